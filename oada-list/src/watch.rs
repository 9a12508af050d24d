//! The ListWatch coordinator: lifecycle, batch processing, event emission

use std::{future::Future, sync::Arc, time::Duration};

use futures::{FutureExt, StreamExt};
use jsonptr::{Pointer, PointerBuf};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::{
    change::{body_rev, Change, ChangeBatch},
    client::{BoxError, ChangeStream, GetRequest, PutRequest, Transport, WatchRequest},
    dispatch::{self, Dispatcher, EventStream, Registration},
    error::{error_chain, Error},
    event::{AssertFn, Event, EventKind, FeedTerminated, Item, ItemAdded, ItemChanged, ItemRemoved},
    meta::MetaManager,
    selector::ItemsPath,
    tree::ChangeTree,
};

/// How to treat items already on the list when no prior progress exists.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OnNewList {
    /// Treat existing items as new: emit [`crate::ItemAdded`] for each.
    #[default]
    New,
    /// Treat existing items as handled: record the list's current rev and
    /// emit nothing for them.
    Handled,
}

/// Options controlling a [`ListWatch`].
#[derive(Clone)]
pub struct Config {
    /// Location of the watched list. Required.
    pub path: String,
    /// Selector for the item nodes within the list.
    pub items_path: ItemsPath,
    /// Tree descriptor used to materialize a missing list and for tree-mode
    /// GETs of the starting snapshot.
    pub tree: Option<Value>,
    /// Stable identity for progress storage under `_meta`.
    pub name: String,
    /// Persist the cursor under `_meta` and resume from it across restarts.
    pub resume: bool,
    /// Interval between debounced cursor writes.
    pub persist_interval: Duration,
    /// Behavior for pre-existing items on a first run with no metadata.
    pub on_new_list: OnNewList,
    /// Predicate run against item bodies when they are fetched.
    pub assert_item: Option<AssertFn>,
}

impl Config {
    /// Options for watching the list at `path`, with defaults everywhere
    /// else.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            items_path: ItemsPath::default(),
            tree: None,
            name: default_name(),
            resume: false,
            persist_interval: Duration::from_secs(1),
            on_new_list: OnNewList::default(),
            assert_item: None,
        }
    }

    /// Select items with a custom selector instead of direct children.
    #[must_use]
    pub fn items_path(mut self, items_path: ItemsPath) -> Self {
        self.items_path = items_path;
        self
    }

    /// Provide a tree descriptor for list materialization and snapshots.
    #[must_use]
    pub fn tree(mut self, tree: Value) -> Self {
        self.tree = Some(tree);
        self
    }

    /// Override the identity progress is stored under.
    ///
    /// Watches sharing a list must use distinct names; the progress
    /// document is written only by its owning watch.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Persist and resume from the cursor under `_meta`.
    #[must_use]
    pub fn resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Change how often the cursor is flushed to the store.
    #[must_use]
    pub fn persist_interval(mut self, persist_interval: Duration) -> Self {
        self.persist_interval = persist_interval;
        self
    }

    /// Change the treatment of pre-existing items on first run.
    #[must_use]
    pub fn on_new_list(mut self, on_new_list: OnNewList) -> Self {
        self.on_new_list = on_new_list;
        self
    }

    /// Assert a predicate over every fetched item body.
    #[must_use]
    pub fn assert_item(mut self, assert_item: AssertFn) -> Self {
        self.assert_item = Some(assert_item);
        self
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("items_path", &self.items_path)
            .field("tree", &self.tree.is_some())
            .field("name", &self.name)
            .field("resume", &self.resume)
            .field("persist_interval", &self.persist_interval)
            .field("on_new_list", &self.on_new_list)
            .field("assert_item", &self.assert_item.is_some())
            .finish()
    }
}

/// Progress identity when the caller does not pick one: the process name.
fn default_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|exe| Some(exe.file_stem()?.to_string_lossy().into_owned()))
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_owned())
}

/// Listener registrations made while the feed task is between dispatches.
#[derive(Default)]
struct Shared {
    pending: parking_lot::Mutex<Vec<Registration>>,
}

impl Shared {
    fn push(&self, registration: Registration) {
        self.pending.lock().push(registration);
    }
}

/// One active watch over an OADA list.
///
/// Turns the store's change feed into [`Event`]s: items added, changed, and
/// removed, resolved through the configured items selector. With
/// [`Config::resume`], progress is recorded under the list's `_meta` so a
/// restarted watch picks up where the last one acknowledged.
///
/// Listeners attach through [`on`](Self::on)/[`once`](Self::once) (async
/// streams) or [`on_fn`](Self::on_fn)/[`once_fn`](Self::once_fn) (async
/// callbacks). They are weakly attached: dropping a stream cancels only that
/// registration, and no listener keeps the watch alive.
pub struct ListWatch {
    shared: Arc<Shared>,
    token: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ListWatch {
    /// Start watching `config.path` over `conn`.
    ///
    /// Ensures the list exists (materializing it when absent), loads or
    /// creates progress metadata when resuming, and opens the change feed
    /// before returning; batch processing runs on a background task.
    ///
    /// # Errors
    ///
    /// Fails when the list cannot be verified or created, the metadata
    /// cannot be initialized, or the change feed cannot be opened.
    pub async fn start(conn: Arc<dyn Transport>, config: Config) -> Result<Self, Error> {
        let span = info_span!("list_watch", path = %config.path, name = %config.name);

        let (meta, found) = async {
            ensure_list(&*conn, &config).await?;
            if config.resume {
                let (manager, found) = MetaManager::init(
                    Arc::clone(&conn),
                    &config.path,
                    &config.name,
                    config.persist_interval,
                    config.on_new_list == OnNewList::Handled,
                )
                .await?;
                Ok::<_, Error>((Some(manager), found))
            } else {
                Ok((None, false))
            }
        }
        .instrument(span.clone())
        .await?;

        let rev = meta.as_ref().map(MetaManager::rev);
        let changes = conn
            .watch(WatchRequest {
                path: &config.path,
                rev,
            })
            .await
            .map_err(Error::WatchList)?;
        debug!(parent: &span, ?rev, "change feed open");

        let shared = Arc::new(Shared::default());
        let token = CancellationToken::new();
        let processor = Processor {
            conn,
            config,
            dispatcher: Dispatcher::default(),
            shared: Arc::clone(&shared),
            meta,
            changes,
            fresh: !found,
            token: token.clone(),
        };
        let task = tokio::spawn(processor.run().instrument(span));

        Ok(Self {
            shared,
            token,
            task: tokio::sync::Mutex::new(Some(task)),
        })
    }

    /// Subscribe to events of `kind` as an async stream.
    pub fn on(&self, kind: EventKind) -> EventStream {
        let (registration, stream) = dispatch::channel(kind, false);
        self.shared.push(registration);
        stream
    }

    /// Register an async callback for events of `kind`.
    ///
    /// A returned `Err` is recorded under the list's `_meta` for the event's
    /// pointer and rev; the cursor still advances past the event.
    pub fn on_fn<F, Fut>(&self, kind: EventKind, mut listener: F)
    where
        F: FnMut(Event) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let handler: dispatch::Handler = Box::new(move |event| listener(event).boxed());
        self.shared.push(dispatch::callback(kind, false, handler));
    }

    /// Wait for a single event of `kind`.
    ///
    /// Resolves to `None` if the watch ends first.
    pub fn once(&self, kind: EventKind) -> impl Future<Output = Option<Event>> + Send + 'static {
        let (registration, mut stream) = dispatch::channel(kind, true);
        self.shared.push(registration);
        async move { stream.next().await }
    }

    /// Register a callback delivered exactly one event of `kind`.
    pub fn once_fn<F, Fut>(&self, kind: EventKind, mut listener: F)
    where
        F: FnMut(Event) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let handler: dispatch::Handler = Box::new(move |event| listener(event).boxed());
        self.shared.push(dispatch::callback(kind, true, handler));
    }

    /// Stop the watch: close the feed at its next yield, wait for in-flight
    /// listener invocations, flush progress, and tear down.
    ///
    /// Idempotent; concurrent calls collapse into one teardown.
    pub async fn stop(&self) {
        self.token.cancel();
        let mut task = self.task.lock().await;
        if let Some(task) = task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ListWatch {
    fn drop(&mut self) {
        // the feed task still flushes metadata on its way out
        self.token.cancel();
    }
}

/// HEAD the list; a missing list is materialized, anything else fatal.
async fn ensure_list(conn: &dyn Transport, config: &Config) -> Result<(), Error> {
    match conn.head(&config.path).await {
        Ok(_) => Ok(()),
        Err(error) if error.is_missing() => {
            info!(path = %config.path, "list does not exist; creating");
            let empty = json!({});
            conn.put(PutRequest {
                path: &config.path,
                data: &empty,
                tree: config.tree.as_ref(),
            })
            .await
            .map_err(|source| Error::CreateList {
                path: config.path.clone(),
                source,
            })?;
            Ok(())
        }
        Err(source) => Err(Error::EnsureList {
            path: config.path.clone(),
            source,
        }),
    }
}

/// Why processing came to rest without an error.
enum Halt {
    Cancelled,
    ListDeleted,
}

/// The single logical task driving one watch.
struct Processor {
    conn: Arc<dyn Transport>,
    config: Config,
    dispatcher: Dispatcher,
    shared: Arc<Shared>,
    meta: Option<MetaManager>,
    changes: ChangeStream,
    fresh: bool,
    token: CancellationToken,
}

impl Processor {
    async fn run(mut self) {
        match self.process().await {
            Ok(Halt::Cancelled) => debug!("watch stopped"),
            Ok(Halt::ListDeleted) => info!("list was deleted; watch is over"),
            Err(error) => {
                warn!(error = %error_chain(&error), "change feed failed");
                let event = Event::Failed(FeedTerminated {
                    error: Arc::new(error),
                });
                self.deliver(EventKind::Failed, &event).await;
            }
        }
        if let Some(meta) = &mut self.meta {
            meta.stop().await;
        }
    }

    async fn process(&mut self) -> Result<Halt, Error> {
        if self.fresh && self.config.on_new_list == OnNewList::New {
            self.emit_starting_items().await?;
        }

        loop {
            let batch = tokio::select! {
                () = self.token.cancelled() => return Ok(Halt::Cancelled),
                batch = self.changes.next() => batch,
            };
            match batch {
                Some(Ok(batch)) => {
                    if let Some(halt) = self.handle_batch(batch).await? {
                        return Ok(halt);
                    }
                }
                Some(Err(source)) => return Err(Error::WatchFailed(source)),
                None => return Err(Error::FeedClosed),
            }
        }
    }

    /// First run over a list nobody has handled: every current item is new.
    async fn emit_starting_items(&mut self) -> Result<(), Error> {
        let response = self
            .conn
            .get(GetRequest {
                path: &self.config.path,
                tree: self.config.tree.as_ref(),
            })
            .await
            .map_err(Error::StartingItems)?;
        let list_rev = body_rev(response.data.as_ref().unwrap_or(&json!({})))
            .or_else(|| response.rev())
            .unwrap_or(0);
        let list = response.data.unwrap_or_else(|| json!({}));

        let matches = self.config.items_path.select(&list)?;
        debug!(count = matches.len(), list_rev, "emitting starting items");
        for matched in matches {
            let event = Event::Added(ItemAdded {
                list_rev,
                item: self.item(&matched.pointer),
                pointer: matched.pointer,
            });
            self.emit(event).await;
        }
        Ok(())
    }

    async fn handle_batch(&mut self, batch: ChangeBatch) -> Result<Option<Halt>, Error> {
        if batch.is_list_deletion() {
            return Ok(Some(Halt::ListDeleted));
        }
        let Some(list_rev) = batch.rev() else {
            warn!("batch carried no list rev; skipping");
            return Ok(None);
        };
        if let Some(meta) = &self.meta {
            if list_rev <= meta.rev() {
                trace!(list_rev, "batch at or before the cursor; skipping");
                return Ok(None);
            }
        }

        let tree = ChangeTree::build(&batch);
        let matches = self.config.items_path.select(tree.value())?;
        trace!(list_rev, count = matches.len(), "classifying matched items");

        for matched in matches {
            let pointer = matched.pointer;
            if tree.is_deleted(&pointer) {
                self.emit(Event::Removed(ItemRemoved { list_rev, pointer }))
                    .await;
                continue;
            }

            let touching = tree.touching(&pointer);
            if touching.is_empty() {
                // untouched nodes only count when the batch linked them in
                if matched.value.get("_id").is_some() {
                    let event = Event::Added(ItemAdded {
                        list_rev,
                        item: self.item(&pointer),
                        pointer,
                    });
                    self.emit(event).await;
                }
                continue;
            }

            for &index in touching {
                let change = rebase(&batch.changes()[index], &pointer);
                let event = Event::Changed(ItemChanged {
                    list_rev,
                    rev: change.rev(),
                    item: self.item(&pointer),
                    pointer: pointer.clone(),
                    change,
                });
                self.emit(event).await;
            }
        }

        // only after every event of the batch has been dispatched
        if let Some(meta) = &self.meta {
            meta.set_rev(list_rev);
        }
        Ok(None)
    }

    /// Dispatch an event, mirror it to `Any` where applicable, and record
    /// listener failures.
    async fn emit(&mut self, event: Event) {
        let kind = event.kind();
        let errors = self.deliver(kind, &event).await;
        Self::record_errors(&self.meta, &event, errors).await;
        if matches!(kind, EventKind::Added | EventKind::Changed) {
            let errors = self.deliver(EventKind::Any, &event).await;
            Self::record_errors(&self.meta, &event, errors).await;
        }
    }

    async fn deliver(&mut self, kind: EventKind, event: &Event) -> Vec<BoxError> {
        let pending = std::mem::take(&mut *self.shared.pending.lock());
        self.dispatcher.adopt(pending);
        self.dispatcher.dispatch(kind, event).await
    }

    async fn record_errors(meta: &Option<MetaManager>, event: &Event, errors: Vec<BoxError>) {
        for error in errors {
            warn!(
                pointer = %event.pointer().map(ToString::to_string).unwrap_or_default(),
                error = %error_chain(&*error),
                "listener failed"
            );
            if let (Some(meta), Some(pointer), Some(rev)) = (meta, event.pointer(), event.list_rev())
            {
                meta.set_errored(pointer, rev, &*error).await;
            }
        }
    }

    fn item(&self, pointer: &Pointer) -> Item {
        let path = format!("{}{pointer}", self.config.path);
        Item::new(
            Arc::clone(&self.conn),
            path,
            self.config.assert_item.clone(),
        )
    }
}

/// Re-root a change's path at the item it falls under.
fn rebase(change: &Change, item: &Pointer) -> Change {
    let path = PointerBuf::from_tokens(change.path.tokens().skip(item.tokens().count()));
    Change {
        path,
        ..change.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebase_strips_the_item_prefix() {
        let change: Change = serde_json::from_value(json!({
            "type": "merge",
            "path": "/K/foo/bar",
            "body": {"x": 1},
        }))
        .expect("valid change");
        let item = PointerBuf::parse("/K").expect("valid pointer");
        assert_eq!(rebase(&change, &item).path.to_string(), "/foo/bar");

        let exact = rebase(&change, &change.path.clone());
        assert!(exact.path.is_root());
    }

    #[test]
    fn config_defaults_match_the_contract() {
        let config = Config::new("/bookmarks/things");
        assert!(matches!(config.items_path, ItemsPath::Children));
        assert!(!config.resume);
        assert_eq!(config.persist_interval, Duration::from_secs(1));
        assert_eq!(config.on_new_list, OnNewList::New);
        assert!(config.assert_item.is_none());
        assert!(!config.name.is_empty());
    }
}
