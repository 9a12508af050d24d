//! Typed item events and the lazy item accessor

use std::{fmt, sync::Arc};

use jsonptr::{Pointer, PointerBuf};
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::{
    change::Change,
    client::{BoxError, GetRequest, Transport},
    error::Error,
};

/// Runtime predicate applied to item bodies fetched through [`Item`].
pub type AssertFn = Arc<dyn Fn(&Value) -> Result<(), BoxError> + Send + Sync>;

/// The kinds of events a watch can deliver.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EventKind {
    /// An item link newly appeared (or existed when the watch began).
    Added,
    /// An existing item was mutated.
    Changed,
    /// An item link disappeared.
    Removed,
    /// Aggregate of every [`Added`](Self::Added) and
    /// [`Changed`](Self::Changed); removals are not included.
    Any,
    /// The change feed itself failed. Delivered at most once; terminal.
    Failed,
}

/// An event dispatched to listeners.
#[derive(Clone, Debug)]
pub enum Event {
    /// An item link newly appeared.
    Added(ItemAdded),
    /// An existing item was mutated.
    Changed(ItemChanged),
    /// An item link disappeared.
    Removed(ItemRemoved),
    /// The change feed failed.
    Failed(FeedTerminated),
}

impl Event {
    /// The intrinsic kind of this event (never [`EventKind::Any`]).
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Added(_) => EventKind::Added,
            Event::Changed(_) => EventKind::Changed,
            Event::Removed(_) => EventKind::Removed,
            Event::Failed(_) => EventKind::Failed,
        }
    }

    /// Pointer of the implicated item, for item events.
    #[must_use]
    pub fn pointer(&self) -> Option<&Pointer> {
        match self {
            Event::Added(added) => Some(&added.pointer),
            Event::Changed(changed) => Some(&changed.pointer),
            Event::Removed(removed) => Some(&removed.pointer),
            Event::Failed(_) => None,
        }
    }

    /// List rev of the batch that produced this event.
    #[must_use]
    pub fn list_rev(&self) -> Option<u64> {
        match self {
            Event::Added(added) => Some(added.list_rev),
            Event::Changed(changed) => Some(changed.list_rev),
            Event::Removed(removed) => Some(removed.list_rev),
            Event::Failed(_) => None,
        }
    }
}

/// An item link newly present in the list, or present when the watch began.
#[derive(Clone, Debug)]
pub struct ItemAdded {
    /// List rev at which the item appeared.
    pub list_rev: u64,
    /// Pointer of the item inside the list.
    pub pointer: PointerBuf,
    /// Lazy handle to the item body.
    pub item: Item,
}

/// An existing item mutated by a change.
#[derive(Clone, Debug)]
pub struct ItemChanged {
    /// List rev of the batch carrying the change.
    pub list_rev: u64,
    /// Pointer of the item inside the list.
    pub pointer: PointerBuf,
    /// The item's own rev recorded in the change body, when present.
    pub rev: Option<u64>,
    /// The raw sub-change, with its path re-rooted at the item.
    pub change: Change,
    /// Lazy handle to the item body.
    pub item: Item,
}

/// An item link removed from the list.
///
/// No item handle here: the link is gone, so there is nothing left to GET.
#[derive(Clone, Debug)]
pub struct ItemRemoved {
    /// List rev at which the item disappeared.
    pub list_rev: u64,
    /// Pointer the item used to occupy.
    pub pointer: PointerBuf,
}

/// Terminal failure of the change feed.
#[derive(Clone, Debug)]
pub struct FeedTerminated {
    /// What brought the feed down.
    pub error: Arc<Error>,
}

/// Lazily fetched item body.
///
/// The GET happens on the first await of [`Item::get`] and the result is
/// memoized: clones of one event share it, distinct events never do. If no
/// listener consults the item, no GET occurs.
#[derive(Clone)]
pub struct Item {
    inner: Arc<ItemInner>,
}

struct ItemInner {
    conn: Arc<dyn Transport>,
    path: String,
    assert: Option<AssertFn>,
    cell: OnceCell<Value>,
}

impl Item {
    pub(crate) fn new(conn: Arc<dyn Transport>, path: String, assert: Option<AssertFn>) -> Self {
        Self {
            inner: Arc::new(ItemInner {
                conn,
                path,
                assert,
                cell: OnceCell::new(),
            }),
        }
    }

    /// Absolute path of the item in the store.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Fetch (once) and return the item body.
    ///
    /// # Errors
    ///
    /// Fails if the GET fails, the store returns no body, or the configured
    /// `assert_item` predicate rejects the body.
    pub async fn get(&self) -> Result<Value, Error> {
        let inner = &self.inner;
        let body = inner
            .cell
            .get_or_try_init(|| async {
                let response = inner
                    .conn
                    .get(GetRequest {
                        path: &inner.path,
                        tree: None,
                    })
                    .await
                    .map_err(|source| Error::GetItem {
                        path: inner.path.clone(),
                        source,
                    })?;
                let body = response.data.ok_or_else(|| Error::EmptyItem {
                    path: inner.path.clone(),
                })?;
                if let Some(assert) = &inner.assert {
                    assert(&body).map_err(|source| Error::AssertItem {
                        path: inner.path.clone(),
                        source,
                    })?;
                }
                Ok::<_, Error>(body)
            })
            .await?;
        Ok(body.clone())
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("path", &self.inner.path)
            .field("fetched", &self.inner.cell.initialized())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::client::{
        self, ChangeStream, PostRequest, PutRequest, Response, WatchRequest,
    };

    /// Transport that counts GETs and always answers with one body.
    struct CountingStore {
        gets: AtomicUsize,
        body: Value,
    }

    #[async_trait]
    impl Transport for CountingStore {
        async fn head(&self, _path: &str) -> Result<Response, client::Error> {
            Ok(Response::default())
        }

        async fn get(&self, _request: GetRequest<'_>) -> Result<Response, client::Error> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            Ok(Response {
                data: Some(self.body.clone()),
                ..Response::default()
            })
        }

        async fn put(&self, _request: PutRequest<'_>) -> Result<Response, client::Error> {
            Ok(Response::default())
        }

        async fn post(&self, _request: PostRequest<'_>) -> Result<Response, client::Error> {
            Ok(Response::default())
        }

        async fn delete(&self, _path: &str) -> Result<Response, client::Error> {
            Ok(Response::default())
        }

        async fn watch(&self, _request: WatchRequest<'_>) -> Result<ChangeStream, client::Error> {
            unimplemented!("not watched in these tests")
        }
    }

    #[tokio::test]
    async fn get_is_memoized_per_item() {
        let store = Arc::new(CountingStore {
            gets: AtomicUsize::new(0),
            body: json!({"foo": "bar"}),
        });
        let item = Item::new(store.clone(), "/bookmarks/list/K".into(), None);
        let twin = item.clone();
        assert_eq!(item.get().await.expect("fetches"), json!({"foo": "bar"}));
        assert_eq!(twin.get().await.expect("fetches"), json!({"foo": "bar"}));
        assert_eq!(store.gets.load(Ordering::SeqCst), 1);

        // a distinct item does not share the memo
        let other = Item::new(store.clone(), "/bookmarks/list/K".into(), None);
        other.get().await.expect("fetches");
        assert_eq!(store.gets.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn assertion_failures_surface() {
        let store = Arc::new(CountingStore {
            gets: AtomicUsize::new(0),
            body: json!({"foo": "bar"}),
        });
        let assert: AssertFn = Arc::new(|_body| Err("not a valid item".into()));
        let item = Item::new(store, "/bookmarks/list/K".into(), Some(assert));
        assert!(matches!(
            item.get().await,
            Err(Error::AssertItem { .. })
        ));
    }
}
