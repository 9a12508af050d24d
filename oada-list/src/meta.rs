//! Progress metadata kept under `_meta/oada-list-lib/<name>`
//!
//! The cursor rev is written through a debounced background task so hot
//! lists do not turn every batch into a PUT. Listener failures are recorded
//! per (pointer, rev) in the same document; the cursor still advances past
//! them so one bad item cannot stall the feed.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use jsonptr::Pointer;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn, Instrument, Span};

use crate::{
    client::{GetRequest, PostRequest, PutRequest, Transport},
    error::{error_chain, Error},
};

/// Subtree of `_meta` reserved for this library's progress documents.
pub(crate) const META_ROOT: &str = "_meta/oada-list-lib";

/// The persisted progress document.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub(crate) struct Metadata {
    /// Rev up to which events have been dispatched.
    #[serde(default)]
    pub rev: u64,
    /// Listener failures, per pointer per rev. Append-only.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, BTreeMap<u64, String>>,
}

/// Write-side state of the cursor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Cursor {
    Clean,
    Dirty(u64),
    Writing(u64),
}

/// Owns the resume cursor and error log for one watch.
pub(crate) struct MetaManager {
    conn: Arc<dyn Transport>,
    path: String,
    rev: Arc<AtomicU64>,
    cursor: Arc<Mutex<Cursor>>,
    token: CancellationToken,
    writer: Option<JoinHandle<()>>,
}

impl MetaManager {
    /// Load the progress document, creating it when absent.
    ///
    /// Returns the manager and whether prior metadata was found. When
    /// creating and `seed_from_store` is set, the initial rev is the
    /// `x-oada-rev` the store reported for the initial PUT (the list is
    /// treated as already handled); otherwise it is 0.
    pub(crate) async fn init(
        conn: Arc<dyn Transport>,
        list_path: &str,
        name: &str,
        persist_interval: Duration,
        seed_from_store: bool,
    ) -> Result<(Self, bool), Error> {
        let path = format!("{list_path}/{META_ROOT}/{name}");
        let (rev, found) = match conn.get(GetRequest { path: &path, tree: None }).await {
            Ok(response) => {
                let data = response.data.unwrap_or_else(|| json!({}));
                let metadata: Metadata =
                    serde_json::from_value(data).map_err(Error::InvalidMetadata)?;
                debug!(rev = metadata.rev, "found existing progress metadata");
                (metadata.rev, true)
            }
            Err(error) if error.is_missing() => {
                let rev = create(&*conn, &path, seed_from_store).await?;
                (rev, false)
            }
            Err(source) => return Err(Error::InitMetadata(source)),
        };

        let cursor = Arc::new(Mutex::new(Cursor::Clean));
        let token = CancellationToken::new();
        let writer = tokio::spawn(
            write_loop(
                Arc::clone(&conn),
                path.clone(),
                Arc::clone(&cursor),
                persist_interval,
                token.clone(),
            )
            .instrument(Span::current()),
        );

        Ok((
            Self {
                conn,
                path,
                rev: Arc::new(AtomicU64::new(rev)),
                cursor,
                token,
                writer: Some(writer),
            },
            found,
        ))
    }

    /// The rev events have been dispatched through.
    pub(crate) fn rev(&self) -> u64 {
        self.rev.load(Ordering::SeqCst)
    }

    /// Advance the cursor; the write happens on the debouncer's next tick.
    pub(crate) fn set_rev(&self, rev: u64) {
        self.rev.store(rev, Ordering::SeqCst);
        *self.cursor.lock() = Cursor::Dirty(rev);
    }

    /// Record a listener failure for `(pointer, rev)`.
    ///
    /// Best effort: a failed write is logged and dropped, since the error
    /// log is diagnostic and must not take the feed down.
    pub(crate) async fn set_errored(
        &self,
        pointer: &Pointer,
        rev: u64,
        error: &(dyn std::error::Error + Send + Sync + 'static),
    ) {
        let body = json!({
            "errors": { pointer.to_string(): { rev.to_string(): error_chain(error) } }
        });
        let request = PutRequest {
            path: &self.path,
            data: &body,
            tree: None,
        };
        if let Err(put_error) = self.conn.put(request).await {
            warn!(
                %pointer,
                rev,
                error = %error_chain(&put_error),
                "failed to record listener error"
            );
        }
    }

    /// Stop the debouncer, flushing a dirty cursor first.
    pub(crate) async fn stop(&mut self) {
        self.token.cancel();
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
    }
}

impl Drop for MetaManager {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Create the progress document: a fresh resource, linked under `_meta`.
async fn create(
    conn: &dyn Transport,
    path: &str,
    seed_from_store: bool,
) -> Result<u64, Error> {
    debug!("no progress metadata; creating");
    let empty = json!({});
    let created = conn
        .post(PostRequest {
            path: "/resources",
            data: &empty,
            content_type: "application/json",
        })
        .await
        .map_err(Error::InitMetadata)?;
    let id = created
        .content_location()
        .map(|location| location.trim_start_matches('/').to_owned())
        .ok_or_else(|| {
            Error::InitMetadata(crate::client::Error::Protocol(
                "resource POST reported no content-location".into(),
            ))
        })?;

    let link = json!({ "_id": id });
    let linked = conn
        .put(PutRequest {
            path,
            data: &link,
            tree: None,
        })
        .await
        .map_err(Error::InitMetadata)?;
    let rev = if seed_from_store {
        linked.rev().unwrap_or(0)
    } else {
        0
    };

    let initial = serde_json::to_value(Metadata {
        rev,
        errors: BTreeMap::new(),
    })
    .map_err(Error::InvalidMetadata)?;
    conn.put(PutRequest {
        path,
        data: &initial,
        tree: None,
    })
    .await
    .map_err(Error::InitMetadata)?;
    Ok(rev)
}

/// Debounced cursor writer: `Clean -> Dirty(r) -> Writing(r) -> Clean`,
/// with a final flush at shutdown.
async fn write_loop(
    conn: Arc<dyn Transport>,
    path: String,
    cursor: Arc<Mutex<Cursor>>,
    persist_interval: Duration,
    token: CancellationToken,
) {
    let mut tick = time::interval(persist_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = tick.tick() => flush(&*conn, &path, &cursor).await,
        }
    }
    flush(&*conn, &path, &cursor).await;
}

async fn flush(conn: &dyn Transport, path: &str, cursor: &Mutex<Cursor>) {
    let rev = {
        let mut state = cursor.lock();
        match *state {
            Cursor::Dirty(rev) => {
                *state = Cursor::Writing(rev);
                rev
            }
            Cursor::Clean | Cursor::Writing(_) => return,
        }
    };

    let body = json!({ "rev": rev });
    let request = PutRequest {
        path,
        data: &body,
        tree: None,
    };
    match conn.put(request).await {
        Ok(_) => {
            trace!(rev, "persisted cursor");
            let mut state = cursor.lock();
            // a set_rev during the write leaves the newer rev dirty
            if *state == Cursor::Writing(rev) {
                *state = Cursor::Clean;
            }
        }
        Err(error) => {
            warn!(rev, error = %error_chain(&error), "failed to persist cursor; will retry");
            let mut state = cursor.lock();
            if *state == Cursor::Writing(rev) {
                *state = Cursor::Dirty(rev);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_json_diff::assert_json_eq;
    use jsonptr::PointerBuf;
    use oada_test::MemStore;
    use serde_json::json;

    use super::*;

    const LIST: &str = "/bookmarks/things";

    fn meta_path(name: &str) -> String {
        format!("{LIST}/{META_ROOT}/{name}")
    }

    #[tokio::test]
    async fn init_reads_existing_metadata() {
        let store = MemStore::new();
        store.insert(LIST, json!({"_rev": 900}));
        store.insert(
            &meta_path("tester"),
            json!({"rev": 766, "errors": {}}),
        );
        let (manager, found) = MetaManager::init(
            Arc::new(store.clone()),
            LIST,
            "tester",
            Duration::from_secs(1),
            false,
        )
        .await
        .expect("initializes");
        assert!(found);
        assert_eq!(manager.rev(), 766);
    }

    #[tokio::test]
    async fn init_creates_missing_metadata() {
        let store = MemStore::new();
        store.insert(LIST, json!({"_rev": 3}));
        let (manager, found) = MetaManager::init(
            Arc::new(store.clone()),
            LIST,
            "tester",
            Duration::from_secs(1),
            false,
        )
        .await
        .expect("initializes");
        assert!(!found);
        assert_eq!(manager.rev(), 0);

        // a resource was created and linked before the initial body
        let puts = store.puts();
        assert!(puts.iter().any(|put| put.path == meta_path("tester")
            && put.data.get("_id").is_some()));
        assert!(puts.iter().any(|put| put.path == meta_path("tester")
            && put.data.get("rev") == Some(&json!(0))));
    }

    #[tokio::test]
    async fn handled_lists_seed_the_cursor_from_the_store() {
        let store = MemStore::new();
        store.insert(LIST, json!({"_rev": 3}));
        let (manager, found) = MetaManager::init(
            Arc::new(store.clone()),
            LIST,
            "tester",
            Duration::from_secs(1),
            true,
        )
        .await
        .expect("initializes");
        assert!(!found);
        let seeded = manager.rev();
        assert!(seeded > 0);
        assert!(store
            .puts()
            .iter()
            .any(|put| put.path == meta_path("tester")
                && put.data.get("rev") == Some(&json!(seeded))));
    }

    #[tokio::test(start_paused = true)]
    async fn cursor_writes_are_debounced() {
        let store = MemStore::new();
        store.insert(LIST, json!({"_rev": 3}));
        let (mut manager, _) = MetaManager::init(
            Arc::new(store.clone()),
            LIST,
            "tester",
            Duration::from_millis(10),
            false,
        )
        .await
        .expect("initializes");
        let creation_puts = store.puts().len();

        manager.set_rev(4);
        manager.set_rev(5);
        time::sleep(Duration::from_millis(500)).await;

        let puts = store.puts();
        let cursor_puts: Vec<_> = puts[creation_puts..]
            .iter()
            .filter(|put| put.path == meta_path("tester"))
            .collect();
        // both bumps collapse into one write
        assert_eq!(cursor_puts.len(), 1);
        assert_json_eq!(&cursor_puts[0].data, &json!({"rev": 5}));

        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flushes_a_dirty_cursor() {
        let store = MemStore::new();
        store.insert(LIST, json!({"_rev": 3}));
        let (mut manager, _) = MetaManager::init(
            Arc::new(store.clone()),
            LIST,
            "tester",
            Duration::from_secs(3600),
            false,
        )
        .await
        .expect("initializes");

        manager.set_rev(42);
        manager.stop().await;

        assert!(store
            .puts()
            .iter()
            .any(|put| put.path == meta_path("tester")
                && put.data.get("rev") == Some(&json!(42))));
    }

    #[tokio::test]
    async fn listener_errors_are_recorded_per_pointer_and_rev() {
        let store = MemStore::new();
        store.insert(LIST, json!({"_rev": 3}));
        let (manager, _) = MetaManager::init(
            Arc::new(store.clone()),
            LIST,
            "tester",
            Duration::from_secs(1),
            false,
        )
        .await
        .expect("initializes");

        let pointer = PointerBuf::parse("/K").expect("valid pointer");
        let error: crate::client::BoxError = "handler exploded".into();
        manager.set_errored(&pointer, 4, &*error).await;

        assert!(store.puts().iter().any(|put| {
            put.path == meta_path("tester")
                && put.data.pointer("/errors/~1K/4") == Some(&json!("handler exploded"))
        }));
    }
}
