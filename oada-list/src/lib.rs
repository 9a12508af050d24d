//! Watch an OADA list resource and react to its items
//!
//! An OADA *list* is a JSON resource whose non-underscore children link to
//! other resources. This crate subscribes to the store's change feed for
//! such a list, folds each change batch into the list's effective state,
//! resolves which items the batch implicates through a configurable items
//! selector, and delivers typed [`Event`]s: [`ItemAdded`], [`ItemChanged`],
//! [`ItemRemoved`], plus an aggregate of the first two.
//!
//! With [`Config::resume`], progress is persisted under the list's
//! `_meta/oada-list-lib/<name>` subtree: a debounced rev cursor plus a log
//! of listener failures, so a restarted watch resumes from the last
//! acknowledged rev instead of replaying or skipping, and one bad item
//! never stalls the feed.
//!
//! The store itself is reached through the [`Transport`] trait; this crate
//! never manages connections or retries.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use futures::StreamExt;
//! use oada_list::{Config, Event, EventKind, ListWatch, Transport};
//!
//! # async fn example(conn: Arc<dyn Transport>) -> Result<(), oada_list::Error> {
//! let watch = ListWatch::start(
//!     conn,
//!     Config::new("/bookmarks/trellis/documents").resume(true),
//! )
//! .await?;
//!
//! let mut added = watch.on(EventKind::Added);
//! while let Some(event) = added.next().await {
//!     if let Event::Added(item) = event {
//!         println!("new item at {}: {:?}", item.pointer, item.item.get().await?);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod change;
pub mod client;
mod dispatch;
mod error;
pub mod event;
mod meta;
pub mod selector;
mod tree;
pub mod watch;

pub use change::{Change, ChangeBatch, ChangeType};
pub use client::Transport;
pub use dispatch::EventStream;
pub use error::{Error, Result};
pub use event::{
    AssertFn, Event, EventKind, FeedTerminated, Item, ItemAdded, ItemChanged, ItemRemoved,
};
pub use selector::ItemsPath;
pub use watch::{Config, ListWatch, OnNewList};
