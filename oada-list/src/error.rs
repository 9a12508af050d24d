//! Errors raised by the watch lifecycle

use std::fmt::Write;

use thiserror::Error;

use crate::{
    client::{self, BoxError},
    selector,
};

/// Failures of a [`ListWatch`](crate::ListWatch) or of item access.
#[derive(Debug, Error)]
pub enum Error {
    /// Checking whether the list exists failed with a non-absence error.
    #[error("failed to verify list at {path}")]
    EnsureList {
        /// Path of the list.
        path: String,
        /// Underlying transport error.
        #[source]
        source: client::Error,
    },

    /// Materializing a missing list failed.
    #[error("failed to create list at {path}")]
    CreateList {
        /// Path of the list.
        path: String,
        /// Underlying transport error.
        #[source]
        source: client::Error,
    },

    /// Reading or creating the progress metadata failed.
    #[error("failed to initialize progress metadata")]
    InitMetadata(#[source] client::Error),

    /// The progress metadata document was not in the expected shape.
    #[error("progress metadata was not valid")]
    InvalidMetadata(#[source] serde_json::Error),

    /// Opening the change feed failed.
    #[error("failed to open change feed")]
    WatchList(#[source] client::Error),

    /// Fetching the starting list contents failed.
    #[error("failed to fetch starting list contents")]
    StartingItems(#[source] client::Error),

    /// The items selector failed to parse or apply.
    #[error(transparent)]
    Selector(#[from] selector::Error),

    /// The change feed itself failed; the watch halts.
    #[error("change feed failed")]
    WatchFailed(#[source] client::Error),

    /// The change feed ended without the list being deleted; the watch halts.
    #[error("change feed ended unexpectedly")]
    FeedClosed,

    /// Fetching an item body failed.
    #[error("failed to fetch item at {path}")]
    GetItem {
        /// Absolute path of the item.
        path: String,
        /// Underlying transport error.
        #[source]
        source: client::Error,
    },

    /// The store answered an item fetch with no body.
    #[error("item at {path} had no body")]
    EmptyItem {
        /// Absolute path of the item.
        path: String,
    },

    /// An item body failed the configured assertion.
    #[error("item at {path} failed assertion")]
    AssertItem {
        /// Absolute path of the item.
        path: String,
        /// What the assertion reported.
        #[source]
        source: BoxError,
    },
}

/// Convenience alias for watch results.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Render an error with its full source chain on one line.
pub(crate) fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut rendering = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let _ = write!(rendering, ": {cause}");
        source = cause.source();
    }
    rendering
}
