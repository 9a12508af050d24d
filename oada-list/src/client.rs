//! Transport contract against an OADA-compatible store
//!
//! The library consumes this interface and nothing else: connection
//! management, authentication, and retry all belong to the implementation
//! behind the trait. See `oada-test` for the in-memory store the tests use.

use async_trait::async_trait;
use futures::stream::BoxStream;
use http::{header::CONTENT_LOCATION, HeaderMap, StatusCode};
use serde_json::Value;
use thiserror::Error;

use crate::change::ChangeBatch;

/// Header carrying the rev a store operation observed or produced.
pub const REV_HEADER: &str = "x-oada-rev";

/// Boxed error for transport internals and listener failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Stream of change batches produced by [`Transport::watch`].
pub type ChangeStream = BoxStream<'static, Result<ChangeBatch, Error>>;

/// Errors surfaced by a [`Transport`] implementation.
#[derive(Debug, Error)]
pub enum Error {
    /// The store answered with a non-success status.
    #[error("API returned status {status}")]
    Status {
        /// The status code the store answered with.
        status: StatusCode,
    },

    /// The store answered with a payload the library cannot interpret.
    #[error("malformed payload: {0}")]
    Protocol(String),

    /// The transport itself failed (connection, TLS, timeout, ...).
    #[error("transport failure")]
    Service(#[source] BoxError),
}

impl Error {
    /// Status code of an API error, if this is one.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Status { status } => Some(*status),
            Error::Protocol(_) | Error::Service(_) => None,
        }
    }

    /// Whether the store reported the path as missing.
    ///
    /// OADA answers 403 rather than 404 for paths a token cannot see, so
    /// both count as absence.
    #[must_use]
    pub fn is_missing(&self) -> bool {
        matches!(
            self.status(),
            Some(StatusCode::FORBIDDEN | StatusCode::NOT_FOUND)
        )
    }
}

/// Response to a non-watch operation.
#[derive(Debug, Default)]
pub struct Response {
    /// Status the store answered with.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body, when there is one.
    pub data: Option<Value>,
}

impl Response {
    /// Rev reported via the [`REV_HEADER`] header.
    #[must_use]
    pub fn rev(&self) -> Option<u64> {
        self.headers.get(REV_HEADER)?.to_str().ok()?.parse().ok()
    }

    /// Location of a resource created by POST.
    #[must_use]
    pub fn content_location(&self) -> Option<&str> {
        self.headers.get(CONTENT_LOCATION)?.to_str().ok()
    }
}

/// Parameters for [`Transport::get`].
#[derive(Clone, Copy, Debug)]
pub struct GetRequest<'a> {
    /// Absolute path to read.
    pub path: &'a str,
    /// Tree descriptor enabling a tree-mode GET.
    pub tree: Option<&'a Value>,
}

/// Parameters for [`Transport::put`].
#[derive(Clone, Copy, Debug)]
pub struct PutRequest<'a> {
    /// Absolute path to write.
    pub path: &'a str,
    /// Body to merge at `path` (OADA PUT semantics are a deep merge).
    pub data: &'a Value,
    /// Tree descriptor used to materialize missing parents.
    pub tree: Option<&'a Value>,
}

/// Parameters for [`Transport::post`].
#[derive(Clone, Copy, Debug)]
pub struct PostRequest<'a> {
    /// Collection to create the resource under (usually `/resources`).
    pub path: &'a str,
    /// Initial contents of the resource.
    pub data: &'a Value,
    /// Media type of `data`.
    pub content_type: &'a str,
}

/// Parameters for [`Transport::watch`].
///
/// Watches are always tree watches: each yielded batch is a root change for
/// the watched path plus any descendant changes, delivered atomically.
#[derive(Clone, Copy, Debug)]
pub struct WatchRequest<'a> {
    /// Absolute path to watch.
    pub path: &'a str,
    /// Rev to resume from; `None` watches from the current tip.
    pub rev: Option<u64>,
}

/// Operations the library requires of an OADA connection.
///
/// Implementations may be shared across watches; every operation is
/// independent.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Check that a path exists.
    async fn head(&self, path: &str) -> Result<Response, Error>;

    /// Read a resource (or a subpath into one).
    async fn get(&self, request: GetRequest<'_>) -> Result<Response, Error>;

    /// Merge a body into a resource, creating it if needed.
    async fn put(&self, request: PutRequest<'_>) -> Result<Response, Error>;

    /// Create a fresh resource.
    async fn post(&self, request: PostRequest<'_>) -> Result<Response, Error>;

    /// Remove a resource or unlink a subpath.
    async fn delete(&self, path: &str) -> Result<Response, Error>;

    /// Open a change feed over the subtree at a path.
    async fn watch(&self, request: WatchRequest<'_>) -> Result<ChangeStream, Error>;
}
