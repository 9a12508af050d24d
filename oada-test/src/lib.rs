//! In-memory OADA store for exercising `oada-list` without a server
//!
//! Implements just enough of the store's semantics for the library's tests:
//! path-keyed documents with JSON-pointer resolution into them, deep-merge
//! PUTs that bump and report `x-oada-rev`, resource POSTs that answer with a
//! `content-location`, and watches fed by hand through [`MemStore::push_batch`].
//! Every write is recorded so tests can assert the metadata protocol without
//! real I/O.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::{channel::mpsc, StreamExt};
use http::{header::CONTENT_LOCATION, HeaderValue, StatusCode};
use jsonptr::{Pointer, PointerBuf, Resolve};
use oada_list::{
    client::{
        ChangeStream, Error, GetRequest, PostRequest, PutRequest, Response, Transport,
        WatchRequest, REV_HEADER,
    },
    ChangeBatch,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;

/// One recorded PUT.
#[derive(Clone, Debug)]
pub struct PutRecord {
    /// Path the PUT targeted.
    pub path: String,
    /// Body as given.
    pub data: Value,
}

#[derive(Default)]
struct State {
    documents: HashMap<String, Value>,
    revs: HashMap<String, u64>,
    puts: Vec<PutRecord>,
    watches: Vec<(String, Option<u64>)>,
    feeds: Vec<(String, mpsc::UnboundedSender<Result<ChangeBatch, Error>>)>,
    next_resource: u64,
}

/// Shareable in-memory store; clones see the same state.
#[derive(Clone, Default)]
pub struct MemStore {
    state: Arc<Mutex<State>>,
}

impl MemStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document at `path` without recording a PUT.
    pub fn insert(&self, path: &str, value: Value) {
        let mut state = self.state.lock();
        state.documents.insert(path.to_owned(), value);
        state.revs.entry(path.to_owned()).or_insert(1);
    }

    /// Current contents at `path`, resolving into containing documents.
    #[must_use]
    pub fn resource(&self, path: &str) -> Option<Value> {
        self.state.lock().resolve(path).cloned()
    }

    /// Every PUT the store has seen, in order.
    #[must_use]
    pub fn puts(&self) -> Vec<PutRecord> {
        self.state.lock().puts.clone()
    }

    /// Every watch that was opened: `(path, resume rev)`.
    #[must_use]
    pub fn watches(&self) -> Vec<(String, Option<u64>)> {
        self.state.lock().watches.clone()
    }

    /// Feed a change batch to every watch open over `path`.
    pub fn push_batch(&self, path: &str, batch: &ChangeBatch) {
        let state = self.state.lock();
        for (watched, feed) in &state.feeds {
            if watched == path {
                let _ = feed.unbounded_send(Ok(batch.clone()));
            }
        }
    }

    /// Feed a transport error to every watch open over `path`.
    pub fn push_error(&self, path: &str) {
        let state = self.state.lock();
        for (watched, feed) in &state.feeds {
            if watched == path {
                let _ = feed.unbounded_send(Err(Error::Status {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                }));
            }
        }
    }

    /// End every open watch feed, as a dying upstream would.
    pub fn end_watches(&self) {
        self.state.lock().feeds.clear();
    }
}

impl State {
    /// Longest containing document for `path`, with the leftover pointer.
    ///
    /// The leftover only parses as a pointer when the prefix ends on a path
    /// boundary, so `/a/bc` never counts as being inside `/a/b`.
    fn containing(&self, path: &str) -> Option<(String, PointerBuf)> {
        let mut candidate: Option<(String, PointerBuf)> = None;
        for key in self.documents.keys() {
            let Some(rest) = path.strip_prefix(key.as_str()) else {
                continue;
            };
            let Ok(pointer) = PointerBuf::parse(rest) else {
                continue;
            };
            let better = candidate
                .as_ref()
                .is_none_or(|(best, _)| key.len() > best.len());
            if better {
                candidate = Some((key.clone(), pointer));
            }
        }
        candidate
    }

    fn resolve(&self, path: &str) -> Option<&Value> {
        let (key, pointer) = self.containing(path)?;
        self.documents.get(&key)?.resolve(&pointer).ok()
    }

    fn missing() -> Error {
        Error::Status {
            status: StatusCode::NOT_FOUND,
        }
    }

    fn bump(&mut self, key: &str) -> u64 {
        let rev = self.revs.entry(key.to_owned()).or_insert(0);
        *rev += 1;
        *rev
    }
}

fn with_rev(rev: u64) -> Response {
    let mut response = Response::default();
    if let Ok(value) = HeaderValue::from_str(&rev.to_string()) {
        response.headers.insert(REV_HEADER, value);
    }
    response
}

/// Deep merge `src` into `dst`: objects recurse, everything else replaces.
fn merge(dst: &mut Value, src: &Value) {
    match (dst, src) {
        (Value::Object(into), Value::Object(from)) => {
            for (key, value) in from {
                merge(into.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (dst, src) => *dst = src.clone(),
    }
}

/// Walk to (and create, as objects) the node at `pointer` within `value`.
fn node_at<'v>(value: &'v mut Value, pointer: &Pointer) -> &'v mut Value {
    let mut node = value;
    for token in pointer.tokens() {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            unreachable!()
        };
        node = map.entry(token.decoded().into_owned()).or_insert(Value::Null);
    }
    node
}

#[async_trait]
impl Transport for MemStore {
    async fn head(&self, path: &str) -> Result<Response, Error> {
        let state = self.state.lock();
        state
            .resolve(path)
            .map(|_| Response::default())
            .ok_or_else(State::missing)
    }

    async fn get(&self, request: GetRequest<'_>) -> Result<Response, Error> {
        let state = self.state.lock();
        let (key, pointer) = state.containing(request.path).ok_or_else(State::missing)?;
        let data = state
            .documents
            .get(&key)
            .and_then(|document| document.resolve(&pointer).ok())
            .cloned()
            .ok_or_else(State::missing)?;
        let rev = state.revs.get(&key).copied().unwrap_or(1);
        let mut response = with_rev(rev);
        response.data = Some(data);
        Ok(response)
    }

    async fn put(&self, request: PutRequest<'_>) -> Result<Response, Error> {
        let mut state = self.state.lock();
        state.puts.push(PutRecord {
            path: request.path.to_owned(),
            data: request.data.clone(),
        });
        let (key, pointer) = match state.containing(request.path) {
            Some(found) => found,
            None => {
                // a PUT materializes the document
                state
                    .documents
                    .insert(request.path.to_owned(), Value::Object(Map::new()));
                (request.path.to_owned(), PointerBuf::new())
            }
        };
        let document = state
            .documents
            .get_mut(&key)
            .unwrap_or_else(|| unreachable!());
        merge(node_at(document, &pointer), request.data);
        let rev = state.bump(&key);
        Ok(with_rev(rev))
    }

    async fn post(&self, request: PostRequest<'_>) -> Result<Response, Error> {
        let mut state = self.state.lock();
        state.next_resource += 1;
        let id = format!("resources/{}", state.next_resource);
        let path = format!("/{id}");
        state.documents.insert(path.clone(), request.data.clone());
        state.revs.insert(path.clone(), 1);
        let mut response = with_rev(1);
        if let Ok(value) = HeaderValue::from_str(&path) {
            response.headers.insert(CONTENT_LOCATION, value);
        }
        Ok(response)
    }

    async fn delete(&self, path: &str) -> Result<Response, Error> {
        let mut state = self.state.lock();
        state.documents.remove(path);
        state.revs.remove(path);
        Ok(Response::default())
    }

    async fn watch(&self, request: WatchRequest<'_>) -> Result<ChangeStream, Error> {
        let (sender, receiver) = mpsc::unbounded();
        let mut state = self.state.lock();
        state
            .watches
            .push((request.path.to_owned(), request.rev));
        state.feeds.push((request.path.to_owned(), sender));
        Ok(receiver.boxed())
    }
}
