//! Folds a change batch into one JSON tree mirroring the list at that rev
//!
//! The tree itself is a plain [`Value`]; everything the classifier needs
//! beyond the JSON lives in side-channels keyed by pointer: which leaves a
//! delete removed, and which raw changes touched which nodes.

use std::collections::{BTreeMap, HashSet};

use jsonptr::{Pointer, PointerBuf};
use serde_json::{Map, Value};

use crate::change::ChangeBatch;

/// The effective state of the list for one batch, with change annotations.
#[derive(Debug, Default)]
pub(crate) struct ChangeTree {
    value: Value,
    deleted: HashSet<PointerBuf>,
    touched: BTreeMap<PointerBuf, Vec<usize>>,
}

impl ChangeTree {
    /// Fold a batch into a tree.
    ///
    /// The root change seeds the tree and annotates only the root pointer;
    /// each descendant change is deep-merged at its path and annotates every
    /// node on the way down. Later children win at matching keys, arrays are
    /// replaced whole, and `null` leaves under a delete are recorded as
    /// removed rather than stored as data.
    pub(crate) fn build(batch: &ChangeBatch) -> Self {
        let mut tree = Self {
            value: Value::Object(Map::new()),
            ..Self::default()
        };

        let root = batch.root();
        if let Some(body) = &root.body {
            tree.graft(Pointer::root(), body, root.is_delete());
        }
        tree.touch(Pointer::root(), 0);

        for (index, child) in batch.children() {
            let mut at = PointerBuf::new();
            tree.touch(&at, index);
            for token in child.path.tokens() {
                at.push_back(token);
                tree.touch(&at, index);
            }
            match &child.body {
                Some(body) => tree.graft(&child.path, body, child.is_delete()),
                // whole-subtree delete
                None if child.is_delete() => {
                    tree.remove(&child.path);
                }
                None => {}
            }
        }

        tree
    }

    /// The JSON value of the list as of this batch.
    pub(crate) fn value(&self) -> &Value {
        &self.value
    }

    /// Whether a delete in this batch removed the node at `pointer`.
    pub(crate) fn is_deleted(&self, pointer: &Pointer) -> bool {
        self.deleted.contains(pointer)
    }

    /// Indices (into the batch) of the changes that touched `pointer`.
    ///
    /// The root change is excluded for non-root pointers; a descendant
    /// change counts for its own path and every ancestor of it.
    pub(crate) fn touching(&self, pointer: &Pointer) -> &[usize] {
        self.touched
            .get(pointer)
            .map_or(&[], |indices| indices.as_slice())
    }

    fn touch(&mut self, pointer: &Pointer, index: usize) {
        let indices = self.touched.entry(pointer.to_buf()).or_default();
        // A change visits each of its ancestors once
        if indices.last() != Some(&index) {
            indices.push(index);
        }
    }

    fn graft(&mut self, at: &Pointer, body: &Value, deleting: bool) {
        let mut at = at.to_buf();
        let node = node_at(&mut self.value, &at);
        merge(node, body, deleting, &mut at, &mut self.deleted);
    }

    fn remove(&mut self, at: &Pointer) {
        *node_at(&mut self.value, at) = Value::Null;
        self.deleted.insert(at.to_buf());
    }
}

/// Walk to (and create, as objects) the node at `pointer`.
fn node_at<'v>(value: &'v mut Value, pointer: &Pointer) -> &'v mut Value {
    let mut node = value;
    for token in pointer.tokens() {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            unreachable!()
        };
        node = map
            .entry(token.decoded().into_owned())
            .or_insert(Value::Null);
    }
    node
}

/// Deep object assign of `src` into `dst` at pointer `at`.
fn merge(
    dst: &mut Value,
    src: &Value,
    deleting: bool,
    at: &mut PointerBuf,
    deleted: &mut HashSet<PointerBuf>,
) {
    match src {
        Value::Null if deleting => {
            *dst = Value::Null;
            deleted.insert(at.clone());
        }
        Value::Object(entries) => {
            if !dst.is_object() {
                *dst = Value::Object(Map::new());
            }
            deleted.remove(&*at);
            let Value::Object(map) = dst else {
                unreachable!()
            };
            for (key, value) in entries {
                let slot = map.entry(key.clone()).or_insert(Value::Null);
                at.push_back(key.as_str());
                merge(slot, value, deleting, at, deleted);
                at.pop_back();
            }
        }
        // Arrays and scalars replace whole
        other => {
            *dst = other.clone();
            deleted.remove(at);
        }
    }
}
