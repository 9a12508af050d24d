//! Wire model for OADA change feeds
//!
//! Consumed as given: the library does not define the change format, it only
//! validates the parts it relies on (a batch is a root change first, then
//! descendants).

use jsonptr::PointerBuf;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Whether a change merges data into a subtree or removes it.
///
/// Any other value on the wire is a deserialization failure, which surfaces
/// as a fatal feed error: batches are assumed valid upstream.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    /// Deep-merge the body into the subtree at `path`.
    Merge,
    /// Remove the keys whose leaves are `null` in the body.
    Delete,
}

/// One sub-change of a [`ChangeBatch`].
#[derive(Clone, Debug, Deserialize)]
pub struct Change {
    /// Merge or delete.
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    /// Pointer relative to the watched resource; empty for the root change.
    pub path: PointerBuf,
    /// New contents at `path`; `null` or absent for whole-subtree deletes.
    #[serde(default)]
    pub body: Option<Value>,
    /// Id of the resource the change was recorded against.
    #[serde(default)]
    pub resource_id: Option<String>,
}

impl Change {
    /// Rev recorded in the change body (`_meta._rev`, falling back to `_rev`).
    #[must_use]
    pub fn rev(&self) -> Option<u64> {
        self.body.as_ref().and_then(body_rev)
    }

    /// Whether this change removes data.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.change_type == ChangeType::Delete
    }
}

/// Extract the rev a resource or change body carries.
pub(crate) fn body_rev(body: &Value) -> Option<u64> {
    let rev = body
        .pointer("/_meta/_rev")
        .or_else(|| body.get("_rev"))?;
    rev.as_u64()
        .or_else(|| rev.as_str().and_then(|s| s.parse().ok()))
}

/// A malformed change batch.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum InvalidBatch {
    /// The batch contained no changes at all.
    #[error("change batch was empty")]
    Empty,
    /// The first change did not target the watched resource itself.
    #[error("first change of a batch must target the list root")]
    RootNotFirst,
}

/// A root change plus zero or more descendant changes, delivered atomically.
#[derive(Clone, Debug, Deserialize)]
#[serde(try_from = "Vec<Change>")]
pub struct ChangeBatch(Vec<Change>);

impl ChangeBatch {
    /// Assemble a batch, validating that the root change comes first.
    pub fn new(changes: Vec<Change>) -> Result<Self, InvalidBatch> {
        let root = changes.first().ok_or(InvalidBatch::Empty)?;
        if !root.path.is_root() {
            return Err(InvalidBatch::RootNotFirst);
        }
        Ok(Self(changes))
    }

    /// The change for the watched resource itself.
    #[must_use]
    pub fn root(&self) -> &Change {
        &self.0[0]
    }

    /// All changes in delivery order, root first.
    #[must_use]
    pub fn changes(&self) -> &[Change] {
        &self.0
    }

    /// Descendant changes with their index into [`Self::changes`].
    pub fn children(&self) -> impl Iterator<Item = (usize, &Change)> {
        self.0.iter().enumerate().skip(1)
    }

    /// List rev this batch advances the resource to.
    #[must_use]
    pub fn rev(&self) -> Option<u64> {
        self.root().rev()
    }

    /// Whether this batch deletes the watched resource itself.
    #[must_use]
    pub fn is_list_deletion(&self) -> bool {
        let root = self.root();
        root.is_delete() && root.body.as_ref().is_none_or(Value::is_null)
    }
}

impl TryFrom<Vec<Change>> for ChangeBatch {
    type Error = InvalidBatch;

    fn try_from(changes: Vec<Change>) -> Result<Self, Self::Error> {
        Self::new(changes)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn batch(value: Value) -> ChangeBatch {
        serde_json::from_value(value).expect("valid batch")
    }

    #[test]
    fn deserializes_wire_shape() {
        let batch = batch(json!([
            {"type": "merge", "path": "", "body": {"K": {"_id": "resources/foo"}, "_rev": 4}},
            {"type": "merge", "path": "/K", "body": {"foo": "bar", "_rev": 4}, "resource_id": "resources/foo"},
        ]));
        assert_eq!(batch.changes().len(), 2);
        assert_eq!(batch.root().change_type, ChangeType::Merge);
        assert!(batch.root().path.is_root());
        assert_eq!(batch.rev(), Some(4));
        let (index, child) = batch.children().next().expect("one child");
        assert_eq!(index, 1);
        assert_eq!(child.path.to_string(), "/K");
        assert_eq!(child.resource_id.as_deref(), Some("resources/foo"));
    }

    #[test]
    fn unknown_change_type_is_rejected() {
        let result: Result<ChangeBatch, _> =
            serde_json::from_value(json!([{"type": "replace", "path": "", "body": {}}]));
        assert!(result.is_err());
    }

    #[test]
    fn empty_batch_is_rejected() {
        assert!(matches!(ChangeBatch::new(vec![]), Err(InvalidBatch::Empty)));
    }

    #[test]
    fn root_must_come_first() {
        let result: Result<ChangeBatch, _> =
            serde_json::from_value(json!([{"type": "merge", "path": "/K", "body": {}}]));
        assert!(result.is_err());
    }

    #[test]
    fn meta_rev_takes_precedence() {
        let change = batch(json!([
            {"type": "merge", "path": "", "body": {"_meta": {"_rev": 7}, "_rev": 4}},
        ]));
        assert_eq!(change.rev(), Some(7));
    }

    #[test]
    fn string_revs_are_parsed() {
        let change = batch(json!([{"type": "merge", "path": "", "body": {"_rev": "42"}}]));
        assert_eq!(change.rev(), Some(42));
    }

    #[test]
    fn list_deletion_is_detected() {
        assert!(batch(json!([{"type": "delete", "path": "", "body": null}])).is_list_deletion());
        assert!(batch(json!([{"type": "delete", "path": ""}])).is_list_deletion());
        assert!(!batch(json!([{"type": "delete", "path": "", "body": {"K": null, "_rev": 4}}]))
            .is_list_deletion());
        assert!(!batch(json!([{"type": "merge", "path": "", "body": {}}])).is_list_deletion());
    }
}
