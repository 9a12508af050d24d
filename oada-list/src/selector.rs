//! Items selector: which nodes inside the list count as items
//!
//! The default selects the list's direct children whose key does not start
//! with `_` (underscore keys are OADA bookkeeping, not data). Callers with
//! nested lists supply a JSONPath expression instead; matches are reported
//! with the JSON pointer of each matched node so events can name items.

use std::{fmt, str::FromStr, sync::Arc};

use jsonpath_rust::{JsonPath, JsonPathValue};
use jsonptr::{PointerBuf, Token};
use serde_json::Value;
use thiserror::Error;

/// Errors from parsing or applying an items selector.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The JSONPath expression did not parse.
    #[error("invalid items path: {0}")]
    Parse(String),
    /// The engine reported a match at a path the library cannot name.
    #[error("unrepresentable match path {0:?}")]
    MatchPath(String),
}

/// Selector identifying the item nodes of a list.
#[derive(Clone)]
pub enum ItemsPath {
    /// Direct children whose key does not start with `_`.
    Children,
    /// A caller-supplied JSONPath expression over the list.
    Expr {
        /// The expression as given.
        source: String,
        /// The parsed query.
        path: Arc<JsonPath>,
    },
}

/// One selected item: its pointer within the list and its value there.
#[derive(Clone, Debug)]
pub struct ItemMatch {
    /// JSON pointer of the item inside the list.
    pub pointer: PointerBuf,
    /// The item node's value in the queried tree.
    pub value: Value,
}

impl ItemsPath {
    /// Parse a JSONPath expression into a selector.
    pub fn expr(source: impl Into<String>) -> Result<Self, Error> {
        let source = source.into();
        let path = JsonPath::from_str(&source).map_err(|err| Error::Parse(err.to_string()))?;
        Ok(Self::Expr {
            source,
            path: Arc::new(path),
        })
    }

    /// Apply the selector, yielding matches in document order.
    ///
    /// Matches whose pointer contains a component starting with `_` never
    /// appear, for either variant.
    pub fn select(&self, list: &Value) -> Result<Vec<ItemMatch>, Error> {
        let mut matches = Vec::new();
        match self {
            ItemsPath::Children => {
                let Some(entries) = list.as_object() else {
                    return Ok(matches);
                };
                for (key, value) in entries {
                    if key.starts_with('_') {
                        continue;
                    }
                    let mut pointer = PointerBuf::new();
                    pointer.push_back(Token::new(key.as_str()));
                    matches.push(ItemMatch {
                        pointer,
                        value: value.clone(),
                    });
                }
            }
            ItemsPath::Expr { path, .. } => {
                for found in path.find_slice(list) {
                    match found {
                        JsonPathValue::Slice(value, path) => {
                            let pointer = jsonpath_to_pointer(&path)?;
                            if pointer
                                .tokens()
                                .any(|token| token.decoded().starts_with('_'))
                            {
                                continue;
                            }
                            matches.push(ItemMatch {
                                pointer,
                                value: value.clone(),
                            });
                        }
                        // values constructed by the query have no location
                        JsonPathValue::NewValue(_) | JsonPathValue::NoValue => {}
                    }
                }
            }
        }
        Ok(matches)
    }
}

impl Default for ItemsPath {
    fn default() -> Self {
        Self::Children
    }
}

impl FromStr for ItemsPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::expr(s)
    }
}

impl fmt::Debug for ItemsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemsPath::Children => f.write_str("ItemsPath::Children"),
            ItemsPath::Expr { source, .. } => f.debug_tuple("ItemsPath::Expr").field(source).finish(),
        }
    }
}

/// Convert the engine's match-path notation (`$.['a'].['b'][0]`) to a
/// JSON pointer.
fn jsonpath_to_pointer(path: &str) -> Result<PointerBuf, Error> {
    let err = || Error::MatchPath(path.to_owned());
    let mut pointer = PointerBuf::new();
    let mut rest = path.strip_prefix('$').ok_or_else(err)?;
    loop {
        rest = rest.trim_start_matches('.');
        if rest.is_empty() {
            return Ok(pointer);
        }
        let inner = rest.strip_prefix('[').ok_or_else(err)?;
        if let Some(quoted) = inner.strip_prefix('\'').or_else(|| inner.strip_prefix('"')) {
            let quote = inner.chars().next().unwrap_or('\'');
            let end = quoted.find(quote).ok_or_else(err)?;
            pointer.push_back(Token::new(&quoted[..end]));
            rest = quoted[end + 1..].strip_prefix(']').ok_or_else(err)?;
        } else {
            let end = inner.find(']').ok_or_else(err)?;
            let index = &inner[..end];
            if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
                return Err(err());
            }
            pointer.push_back(Token::new(index));
            rest = &inner[end + 1..];
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn pointers(matches: &[ItemMatch]) -> Vec<String> {
        matches.iter().map(|m| m.pointer.to_string()).collect()
    }

    #[test]
    fn children_skips_underscore_keys() {
        let list = json!({
            "a": {"_id": "resources/a"},
            "_meta": {"_rev": 4},
            "_rev": 4,
            "b": {"_id": "resources/b"},
        });
        let matches = ItemsPath::Children.select(&list).expect("selects");
        assert_eq!(pointers(&matches), ["/a", "/b"]);
        assert_eq!(matches[0].value, json!({"_id": "resources/a"}));
    }

    #[test]
    fn children_of_non_object_is_empty() {
        assert!(ItemsPath::Children
            .select(&json!([1, 2]))
            .expect("selects")
            .is_empty());
    }

    #[test]
    fn expr_reports_pointers() {
        let selector: ItemsPath = "$.*.*".parse().expect("parses");
        let list = json!({"day1": {"a": {"_id": "resources/a"}}, "day2": {"b": {"_id": "resources/b"}}});
        let matches = selector.select(&list).expect("selects");
        assert_eq!(pointers(&matches), ["/day1/a", "/day2/b"]);
    }

    #[test]
    fn expr_filters_underscore_ancestry() {
        let selector: ItemsPath = "$.*".parse().expect("parses");
        let list = json!({"a": 1, "_meta": {"x": 2}});
        let matches = selector.select(&list).expect("selects");
        assert_eq!(pointers(&matches), ["/a"]);
    }

    #[test]
    fn invalid_expr_is_a_parse_error() {
        assert!(matches!(ItemsPath::expr("$[????"), Err(Error::Parse(_))));
    }

    #[test]
    fn match_paths_convert_to_pointers() {
        for (path, pointer) in [
            ("$", ""),
            ("$.['K']", "/K"),
            ("$['a']['b']", "/a/b"),
            ("$.['a'].[0]", "/a/0"),
            ("$[\"x y\"][10]", "/x y/10"),
        ] {
            assert_eq!(
                jsonpath_to_pointer(path).expect("converts").to_string(),
                pointer
            );
        }
        assert!(jsonpath_to_pointer("K.x").is_err());
        assert!(jsonpath_to_pointer("$.[abc]").is_err());
    }
}
