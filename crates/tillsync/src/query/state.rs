//! Immutable query snapshots.
//!
//! Every mutation produces a new [`QueryState`] value; subscribers holding a
//! prior snapshot never observe in-place changes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::store::Document;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl Default for SortDirection {
    fn default() -> Self {
        SortDirection::Asc
    }
}

impl SortDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

/// One structured filter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterValue {
    /// Field equals the scalar.
    Eq(Value),
    /// Field (or remote ID) is a member of the set.
    In(Vec<Value>),
    /// Array field contains at least one element matching the sub-filter.
    ElemMatch(StructuredFilter),
}

/// ANDed map of field -> filter value. Ordered so serialized shapes are
/// deterministic.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StructuredFilter(pub BTreeMap<String, FilterValue>);

impl StructuredFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&FilterValue> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FilterValue)> {
        self.0.iter()
    }

    /// Returns a copy with `key` set to `value`.
    pub fn with(&self, key: impl Into<String>, value: FilterValue) -> Self {
        let mut map = self.0.clone();
        map.insert(key.into(), value);
        Self(map)
    }

    /// Returns a copy with `key` removed.
    pub fn without(&self, key: &str) -> Self {
        let mut map = self.0.clone();
        map.remove(key);
        Self(map)
    }

    /// Evaluates the filter against a local document. Empty filter matches
    /// everything.
    pub fn matches(&self, doc: &Document) -> bool {
        self.0.iter().all(|(key, fv)| match fv {
            FilterValue::Eq(expected) => doc.field(key).map(|v| v == expected).unwrap_or(false),
            FilterValue::In(set) => doc
                .field(key)
                .map(|v| set.iter().any(|s| s == v))
                .unwrap_or(false),
            FilterValue::ElemMatch(sub) => doc
                .field(key)
                .and_then(Value::as_array)
                .map(|items| {
                    items.iter().any(|item| {
                        sub.0.iter().all(|(sk, sv)| match sv {
                            FilterValue::Eq(expected) => {
                                item.get(sk).map(|v| v == expected).unwrap_or(false)
                            }
                            FilterValue::In(set) => item
                                .get(sk)
                                .map(|v| set.iter().any(|s| s == v))
                                .unwrap_or(false),
                            // Nested elemMatch is not a supported shape.
                            FilterValue::ElemMatch(_) => false,
                        })
                    })
                })
                .unwrap_or(false),
        })
    }
}

/// Immutable snapshot of one local query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryState {
    pub search: String,
    pub selector: StructuredFilter,
    pub sort_by: String,
    pub sort_direction: SortDirection,
}

impl Default for QueryState {
    fn default() -> Self {
        Self {
            search: String::new(),
            selector: StructuredFilter::new(),
            sort_by: "name".to_string(),
            sort_direction: SortDirection::Asc,
        }
    }
}

impl QueryState {
    pub fn new(sort_by: impl Into<String>, sort_direction: SortDirection) -> Self {
        Self {
            search: String::new(),
            selector: StructuredFilter::new(),
            sort_by: sort_by.into(),
            sort_direction,
        }
    }

    pub fn has_search(&self) -> bool {
        !self.search.trim().is_empty()
    }

    pub fn with_search(&self, search: impl Into<String>) -> Self {
        Self {
            search: search.into(),
            ..self.clone()
        }
    }

    pub fn with_selector_entry(&self, key: impl Into<String>, value: FilterValue) -> Self {
        Self {
            selector: self.selector.with(key, value),
            ..self.clone()
        }
    }

    pub fn without_selector_entry(&self, key: &str) -> Self {
        Self {
            selector: self.selector.without(key),
            ..self.clone()
        }
    }

    pub fn with_sort(&self, sort_by: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            sort_by: sort_by.into(),
            sort_direction: direction,
            ..self.clone()
        }
    }

    /// Canonical JSON describing the shape of this query for replication
    /// identity purposes. Search text is part of the shape: a text-search
    /// variant is a distinct poller with its own checkpoint.
    pub fn query_shape(&self) -> Value {
        serde_json::json!({
            "search": self.search.trim(),
            "selector": self.selector,
            "sort_by": self.sort_by,
            "sort_direction": self.sort_direction.as_str(),
        })
    }
}
