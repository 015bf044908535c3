//! Local query -> remote endpoint parameters.
//!
//! Pure and deterministic: no I/O, same inputs always produce the same
//! parameter map.

use serde_json::Value;

use crate::query::state::{FilterValue, QueryState, StructuredFilter};
use crate::resource::ResourceKind;
use crate::transport::Params;

/// Translation result. `unscoped` is true when the parameters describe a
/// full unfiltered fetch (nothing beyond pagination and ordering); the
/// coordinator then prefers the audit path over a pathological
/// full-collection refetch.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslatedParams {
    pub params: Params,
    pub unscoped: bool,
}

/// Maps a query snapshot onto remote query parameters.
///
/// - selector keys go through the per-resource alias table;
/// - an `id ∈ {…}` membership filter becomes the `include` list parameter;
/// - an elemMatch-style sub-filter on `{id}` flattens to the scalar id;
/// - `search` is emitted only when non-empty;
/// - sort maps to `orderby`/`order` with per-resource field renames;
/// - `per_page` is always present, `page` only when a cursor is given.
pub fn translate(
    kind: ResourceKind,
    state: &QueryState,
    page: Option<u64>,
    per_page: u64,
) -> TranslatedParams {
    let mut params = Params::new();
    let mut scoped = false;

    for (key, value) in state.selector.iter() {
        let alias = kind.selector_alias(key).to_string();
        match value {
            FilterValue::Eq(v) => {
                params.insert(alias, scalar_string(v));
                scoped = true;
            }
            FilterValue::In(set) => {
                let joined = join_scalars(set);
                if key == "id" {
                    params.insert("include".to_string(), joined);
                } else {
                    params.insert(alias, joined);
                }
                scoped = true;
            }
            FilterValue::ElemMatch(sub) => {
                if let Some(id) = elem_match_id(sub) {
                    params.insert(alias, id);
                    scoped = true;
                }
            }
        }
    }

    let search = state.search.trim();
    if !search.is_empty() {
        params.insert("search".to_string(), search.to_string());
        scoped = true;
    }

    params.insert(
        "orderby".to_string(),
        kind.remote_sort_field(&state.sort_by).to_string(),
    );
    params.insert("order".to_string(), state.sort_direction.as_str().to_string());
    params.insert("per_page".to_string(), per_page.to_string());
    if let Some(page) = page {
        params.insert("page".to_string(), page.to_string());
    }

    TranslatedParams {
        params,
        unscoped: !scoped,
    }
}

/// Flattens `$elemMatch`-style `{id: X}` to the scalar id value.
fn elem_match_id(sub: &StructuredFilter) -> Option<String> {
    match sub.get("id")? {
        FilterValue::Eq(v) => Some(scalar_string(v)),
        FilterValue::In(set) => Some(join_scalars(set)),
        FilterValue::ElemMatch(_) => None,
    }
}

fn scalar_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn join_scalars(set: &[Value]) -> String {
    set.iter().map(scalar_string).collect::<Vec<_>>().join(",")
}
