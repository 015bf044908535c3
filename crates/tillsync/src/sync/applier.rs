//! Applies fetched remote pages to the local store.
//!
//! Remote records are normalized into local documents; embedded
//! cross-referenced entities are upserted before their parent so foreign
//! keys resolve; audit tombstones are applied as deletions.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::error::{Result, TillSyncError};
use crate::resource::ResourceKind;
use crate::store::{Document, LocalStore};

use super::audit::Tombstone;

/// Outcome of applying one page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppliedPage {
    pub upserts: usize,
    /// Max modification time seen in the page, for the checkpoint
    /// watermark.
    pub max_modified: Option<String>,
}

/// Upserts every record of a fetched page.
pub async fn apply_page(
    store: &Arc<dyn LocalStore>,
    kind: ResourceKind,
    records: &[Value],
) -> Result<AppliedPage> {
    let mut applied = AppliedPage::default();
    for record in records {
        apply_embedded_refs(store, kind, record).await?;
        let doc = normalize(store, kind, record.clone()).await?;
        if let Some(modified) = doc
            .date_modified
            .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string())
        {
            let newer = applied
                .max_modified
                .as_deref()
                .map(|m| modified.as_str() > m)
                .unwrap_or(true);
            if newer {
                applied.max_modified = Some(modified);
            }
        }
        store
            .upsert(kind.collection(), doc)
            .await
            .map_err(apply_error)?;
        applied.upserts += 1;
    }
    debug!("applied {} {} records", applied.upserts, kind);
    Ok(applied)
}

/// Deletes locally the records the audit flagged as gone server-side.
pub async fn apply_tombstones(
    store: &Arc<dyn LocalStore>,
    kind: ResourceKind,
    tombstones: &[Tombstone],
) -> Result<usize> {
    for t in tombstones {
        store
            .remove(kind.collection(), &t.local_id)
            .await
            .map_err(apply_error)?;
    }
    if !tombstones.is_empty() {
        debug!("removed {} {} records per audit", tombstones.len(), kind);
    }
    Ok(tombstones.len())
}

/// Embedded cross-referenced entities land in their own collections first.
/// A product carries its categories and tags inline; a variation carries a
/// stub of its parent product.
async fn apply_embedded_refs(
    store: &Arc<dyn LocalStore>,
    kind: ResourceKind,
    record: &Value,
) -> Result<()> {
    match kind {
        ResourceKind::Product => {
            upsert_embedded_list(store, ResourceKind::Category, record.get("categories")).await?;
            upsert_embedded_list(store, ResourceKind::Tag, record.get("tags")).await?;
        }
        ResourceKind::ProductVariation => {
            if let Some(parent_id) = record.get("parent_id").and_then(Value::as_u64) {
                if store
                    .find_by_remote_id(ResourceKind::Product.collection(), parent_id)
                    .await
                    .map_err(apply_error)?
                    .is_none()
                {
                    let stub = Document::from_remote(serde_json::json!({ "id": parent_id }));
                    store
                        .upsert(ResourceKind::Product.collection(), stub)
                        .await
                        .map_err(apply_error)?;
                }
            }
        }
        _ => {}
    }
    Ok(())
}

async fn upsert_embedded_list(
    store: &Arc<dyn LocalStore>,
    kind: ResourceKind,
    items: Option<&Value>,
) -> Result<()> {
    let Some(items) = items.and_then(Value::as_array) else {
        return Ok(());
    };
    for item in items {
        if item.get("id").and_then(Value::as_u64).is_none() {
            continue;
        }
        let doc = normalize(store, kind, item.clone()).await?;
        // Embedded stubs never overwrite a full record already present.
        let exists = store
            .get(kind.collection(), &doc.local_id)
            .await
            .map_err(apply_error)?
            .is_some();
        if !exists {
            store
                .upsert(kind.collection(), doc)
                .await
                .map_err(apply_error)?;
        }
    }
    Ok(())
}

/// Normalizes a remote record, adopting an existing local document when one
/// already tracks the same remote ID (an optimistic create that has been
/// pushed keeps its device-local primary key).
async fn normalize(
    store: &Arc<dyn LocalStore>,
    kind: ResourceKind,
    record: Value,
) -> Result<Document> {
    let mut doc = Document::from_remote(record);
    if let Some(remote_id) = doc.remote_id {
        if let Some(existing) = store
            .find_by_remote_id(kind.collection(), remote_id)
            .await
            .map_err(apply_error)?
        {
            doc.local_id = existing.local_id;
        }
    }
    Ok(doc)
}

fn apply_error(e: TillSyncError) -> TillSyncError {
    match e {
        TillSyncError::Apply(_) => e,
        other => TillSyncError::Apply(other.to_string()),
    }
}
