//! tillsync - offline-first replication and local query engine for
//! point-of-sale terminals backed by a WooCommerce-style REST API.
//!
//! The local store is the single source of truth for the UI. Background
//! coordinators pull remote records into it page by page, an auditor
//! reconciles remote and local ID sets, and a reactive query pipeline
//! turns store changes into ordered ID lists for views. Local writes are
//! optimistic: they land in the store first and are pushed to the server,
//! rolling back only on definitive rejection.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tillsync::config::{SyncConfig, SyncContext};
//! use tillsync::query::{QueryPipeline, QueryState, SortDirection};
//! use tillsync::resource::ResourceKind;
//! use tillsync::store::memory::MemoryStore;
//!
//! # async fn demo() -> tillsync::error::Result<()> {
//! let store = MemoryStore::new();
//! let config = SyncConfig {
//!     base_url: "https://shop.example/wp-json/wc/v3".to_string(),
//!     device_scope: "till-1".to_string(),
//!     ..Default::default()
//! };
//! let ctx = SyncContext::new(config, store.clone(), store.clone())?;
//!
//! // Start replicating products and watch them locally.
//! let query = QueryState::new("name", SortDirection::Asc);
//! ctx.coordinator(ResourceKind::Product, &query);
//! let pipeline = QueryPipeline::open(
//!     store as Arc<dyn tillsync::store::LocalStore>,
//!     ResourceKind::Product.collection(),
//!     query,
//!     10,
//! )
//! .await?;
//! let mut ids = pipeline.subscribe();
//! while ids.changed().await.is_ok() {
//!     println!("visible products: {}", ids.borrow().len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod mutation;
pub mod query;
pub mod resource;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod transport;

pub use config::{SyncConfig, SyncContext};
pub use error::{Result, TillSyncError};
pub use mutation::MutationPipeline;
pub use query::{QueryPipeline, QueryState};
pub use resource::ResourceKind;
pub use store::{Document, LocalStore, LocalValueStore};
pub use sync::{Coordinator, ReplicationIdentity, SyncStatus};
