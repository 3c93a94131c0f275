//! Batch synchronization of Trino query history with table-level lineage.
//!
//! One run pulls the current contents of `system.runtime.queries` in offset
//! windows, extracts the source tables of each query by static SQL analysis,
//! persists an idempotent history plus a query/table link graph in Postgres,
//! and pushes lineage-annotated query metadata to an OpenMetadata-compatible
//! catalog over its REST API. Re-runs reprocess from offset 0; every write is
//! an idempotent upsert, so overlap is harmless and partial failures leave
//! completed batches committed.

pub mod catalog;
pub mod config;
pub mod db;
pub mod lineage;
pub mod models;
pub mod pipeline;
pub mod schema;
pub mod trino;

pub use lineage::{extract_source_tables, Lineage, PARSE_FAILURE_SENTINEL};
pub use pipeline::{RunSummary, SyncPipeline};
