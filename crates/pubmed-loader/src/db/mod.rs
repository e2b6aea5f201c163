//! Database adapters
//!
//! The loader talks to its durable store through the [`DatabaseAdapter`]
//! trait: the per-file load state machine (§load history) and the
//! staging-then-merge bulk loading protocol. Adapters are resolved through a
//! static registry keyed by the configured adapter name.

pub mod copy;
mod postgres;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::Settings;
use crate::model::{FileType, LoadHistory, LoadMode, LoadStatus};
use crate::parser::UpsertChunk;

pub use postgres::PostgresAdapter;

/// Optional fields accompanying a load-state transition
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub file_type: Option<FileType>,
    pub md5_checksum: Option<String>,
    pub records_processed: Option<i32>,
}

/// Optimization stage bracketing an initial bulk load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizeStage {
    /// Drop key constraints before loading into an empty database
    PreLoad,
    /// Recreate the constraints afterwards
    PostLoad,
}

/// Contract the persistent store must satisfy
///
/// Every method acquires its own connection for the duration of the call;
/// no state is cached between calls, so the store always reflects external
/// changes such as a manual reset between runs.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Create the final tables and the load history table
    async fn initialize_schema(&self, mode: LoadMode) -> Result<()>;

    /// (Re)create empty, unindexed staging tables for one file's load
    async fn create_staging_tables(&self, mode: LoadMode) -> Result<()>;

    /// Append a chunk's upsert records to the staging tables
    async fn bulk_load_chunk(&self, chunk: &UpsertChunk) -> Result<()>;

    /// Remove the given PMIDs from the final tables; returns rows removed
    async fn process_deletions(&self, pmids: &[i32], mode: LoadMode) -> Result<u64>;

    /// Move staged rows into the final tables and drop staging
    ///
    /// With `is_initial_load` the merge is a plain bulk insert and assumes
    /// key constraints were dropped via [`DatabaseAdapter::optimize_database`];
    /// calling the non-initial merge while constraints are absent is a
    /// caller error.
    async fn execute_merge_strategy(&self, mode: LoadMode, is_initial_load: bool) -> Result<()>;

    /// Record a per-file status transition, creating the row if absent
    async fn manage_load_state(
        &self,
        file_name: &str,
        status: LoadStatus,
        update: StateUpdate,
    ) -> Result<()>;

    /// Drop (pre-load) or recreate (post-load) key constraints on the final
    /// tables around an initial baseline run
    async fn optimize_database(&self, stage: OptimizeStage, mode: LoadMode) -> Result<()>;

    /// File names whose status is COMPLETE, in no particular order
    async fn get_completed_files(&self) -> Result<Vec<String>>;

    /// All load history rows, ordered by file name
    async fn get_load_history(&self) -> Result<Vec<LoadHistory>>;

    /// Reset every FAILED row to PENDING; returns the number reset
    async fn reset_failed_files(&self) -> Result<u64>;

    /// Whether at least one BASELINE file has completed
    async fn has_completed_baseline(&self) -> Result<bool>;
}

/// Create the adapter named in the configuration
///
/// Static registry: adapters are compiled in, not discovered at runtime.
pub async fn create_adapter(settings: &Settings) -> Result<Box<dyn DatabaseAdapter>> {
    match settings.db_adapter.as_str() {
        "postgresql" | "postgres" => {
            let adapter = PostgresAdapter::connect(&settings.database_url).await?;
            Ok(Box::new(adapter))
        },
        other => anyhow::bail!(
            "Unknown database adapter '{}' (available adapters: postgresql)",
            other
        ),
    }
}

/// Normalized-representation tables, in staging-creation and merge order
/// (dimensions before the rows that reference them)
pub(crate) fn normalized_tables() -> &'static [&'static str] {
    &[
        "journals",
        "authors",
        "mesh_terms",
        "citations",
        "citation_authors",
        "citation_mesh_terms",
    ]
}

/// Per-table record counts of a chunk, for logging
pub fn chunk_table_counts(chunk: &UpsertChunk) -> HashMap<&'static str, usize> {
    let mut counts = HashMap::new();
    counts.insert("citations_json", chunk.documents.len());
    counts.insert("journals", chunk.journals.len());
    counts.insert("citations", chunk.citations.len());
    counts.insert("authors", chunk.authors.len());
    counts.insert("citation_authors", chunk.citation_authors.len());
    counts.insert("mesh_terms", chunk.mesh_terms.len());
    counts.insert("citation_mesh_terms", chunk.citation_mesh_terms.len());
    counts.retain(|_, count| *count > 0);
    counts
}
