//! Run orchestration for baseline and delta loads
//!
//! Drives the per-file state machine: DOWNLOADING → LOADING → COMPLETE or
//! FAILED, with the transition written before and after every risky step so
//! an interrupted process can resume from the recorded status. Files are
//! processed sequentially in file-name order, which is chronological for
//! the NLM naming convention.
//!
//! Failure policy differs by run kind: a baseline run logs a failed file
//! and continues with the next one, while a delta run aborts immediately —
//! each update archive is a differential against the previous cumulative
//! state, so skipping ahead would silently lose updates.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::db::{DatabaseAdapter, OptimizeStage, StateUpdate};
use crate::ftp::{FilePair, TransferClient};
use crate::model::{FileType, LoadStatus};
use crate::parser::{CitationStream, OperationChunk};

/// Default number of records per operation chunk
pub const DEFAULT_CHUNK_SIZE: usize = 20_000;

/// Options for a baseline or delta run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum number of files to process
    pub limit: Option<usize>,

    /// Records per operation chunk
    pub chunk_size: usize,

    /// Load into an empty database with key constraints dropped for speed;
    /// only meaningful for a baseline run
    pub initial_load: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            limit: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            initial_load: false,
        }
    }
}

/// Aggregate outcome of a run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub files_processed: usize,
    pub files_failed: usize,
    pub records_processed: u64,
}

/// Sequences transformer output into the loader, one file at a time
pub struct LoadPipeline<'a> {
    client: &'a dyn TransferClient,
    adapter: &'a dyn DatabaseAdapter,
    settings: &'a Settings,
}

impl<'a> LoadPipeline<'a> {
    pub fn new(
        client: &'a dyn TransferClient,
        adapter: &'a dyn DatabaseAdapter,
        settings: &'a Settings,
    ) -> Self {
        Self {
            client,
            adapter,
            settings,
        }
    }

    /// Run the baseline load: process every new baseline file, continuing
    /// past individual failures
    pub async fn run_baseline(&self, opts: &RunOptions) -> Result<RunSummary> {
        info!(
            mode = %self.settings.load_mode,
            initial_load = opts.initial_load,
            "Starting baseline load"
        );

        let files = self.files_to_process(FileType::Baseline, opts.limit).await?;
        if files.is_empty() {
            info!("No new baseline files to process");
            return Ok(RunSummary::default());
        }
        info!(count = files.len(), "Found new baseline files to process");

        if opts.initial_load {
            self.adapter
                .optimize_database(OptimizeStage::PreLoad, self.settings.load_mode)
                .await
                .context("Pre-load optimization failed")?;
        }

        let mut summary = RunSummary::default();
        for pair in &files {
            match self.process_file(pair, FileType::Baseline, opts).await {
                Ok(records) => {
                    summary.files_processed += 1;
                    summary.records_processed += records;
                },
                Err(e) => {
                    summary.files_failed += 1;
                    error!(
                        file_name = %pair.data_file,
                        error = ?e,
                        "File failed, continuing with next baseline file"
                    );
                },
            }
        }

        if opts.initial_load {
            self.adapter
                .optimize_database(OptimizeStage::PostLoad, self.settings.load_mode)
                .await
                .context("Post-load optimization failed")?;
        }

        info!(
            processed = summary.files_processed,
            failed = summary.files_failed,
            records = summary.records_processed,
            "Baseline run finished"
        );
        Ok(summary)
    }

    /// Run the delta load: apply every new update file in strict order,
    /// aborting on the first failure
    pub async fn run_delta(&self, opts: &RunOptions) -> Result<RunSummary> {
        info!(mode = %self.settings.load_mode, "Starting delta load");

        if !self
            .adapter
            .has_completed_baseline()
            .await
            .context("Failed to check baseline completion")?
        {
            anyhow::bail!("A baseline load must complete before delta files can be processed");
        }

        let files = self.files_to_process(FileType::Delta, opts.limit).await?;
        if files.is_empty() {
            info!("No new update files to process");
            return Ok(RunSummary::default());
        }
        info!(count = files.len(), "Found new update files to process");

        let mut summary = RunSummary::default();
        for pair in &files {
            let records = self
                .process_file(pair, FileType::Delta, opts)
                .await
                .with_context(|| {
                    format!(
                        "Aborting delta run at {} to preserve sequential ordering",
                        pair.data_file
                    )
                })?;
            summary.files_processed += 1;
            summary.records_processed += records;
        }

        info!(
            processed = summary.files_processed,
            records = summary.records_processed,
            "Delta run finished"
        );
        Ok(summary)
    }

    /// Remote files not yet completed, sorted ascending by file name
    async fn files_to_process(
        &self,
        kind: FileType,
        limit: Option<usize>,
    ) -> Result<Vec<FilePair>> {
        let remote = self
            .client
            .list_files(kind)
            .await
            .context("Failed to list remote files")?;

        let completed: HashSet<String> = self
            .adapter
            .get_completed_files()
            .await
            .context("Failed to query completed files")?
            .into_iter()
            .collect();

        let mut files: Vec<FilePair> = remote
            .into_iter()
            .filter(|pair| !completed.contains(&pair.data_file))
            .collect();
        files.sort_by(|a, b| a.data_file.cmp(&b.data_file));

        if let Some(limit) = limit {
            if files.len() > limit {
                info!(limit, "Limiting number of files to process");
                files.truncate(limit);
            }
        }

        Ok(files)
    }

    /// Process one file through the full state machine
    ///
    /// On error the FAILED transition is recorded best-effort and the error
    /// re-raised; the downloaded file is removed in every outcome.
    async fn process_file(
        &self,
        pair: &FilePair,
        file_type: FileType,
        opts: &RunOptions,
    ) -> Result<u64> {
        info!(
            file_name = %pair.data_file,
            file_type = file_type.as_str(),
            "Processing file"
        );

        let mut local_path: Option<PathBuf> = None;
        let result = self.load_file(pair, file_type, opts, &mut local_path).await;

        if result.is_err() {
            // Best-effort: a failure to record FAILED must not mask the
            // original error
            if let Err(state_err) = self
                .adapter
                .manage_load_state(&pair.data_file, LoadStatus::Failed, StateUpdate::default())
                .await
            {
                warn!(
                    file_name = %pair.data_file,
                    error = ?state_err,
                    "Could not record FAILED status"
                );
            }
        }

        if let Some(path) = local_path {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => info!(path = %path.display(), "Cleaned up local file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "Could not remove downloaded file"
                ),
            }
        }

        result
    }

    async fn load_file(
        &self,
        pair: &FilePair,
        file_type: FileType,
        opts: &RunOptions,
        local_path: &mut Option<PathBuf>,
    ) -> Result<u64> {
        let mode = self.settings.load_mode;

        let checksum = self
            .client
            .fetch_checksum(file_type, &pair.checksum_file)
            .await
            .context("Failed to fetch remote checksum")?;

        self.adapter
            .manage_load_state(
                &pair.data_file,
                LoadStatus::Downloading,
                StateUpdate {
                    file_type: Some(file_type),
                    md5_checksum: Some(checksum),
                    ..Default::default()
                },
            )
            .await
            .context("Failed to record DOWNLOADING status")?;

        info!(file_name = %pair.data_file, "Downloading and verifying file");
        let path = self
            .client
            .fetch_and_verify(file_type, pair, &self.settings.local_staging_dir)
            .await
            .context("Failed to download and verify file")?;
        *local_path = Some(path.clone());

        self.adapter
            .manage_load_state(&pair.data_file, LoadStatus::Loading, StateUpdate::default())
            .await
            .context("Failed to record LOADING status")?;

        self.adapter
            .create_staging_tables(mode)
            .await
            .context("Failed to create staging tables")?;
        debug!(file_name = %pair.data_file, "Staging tables created");

        let mut total: u64 = 0;
        let stream = CitationStream::from_gzip_path(&path, mode, opts.chunk_size)?;
        for chunk in stream {
            match chunk.context("Failed to parse citation archive")? {
                OperationChunk::Upsert(chunk) => {
                    let records = chunk.record_count();
                    info!(file_name = %pair.data_file, records, "Staging upserts");
                    self.adapter
                        .bulk_load_chunk(&chunk)
                        .await
                        .context("Failed to bulk load chunk")?;
                    total += records as u64;
                },
                OperationChunk::Delete(pmids) => {
                    info!(file_name = %pair.data_file, count = pmids.len(), "Processing deletions");
                    self.adapter
                        .process_deletions(&pmids, mode)
                        .await
                        .context("Failed to process deletions")?;
                    total += pmids.len() as u64;
                },
            }
        }

        info!(file_name = %pair.data_file, "Merging staged data into final tables");
        self.adapter
            .execute_merge_strategy(mode, opts.initial_load)
            .await
            .context("Failed to merge staged data")?;

        self.adapter
            .manage_load_state(
                &pair.data_file,
                LoadStatus::Complete,
                StateUpdate {
                    records_processed: Some(total as i32),
                    ..Default::default()
                },
            )
            .await
            .context("Failed to record COMPLETE status")?;

        info!(
            file_name = %pair.data_file,
            records_processed = total,
            "Successfully processed file"
        );
        Ok(total)
    }
}
