//! PubMed Citation Loader Library
//!
//! Resilient, resumable ETL for PubMed citation archives. Downloads the
//! gzipped XML dumps from the NLM FTP server, streams them through a
//! memory-bounded transformer, and bulk-loads the result into PostgreSQL
//! using transient staging tables and upsert merges.
//!
//! # Architecture
//!
//! - **config**: environment-based settings (`PUBMED_*` variables)
//! - **model**: record types for both citation representations and the
//!   per-file load history
//! - **parser**: streaming XML transformer yielding upsert/deletion chunks
//! - **db**: database adapter trait, the PostgreSQL implementation, and the
//!   COPY text-format encoder
//! - **ftp**: transfer client for the NLM baseline/update directories
//! - **pipeline**: run orchestration (per-file state machine, failure policy)
//!
//! # Example
//!
//! ```no_run
//! use pubmed_loader::config::Settings;
//! use pubmed_loader::db::create_adapter;
//! use pubmed_loader::ftp::NlmFtpClient;
//! use pubmed_loader::pipeline::{LoadPipeline, RunOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load()?;
//!     let adapter = create_adapter(&settings).await?;
//!     let client = NlmFtpClient::new(settings.ftp.clone());
//!     let pipeline = LoadPipeline::new(&client, adapter.as_ref(), &settings);
//!     pipeline.run_baseline(&RunOptions::default()).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod db;
pub mod ftp;
pub mod model;
pub mod parser;
pub mod pipeline;

pub use config::Settings;
pub use pipeline::{LoadPipeline, RunOptions, RunSummary};
