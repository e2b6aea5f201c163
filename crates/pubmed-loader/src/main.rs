//! PubMed Load - resumable loader for PubMed citation archives

use anyhow::Result;
use clap::{Parser, Subcommand};
use pubmed_common::logging::{init_logging, LogConfig, LogLevel};
use pubmed_loader::config::Settings;
use pubmed_loader::db::create_adapter;
use pubmed_loader::ftp::{NlmFtpClient, TransferClient};
use pubmed_loader::model::FileType;
use pubmed_loader::pipeline::{LoadPipeline, RunOptions, DEFAULT_CHUNK_SIZE};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "pubmed-load")]
#[command(author, version, about = "Resumable loader for PubMed citation archives")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize the database schema and state tracking table
    InitializeDb,

    /// List available files on the NLM server
    ListRemoteFiles {
        /// Skip the baseline directory
        #[arg(long)]
        no_baseline: bool,

        /// Skip the update directory
        #[arg(long)]
        no_updates: bool,
    },

    /// Show the current state of the load history
    CheckStatus,

    /// Reset FAILED files to PENDING so they become eligible again
    ResetFailed,

    /// Run the full baseline load process
    RunBaseline {
        /// Limit number of files
        #[arg(short = 'l', long)]
        limit: Option<usize>,

        /// Drop key constraints for an empty-database load and restore them
        /// afterwards
        #[arg(long)]
        initial_load: bool,

        /// Records per chunk
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
    },

    /// Apply daily update files in strict sequential order
    RunDelta {
        /// Limit number of files
        #[arg(short = 'l', long)]
        limit: Option<usize>,

        /// Records per chunk
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env()?;
    if cli.verbose {
        log_config = log_config.with_level(LogLevel::Debug);
    }
    init_logging(&log_config)?;

    let settings = Settings::load()?;

    match cli.command {
        Command::InitializeDb => {
            info!(mode = %settings.load_mode, "Initializing database");
            let adapter = create_adapter(&settings).await?;
            adapter.initialize_schema(settings.load_mode).await?;
            info!("Database initialized successfully");
        },

        Command::ListRemoteFiles {
            no_baseline,
            no_updates,
        } => {
            let client = NlmFtpClient::new(settings.ftp.clone());
            info!("Connecting to NLM FTP server to list files...");
            if !no_baseline {
                let files = client.list_files(FileType::Baseline).await?;
                info!(count = files.len(), "Available baseline files");
                for pair in &files {
                    debug!(file_name = %pair.data_file, "baseline");
                }
            }
            if !no_updates {
                let files = client.list_files(FileType::Delta).await?;
                info!(count = files.len(), "Available update files");
                for pair in &files {
                    debug!(file_name = %pair.data_file, "update");
                }
            }
        },

        Command::CheckStatus => {
            let adapter = create_adapter(&settings).await?;
            let history = adapter.get_load_history().await?;
            if history.is_empty() {
                info!("No files have been processed yet");
            }
            for entry in &history {
                info!(
                    file_name = %entry.file_name,
                    file_type = %entry.file_type,
                    status = entry.status.as_str(),
                    records_processed = entry.records_processed,
                    "Load history"
                );
            }
        },

        Command::ResetFailed => {
            let adapter = create_adapter(&settings).await?;
            let reset = adapter.reset_failed_files().await?;
            if reset > 0 {
                warn!(count = reset, "Reset failed file(s) to PENDING");
            } else {
                info!("No failed files found to reset");
            }
        },

        Command::RunBaseline {
            limit,
            initial_load,
            chunk_size,
        } => {
            let adapter = create_adapter(&settings).await?;
            let client = NlmFtpClient::new(settings.ftp.clone());
            let pipeline = LoadPipeline::new(&client, adapter.as_ref(), &settings);
            let opts = RunOptions {
                limit,
                chunk_size,
                initial_load,
            };
            let summary = pipeline.run_baseline(&opts).await?;
            if summary.files_failed > 0 {
                warn!(
                    failed = summary.files_failed,
                    "Some baseline files failed; run reset-failed and retry"
                );
            }
        },

        Command::RunDelta { limit, chunk_size } => {
            let adapter = create_adapter(&settings).await?;
            let client = NlmFtpClient::new(settings.ftp.clone());
            let pipeline = LoadPipeline::new(&client, adapter.as_ref(), &settings);
            let opts = RunOptions {
                limit,
                chunk_size,
                initial_load: false,
            };
            pipeline.run_delta(&opts).await?;
        },
    }

    Ok(())
}
