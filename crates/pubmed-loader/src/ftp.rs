//! NLM FTP transfer client
//!
//! Lists the baseline and update directories, fetches checksum sidecars,
//! and downloads archives with verification. All FTP I/O runs inside
//! `spawn_blocking` with retry logic; Extended Passive Mode is used for
//! better NAT/firewall compatibility.
//!
//! The pipeline depends only on the [`TransferClient`] trait, so tests can
//! substitute a local fixture client.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use suppaftp::FtpStream;
use tracing::{debug, info, warn};

use crate::config::FtpSettings;
use crate::model::FileType;
use pubmed_common::checksum;

/// Maximum number of attempts for any FTP operation
pub const MAX_RETRIES: u32 = 3;

/// Base delay between retry attempts (in seconds); the actual delay is this
/// value multiplied by the attempt number
pub const RETRY_DELAY_SECS: u64 = 5;

/// Remote directory holding the annual baseline archives
pub const BASELINE_DIR: &str = "/pubmed/baseline/";

/// Remote directory holding the daily update archives
pub const UPDATE_DIR: &str = "/pubmed/updatefiles/";

/// A remote data file paired with its checksum sidecar
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePair {
    pub data_file: String,
    pub checksum_file: String,
}

/// Transfer contract the run orchestrator depends on
#[async_trait]
pub trait TransferClient: Send + Sync {
    /// List data/checksum file pairs for the given archive kind, sorted by
    /// data file name ascending
    async fn list_files(&self, kind: FileType) -> Result<Vec<FilePair>>;

    /// Fetch and parse the checksum sidecar for a data file
    async fn fetch_checksum(&self, kind: FileType, checksum_file: &str) -> Result<String>;

    /// Download a data file into `local_dir`, verifying it against its
    /// checksum sidecar; retries internally, returning the local path once
    /// verified
    async fn fetch_and_verify(
        &self,
        kind: FileType,
        pair: &FilePair,
        local_dir: &Path,
    ) -> Result<PathBuf>;
}

/// FTP client for the NLM archive server
pub struct NlmFtpClient {
    settings: FtpSettings,
}

impl NlmFtpClient {
    pub fn new(settings: FtpSettings) -> Self {
        Self { settings }
    }

    fn remote_dir(kind: FileType) -> &'static str {
        match kind {
            FileType::Baseline => BASELINE_DIR,
            FileType::Delta => UPDATE_DIR,
        }
    }

    /// Connect, switch to extended passive mode, and log in
    fn connect_sync(settings: &FtpSettings) -> Result<FtpStream> {
        debug!("Connecting to FTP server: {}:{}", settings.host, settings.port);

        let mut ftp_stream = FtpStream::connect(format!("{}:{}", settings.host, settings.port))
            .context("Failed to connect to FTP server")?;

        ftp_stream.set_mode(suppaftp::Mode::ExtendedPassive);

        ftp_stream
            .login(&settings.username, &settings.password)
            .context("Failed to login to FTP server")?;

        ftp_stream
            .transfer_type(suppaftp::types::FileType::Binary)
            .context("Failed to set binary mode")?;

        Ok(ftp_stream)
    }

    fn quit(mut ftp_stream: FtpStream) {
        if let Err(e) = ftp_stream.quit() {
            warn!("Failed to quit FTP session gracefully: {}", e);
        }
    }

    /// List a directory and pair each `.xml.gz` with its `.md5` sidecar
    fn list_pairs_sync(settings: &FtpSettings, dir: &str) -> Result<Vec<FilePair>> {
        let mut ftp_stream = Self::connect_sync(settings)?;

        ftp_stream
            .cwd(dir)
            .with_context(|| format!("Failed to change to directory: {}", dir))?;

        let names = ftp_stream
            .nlst(None)
            .with_context(|| format!("Failed to list directory: {}", dir))?;

        Self::quit(ftp_stream);

        Ok(pair_files(&names))
    }

    /// Download and parse a checksum sidecar file
    fn fetch_checksum_sync(settings: &FtpSettings, dir: &str, checksum_file: &str) -> Result<String> {
        let mut ftp_stream = Self::connect_sync(settings)?;

        ftp_stream
            .cwd(dir)
            .with_context(|| format!("Failed to change to directory: {}", dir))?;

        let mut reader = ftp_stream
            .retr_as_buffer(checksum_file)
            .with_context(|| format!("Failed to download checksum file: {}", checksum_file))?;

        let mut data = Vec::new();
        std::io::Read::read_to_end(&mut reader, &mut data)
            .context("Failed to read checksum data")?;

        Self::quit(ftp_stream);

        parse_checksum_line(&String::from_utf8_lossy(&data))
            .with_context(|| format!("Malformed checksum file: {}", checksum_file))
    }

    /// Download a data file to disk and verify it against the expected MD5
    fn download_and_verify_sync(
        settings: &FtpSettings,
        dir: &str,
        pair: &FilePair,
        local_path: &Path,
    ) -> Result<()> {
        let mut ftp_stream = Self::connect_sync(settings)?;

        ftp_stream
            .cwd(dir)
            .with_context(|| format!("Failed to change to directory: {}", dir))?;

        let mut checksum_reader = ftp_stream
            .retr_as_buffer(&pair.checksum_file)
            .with_context(|| format!("Failed to download checksum file: {}", pair.checksum_file))?;
        let mut checksum_data = Vec::new();
        std::io::Read::read_to_end(&mut checksum_reader, &mut checksum_data)
            .context("Failed to read checksum data")?;
        let expected = parse_checksum_line(&String::from_utf8_lossy(&checksum_data))
            .with_context(|| format!("Malformed checksum file: {}", pair.checksum_file))?;

        debug!("Downloading file: {}", pair.data_file);
        let mut file = std::fs::File::create(local_path)
            .with_context(|| format!("Failed to create local file: {}", local_path.display()))?;

        // Stream straight to disk; baseline archives run to multiple GB
        let mut data_stream = ftp_stream
            .retr_as_stream(&pair.data_file)
            .with_context(|| format!("Failed to download file: {}", pair.data_file))?;
        std::io::copy(&mut data_stream, &mut file)
            .with_context(|| format!("Failed to write local file: {}", local_path.display()))?;
        ftp_stream
            .finalize_retr_stream(data_stream)
            .context("Failed to finalize download")?;

        Self::quit(ftp_stream);

        debug!("Verifying checksum for {}", local_path.display());
        checksum::verify_file_md5(local_path, &expected)
            .with_context(|| format!("Checksum verification failed for {}", pair.data_file))?;

        Ok(())
    }

    /// Run a blocking FTP operation with bounded retries and backoff
    async fn run_with_retries<T, F>(label: String, op: F) -> Result<T>
    where
        F: Fn() -> Result<T> + Clone + Send + 'static,
        T: Send + 'static,
    {
        for attempt in 1..=MAX_RETRIES {
            debug!("{} attempt {}/{}", label, attempt, MAX_RETRIES);

            let op_clone = op.clone();
            match tokio::task::spawn_blocking(move || op_clone()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    if attempt < MAX_RETRIES {
                        let delay = RETRY_DELAY_SECS * attempt as u64;
                        warn!(
                            "{} attempt {}/{} failed: {:#}. Retrying in {}s...",
                            label, attempt, MAX_RETRIES, e, delay
                        );
                        tokio::time::sleep(Duration::from_secs(delay)).await;
                    } else {
                        return Err(e)
                            .with_context(|| format!("{} failed after {} attempts", label, MAX_RETRIES));
                    }
                },
                Err(e) => {
                    return Err(anyhow::anyhow!("FTP task panicked: {}", e));
                },
            }
        }

        unreachable!("Retry loop should always return")
    }
}

#[async_trait]
impl TransferClient for NlmFtpClient {
    async fn list_files(&self, kind: FileType) -> Result<Vec<FilePair>> {
        let settings = self.settings.clone();
        let dir = Self::remote_dir(kind);

        let pairs = Self::run_with_retries(format!("LIST {}", dir), move || {
            Self::list_pairs_sync(&settings, dir)
        })
        .await?;

        info!(dir, count = pairs.len(), "Listed remote archive files");
        Ok(pairs)
    }

    async fn fetch_checksum(&self, kind: FileType, checksum_file: &str) -> Result<String> {
        let settings = self.settings.clone();
        let dir = Self::remote_dir(kind);
        let checksum_file = checksum_file.to_string();

        Self::run_with_retries(format!("CHECKSUM {}", checksum_file), move || {
            Self::fetch_checksum_sync(&settings, dir, &checksum_file)
        })
        .await
    }

    async fn fetch_and_verify(
        &self,
        kind: FileType,
        pair: &FilePair,
        local_dir: &Path,
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(local_dir).with_context(|| {
            format!("Failed to create staging directory: {}", local_dir.display())
        })?;

        let settings = self.settings.clone();
        let dir = Self::remote_dir(kind);
        let pair = pair.clone();
        let local_path = local_dir.join(&pair.data_file);
        let download_path = local_path.clone();

        Self::run_with_retries(format!("DOWNLOAD {}", pair.data_file), move || {
            Self::download_and_verify_sync(&settings, dir, &pair, &download_path)
        })
        .await?;

        info!(path = %local_path.display(), "Downloaded and verified file");
        Ok(local_path)
    }
}

/// Pair each `.xml.gz` data file with its `.md5` sidecar, sorted ascending
fn pair_files(names: &[String]) -> Vec<FilePair> {
    let name_set: std::collections::HashSet<&str> =
        names.iter().map(|name| name.as_str()).collect();

    let mut data_files: Vec<&str> = names
        .iter()
        .map(|name| name.as_str())
        .filter(|name| name.ends_with(".xml.gz"))
        .collect();
    data_files.sort_unstable();

    data_files
        .into_iter()
        .filter_map(|data_file| {
            let checksum_file = format!("{}.md5", data_file);
            name_set.contains(checksum_file.as_str()).then(|| FilePair {
                data_file: data_file.to_string(),
                checksum_file,
            })
        })
        .collect()
}

/// Parse a checksum sidecar line of the form `MD5(file.xml.gz)= abcdef...`
fn parse_checksum_line(content: &str) -> Result<String> {
    let checksum = content
        .rsplit_once('=')
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
        .context("No checksum value found")?;
    Ok(checksum.to_string())
}
