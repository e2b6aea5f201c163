//! MD5 checksum utilities for archive verification
//!
//! NLM publishes an `.md5` sidecar for every data file, so MD5 is the only
//! digest this tool needs.

use crate::error::{LoadError, Result};
use std::io::Read;
use std::path::Path;

/// Compute the MD5 checksum of a file, streaming in 8 KiB blocks
pub fn compute_file_md5(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    compute_md5(&mut file)
}

/// Compute the MD5 checksum of any readable source
pub fn compute_md5<R: Read>(reader: &mut R) -> Result<String> {
    let mut context = md5::Context::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        context.consume(&buffer[..bytes_read]);
    }

    Ok(hex::encode(context.compute().0))
}

/// Verify a file against an expected MD5 checksum
///
/// Returns `Ok(())` on match, `LoadError::ChecksumMismatch` otherwise.
pub fn verify_file_md5(path: impl AsRef<Path>, expected: &str) -> Result<()> {
    let actual = compute_file_md5(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(LoadError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}
