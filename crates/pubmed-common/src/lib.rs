//! PubMed Load Common Library
//!
//! Shared utilities for the pubmed-load workspace:
//!
//! - **Error Handling**: common error and result types
//! - **Checksums**: MD5 verification for downloaded archives
//! - **Logging**: tracing subscriber configuration and initialization

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{LoadError, Result};
