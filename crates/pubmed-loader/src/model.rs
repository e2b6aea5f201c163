//! Record model for the citation representations and load tracking
//!
//! Two alternative relational shapes are produced from the same source
//! element: a denormalized JSONB document (`CitationDocument`) and a fully
//! normalized set (`Citation` plus its journal, author, and MeSH satellites).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::parser::tree::XmlNode;

/// Which representation(s) to produce and load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum LoadMode {
    #[default]
    Full,
    Normalized,
    Both,
}

impl LoadMode {
    pub fn includes_full(self) -> bool {
        matches!(self, LoadMode::Full | LoadMode::Both)
    }

    pub fn includes_normalized(self) -> bool {
        matches!(self, LoadMode::Normalized | LoadMode::Both)
    }

    pub fn as_str(&self) -> &str {
        match self {
            LoadMode::Full => "FULL",
            LoadMode::Normalized => "NORMALIZED",
            LoadMode::Both => "BOTH",
        }
    }
}

impl std::str::FromStr for LoadMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "FULL" => Ok(LoadMode::Full),
            "NORMALIZED" => Ok(LoadMode::Normalized),
            "BOTH" => Ok(LoadMode::Both),
            _ => Err(anyhow::anyhow!(
                "Invalid load mode: {} (expected FULL, NORMALIZED, or BOTH)",
                s
            )),
        }
    }
}

impl std::fmt::Display for LoadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of source archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileType {
    /// Full annual snapshot archive
    Baseline,
    /// Daily differential archive, applied strictly in sequence
    Delta,
}

impl FileType {
    pub fn as_str(&self) -> &str {
        match self {
            FileType::Baseline => "BASELINE",
            FileType::Delta => "DELTA",
        }
    }
}

/// Per-file processing status in the load history table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LoadStatus {
    Pending,
    Downloading,
    Loading,
    Complete,
    Failed,
}

impl LoadStatus {
    pub fn as_str(&self) -> &str {
        match self {
            LoadStatus::Pending => "PENDING",
            LoadStatus::Downloading => "DOWNLOADING",
            LoadStatus::Loading => "LOADING",
            LoadStatus::Complete => "COMPLETE",
            LoadStatus::Failed => "FAILED",
        }
    }
}

impl From<String> for LoadStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "DOWNLOADING" => LoadStatus::Downloading,
            "LOADING" => LoadStatus::Loading,
            "COMPLETE" => LoadStatus::Complete,
            "FAILED" => LoadStatus::Failed,
            _ => LoadStatus::Pending,
        }
    }
}

/// One row of the `_pubmed_load_history` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadHistory {
    pub file_name: String,
    /// "BASELINE", "DELTA", or "UNKNOWN" for rows created before the type
    /// was known
    pub file_type: String,
    pub md5_checksum: Option<String>,
    pub download_timestamp: Option<DateTime<Utc>>,
    pub load_start_timestamp: Option<DateTime<Utc>>,
    pub load_end_timestamp: Option<DateTime<Utc>>,
    pub status: LoadStatus,
    pub records_processed: Option<i32>,
}

/// Denormalized representation: the whole citation element as a document tree
#[derive(Debug, Clone)]
pub struct CitationDocument {
    pub pmid: i32,
    pub date_revised: Option<NaiveDate>,
    pub data: XmlNode,
}

impl CitationDocument {
    /// Serialize the document tree for the JSONB storage boundary
    pub fn payload_json(&self) -> Value {
        json!({ "MedlineCitation": self.data.to_json() })
    }
}

/// Normalized representation: one citation row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub pmid: i32,
    pub title: Option<String>,
    pub abstract_text: Option<String>,
    pub publication_date: Option<NaiveDate>,
    pub journal_issn: Option<String>,
}

/// Journal dimension row, keyed by ISSN
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Journal {
    pub issn: String,
    pub title: Option<String>,
    pub iso_abbreviation: Option<String>,
}

/// Author dimension row with a derived surrogate id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Author {
    pub author_id: i64,
    pub last_name: Option<String>,
    pub fore_name: Option<String>,
    pub initials: Option<String>,
}

/// Citation-to-author link, ordered by declared position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CitationAuthor {
    pub pmid: i32,
    pub author_id: i64,
    pub display_order: i32,
}

/// MeSH descriptor dimension row with a derived surrogate id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshTerm {
    pub mesh_id: i64,
    pub term: String,
    pub is_major_topic: bool,
}

/// Citation-to-MeSH link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CitationMeshTerm {
    pub pmid: i32,
    pub mesh_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_mode_from_str() {
        assert_eq!("FULL".parse::<LoadMode>().unwrap(), LoadMode::Full);
        assert_eq!("normalized".parse::<LoadMode>().unwrap(), LoadMode::Normalized);
        assert_eq!("Both".parse::<LoadMode>().unwrap(), LoadMode::Both);
        assert!("ALL".parse::<LoadMode>().is_err());
    }

    #[test]
    fn test_load_mode_includes() {
        assert!(LoadMode::Full.includes_full());
        assert!(!LoadMode::Full.includes_normalized());
        assert!(LoadMode::Normalized.includes_normalized());
        assert!(!LoadMode::Normalized.includes_full());
        assert!(LoadMode::Both.includes_full());
        assert!(LoadMode::Both.includes_normalized());
    }

    #[test]
    fn test_load_status_round_trip() {
        for status in [
            LoadStatus::Pending,
            LoadStatus::Downloading,
            LoadStatus::Loading,
            LoadStatus::Complete,
            LoadStatus::Failed,
        ] {
            assert_eq!(LoadStatus::from(status.as_str().to_string()), status);
        }
        // Unknown strings fall back to the initial state
        assert_eq!(LoadStatus::from("BOGUS".to_string()), LoadStatus::Pending);
    }

    #[test]
    fn test_file_type_as_str() {
        assert_eq!(FileType::Baseline.as_str(), "BASELINE");
        assert_eq!(FileType::Delta.as_str(), "DELTA");
    }
}
