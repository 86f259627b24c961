//! Transfer manifest

use serde::{Deserialize, Serialize};

/// File entry in a manifest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestFile {
    /// Path relative to the transfer root
    pub path: String,
    /// File size in bytes
    pub size: u64,
}

/// Describes a transfer to the receiver before data flows.
///
/// Field names are camelCase on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferManifest {
    /// Total byte budget of the transfer
    pub total_size: u64,
    /// Number of logical files
    pub total_files: u32,
    /// Per-file listing, when the sender enumerated up front
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<ManifestFile>>,
    /// Name of the root entry (single file or directory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_name: Option<String>,
    /// Whether `total_size` is an estimate rather than an exact sum
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_size_estimated: Option<bool>,
}

impl TransferManifest {
    /// Create a manifest with totals only
    pub fn new(total_size: u64, total_files: u32) -> Self {
        Self {
            total_size,
            total_files,
            files: None,
            root_name: None,
            is_size_estimated: None,
        }
    }

    /// Build a manifest from a full file listing
    pub fn from_files(files: Vec<ManifestFile>) -> Self {
        let total_size = files.iter().map(|f| f.size).sum();
        let total_files = files.len() as u32;
        Self {
            total_size,
            total_files,
            files: Some(files),
            root_name: None,
            is_size_estimated: None,
        }
    }
}
