//! Request and response types of the upload pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use stowage_core::models::{PartRange, UploadAlgorithm};
use stowage_core::{Config, FileId, FileUploadId, FolderId, UploadThresholds};

/// Orchestrator settings derived from [`Config`].
#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub thresholds: UploadThresholds,
    pub presigned_url_ttl: Duration,
    /// Attempts per interactive storage call, transient failures only.
    pub storage_retry_attempts: u32,
    /// Base URL clients use to reach this service, without trailing slash.
    pub public_base_url: String,
}

impl UploadSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            thresholds: config.upload_thresholds,
            presigned_url_ttl: config.presigned_url_ttl(),
            storage_retry_attempts: config.storage_retry_attempts,
            public_base_url: config.public_base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitiateUpload {
    /// Target folder; `None` is the workspace root.
    pub folder_id: Option<FolderId>,
    pub name: String,
    pub content_type: String,
    pub size_bytes: u64,
}

/// What the client needs to start transferring bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UploadPayload {
    /// Stream the body to `upload_url`; the upload completes with that request.
    Direct { upload_url: String },
    /// `PUT` the whole object to `upload_url` with `upload_headers`. When
    /// `requires_completion_callback` is set the client reports the returned ETag before
    /// finalizing.
    SingleChunk {
        upload_url: String,
        upload_headers: BTreeMap<String, String>,
        requires_completion_callback: bool,
    },
    /// Request one URL per part, `1..=expected_parts_count`.
    MultiStep {
        expected_parts_count: u32,
        part_size_bytes: u64,
    },
}

#[derive(Debug, Clone)]
pub struct UploadTicket {
    pub upload_id: FileUploadId,
    pub file_id: FileId,
    pub algorithm: UploadAlgorithm,
    pub payload: UploadPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartTicket {
    pub upload_url: String,
    /// Headers that must accompany the `PUT` to `upload_url`.
    pub upload_headers: BTreeMap<String, String>,
    pub range: PartRange,
    pub requires_completion_callback: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedParts {
    pub part_numbers: Vec<u32>,
    pub expected_parts_count: u32,
}

/// Result of a server-brokered transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentOutcome {
    /// A direct upload was committed as a file.
    Completed { file_id: FileId },
    /// Bytes are stored; the upload still has to be finalized.
    Stored { etag: String },
}
