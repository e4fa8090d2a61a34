//! Upload session models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use utoipa::ToSchema;

use crate::error::AppError;
use crate::ids::{FileId, FileUploadId, FolderId, IntegrationId, StorageId, UserId, WorkspaceId};
use crate::models::identity::Identity;
use crate::models::storage::EncryptionMode;

/// Transfer algorithm chosen once at initiation from the declared size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum UploadAlgorithm {
    /// One server-brokered request, no completion callback.
    Direct,
    /// One pre-authorized URL for the whole object.
    SingleChunk,
    /// Backend multipart upload, one URL per part.
    MultiStep,
}

impl Display for UploadAlgorithm {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            UploadAlgorithm::Direct => write!(f, "direct"),
            UploadAlgorithm::SingleChunk => write!(f, "single_chunk"),
            UploadAlgorithm::MultiStep => write!(f, "multi_step"),
        }
    }
}

/// The chosen algorithm together with the data only that algorithm needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum UploadPlan {
    Direct,
    SingleChunk,
    MultiStep {
        part_size_bytes: u64,
        expected_parts: u32,
    },
}

impl UploadPlan {
    pub fn algorithm(&self) -> UploadAlgorithm {
        match self {
            UploadPlan::Direct => UploadAlgorithm::Direct,
            UploadPlan::SingleChunk => UploadAlgorithm::SingleChunk,
            UploadPlan::MultiStep { .. } => UploadAlgorithm::MultiStep,
        }
    }

    pub fn expected_parts(&self) -> u32 {
        match self {
            UploadPlan::MultiStep { expected_parts, .. } => *expected_parts,
            _ => 1,
        }
    }
}

/// Inclusive byte range covered by one part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRange {
    pub start: u64,
    pub end: u64,
}

impl PartRange {
    /// Byte range of `part_number` (1-based) for an object of `total_size` bytes.
    pub fn for_part(part_number: u32, part_size: u64, total_size: u64) -> Self {
        let start = u64::from(part_number.saturating_sub(1)) * part_size;
        let end = (start + part_size).min(total_size).saturating_sub(1);
        Self { start, end }
    }

    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Initiated,
    PartsPending,
    AwaitingCompletion,
    Abandoned,
}

impl UploadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadStatus::Abandoned)
    }

    /// Whether the session may move from `self` to `next`.
    ///
    /// Completion is not a status: the row is replaced by a file record.
    pub fn can_transition_to(&self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        match (self, next) {
            (Abandoned, _) => false,
            (_, Abandoned) => true,
            (Initiated, PartsPending | AwaitingCompletion) => true,
            (PartsPending, PartsPending | AwaitingCompletion) => true,
            (AwaitingCompletion, AwaitingCompletion) => true,
            _ => false,
        }
    }
}

impl Display for UploadStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            UploadStatus::Initiated => write!(f, "initiated"),
            UploadStatus::PartsPending => write!(f, "parts_pending"),
            UploadStatus::AwaitingCompletion => write!(f, "awaiting_completion"),
            UploadStatus::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// An in-progress transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct FileUpload {
    pub id: FileUploadId,
    pub workspace_id: WorkspaceId,
    pub folder_id: Option<FolderId>,
    /// File id reserved for the record created on completion.
    pub file_id: FileId,
    pub storage_id: StorageId,
    pub bucket_name: String,
    /// Physical object key, see [`S3FileKey`](crate::models::S3FileKey).
    pub storage_key: String,
    pub name: String,
    pub extension: Option<String>,
    pub content_type: String,
    pub size_bytes: i64,
    pub algorithm: UploadAlgorithm,
    pub part_size_bytes: Option<i64>,
    pub expected_parts: i64,
    pub multipart_upload_id: Option<String>,
    /// ETag reported by the client for a single-chunk upload.
    pub reported_etag: Option<String>,
    pub status: UploadStatus,
    pub encryption_mode: EncryptionMode,
    pub owner_user_id: Option<UserId>,
    pub owner_integration_id: Option<IntegrationId>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl FileUpload {
    pub fn plan(&self) -> UploadPlan {
        match self.algorithm {
            UploadAlgorithm::Direct => UploadPlan::Direct,
            UploadAlgorithm::SingleChunk => UploadPlan::SingleChunk,
            UploadAlgorithm::MultiStep => UploadPlan::MultiStep {
                part_size_bytes: self.part_size_bytes.unwrap_or(self.size_bytes).max(1) as u64,
                expected_parts: self.expected_parts.max(1) as u32,
            },
        }
    }

    pub fn expected_parts(&self) -> u32 {
        self.plan().expected_parts()
    }

    pub fn owner(&self) -> Option<Identity> {
        Identity::from_columns(
            self.owner_user_id.clone(),
            self.owner_integration_id.clone(),
        )
    }

    /// Reject part numbers outside `1..=expected_parts`.
    pub fn check_part_number(&self, part_number: u32) -> Result<(), AppError> {
        let expected_parts = self.expected_parts();
        if part_number == 0 || part_number > expected_parts {
            return Err(AppError::InvalidPart {
                part_number,
                expected_parts,
            });
        }
        Ok(())
    }

    pub fn part_range(&self, part_number: u32) -> PartRange {
        match self.plan() {
            UploadPlan::MultiStep {
                part_size_bytes, ..
            } => PartRange::for_part(part_number, part_size_bytes, self.size_bytes as u64),
            _ => PartRange::for_part(1, self.size_bytes as u64, self.size_bytes as u64),
        }
    }

    /// Part numbers in `1..=expected_parts` not present in `acknowledged`.
    pub fn missing_parts(&self, acknowledged: &[u32]) -> Vec<u32> {
        (1..=self.expected_parts())
            .filter(|n| !acknowledged.contains(n))
            .collect()
    }
}

/// A durably acknowledged part of a multi-step upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct UploadPart {
    pub upload_id: FileUploadId,
    pub part_number: i64,
    pub etag: String,
    pub acknowledged_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    fn multi_step_upload(size: u64, part_size: u64, parts: i64) -> FileUpload {
        let now = Utc::now();
        FileUpload {
            id: FileUploadId::new(),
            workspace_id: WorkspaceId::new(),
            folder_id: None,
            file_id: FileId::new(),
            storage_id: StorageId::new(),
            bucket_name: "bucket".into(),
            storage_key: "key".into(),
            name: "video.mp4".into(),
            extension: Some("mp4".into()),
            content_type: "video/mp4".into(),
            size_bytes: size as i64,
            algorithm: UploadAlgorithm::MultiStep,
            part_size_bytes: Some(part_size as i64),
            expected_parts: parts,
            multipart_upload_id: Some("mpu".into()),
            reported_etag: None,
            status: UploadStatus::Initiated,
            encryption_mode: EncryptionMode::None,
            owner_user_id: Some(UserId::new()),
            owner_integration_id: None,
            created_at: now,
            last_activity_at: now,
        }
    }

    #[test]
    fn part_ranges_cover_the_object_exactly() {
        let upload = multi_step_upload(120 * MB + 7, 50 * MB, 3);
        assert_eq!(upload.part_range(1), PartRange { start: 0, end: 50 * MB - 1 });
        assert_eq!(upload.part_range(2).start, 50 * MB);
        let last = upload.part_range(3);
        assert_eq!(last.start, 100 * MB);
        assert_eq!(last.end, 120 * MB + 6);
        assert_eq!(last.size(), 20 * MB + 7);
    }

    #[test]
    fn part_numbers_are_bounded() {
        let upload = multi_step_upload(500 * MB, 50 * MB, 10);
        assert!(upload.check_part_number(1).is_ok());
        assert!(upload.check_part_number(10).is_ok());
        assert!(matches!(
            upload.check_part_number(0),
            Err(AppError::InvalidPart { .. })
        ));
        assert!(matches!(
            upload.check_part_number(11),
            Err(AppError::InvalidPart {
                part_number: 11,
                expected_parts: 10
            })
        ));
    }

    #[test]
    fn missing_parts_lists_gaps() {
        let upload = multi_step_upload(500 * MB, 50 * MB, 10);
        let acked: Vec<u32> = (1..=9).collect();
        assert_eq!(upload.missing_parts(&acked), vec![10]);
        assert_eq!(upload.missing_parts(&[2, 5]).len(), 8);
    }

    #[test]
    fn abandoned_is_terminal() {
        assert!(UploadStatus::Initiated.can_transition_to(UploadStatus::PartsPending));
        assert!(UploadStatus::PartsPending.can_transition_to(UploadStatus::Abandoned));
        assert!(!UploadStatus::Abandoned.can_transition_to(UploadStatus::PartsPending));
        assert!(!UploadStatus::AwaitingCompletion.can_transition_to(UploadStatus::Initiated));
    }
}
