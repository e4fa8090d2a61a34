//! Stowage Core Library
//!
//! Domain models, tagged identifiers, error types, configuration and the upload
//! algorithm policy shared by every Stowage component.

pub mod access;
pub mod config;
pub mod error;
pub mod ids;
pub mod job_error;
pub mod models;
pub mod thresholds;

// Re-export commonly used types
pub use access::{WorkspaceAccess, WorkspaceAccessProvider, WorkspaceOperation};
pub use config::{BootstrapStorage, Config, JobQueueSettings};
pub use error::{AppError, ErrorMetadata, LogLevel};
pub use ids::{
    FileId, FileUploadId, FolderId, IdParseError, IntegrationId, StorageId, UserId, WorkspaceId,
};
pub use job_error::{JobError, JobResultExt};
pub use thresholds::UploadThresholds;
