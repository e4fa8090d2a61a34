pub mod file;
pub mod identity;
pub mod job;
pub mod storage;
pub mod upload;
pub mod workspace;

pub use file::{FileRecord, Folder};
pub use identity::Identity;
pub use job::{
    BulkDeleteObjectsJob, DeleteBucketJob, DeleteObjectJob, JobDefinition, JobLane, JobStatus,
    NewJob, Priority, QueueJob, ReclaimFileUploadJob, UpdateWorkspaceSizeJob,
};
pub use storage::{EncryptionMode, S3FileKey, StorageConfig, StorageProvider};
pub use upload::{
    FileUpload, PartRange, UploadAlgorithm, UploadPart, UploadPlan, UploadStatus,
};
pub use workspace::{Selection, Workspace};
