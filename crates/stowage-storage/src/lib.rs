//! Stowage Storage Library
//!
//! Uniform object-storage contract ([`Storage`]) with a local filesystem and an
//! S3-compatible implementation, plus the registry that resolves a logical storage id
//! to a live backend.
//!
//! Every operation names the bucket explicitly: one backend serves the buckets of
//! every workspace configured on it. Object keys must not contain `..` or a leading `/`.

pub mod factory;
#[cfg(feature = "storage-local")]
pub mod local;
pub mod registry;
#[cfg(feature = "storage-s3")]
pub mod s3;
pub mod signing;
pub mod traits;

// Re-export commonly used types
pub use factory::create_storage;
#[cfg(feature = "storage-local")]
pub use local::LocalStorage;
pub use registry::StorageRegistry;
#[cfg(feature = "storage-s3")]
pub use s3::S3Storage;
pub use signing::{LocalUrlSigner, SignedOperation};
pub use traits::{
    normalize_etag, BatchDeleteOutcome, CompletedUploadPart, DownloadStream, ObjectMetadata,
    PresignedOperation, PresignedRequest, Storage, StorageBackend, StorageCapabilities,
    StorageError, StorageResult, UploadReader,
};
