//! Repositories and connection management.
//!
//! Repository reads take `&self` and use the read pool. Writes are associated functions
//! over `&mut SqliteConnection` so they can only run inside a [`writer::DbWriter`]
//! operation, and several of them can be composed into one transaction.

pub mod file;
pub mod folder;
pub mod job;
pub mod pool;
pub mod storage;
pub mod upload;
pub mod workspace;
pub mod writer;

pub use file::FileRepository;
pub use folder::FolderRepository;
pub use job::JobRepository;
pub use storage::StorageRepository;
pub use upload::UploadRepository;
pub use workspace::WorkspaceRepository;
