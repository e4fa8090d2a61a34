//! Stowage Database Layer
//!
//! SQLite persistence for upload sessions, file records and the background job queue.
//! Reads go through a shared pool; every mutation is funnelled through [`DbWriter`],
//! which owns the only write connection and applies operations in submission order.

pub mod db;

pub use db::pool::{Database, DatabaseSettings};
pub use db::writer::{DbWriter, PendingWrite};
pub use db::{
    FileRepository, FolderRepository, JobRepository, StorageRepository, UploadRepository,
    WorkspaceRepository,
};
