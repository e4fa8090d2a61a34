//! Resumable, algorithm-selecting upload pipeline.

pub mod service;
pub mod types;
pub mod validation;

pub(crate) use service::abandon_upload;
pub use service::UploadOrchestrator;
pub use types::{
    ContentOutcome, InitiateUpload, PartTicket, UploadPayload, UploadSettings, UploadTicket,
    UploadedParts,
};
