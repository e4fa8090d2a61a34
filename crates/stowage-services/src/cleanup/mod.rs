mod service;

pub use service::AbandonedUploadReclaimer;
