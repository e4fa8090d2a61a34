//! Stowage API Library
//!
//! HTTP handlers, request extractors and application setup for the Stowage server.

mod api_doc;
pub mod constants;
mod handlers;
pub mod setup;
mod telemetry;

pub mod error;
pub mod identity;
pub mod state;

pub use api_doc::ApiDoc;
pub use error::{ErrorResponse, HttpAppError};
pub use setup::BackgroundTasks;
