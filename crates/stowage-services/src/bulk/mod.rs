//! Bulk delete, move and size-count over folder/file selections.

pub mod selection;
mod service;

pub use service::{BulkOperations, BulkOutcome, ItemFailure, ItemKind, SelectionSize};
