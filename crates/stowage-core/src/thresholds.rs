//! Upload algorithm selection.
//!
//! The algorithm is a pure function of the declared size and three fixed numbers.
//! A size exactly at a threshold always lands on the smaller algorithm's side.

use crate::error::AppError;
use crate::models::UploadPlan;

pub const DEFAULT_DIRECT_UPLOAD_THRESHOLD_BYTES: u64 = 1024 * 1024;
pub const DEFAULT_SINGLE_CHUNK_THRESHOLD_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_UPLOAD_PART_SIZE_BYTES: u64 = 50 * 1024 * 1024;
/// S3 rejects multipart uploads with more parts than this.
pub const MAX_UPLOAD_PARTS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadThresholds {
    /// Sizes up to and including this use a direct upload.
    pub direct_max_bytes: u64,
    /// Sizes up to and including this (and above `direct_max_bytes`) use one chunk.
    pub single_chunk_max_bytes: u64,
    /// Preferred part size for multi-step uploads.
    pub part_size_bytes: u64,
}

impl Default for UploadThresholds {
    fn default() -> Self {
        Self {
            direct_max_bytes: DEFAULT_DIRECT_UPLOAD_THRESHOLD_BYTES,
            single_chunk_max_bytes: DEFAULT_SINGLE_CHUNK_THRESHOLD_BYTES,
            part_size_bytes: DEFAULT_UPLOAD_PART_SIZE_BYTES,
        }
    }
}

impl UploadThresholds {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.direct_max_bytes > self.single_chunk_max_bytes {
            return Err(AppError::InvalidInput(format!(
                "direct upload threshold ({}) must not exceed single chunk threshold ({})",
                self.direct_max_bytes, self.single_chunk_max_bytes
            )));
        }
        if self.part_size_bytes == 0 {
            return Err(AppError::InvalidInput(
                "upload part size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Choose the upload plan for `size` bytes.
    ///
    /// `min_part_size` is the backend's smallest allowed non-final part; the configured
    /// part size is raised to it, and raised further if the object would otherwise need
    /// more than [`MAX_UPLOAD_PARTS`] parts.
    pub fn plan(&self, size: u64, min_part_size: u64) -> UploadPlan {
        if size <= self.direct_max_bytes {
            return UploadPlan::Direct;
        }
        if size <= self.single_chunk_max_bytes {
            return UploadPlan::SingleChunk;
        }

        let mut part_size = self.part_size_bytes.max(min_part_size).max(1);
        if size.div_ceil(part_size) > MAX_UPLOAD_PARTS {
            part_size = size.div_ceil(MAX_UPLOAD_PARTS);
        }
        UploadPlan::MultiStep {
            part_size_bytes: part_size,
            expected_parts: size.div_ceil(part_size) as u32,
        }
    }
}
