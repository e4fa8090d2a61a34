//! Storage backend configuration and physical object keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use utoipa::ToSchema;

use crate::ids::{random_suffix, FileId, StorageId};

const KEY_SECRET_LEN: usize = 32;

/// Encryption-at-rest applied by the backend.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum EncryptionMode {
    #[default]
    None,
    /// Provider-managed keys (SSE-S3, AES-256).
    ServerSide,
}

impl Display for EncryptionMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            EncryptionMode::None => write!(f, "none"),
            EncryptionMode::ServerSide => write!(f, "server_side"),
        }
    }
}

/// Physical medium and the settings needed to reach it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageProvider {
    Local {
        root_path: String,
        /// Public base URL of this service, used to build signed local transfer URLs.
        public_base_url: String,
    },
    S3 {
        region: String,
        /// Custom endpoint for S3-compatible providers (MinIO, R2, ...).
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        access_key_id: Option<String>,
        #[serde(default)]
        secret_access_key: Option<String>,
    },
}

impl StorageProvider {
    pub fn kind(&self) -> &'static str {
        match self {
            StorageProvider::Local { .. } => "local",
            StorageProvider::S3 { .. } => "s3",
        }
    }
}

// Credentials never reach logs.
impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            StorageProvider::Local {
                root_path,
                public_base_url,
            } => f
                .debug_struct("Local")
                .field("root_path", root_path)
                .field("public_base_url", public_base_url)
                .finish(),
            StorageProvider::S3 {
                region, endpoint, ..
            } => f
                .debug_struct("S3")
                .field("region", region)
                .field("endpoint", endpoint)
                .finish_non_exhaustive(),
        }
    }
}

/// A configured storage backend. Security-relevant fields are replaced, never edited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub id: StorageId,
    pub name: String,
    pub provider: StorageProvider,
    pub encryption_mode: EncryptionMode,
    pub created_at: DateTime<Utc>,
}

/// Physical key of a stored object: `{file_id}_{secret}`.
///
/// The random secret means knowing one key reveals nothing about any other, and a
/// fresh secret is drawn for every upload so keys are never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct S3FileKey {
    pub file_id: FileId,
    pub secret: String,
}

impl S3FileKey {
    pub fn generate(file_id: FileId) -> Self {
        Self {
            file_id,
            secret: random_suffix(KEY_SECRET_LEN),
        }
    }

    pub fn object_key(&self) -> String {
        format!("{}_{}", self.file_id, self.secret)
    }

    pub fn parse(key: &str) -> Option<Self> {
        let (file_id, secret) = key.rsplit_once('_')?;
        if secret.is_empty() || !secret.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return None;
        }
        Some(Self {
            file_id: FileId::try_parse(file_id)?,
            secret: secret.to_string(),
        })
    }
}

impl Display for S3FileKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}_{}", self.file_id, self.secret)
    }
}
