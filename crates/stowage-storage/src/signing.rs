//! HMAC-signed URLs for the local filesystem backend.
//!
//! The local backend has no server of its own, so "pre-signed" URLs point at the
//! application's `/api/local-storage/{bucket}/{key}` route and carry an expiry and an
//! HMAC-SHA256 signature over the operation they authorize.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::traits::{StorageError, StorageResult};

type HmacSha256 = Hmac<Sha256>;

pub const LOCAL_STORAGE_ROUTE: &str = "/api/local-storage";

/// Operation a signed local URL authorizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignedOperation {
    Get,
    Put,
    UploadPart { upload_id: String, part_number: u32 },
}

impl SignedOperation {
    fn tag(&self) -> &'static str {
        match self {
            SignedOperation::Get => "get",
            SignedOperation::Put => "put",
            SignedOperation::UploadPart { .. } => "part",
        }
    }

    /// Rebuild the operation from the `op`, `upload_id` and `part` query parameters.
    pub fn from_query(
        op: &str,
        upload_id: Option<&str>,
        part_number: Option<u32>,
    ) -> StorageResult<Self> {
        match (op, upload_id, part_number) {
            ("get", _, _) => Ok(SignedOperation::Get),
            ("put", _, _) => Ok(SignedOperation::Put),
            ("part", Some(upload_id), Some(part_number)) => Ok(SignedOperation::UploadPart {
                upload_id: upload_id.to_string(),
                part_number,
            }),
            _ => Err(StorageError::InvalidKey(format!(
                "unsupported signed operation `{}`",
                op
            ))),
        }
    }
}

#[derive(Clone)]
pub struct LocalUrlSigner {
    secret: Vec<u8>,
    public_base_url: String,
}

impl LocalUrlSigner {
    pub fn new(secret: impl AsRef<[u8]>, public_base_url: impl Into<String>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn canonical(
        operation: &SignedOperation,
        bucket: &str,
        key: &str,
        expires: i64,
    ) -> String {
        let (upload_id, part) = match operation {
            SignedOperation::UploadPart {
                upload_id,
                part_number,
            } => (upload_id.as_str(), part_number.to_string()),
            _ => ("", String::new()),
        };
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            operation.tag(),
            bucket,
            key,
            upload_id,
            part,
            expires
        )
    }

    fn mac(&self) -> StorageResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| StorageError::ConfigError(format!("invalid signing secret: {}", e)))
    }

    pub fn signature(
        &self,
        operation: &SignedOperation,
        bucket: &str,
        key: &str,
        expires: i64,
    ) -> StorageResult<String> {
        let mut mac = self.mac()?;
        mac.update(Self::canonical(operation, bucket, key, expires).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Build the full signed URL.
    pub fn sign(
        &self,
        operation: &SignedOperation,
        bucket: &str,
        key: &str,
        expires_at: DateTime<Utc>,
    ) -> StorageResult<String> {
        let expires = expires_at.timestamp();
        let signature = self.signature(operation, bucket, key, expires)?;
        let mut url = format!(
            "{}{}/{}/{}?op={}&expires={}",
            self.public_base_url,
            LOCAL_STORAGE_ROUTE,
            urlencoding::encode(bucket),
            urlencoding::encode(key),
            operation.tag(),
            expires
        );
        if let SignedOperation::UploadPart {
            upload_id,
            part_number,
        } = operation
        {
            url.push_str(&format!(
                "&upload_id={}&part={}",
                urlencoding::encode(upload_id),
                part_number
            ));
        }
        url.push_str(&format!("&signature={}", signature));
        Ok(url)
    }

    /// Check an incoming signed request. Comparison is constant-time.
    pub fn verify(
        &self,
        operation: &SignedOperation,
        bucket: &str,
        key: &str,
        expires: i64,
        signature: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        if now.timestamp() > expires {
            return Err(StorageError::InvalidKey("signed URL has expired".to_string()));
        }
        let provided = hex::decode(signature)
            .map_err(|_| StorageError::InvalidKey("malformed signature".to_string()))?;
        let mut mac = self.mac()?;
        mac.update(Self::canonical(operation, bucket, key, expires).as_bytes());
        mac.verify_slice(&provided)
            .map_err(|_| StorageError::InvalidKey("signature mismatch".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> LocalUrlSigner {
        LocalUrlSigner::new("secret", "http://localhost:4000/")
    }

    #[test]
    fn signed_url_verifies() {
        let signer = signer();
        let now = Utc::now();
        let expires = now + chrono::Duration::minutes(15);
        let url = signer
            .sign(&SignedOperation::Get, "bucket", "fi_abc_xyz", expires)
            .unwrap();
        assert!(url.starts_with("http://localhost:4000/api/local-storage/bucket/fi_abc_xyz?op=get"));

        let signature = url.rsplit_once("signature=").unwrap().1;
        assert!(signer
            .verify(
                &SignedOperation::Get,
                "bucket",
                "fi_abc_xyz",
                expires.timestamp(),
                signature,
                now
            )
            .is_ok());
    }

    #[test]
    fn signature_is_bound_to_operation_and_key() {
        let signer = signer();
        let now = Utc::now();
        let expires = (now + chrono::Duration::minutes(5)).timestamp();
        let part = SignedOperation::UploadPart {
            upload_id: "u1".into(),
            part_number: 2,
        };
        let signature = signer.signature(&part, "b", "k", expires).unwrap();

        let other_part = SignedOperation::UploadPart {
            upload_id: "u1".into(),
            part_number: 3,
        };
        assert!(signer
            .verify(&other_part, "b", "k", expires, &signature, now)
            .is_err());
        assert!(signer
            .verify(&part, "b", "other", expires, &signature, now)
            .is_err());
        assert!(signer.verify(&part, "b", "k", expires, &signature, now).is_ok());
    }

    #[test]
    fn expired_urls_are_rejected() {
        let signer = signer();
        let now = Utc::now();
        let expires = (now - chrono::Duration::seconds(1)).timestamp();
        let signature = signer
            .signature(&SignedOperation::Put, "b", "k", expires)
            .unwrap();
        assert!(signer
            .verify(&SignedOperation::Put, "b", "k", expires, &signature, now)
            .is_err());
    }

    #[test]
    fn query_parsing_requires_part_details() {
        assert!(SignedOperation::from_query("part", Some("u"), None).is_err());
        assert_eq!(
            SignedOperation::from_query("get", None, None).unwrap(),
            SignedOperation::Get
        );
    }
}
