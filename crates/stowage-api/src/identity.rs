//! Caller identity taken from the trusted identity header.

use axum::extract::FromRequestParts;
use axum::http::{request::Parts, StatusCode};
use axum::Json;

use stowage_core::models::Identity;

use crate::constants::IDENTITY_HEADER;
use crate::error::ErrorResponse;

/// The identity the request acts as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity(pub Identity);

fn rejection(error: String, code: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error,
            details: None,
            error_type: None,
            code: code.to_string(),
            recoverable: false,
            suggested_action: Some(format!(
                "Send a user or integration id in the {} header",
                IDENTITY_HEADER
            )),
        }),
    )
}

impl<S> FromRequestParts<S> for CallerIdentity
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ErrorResponse>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(IDENTITY_HEADER)
            .ok_or_else(|| rejection("Missing caller identity".to_string(), "MISSING_IDENTITY"))?
            .to_str()
            .map_err(|_| rejection("Malformed caller identity".to_string(), "INVALID_IDENTITY"))?;

        let identity = value
            .trim()
            .parse::<Identity>()
            .map_err(|e| rejection(format!("Invalid caller identity: {}", e), "INVALID_IDENTITY"))?;

        Ok(CallerIdentity(identity))
    }
}
