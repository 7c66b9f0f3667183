//! API handlers module

pub mod health;
pub mod sessions;

use axum::{extract::FromRequestParts, http::request::Parts};
use parley_common::errors::{AppError, Result};
use validator::Validate;

/// Header carrying the calling party's id
pub const PARTY_HEADER: &str = "x-party-id";

const MAX_PARTY_ID_LEN: usize = 128;

/// Identity of the calling party.
///
/// Authentication happens upstream; the gateway trusts the forwarded id.
#[derive(Debug, Clone)]
pub struct PartyContext {
    pub party_id: String,
}

impl<S> FromRequestParts<S> for PartyContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        let raw = parts
            .headers
            .get(PARTY_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::MissingField {
                field: "X-Party-Id".to_string(),
            })?;

        Ok(Self {
            party_id: check_party_id(raw)?,
        })
    }
}

/// Validate a party id from a header or query string
pub fn check_party_id(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_PARTY_ID_LEN {
        return Err(AppError::Validation {
            message: format!("party id must be 1-{} characters", MAX_PARTY_ID_LEN),
            field: Some("partyId".to_string()),
        });
    }
    Ok(trimmed.to_string())
}

/// Run derive-based validation on a request payload
pub fn validated<T: Validate>(payload: T) -> Result<T> {
    payload.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;
    Ok(payload)
}
