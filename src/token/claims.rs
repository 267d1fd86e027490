//! Unverified claim extraction for compact JWTs.
//!
//! Only the payload segment is interpreted. Signatures are **not** checked:
//! the tokens handled here are either mounted by the platform or were just
//! returned by the upstream identity API, so they are trusted as-is. Never use
//! this to authenticate a token presented by a client.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

/// Reasons a token's claims could not be extracted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClaimsError {
    #[error("token must have 3 dot-separated segments, found {0}")]
    Malformed(usize),

    #[error("{0} segment is not valid base64url")]
    Base64(&'static str),

    #[error("payload is not a JSON object")]
    Json,

    #[error("aud claim missing or not a string")]
    Audience,

    #[error("exp claim missing or not numeric")]
    Expiry,

    #[error("exp claim {0} is out of range")]
    ExpiryRange(i64),
}

/// The claims the token cache keys and expires entries on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    pub audience: String,
    pub expires_at: DateTime<Utc>,
}

/// Extract `aud` and `exp` from a compact JWT without verifying it.
pub fn extract_claims(token: &str) -> Result<TokenClaims, ClaimsError> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(ClaimsError::Malformed(segments.len()));
    }

    URL_SAFE_NO_PAD
        .decode(segments[0])
        .map_err(|_| ClaimsError::Base64("header"))?;
    let payload = URL_SAFE_NO_PAD
        .decode(segments[1])
        .map_err(|_| ClaimsError::Base64("payload"))?;

    // Arrays and scalars are rejected, not matched by position
    let mut payload: Map<String, Value> =
        serde_json::from_slice(&payload).map_err(|_| ClaimsError::Json)?;

    let audience = match payload.remove("aud") {
        Some(Value::String(aud)) => aud,
        _ => return Err(ClaimsError::Audience),
    };

    // Fractional seconds are truncated
    let exp = payload
        .get("exp")
        .and_then(Value::as_f64)
        .ok_or(ClaimsError::Expiry)? as i64;
    let expires_at = DateTime::from_timestamp(exp, 0).ok_or(ClaimsError::ExpiryRange(exp))?;

    Ok(TokenClaims {
        audience,
        expires_at,
    })
}
