//! Audience-keyed identity token cache with refresh-ahead expiry.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

use super::claims::{extract_claims, ClaimsError};

/// Fraction of a token's lifetime after which it is no longer handed out,
/// expressed as `REFRESH_AHEAD_NUM / REFRESH_AHEAD_DEN` (75%).
const REFRESH_AHEAD_NUM: i64 = 3;
const REFRESH_AHEAD_DEN: i64 = 4;

/// A cached identity token.
#[derive(Debug, Clone)]
pub struct CachedToken {
    /// Audience taken from the token's own `aud` claim.
    pub audience: String,
    /// Raw bearer token, returned verbatim.
    pub token: String,
    /// When the entry was written.
    pub issued_at: DateTime<Utc>,
    /// The token's `exp` claim.
    pub expires_at: DateTime<Utc>,
}

impl CachedToken {
    /// Whether less than 75% of the entry's lifetime has elapsed at `now`.
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        let total = (self.expires_at - self.issued_at).num_milliseconds();
        if total <= 0 {
            return false;
        }
        let elapsed = (now - self.issued_at).num_milliseconds();
        elapsed * REFRESH_AHEAD_DEN < total * REFRESH_AHEAD_NUM
    }
}

/// Why a token was not admitted to the cache.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("invalid token claims: {0}")]
    Claims(#[from] ClaimsError),

    #[error("token already expired at {0}")]
    Expired(DateTime<Utc>),
}

/// Token cache shared by all in-flight checks.
///
/// Entries are only ever overwritten, never removed: a stale entry is simply
/// reported as missing until the next successful refresh replaces it.
#[derive(Default)]
pub struct TokenCache {
    entries: RwLock<HashMap<String, CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache `token` under its own `aud` claim.
    ///
    /// Tokens whose claims cannot be read, or that are already expired, are
    /// not stored. The error is informational only.
    pub fn put(&self, token: &str) -> Result<(), AdmissionError> {
        self.put_at(token, Utc::now())
    }

    pub(crate) fn put_at(&self, token: &str, now: DateTime<Utc>) -> Result<(), AdmissionError> {
        let claims = extract_claims(token)?;
        if claims.expires_at <= now {
            return Err(AdmissionError::Expired(claims.expires_at));
        }

        debug!(
            audience = %claims.audience,
            expires_at = %claims.expires_at,
            "Caching identity token"
        );

        let entry = CachedToken {
            audience: claims.audience.clone(),
            token: token.to_string(),
            issued_at: now,
            expires_at: claims.expires_at,
        };

        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(claims.audience, entry);

        Ok(())
    }

    /// Look up a token for `audience` that is still inside its refresh-ahead
    /// window.
    pub fn get(&self, audience: &str) -> Option<String> {
        self.get_at(audience, Utc::now())
    }

    pub(crate) fn get_at(&self, audience: &str, now: DateTime<Utc>) -> Option<String> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let cached = entries.get(audience)?;

        if !cached.is_fresh_at(now) {
            debug!(
                audience = %cached.audience,
                issued_at = %cached.issued_at,
                expires_at = %cached.expires_at,
                "Cached token past refresh threshold"
            );
            return None;
        }

        Some(cached.token.clone())
    }

    /// Number of audiences with an entry, fresh or not.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::test_token;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use chrono::Duration;

    const AUDIENCE: &str = "https://example.com";

    fn base() -> DateTime<Utc> {
        DateTime::from_timestamp(1_800_000_000, 0).unwrap()
    }

    fn token_expiring_in(secs: i64) -> String {
        test_token(AUDIENCE, base().timestamp() + secs)
    }

    #[test]
    fn test_put_then_get() {
        let cache = TokenCache::new();
        let token = token_expiring_in(3600);

        cache.put_at(&token, base()).unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_at(AUDIENCE, base()), Some(token));
    }

    #[test]
    fn test_put_then_get_wall_clock() {
        let cache = TokenCache::new();
        let token = test_token(AUDIENCE, Utc::now().timestamp() + 3600);

        cache.put(&token).unwrap();

        assert_eq!(cache.get(AUDIENCE), Some(token));
    }

    #[test]
    fn test_unknown_audience() {
        let cache = TokenCache::new();
        cache.put_at(&token_expiring_in(3600), base()).unwrap();

        assert_eq!(cache.get_at("https://other.example.com", base()), None);
    }

    #[test]
    fn test_fresh_before_threshold() {
        let cache = TokenCache::new();
        let token = token_expiring_in(1000);
        cache.put_at(&token, base()).unwrap();

        let now = base() + Duration::seconds(749);
        assert_eq!(cache.get_at(AUDIENCE, now), Some(token));
    }

    #[test]
    fn test_stale_at_threshold() {
        let cache = TokenCache::new();
        cache.put_at(&token_expiring_in(1000), base()).unwrap();

        // Not yet expired on the wall clock, but 75% of its lifetime is gone
        assert_eq!(cache.get_at(AUDIENCE, base() + Duration::seconds(750)), None);
        assert_eq!(cache.get_at(AUDIENCE, base() + Duration::seconds(900)), None);
    }

    #[test]
    fn test_stale_after_expiry() {
        let cache = TokenCache::new();
        cache.put_at(&token_expiring_in(1000), base()).unwrap();

        assert_eq!(cache.get_at(AUDIENCE, base() + Duration::seconds(1001)), None);
        assert_eq!(cache.get_at(AUDIENCE, base() + Duration::days(1)), None);
    }

    #[test]
    fn test_stale_entry_is_kept_until_overwritten() {
        let cache = TokenCache::new();
        cache.put_at(&token_expiring_in(1000), base()).unwrap();

        assert_eq!(cache.get_at(AUDIENCE, base() + Duration::seconds(800)), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_overwrite_returns_newest() {
        let cache = TokenCache::new();
        let first = token_expiring_in(3600);
        let second = token_expiring_in(7200);

        cache.put_at(&first, base()).unwrap();
        cache.put_at(&second, base() + Duration::seconds(10)).unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.get_at(AUDIENCE, base() + Duration::seconds(10)),
            Some(second)
        );
    }

    #[test]
    fn test_refresh_resets_issued_at() {
        let cache = TokenCache::new();
        cache.put_at(&token_expiring_in(1000), base()).unwrap();

        let later = base() + Duration::seconds(800);
        let refreshed = token_expiring_in(2000);
        cache.put_at(&refreshed, later).unwrap();

        assert_eq!(cache.get_at(AUDIENCE, later), Some(refreshed));
    }

    #[test]
    fn test_invalid_token_not_cached() {
        let cache = TokenCache::new();

        let result = cache.put_at("invalid-token", base());

        assert_eq!(
            result,
            Err(AdmissionError::Claims(ClaimsError::Malformed(1)))
        );
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_token_without_claims_leaves_cache_unchanged() {
        let cache = TokenCache::new();
        let existing = token_expiring_in(3600);
        cache.put_at(&existing, base()).unwrap();

        let no_claims = format!(
            "{}.{}.",
            URL_SAFE_NO_PAD.encode("{}"),
            URL_SAFE_NO_PAD.encode(r#"{"sub":"x"}"#)
        );
        assert!(cache.put_at(&no_claims, base()).is_err());

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_at(AUDIENCE, base()), Some(existing));
    }

    #[test]
    fn test_expired_token_not_cached() {
        let cache = TokenCache::new();
        let token = token_expiring_in(-10);

        assert!(matches!(
            cache.put_at(&token, base()),
            Err(AdmissionError::Expired(_))
        ));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_keyed_by_token_audience() {
        let cache = TokenCache::new();
        let token = test_token("https://actual.example.com", base().timestamp() + 3600);
        cache.put_at(&token, base()).unwrap();

        assert_eq!(cache.get_at("https://actual.example.com", base()), Some(token));
        assert_eq!(cache.get_at(AUDIENCE, base()), None);
    }
}
