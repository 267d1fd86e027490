//! Identity token handling: unverified claim extraction and the
//! refresh-ahead token cache.

pub mod cache;
pub mod claims;

pub use cache::TokenCache;

/// Mint an HS256-signed token carrying `aud` and `exp`, as the identity API
/// would return (the signature is never checked here).
#[cfg(test)]
pub(crate) fn test_token(audience: &str, exp: i64) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let claims = serde_json::json!({
        "aud": audience,
        "exp": exp,
        "iss": "https://accounts.google.com",
        "email": "injector@example-project.iam.gserviceaccount.com",
    });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"test-secret-key-long-enough-for-hs256"),
    )
    .unwrap()
}
