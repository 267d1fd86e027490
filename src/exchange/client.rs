//! Two-stage workload identity federation: STS token exchange followed by
//! service account impersonation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::config::ExchangeConfig;
use super::error::{ExchangeError, Stage};

/// Token exchange grant type (RFC 8693).
pub const GRANT_TYPE_TOKEN_EXCHANGE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";

/// Scope requested for the federated access token.
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Requested token type: OAuth 2.0 access token.
pub const TOKEN_TYPE_ACCESS_TOKEN: &str = "urn:ietf:params:oauth:token-type:access_token";

/// Subject token type: JWT.
pub const TOKEN_TYPE_JWT: &str = "urn:ietf:params:oauth:token-type:jwt";

/// Produces an audience-scoped identity token from a local subject token.
#[async_trait]
pub trait TokenPipeline: Send + Sync {
    /// Run the full pipeline once. Implementations must not cache.
    async fn run(&self, subject_token: &str, audience: &str) -> Result<String, ExchangeError>;
}

/// STS token exchange request (JSON body).
#[derive(Debug, Serialize)]
pub struct StsRequest<'a> {
    pub grant_type: &'a str,
    pub audience: &'a str,
    pub scope: &'a str,
    pub requested_token_type: &'a str,
    pub subject_token_type: &'a str,
    pub subject_token: &'a str,
}

/// STS token exchange response.
#[derive(Debug, Deserialize)]
pub struct StsResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// IAM Credentials `generateIdToken` request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateIdTokenRequest<'a> {
    pub audience: &'a str,
    pub include_email: bool,
}

/// IAM Credentials `generateIdToken` response.
#[derive(Debug, Deserialize)]
pub struct GenerateIdTokenResponse {
    #[serde(default)]
    pub token: Option<String>,
}

/// Pipeline backed by Google STS and IAM Credentials.
pub struct FederatedTokenPipeline {
    config: ExchangeConfig,
    http_client: reqwest::Client,
}

impl FederatedTokenPipeline {
    /// Create a pipeline; the configured timeout bounds each stage separately.
    pub fn new(config: ExchangeConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            config,
            http_client,
        })
    }

    /// Stage 1: exchange the local subject token for a federated access token.
    pub async fn exchange_token(&self, subject_token: &str) -> Result<String, ExchangeError> {
        let stage = Stage::Exchange;
        let audience = self.config.workload_identity_audience();
        let request = StsRequest {
            grant_type: GRANT_TYPE_TOKEN_EXCHANGE,
            audience: &audience,
            scope: CLOUD_PLATFORM_SCOPE,
            requested_token_type: TOKEN_TYPE_ACCESS_TOKEN,
            subject_token_type: TOKEN_TYPE_JWT,
            subject_token,
        };

        debug!(url = %self.config.sts_url, audience = %audience, "Exchanging subject token");

        let response = self
            .http_client
            .post(&self.config.sts_url)
            .json(&request)
            .send()
            .await
            .map_err(|source| ExchangeError::Transport { stage, source })?;

        let sts: StsResponse = read_json(stage, response).await?;
        let access_token = sts.access_token.unwrap_or_default();
        if access_token.is_empty() {
            return Err(ExchangeError::EmptyToken { stage });
        }

        debug!(
            expires_in = ?sts.expires_in,
            token_type = ?sts.token_type,
            "Received federated access token"
        );

        Ok(access_token)
    }

    /// Stage 2: impersonate the service account to mint an identity token.
    pub async fn generate_identity_token(
        &self,
        access_token: &str,
        audience: &str,
    ) -> Result<String, ExchangeError> {
        let stage = Stage::Impersonation;
        let url = self.config.generate_id_token_url();
        let request = GenerateIdTokenRequest {
            audience,
            include_email: true,
        };

        debug!(url = %url, audience = %audience, "Generating identity token");

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(access_token)
            .json(&request)
            .send()
            .await
            .map_err(|source| ExchangeError::Transport { stage, source })?;

        let iam: GenerateIdTokenResponse = read_json(stage, response).await?;
        match iam.token {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(ExchangeError::EmptyToken { stage }),
        }
    }
}

#[async_trait]
impl TokenPipeline for FederatedTokenPipeline {
    async fn run(&self, subject_token: &str, audience: &str) -> Result<String, ExchangeError> {
        let access_token = self.exchange_token(subject_token).await?;
        self.generate_identity_token(&access_token, audience).await
    }
}

/// Check for a 200 and decode the body, keeping status errors, transport
/// errors and decode errors apart.
async fn read_json<T: DeserializeOwned>(
    stage: Stage,
    response: reqwest::Response,
) -> Result<T, ExchangeError> {
    let status = response.status();
    if status != reqwest::StatusCode::OK {
        let body = response.text().await.unwrap_or_default();
        return Err(ExchangeError::Status {
            stage,
            status,
            body,
        });
    }

    let body = response
        .bytes()
        .await
        .map_err(|source| ExchangeError::Transport { stage, source })?;

    serde_json::from_slice(&body).map_err(|source| ExchangeError::Decode { stage, source })
}
