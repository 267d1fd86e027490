//! Workload identity federation configuration.

use std::time::Duration;

/// Default Security Token Service endpoint.
pub const DEFAULT_STS_URL: &str = "https://sts.googleapis.com/v1/token";

/// Default IAM Credentials API base URL.
pub const DEFAULT_IAM_CREDENTIALS_URL: &str = "https://iamcredentials.googleapis.com";

/// Default per-stage upstream timeout in seconds.
pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 10;

/// Identity and endpoint settings for the exchange pipeline.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Cloud project number owning the workload identity pool.
    pub project_number: String,

    /// Workload identity pool ID.
    pub workload_identity_pool: String,

    /// Workload identity pool provider ID.
    pub workload_provider: String,

    /// Service account impersonated to mint identity tokens.
    pub service_account_email: String,

    /// Token exchange endpoint.
    pub sts_url: String,

    /// IAM Credentials API base URL, without a trailing path.
    pub iam_credentials_url: String,

    /// Timeout applied to each upstream call.
    pub timeout: Duration,
}

impl ExchangeConfig {
    /// Config pointing at the public Google endpoints.
    pub fn new(
        project_number: impl Into<String>,
        workload_identity_pool: impl Into<String>,
        workload_provider: impl Into<String>,
        service_account_email: impl Into<String>,
    ) -> Self {
        Self {
            project_number: project_number.into(),
            workload_identity_pool: workload_identity_pool.into(),
            workload_provider: workload_provider.into(),
            service_account_email: service_account_email.into(),
            sts_url: DEFAULT_STS_URL.to_string(),
            iam_credentials_url: DEFAULT_IAM_CREDENTIALS_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_UPSTREAM_TIMEOUT_SECS),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.sts_url.is_empty() {
            return Err("sts_url must not be empty".to_string());
        }
        if self.iam_credentials_url.is_empty() {
            return Err("iam_credentials_url must not be empty".to_string());
        }
        if self.timeout.is_zero() {
            return Err("upstream timeout must be greater than zero".to_string());
        }
        Ok(())
    }

    /// Audience of the token exchange request, naming the pool provider.
    pub fn workload_identity_audience(&self) -> String {
        format!(
            "//iam.googleapis.com/projects/{}/locations/global/workloadIdentityPools/{}/providers/{}",
            self.project_number, self.workload_identity_pool, self.workload_provider
        )
    }

    /// `generateIdToken` URL for the configured service account.
    pub fn generate_id_token_url(&self) -> String {
        format!(
            "{}/v1/projects/-/serviceAccounts/{}:generateIdToken",
            self.iam_credentials_url.trim_end_matches('/'),
            self.service_account_email
        )
    }
}
