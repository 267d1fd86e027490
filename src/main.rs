//! GCP Token Injector Agent
//!
//! Envoy external authorization agent that injects an
//! `Authorization: Bearer <identity token>` header into proxied requests.
//! Identity tokens are minted for the audience named in route metadata by
//! federating the pod's Kubernetes service account token through Google STS
//! and service account impersonation, and cached until 75% of their lifetime
//! has elapsed.

mod exchange;
mod injector;
mod server;
mod token;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use exchange::config::{DEFAULT_IAM_CREDENTIALS_URL, DEFAULT_STS_URL, DEFAULT_UPSTREAM_TIMEOUT_SECS};
use exchange::{ExchangeConfig, FederatedTokenPipeline};
use injector::{InjectorConfig, LockScope, TokenInjector};
use server::{InjectorServer, DEFAULT_METADATA_NAMESPACE};

/// Default gRPC listen port.
const DEFAULT_PORT: u16 = 50051;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "gcp-token-injector-agent")]
#[command(about = "Envoy ext_authz agent injecting GCP identity tokens via workload identity federation")]
struct Args {
    /// Path to the mounted Kubernetes service account token
    #[arg(long, env = "K8S_TOKEN_PATH")]
    token_path: Option<PathBuf>,

    /// GCP project number owning the workload identity pool
    #[arg(long, env = "PROJECT_NUMBER")]
    project_number: Option<String>,

    /// Workload identity pool ID
    #[arg(long, env = "WORKLOAD_IDENTITY_POOL")]
    workload_identity_pool: Option<String>,

    /// Workload identity pool provider ID
    #[arg(long, env = "WORKLOAD_PROVIDER")]
    workload_provider: Option<String>,

    /// Service account to impersonate
    #[arg(long, env = "SERVICE_ACCOUNT_EMAIL")]
    service_account_email: Option<String>,

    /// gRPC listen port
    #[arg(long, default_value_t = DEFAULT_PORT, env = "PORT")]
    port: u16,

    /// gRPC listen address
    #[arg(long, default_value = "0.0.0.0", env = "LISTEN_ADDRESS")]
    listen_address: IpAddr,

    /// Route filter metadata namespace holding the claims
    #[arg(long, default_value = DEFAULT_METADATA_NAMESPACE, env = "METADATA_NAMESPACE")]
    metadata_namespace: String,

    /// Security Token Service endpoint
    #[arg(long, default_value = DEFAULT_STS_URL, env = "STS_URL")]
    sts_url: String,

    /// IAM Credentials API base URL
    #[arg(long, default_value = DEFAULT_IAM_CREDENTIALS_URL, env = "IAM_CREDENTIALS_URL")]
    iam_credentials_url: String,

    /// Timeout for each upstream call, in seconds
    #[arg(long, default_value_t = DEFAULT_UPSTREAM_TIMEOUT_SECS, env = "UPSTREAM_TIMEOUT_SECS")]
    upstream_timeout_secs: u64,

    /// Refresh lock granularity
    #[arg(long, value_enum, default_value_t = LockScope::Audience, env = "REFRESH_LOCK")]
    refresh_lock: LockScope,

    /// Enable verbose logging
    #[arg(short, long, env = "DEBUG")]
    verbose: bool,
}

/// Agent configuration
#[derive(Debug)]
struct AgentConfig {
    exchange: ExchangeConfig,
    injector: InjectorConfig,
    listen_addr: SocketAddr,
    metadata_namespace: String,
}

impl AgentConfig {
    fn from_args(args: &Args) -> Result<Self> {
        fn required<'a>(
            value: &'a Option<String>,
            name: &'static str,
            missing: &mut Vec<&'static str>,
        ) -> &'a str {
            match value.as_deref().map(str::trim) {
                Some(v) if !v.is_empty() => v,
                _ => {
                    missing.push(name);
                    ""
                }
            }
        }

        let mut missing = Vec::new();

        let token_path = match &args.token_path {
            Some(path) if !path.as_os_str().is_empty() => path.clone(),
            _ => {
                missing.push("K8S_TOKEN_PATH");
                PathBuf::new()
            }
        };
        let project_number = required(&args.project_number, "PROJECT_NUMBER", &mut missing);
        let pool = required(&args.workload_identity_pool, "WORKLOAD_IDENTITY_POOL", &mut missing);
        let provider = required(&args.workload_provider, "WORKLOAD_PROVIDER", &mut missing);
        let email = required(&args.service_account_email, "SERVICE_ACCOUNT_EMAIL", &mut missing);

        if !missing.is_empty() {
            return Err(anyhow!(
                "missing required configuration: {}",
                missing.join(", ")
            ));
        }

        if args.port == 0 {
            return Err(anyhow!("invalid port: {}", args.port));
        }

        let exchange = ExchangeConfig {
            sts_url: args.sts_url.clone(),
            iam_credentials_url: args.iam_credentials_url.clone(),
            timeout: Duration::from_secs(args.upstream_timeout_secs),
            ..ExchangeConfig::new(project_number, pool, provider, email)
        };
        exchange
            .validate()
            .map_err(|e| anyhow!("invalid exchange configuration: {}", e))?;

        Ok(Self {
            exchange,
            injector: InjectorConfig {
                token_path,
                lock_scope: args.refresh_lock,
            },
            listen_addr: SocketAddr::new(args.listen_address, args.port),
            metadata_namespace: args.metadata_namespace.clone(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("{}={},warn", env!("CARGO_CRATE_NAME"), log_level))
        .json()
        .init();

    info!("Starting GCP Token Injector Agent");

    // Build configuration
    let config = AgentConfig::from_args(&args).context("Configuration error")?;

    info!(
        token_path = ?config.injector.token_path,
        project_number = %config.exchange.project_number,
        workload_identity_pool = %config.exchange.workload_identity_pool,
        workload_provider = %config.exchange.workload_provider,
        service_account = %config.exchange.service_account_email,
        metadata_namespace = %config.metadata_namespace,
        refresh_lock = %config.injector.lock_scope,
        upstream_timeout_secs = config.exchange.timeout.as_secs(),
        "Configuration loaded"
    );

    let pipeline = FederatedTokenPipeline::new(config.exchange)?;
    let injector = Arc::new(TokenInjector::new(config.injector, pipeline));

    InjectorServer::new(injector, config.metadata_namespace, config.listen_addr)
        .run()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["gcp-token-injector-agent"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    fn full_args() -> Vec<&'static str> {
        vec![
            "--token-path",
            "/var/run/secrets/tokens/gcp-token",
            "--project-number",
            "123456789",
            "--workload-identity-pool",
            "k8s-pool",
            "--workload-provider",
            "k8s-provider",
            "--service-account-email",
            "injector@example-project.iam.gserviceaccount.com",
        ]
    }

    #[test]
    fn test_config_with_defaults() {
        let config = AgentConfig::from_args(&parse(&full_args())).unwrap();

        assert_eq!(
            config.injector.token_path,
            PathBuf::from("/var/run/secrets/tokens/gcp-token")
        );
        assert_eq!(config.injector.lock_scope, LockScope::Audience);
        assert_eq!(config.listen_addr, "0.0.0.0:50051".parse().unwrap());
        assert_eq!(config.metadata_namespace, DEFAULT_METADATA_NAMESPACE);
        assert_eq!(config.exchange.sts_url, DEFAULT_STS_URL);
        assert_eq!(config.exchange.timeout, Duration::from_secs(10));
        assert_eq!(config.exchange.project_number, "123456789");
    }

    #[test]
    fn test_config_overrides() {
        let mut argv = full_args();
        argv.extend_from_slice(&[
            "--port",
            "8080",
            "--refresh-lock",
            "global",
            "--upstream-timeout-secs",
            "3",
            "--sts-url",
            "http://127.0.0.1:9000/v1/token",
        ]);

        let config = AgentConfig::from_args(&parse(&argv)).unwrap();

        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.injector.lock_scope, LockScope::Global);
        assert_eq!(config.exchange.timeout, Duration::from_secs(3));
        assert_eq!(config.exchange.sts_url, "http://127.0.0.1:9000/v1/token");
    }

    #[test]
    fn test_missing_required_listed_together() {
        let args = parse(&["--project-number", "123456789", "--workload-provider", ""]);

        let err = AgentConfig::from_args(&args).unwrap_err().to_string();

        assert_eq!(
            err,
            "missing required configuration: K8S_TOKEN_PATH, WORKLOAD_IDENTITY_POOL, \
             WORKLOAD_PROVIDER, SERVICE_ACCOUNT_EMAIL"
        );
    }

    #[test]
    fn test_port_zero_rejected() {
        let mut argv = full_args();
        argv.extend_from_slice(&["--port", "0"]);

        let err = AgentConfig::from_args(&parse(&argv)).unwrap_err();
        assert!(err.to_string().contains("invalid port"));
    }

    #[test]
    fn test_port_out_of_range_rejected_by_parser() {
        let mut argv = vec!["gcp-token-injector-agent"];
        argv.extend(full_args());
        argv.extend_from_slice(&["--port", "70000"]);

        assert!(Args::try_parse_from(argv).is_err());
    }
}
