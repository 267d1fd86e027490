//! Request coordination: audience lookup, cache, single-flight refresh.

pub mod refresh;

pub use refresh::{LockScope, RefreshLocks};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::exchange::{ExchangeError, TokenPipeline};
use crate::token::TokenCache;

/// Inbound claim naming the audience to mint a token for.
pub const AUDIENCE_CLAIM: &str = "audience";

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct InjectorConfig {
    /// Mounted Kubernetes service account token, re-read on every refresh.
    pub token_path: PathBuf,
    /// Refresh lock granularity.
    pub lock_scope: LockScope,
}

/// Why a check could not be authorized.
#[derive(Debug, Error)]
pub enum InjectError {
    #[error("audience not found in metadata")]
    MissingAudience,

    #[error("failed to read local identity token {path:?}: {source}")]
    LocalCredential {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("refresh task failed: {0}")]
    RefreshTask(#[from] tokio::task::JoinError),
}

impl InjectError {
    /// Short failure kind for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            InjectError::MissingAudience => "missing_audience",
            InjectError::LocalCredential { .. } => "local_credential",
            InjectError::RefreshTask(_) => "refresh_task",
            InjectError::Exchange(e) => match e.stage() {
                crate::exchange::Stage::Exchange => "exchange",
                crate::exchange::Stage::Impersonation => "impersonation",
            },
        }
    }
}

/// Result of one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Inject `Authorization: Bearer <token>`.
    Authorized { token: String },
    /// Reject with the fixed internal-error response.
    Denied,
}

/// Hands out cached identity tokens, refreshing through the pipeline on miss.
pub struct TokenInjector<P> {
    shared: Arc<Shared<P>>,
}

/// State owned jointly by the injector and its in-flight refresh tasks.
struct Shared<P> {
    config: InjectorConfig,
    cache: TokenCache,
    locks: RefreshLocks,
    pipeline: P,
}

impl<P: TokenPipeline + 'static> TokenInjector<P> {
    pub fn new(config: InjectorConfig, pipeline: P) -> Self {
        let locks = RefreshLocks::new(config.lock_scope);
        Self {
            shared: Arc::new(Shared {
                config,
                cache: TokenCache::new(),
                locks,
                pipeline,
            }),
        }
    }

    #[cfg(test)]
    pub fn cache(&self) -> &TokenCache {
        &self.shared.cache
    }

    /// Authorize one inbound check. Every failure becomes [`CheckOutcome::Denied`];
    /// the cause is only logged.
    pub async fn check(&self, claims: &HashMap<String, String>) -> CheckOutcome {
        let result = match claims.get(AUDIENCE_CLAIM).filter(|a| !a.is_empty()) {
            Some(audience) => self.identity_token(audience).await,
            None => Err(InjectError::MissingAudience),
        };

        match result {
            Ok(token) => CheckOutcome::Authorized { token },
            Err(e @ InjectError::MissingAudience) => {
                warn!(kind = e.kind(), "{}", e);
                CheckOutcome::Denied
            }
            Err(InjectError::Exchange(e)) => {
                error!(
                    stage = %e.stage(),
                    kind = e.kind(),
                    audience = ?claims.get(AUDIENCE_CLAIM),
                    error = %e,
                    "Error getting identity token"
                );
                CheckOutcome::Denied
            }
            Err(e) => {
                error!(
                    kind = e.kind(),
                    audience = ?claims.get(AUDIENCE_CLAIM),
                    error = %e,
                    "Error getting identity token"
                );
                CheckOutcome::Denied
            }
        }
    }

    /// Identity token for `audience`, from cache or freshly minted.
    ///
    /// A miss is refreshed on a spawned task, so a caller that goes away
    /// (proxy timeout, client disconnect) does not abort the upstream round
    /// trip: the token is still cached for the next check. Concurrent misses
    /// for the same audience wait on one refresh lock and re-check the cache
    /// once they hold it, so only the first one calls upstream.
    pub async fn identity_token(&self, audience: &str) -> Result<String, InjectError> {
        if let Some(token) = self.shared.cache.get(audience) {
            debug!(audience = %audience, "Found token in cache");
            return Ok(token);
        }

        let shared = Arc::clone(&self.shared);
        let audience = audience.to_string();
        tokio::spawn(async move { shared.refresh(&audience).await }).await?
    }
}

impl<P: TokenPipeline> Shared<P> {
    async fn refresh(&self, audience: &str) -> Result<String, InjectError> {
        let _guard = self.locks.acquire(audience).await;

        if let Some(token) = self.cache.get(audience) {
            debug!(audience = %audience, "Found token in cache after waiting for refresh");
            return Ok(token);
        }

        let subject_token = self.read_subject_token().await?;

        let start = Instant::now();
        let token = self.pipeline.run(&subject_token, audience).await?;
        debug!(
            audience = %audience,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Obtained identity token"
        );

        // Best effort: an uncacheable token is still good for this request
        if let Err(e) = self.cache.put(&token) {
            warn!(audience = %audience, error = %e, "Identity token not cached");
        }

        Ok(token)
    }

    async fn read_subject_token(&self) -> Result<String, InjectError> {
        let path = &self.config.token_path;
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| InjectError::LocalCredential {
                path: path.clone(),
                source,
            })?;
        Ok(raw.trim().to_string())
    }
}
