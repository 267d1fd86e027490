//! Workload identity federation pipeline.
//!
//! Exchanges the mounted Kubernetes service account token for a federated
//! access token (STS, RFC 8693), then impersonates a service account to mint
//! an identity token for the requested audience.

pub mod client;
pub mod config;
pub mod error;

pub use client::{FederatedTokenPipeline, TokenPipeline};
pub use config::ExchangeConfig;
pub use error::{ExchangeError, Stage};
