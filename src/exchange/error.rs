//! Exchange pipeline errors.

use reqwest::StatusCode;
use std::fmt;
use thiserror::Error;

/// Pipeline stage an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Subject token → federated access token (STS).
    Exchange,
    /// Access token → audience-scoped identity token (IAM Credentials).
    Impersonation,
}

impl Stage {
    /// Upstream service answering this stage.
    pub fn service(&self) -> &'static str {
        match self {
            Stage::Exchange => "STS",
            Stage::Impersonation => "IAM",
        }
    }

    /// Name of the token this stage must return.
    pub fn token_name(&self) -> &'static str {
        match self {
            Stage::Exchange => "access token",
            Stage::Impersonation => "identity token",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Exchange => write!(f, "token exchange"),
            Stage::Impersonation => write!(f, "impersonation"),
        }
    }
}

/// Failure of one exchange pipeline stage.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The request never produced a response (connect, TLS, timeout).
    #[error("{stage} failed: could not call {}: {source}", .stage.service())]
    Transport {
        stage: Stage,
        #[source]
        source: reqwest::Error,
    },

    /// Upstream answered with something other than 200.
    #[error("{stage} failed: {} returned non-OK status: {status}, body: {body}", .stage.service())]
    Status {
        stage: Stage,
        status: StatusCode,
        body: String,
    },

    /// Upstream answered 200 with a body that is not the expected JSON.
    #[error("{stage} failed: failed to decode {} response: {source}", .stage.service())]
    Decode {
        stage: Stage,
        #[source]
        source: serde_json::Error,
    },

    /// Upstream answered 200 but left the token field empty.
    #[error("{stage} failed: empty {} received from {}", .stage.token_name(), .stage.service())]
    EmptyToken { stage: Stage },
}

impl ExchangeError {
    /// Stage the error came from.
    pub fn stage(&self) -> Stage {
        match self {
            ExchangeError::Transport { stage, .. }
            | ExchangeError::Status { stage, .. }
            | ExchangeError::Decode { stage, .. }
            | ExchangeError::EmptyToken { stage } => *stage,
        }
    }

    /// Short failure kind for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ExchangeError::Transport { .. } => "transport",
            ExchangeError::Status { .. } => "status",
            ExchangeError::Decode { .. } => "decode",
            ExchangeError::EmptyToken { .. } => "empty_token",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_message() {
        let err = ExchangeError::Status {
            stage: Stage::Exchange,
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: "boom".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "token exchange failed: STS returned non-OK status: 500 Internal Server Error, body: boom"
        );
        assert_eq!(err.stage(), Stage::Exchange);
        assert_eq!(err.kind(), "status");
    }

    #[test]
    fn test_empty_token_message() {
        let err = ExchangeError::EmptyToken {
            stage: Stage::Impersonation,
        };
        assert_eq!(
            err.to_string(),
            "impersonation failed: empty identity token received from IAM"
        );
    }
}
