//! Node-level error types.

use thiserror::Error;

/// Errors returned by a node executor's `execute` method.
///
/// The scheduler uses the variant to decide retry behaviour:
/// - `Transient`: retried with exponential back-off up to the configured
///   attempt limit, then escalated to permanent.
/// - `Permanent`: the run is immediately marked as `error`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// Temporary failure (network hiccup, rate limit, 5xx); worth retrying.
    #[error("transient executor error: {0}")]
    Transient(String),

    /// Permanent failure; no retry should be attempted.
    #[error("permanent executor error: {0}")]
    Permanent(String),
}

impl ExecutorError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// The message without the variant prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Transient(msg) | Self::Permanent(msg) => msg,
        }
    }
}

/// Errors raised while resolving a credential reference to a usable secret.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("no credential found for provider '{provider}'")]
    NotFound { provider: String },

    #[error("credential for provider '{provider}' expired")]
    Expired { provider: String },

    #[error("credential resolution timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Token refresh or secret backend failure.
    #[error("credential backend error: {0}")]
    Backend(String),
}

impl From<CredentialError> for ExecutorError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Timeout(_) | CredentialError::Backend(_) => {
                ExecutorError::Transient(err.to_string())
            }
            CredentialError::NotFound { .. } | CredentialError::Expired { .. } => {
                ExecutorError::Permanent(err.to_string())
            }
        }
    }
}

/// Registry lookup failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown node type '{0}'")]
    UnknownNodeType(String),
}
