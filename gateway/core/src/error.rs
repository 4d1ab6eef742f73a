//! Gateway Errors
//!
//! One error enum for every failure an adapter can observe. Adapters never let
//! these escape: they are translated into a terminal `error` event plus pool
//! bookkeeping. The [`ErrorKind`] and [`RetryClass`] accessors drive that
//! bookkeeping.

use std::time::Duration;

use thiserror::Error;

/// Result alias used across the gateway
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Coarse failure taxonomy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// No eligible resource was available
    PoolExhausted,
    /// Timeout, stall or malformed data; the resource is probably fine
    TransientUpstream,
    /// The credential itself was rejected or restricted
    TerminalCredential,
    /// Navigation or element errors inside an automated session
    AutomationFailure,
}

/// What the caller should do with the resource after a failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryClass {
    /// Resource is healthy; the same one may be retried
    RetrySame,
    /// Resource is suspect; a different one should be used
    RetryDifferent,
    /// Resource must not be used again until revalidated
    Terminal,
}

/// Errors produced by pools, transports and protocol adapters
#[derive(Error, Debug)]
pub enum GatewayError {
    /// No eligible credential or worker
    #[error("{pool} pool exhausted")]
    PoolExhausted {
        /// Pool name
        pool: String,
    },

    /// No chunk arrived within the inactivity window
    #[error("no data from upstream for {0:?}, please retry later")]
    Stalled(Duration),

    /// Upstream answered with a retryable failure
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Upstream data could not be decoded
    #[error("malformed upstream data: {0}")]
    Malformed(String),

    /// Upstream rejected the credential
    #[error("credential rejected: {0}")]
    CredentialRejected(String),

    /// Upstream restricted the account
    #[error("access restricted: {0}")]
    Restricted(String),

    /// Browser automation failed
    #[error("automation failed: {0}")]
    Automation(String),

    /// Model not served by the selected backend
    #[error("model {0} is not supported")]
    UnsupportedModel(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// HTTP transport error
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// JSON encode/decode error
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Filesystem error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Build an error from an HTTP status and response body
    #[must_use]
    pub fn from_status(status: u16, body: &str) -> Self {
        let detail = format!("{status}: {body}");
        if body.contains("restricted") {
            Self::Restricted(detail)
        } else if status == 401 || status == 403 {
            Self::CredentialRejected(detail)
        } else {
            Self::Upstream(detail)
        }
    }

    /// Taxonomy bucket for this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::CredentialRejected(_) | Self::Restricted(_) => ErrorKind::TerminalCredential,
            Self::Automation(_) => ErrorKind::AutomationFailure,
            Self::Stalled(_)
            | Self::Upstream(_)
            | Self::Malformed(_)
            | Self::UnsupportedModel(_)
            | Self::Config(_)
            | Self::Http(_)
            | Self::Json(_)
            | Self::Io(_) => ErrorKind::TransientUpstream,
        }
    }

    /// Retry classification for pool bookkeeping
    #[must_use]
    pub fn class(&self) -> RetryClass {
        match self {
            Self::CredentialRejected(_) | Self::Restricted(_) | Self::Automation(_) => {
                RetryClass::Terminal
            }
            Self::Stalled(_) | Self::Malformed(_) => RetryClass::RetryDifferent,
            Self::Http(e) if e.is_timeout() => RetryClass::RetryDifferent,
            _ => RetryClass::RetrySame,
        }
    }

    /// Whether this error should invalidate the credential
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.class() == RetryClass::Terminal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_classification() {
        assert!(matches!(
            GatewayError::from_status(401, "bad token"),
            GatewayError::CredentialRejected(_)
        ));
        assert!(matches!(
            GatewayError::from_status(403, "forbidden"),
            GatewayError::CredentialRejected(_)
        ));
        assert!(matches!(
            GatewayError::from_status(400, "organization restricted"),
            GatewayError::Restricted(_)
        ));
        assert!(matches!(
            GatewayError::from_status(429, "slow down"),
            GatewayError::Upstream(_)
        ));
    }

    #[test]
    fn test_kind_and_class() {
        let stalled = GatewayError::Stalled(Duration::from_secs(5));
        assert_eq!(stalled.kind(), ErrorKind::TransientUpstream);
        assert_eq!(stalled.class(), RetryClass::RetryDifferent);

        let rejected = GatewayError::CredentialRejected("401".into());
        assert_eq!(rejected.kind(), ErrorKind::TerminalCredential);
        assert!(rejected.is_terminal());

        let automation = GatewayError::Automation("no input box".into());
        assert_eq!(automation.kind(), ErrorKind::AutomationFailure);
        assert!(automation.is_terminal());

        let exhausted = GatewayError::PoolExhausted { pool: "x".into() };
        assert_eq!(exhausted.kind(), ErrorKind::PoolExhausted);
        assert_eq!(exhausted.class(), RetryClass::RetrySame);
    }

    #[test]
    fn test_stalled_message() {
        let msg = GatewayError::Stalled(Duration::from_secs(5)).to_string();
        assert!(msg.contains("please retry later"));
    }
}
