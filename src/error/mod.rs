//! Error taxonomy for discovery and ingestion.
//!
//! Only [`PipelineError::RequiredEndpointExhausted`] is fatal for a fetch
//! cycle. Everything else is retried locally or degrades into a smaller
//! result set with a diagnostic attached.

use crate::models::Category;
use thiserror::Error;

/// Network-level failure of a single request.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("timeout fetching {url}")]
    Timeout { url: String },

    #[error("blocked (HTTP 403) fetching {url}")]
    Blocked { url: String },

    #[error("HTTP {status} fetching {url}")]
    Status { url: String, status: u16 },

    #[error("empty body from {url}")]
    EmptyBody { url: String },

    #[error("request to {url} failed: {reason}")]
    Request { url: String, reason: String },
}

impl TransportError {
    pub fn from_reqwest(url: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout { url: url.to_string() }
        } else if let Some(status) = err.status() {
            TransportError::from_status(url, status.as_u16())
        } else {
            TransportError::Request {
                url: url.to_string(),
                reason: err.to_string(),
            }
        }
    }

    pub fn from_status(url: &str, status: u16) -> Self {
        if status == 403 {
            TransportError::Blocked { url: url.to_string() }
        } else {
            TransportError::Status {
                url: url.to_string(),
                status,
            }
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, TransportError::Blocked { .. })
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("invalid payload: {0}")]
    Validation(String),

    #[error("could not sample {url}: {reason}")]
    ClassificationFailure { url: String, reason: String },

    #[error("required endpoint {category} exhausted after {attempts} attempts: {reason}")]
    RequiredEndpointExhausted {
        category: Category,
        attempts: u32,
        reason: String,
    },

    #[error("optional endpoint {category} exhausted after {attempts} attempts: {reason}")]
    OptionalEndpointExhausted {
        category: Category,
        attempts: u32,
        reason: String,
    },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Whether this error should abort the whole fetch cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::RequiredEndpointExhausted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_403_is_blocked() {
        assert!(TransportError::from_status("u", 403).is_blocked());
        assert_eq!(
            TransportError::from_status("u", 503),
            TransportError::Status { url: "u".into(), status: 503 }
        );
    }

    #[test]
    fn test_only_required_exhaustion_is_fatal() {
        let fatal = PipelineError::RequiredEndpointExhausted {
            category: Category::Equity,
            attempts: 3,
            reason: "HTTP 503".into(),
        };
        let soft = PipelineError::OptionalEndpointExhausted {
            category: Category::Sme,
            attempts: 3,
            reason: "HTTP 503".into(),
        };
        assert!(fatal.is_fatal());
        assert!(!soft.is_fatal());
        assert!(!PipelineError::StorageUnavailable("down".into()).is_fatal());
        assert!(fatal.to_string().contains("equity"));
    }
}
