use thiserror::Error;

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors that can occur while emulating receivers or talking to the backend
#[derive(Error, Debug)]
pub enum BridgeError {
    /// No usable credential is held for the backend API
    #[error("Not authenticated with the backend")]
    Unauthenticated,

    /// Network failure, timeout or 5xx from the backend
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Backend answered with a 4xx we do not recover from
    #[error("Backend rejected request ({status}): {detail}")]
    BackendRejected {
        /// HTTP status code
        status: u16,
        /// Response body or reason phrase
        detail: String,
    },

    /// Control session request could not be parsed
    #[error("Malformed control request: {0}")]
    ProtocolMalformed(String),

    /// Operation on a virtual device id that is not registered
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// Device name that yields no usable id
    #[error("Invalid device name: {0:?}")]
    InvalidDeviceName(String),

    /// Operation did not finish within its deadline
    #[error("Request timeout")]
    Timeout,

    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// mDNS daemon error
    #[error("mDNS error: {0}")]
    Mdns(#[from] mdns_sd::Error),

    /// Channel receive error
    #[error("Channel error: {0}")]
    ChannelError(String),
}

impl BridgeError {
    /// Classify a non-success HTTP status from the backend.
    pub fn from_status(status: reqwest::StatusCode, detail: impl Into<String>) -> Self {
        if status == reqwest::StatusCode::UNAUTHORIZED {
            BridgeError::Unauthenticated
        } else if status.is_server_error() {
            BridgeError::BackendUnavailable(format!("{}: {}", status, detail.into()))
        } else {
            BridgeError::BackendRejected {
                status: status.as_u16(),
                detail: detail.into(),
            }
        }
    }

    /// Whether the next scheduled cycle may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::BackendUnavailable(_) | BridgeError::Timeout | BridgeError::Io(_)
        )
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BridgeError::Timeout
        } else if let Some(status) = e.status() {
            BridgeError::from_status(status, e.to_string())
        } else {
            BridgeError::BackendUnavailable(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn status_classification_follows_taxonomy() {
        assert!(matches!(
            BridgeError::from_status(StatusCode::UNAUTHORIZED, ""),
            BridgeError::Unauthenticated
        ));
        assert!(matches!(
            BridgeError::from_status(StatusCode::BAD_GATEWAY, "upstream"),
            BridgeError::BackendUnavailable(_)
        ));
        match BridgeError::from_status(StatusCode::NOT_FOUND, "missing") {
            BridgeError::BackendRejected { status, detail } => {
                assert_eq!(status, 404);
                assert_eq!(detail, "missing");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(BridgeError::Timeout.is_retryable());
        assert!(BridgeError::BackendUnavailable("5xx".into()).is_retryable());
        assert!(!BridgeError::Unauthenticated.is_retryable());
        assert!(!BridgeError::UnknownDevice("x".into()).is_retryable());
    }
}
