use thiserror::Error;

/// Failure of a single logical remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// Non-2xx response after retries (if any) were exhausted.
    #[error("remote API error {status}: {body}")]
    Status { status: u16, body: String },

    #[error("remote API call timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl ApiError {
    /// 5xx responses and timeouts are worth another attempt; everything else is final.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Status { status, .. } => *status >= 500,
            ApiError::Timeout => true,
            ApiError::Network(_) | ApiError::Decode(_) => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}
