//! Typed failures for remote drive calls.
//!
//! The walker and orchestrator branch on these: a [`DriveError::Timeout`] is
//! retried once with a longer timeout, a [`DriveError::Unauthorized`] triggers
//! a silent token refresh, anything else marks the folder or file as failed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriveError {
    /// The request did not complete within its timeout.
    #[error("request timed out after {0}s")]
    Timeout(u64),

    /// 401, or a 400 whose body names an invalid or expired token.
    #[error("authorization failed (HTTP {status})")]
    Unauthorized { status: u16 },

    /// Any other non-2xx response.
    #[error("API error {status}: {message}")]
    Status { status: u16, message: String },

    /// Connection reset, DNS failure and similar transport errors.
    #[error("network error: {0}")]
    Network(String),

    #[error("invalid response body: {0}")]
    Decode(String),

    /// The item has no direct download reference.
    #[error("no download reference for {0}")]
    NoDownloadUrl(String),
}

impl DriveError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, DriveError::Unauthorized { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DriveError::Timeout(_))
    }

    /// Failures worth another attempt at the call site: transport errors,
    /// throttling and server-side errors.
    pub fn is_transient(&self) -> bool {
        match self {
            DriveError::Timeout(_) | DriveError::Network(_) => true,
            DriveError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            DriveError::Timeout(timeout_secs)
        } else if err.is_decode() {
            DriveError::Decode(err.to_string())
        } else {
            DriveError::Network(err.to_string())
        }
    }
}

pub type DriveResult<T> = std::result::Result<T, DriveError>;
