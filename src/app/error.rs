use thiserror::Error;

use crate::RpcError;

use super::store::StoreError;

/// Failure of an application handler, carrying the HTTP status it maps to.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Profit service unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Profit service did not answer in time")]
    UpstreamTimeout,

    #[error("Profit service replied {status_code} {status_text}")]
    Upstream { status_code: i64, status_text: String },

    #[error("Profit service sent unusable data: {0}")]
    UpstreamData(String),

    #[error("Database error: {0}")]
    Database(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::UpstreamUnavailable(_) => 503,
            ApiError::UpstreamTimeout => 504,
            ApiError::Upstream { .. } | ApiError::UpstreamData(_) => 502,
            ApiError::Database(_) | ApiError::Internal(_) => 500,
        }
    }
}

impl From<RpcError> for ApiError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Timeout => ApiError::UpstreamTimeout,
            RpcError::BrokerUnavailable(reason) => ApiError::UpstreamUnavailable(reason),
            RpcError::Publish(reason) => ApiError::UpstreamUnavailable(reason),
            RpcError::Closed => ApiError::UpstreamUnavailable("client closed".to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Internal(format!("JSON error: {err}"))
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::Internal(format!("blocking task failed: {err}"))
    }
}
