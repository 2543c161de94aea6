use thiserror::Error;

/// Errors that can occur during RPC operations.
#[derive(Error, Debug)]
pub enum RpcError {
    /// No response arrived before the call's deadline.
    #[error("request timed out")]
    Timeout,

    /// The broker connection never came up or was lost.
    ///
    /// Every outstanding and future call on the client resolves with this.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Publishing a single request failed.
    #[error("publish failed: {0}")]
    Publish(String),

    /// Transport-level failure (connection, channel, queue or consumer).
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A message did not have the expected response shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The connection state machine received an event it cannot accept.
    #[error("invalid transition: {event} in state {state}")]
    InvalidTransition { state: String, event: String },

    /// The client was closed while the call was outstanding.
    #[error("client closed")]
    Closed,

    /// The supplied configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RpcError {
    /// Clone-like helper for fanning one failure out to many pending calls.
    ///
    /// `serde_json::Error` is not `Clone`, so it is flattened to its message.
    pub(crate) fn duplicate(&self) -> Self {
        // ---
        match self {
            RpcError::Timeout => RpcError::Timeout,
            RpcError::BrokerUnavailable(s) => RpcError::BrokerUnavailable(s.clone()),
            RpcError::Publish(s) => RpcError::Publish(s.clone()),
            RpcError::Transport(s) => RpcError::Transport(s.clone()),
            RpcError::Serialization(e) => RpcError::InvalidResponse(e.to_string()),
            RpcError::InvalidResponse(s) => RpcError::InvalidResponse(s.clone()),
            RpcError::InvalidTransition { state, event } => RpcError::InvalidTransition {
                state: state.clone(),
                event: event.clone(),
            },
            RpcError::Closed => RpcError::Closed,
            RpcError::InvalidConfig(s) => RpcError::InvalidConfig(s.clone()),
        }
    }
}

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;
