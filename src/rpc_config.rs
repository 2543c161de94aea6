//! Client configuration.
//!
//! Connection parameters are fixed at construction and never mutated. The
//! per-request timeout has no default and must be supplied by the caller.

use std::time::Duration;

use url::Url;

use crate::{Result, RpcError};

/// Default name of the queue requests are published to.
pub const DEFAULT_OUTBOUND_QUEUE: &str = "client_queue";

/// Default name of the queue responses are consumed from.
pub const DEFAULT_INBOUND_QUEUE: &str = "server_queue";

/// Broker address and credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    /// Broker host name or IP address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Broker user name.
    pub username: String,
    /// Broker password.
    pub password: String,
}

impl ConnectionParams {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Default for ConnectionParams {
    /// Local RabbitMQ with the stock guest account.
    fn default() -> Self {
        Self::new("localhost", 5672, "guest", "guest")
    }
}

/// RPC client configuration.
///
/// # Example
///
/// ```
/// use profits_rpc::{ConnectionParams, RpcConfig};
/// use std::time::Duration;
///
/// let config = RpcConfig::new(ConnectionParams::default(), Duration::from_secs(30))
///     .with_transport_id("profits-api");
///
/// assert_eq!(config.outbound_queue, "client_queue");
/// assert_eq!(config.inbound_queue, "server_queue");
/// ```
#[derive(Debug, Clone)]
pub struct RpcConfig {
    // ---
    /// Broker address and credentials.
    pub params: ConnectionParams,

    /// Identifier used in log lines and consumer tags.
    pub transport_id: String,

    /// Queue requests are published to.
    pub outbound_queue: String,

    /// Queue responses are consumed from.
    pub inbound_queue: String,

    /// How long a call may stay pending before it resolves with
    /// [`RpcError::Timeout`].
    pub request_timeout: Duration,
}

impl RpcConfig {
    /// Create a config with the default queue names.
    pub fn new(params: ConnectionParams, request_timeout: Duration) -> Self {
        Self {
            params,
            transport_id: "profits-rpc".to_string(),
            outbound_queue: DEFAULT_OUTBOUND_QUEUE.to_string(),
            inbound_queue: DEFAULT_INBOUND_QUEUE.to_string(),
            request_timeout,
        }
    }

    /// Set the identifier used in logs and consumer tags.
    pub fn with_transport_id(mut self, id: impl Into<String>) -> Self {
        self.transport_id = id.into();
        self
    }

    /// Override the request queue name.
    pub fn with_outbound_queue(mut self, name: impl Into<String>) -> Self {
        self.outbound_queue = name.into();
        self
    }

    /// Override the response queue name.
    pub fn with_inbound_queue(mut self, name: impl Into<String>) -> Self {
        self.inbound_queue = name.into();
        self
    }

    /// Check the config before any network activity.
    pub fn validate(&self) -> Result<()> {
        // ---
        if self.request_timeout.is_zero() {
            return Err(RpcError::InvalidConfig(
                "request_timeout must be greater than zero".into(),
            ));
        }
        if self.outbound_queue.is_empty() || self.inbound_queue.is_empty() {
            return Err(RpcError::InvalidConfig("queue names must not be empty".into()));
        }
        if self.outbound_queue == self.inbound_queue {
            return Err(RpcError::InvalidConfig(format!(
                "outbound and inbound queue are both '{}'",
                self.outbound_queue
            )));
        }
        if self.params.host.is_empty() {
            return Err(RpcError::InvalidConfig("host must not be empty".into()));
        }
        Ok(())
    }

    /// Render the AMQP URI for the default virtual host.
    ///
    /// Credentials are percent-encoded.
    pub fn amqp_uri(&self) -> Result<String> {
        // ---
        let p = &self.params;
        let invalid = |what: &str| RpcError::InvalidConfig(format!("cannot use {what} in AMQP URI"));

        let mut url = Url::parse("amqp://localhost/")
            .map_err(|e| RpcError::InvalidConfig(format!("base URI: {e}")))?;
        url.set_host(Some(&p.host)).map_err(|_| invalid("host"))?;
        url.set_port(Some(p.port)).map_err(|_| invalid("port"))?;
        url.set_username(&p.username).map_err(|_| invalid("username"))?;
        url.set_password(Some(&p.password)).map_err(|_| invalid("password"))?;
        url.set_path("/%2f");

        Ok(url.to_string())
    }
}
