// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! A transport exposes the individual broker steps (open connection, open
//! channel, declare queue, consume, publish) as separate async operations so
//! the client's connection state machine can drive them one event at a time
//! and observe each completion or failure.
//!
//! The transport layer only moves opaque message bodies plus two properties
//! (`correlation_id`, `content_type`). Correlation, deadlines and failure
//! propagation live in the client.
//!
//! Concrete implementations live under `src/transport/`.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::Result;

/// One message as it travels through a queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    // ---
    /// Queue the message is routed to (default exchange, routing key = queue).
    pub queue: Arc<str>,

    /// Serialized envelope.
    pub payload: Bytes,

    /// Correlation identifier property.
    pub correlation_id: Option<Arc<str>>,

    /// Content type property (`application/json` for everything we send).
    pub content_type: Option<Arc<str>>,
}

impl Message {
    /// A JSON message addressed to `queue` carrying `correlation_id`.
    pub fn json(queue: impl Into<Arc<str>>, payload: Bytes, correlation_id: impl Into<Arc<str>>) -> Self {
        // ---
        Self {
            queue: queue.into(),
            payload,
            correlation_id: Some(correlation_id.into()),
            content_type: Some(Arc::from(crate::protocol::CONTENT_TYPE_JSON)),
        }
    }
}

/// Handle returned from a successful `consume()`.
///
/// The inbox yields `None` once the consumer is gone (transport closed,
/// channel lost, or the broker cancelled the subscription).
pub struct SubscriptionHandle {
    // ---
    /// Delivered messages, in broker delivery order.
    pub inbox: mpsc::UnboundedReceiver<Message>,
}

/// Broker abstraction.
///
/// Implementations must ensure that:
/// - `declare_queue()` creates the queue if absent and returns the name the
///   broker acknowledged.
/// - Once `consume()` returns, messages published to that queue afterwards
///   are delivered to the returned inbox without acknowledgement.
/// - `publish()` reports failures instead of dropping the message silently.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Identifier used in log lines.
    fn transport_id(&self) -> &str;

    /// Open the broker connection.
    async fn connect(&self) -> Result<()>;

    /// Open a logical channel on the connection.
    async fn open_channel(&self) -> Result<()>;

    /// Declare (create if absent) a queue, returning its acknowledged name.
    async fn declare_queue(&self, name: &str) -> Result<String>;

    /// Start a no-ack consumer on `queue`.
    async fn consume(&self, queue: &str) -> Result<SubscriptionHandle>;

    /// Publish a message to its queue.
    async fn publish(&self, msg: Message) -> Result<()>;

    /// Close the transport and release any associated resources.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// Cloning only bumps a reference count; clones share one connection.
pub type TransportPtr = Arc<dyn Transport>;
