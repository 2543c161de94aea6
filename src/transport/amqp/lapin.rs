//! AMQP transport implementation using `lapin`.
//!
//! Each [`Transport`] step maps onto one AMQP operation:
//!
//! | step             | AMQP                                  |
//! |------------------|---------------------------------------|
//! | `connect`        | `Connection::connect`                 |
//! | `open_channel`   | `Connection::create_channel`          |
//! | `declare_queue`  | `queue.declare` (default options)     |
//! | `consume`        | `basic.consume` with `no_ack = true`  |
//! | `publish`        | `basic.publish` on the default exchange, routing key = queue |
//!
//! ## Delivery semantics
//!
//! Consumption is fire-and-forget: deliveries are never acknowledged, so the
//! broker may redeliver. Each consumer runs in its own task that forwards
//! deliveries to the subscription inbox. When the consumer stream ends or
//! errors, the task exits and the inbox closes; callers treat that as a lost
//! connection.
//!
//! ## Scope and limitations
//!
//! One transport instance is one broker connection with one channel. TLS,
//! publisher confirms and durable queues are not used.

use std::sync::{Arc, Mutex};

use futures_lite::stream::StreamExt;
use lapin::{
    //
    options::{
        //
        BasicConsumeOptions,
        BasicPublishOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
};
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;

use crate::util::lock_ignore_poison;
use crate::{
    //
    log_debug,
    log_error,
    log_info,
    Message,
    Result,
    RpcConfig,
    RpcError,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};

/// AMQP transport implementation using lapin.
struct AmqpTransport {
    // ---
    transport_id: String,
    uri: String,
    endpoint: String,
    connection: OnceCell<Connection>,
    channel: OnceCell<Channel>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl AmqpTransport {
    fn channel(&self) -> Result<&Channel> {
        self.channel
            .get()
            .ok_or_else(|| RpcError::Transport("amqp: channel not open".into()))
    }
}

/// Convert a lapin delivery into a transport message.
fn to_message(queue: &str, delivery: lapin::message::Delivery) -> Message {
    // ---
    let props = &delivery.properties;
    Message {
        queue: Arc::from(queue),
        correlation_id: props.correlation_id().as_ref().map(|s| Arc::from(s.as_str())),
        content_type: props.content_type().as_ref().map(|s| Arc::from(s.as_str())),
        payload: delivery.data.into(),
    }
}

#[async_trait::async_trait]
impl Transport for AmqpTransport {
    // ---
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    async fn connect(&self) -> Result<()> {
        // ---
        log_info!("[{}] Connecting to {}", self.transport_id, self.endpoint);

        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|e| {
                let msg = format!("amqp: connection to {} failed: {e}", self.endpoint);
                log_error!("[{}] {msg}", self.transport_id);
                RpcError::Transport(msg)
            })?;

        self.connection
            .set(connection)
            .map_err(|_| RpcError::Transport("amqp: already connected".into()))
    }

    async fn open_channel(&self) -> Result<()> {
        // ---
        let connection = self
            .connection
            .get()
            .ok_or_else(|| RpcError::Transport("amqp: not connected".into()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: channel creation failed: {e}")))?;

        self.channel
            .set(channel)
            .map_err(|_| RpcError::Transport("amqp: channel already open".into()))
    }

    async fn declare_queue(&self, name: &str) -> Result<String> {
        // ---
        let queue = self
            .channel()?
            .queue_declare(name, QueueDeclareOptions::default(), FieldTable::default())
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: queue declare {name} failed: {e}")))?;

        Ok(queue.name().as_str().to_string())
    }

    async fn consume(&self, queue: &str) -> Result<SubscriptionHandle> {
        // ---
        let options = BasicConsumeOptions {
            no_ack: true,
            ..BasicConsumeOptions::default()
        };
        let tag = format!("{}-consumer", self.transport_id);

        let mut consumer = self
            .channel()?
            .basic_consume(queue, &tag, options, FieldTable::default())
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: consume {queue} failed: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let queue = queue.to_string();
        let transport_id = self.transport_id.clone();

        let handle = tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        log_debug!("[{transport_id}] Received message on queue: {queue}");
                        if tx.send(to_message(&queue, delivery)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log_error!("[{transport_id}] Consumer error on {queue}: {e}");
                        break;
                    }
                }
            }
            log_info!("[{transport_id}] Consumer task ended for queue: {queue}");
        });

        lock_ignore_poison(&self.consumers).push(handle);
        Ok(SubscriptionHandle { inbox: rx })
    }

    async fn publish(&self, msg: Message) -> Result<()> {
        // ---
        let mut props = BasicProperties::default();
        if let Some(ct) = msg.content_type.as_deref() {
            props = props.with_content_type(ct.into());
        }
        if let Some(id) = msg.correlation_id.as_deref() {
            props = props.with_correlation_id(id.into());
        }

        self.channel()?
            .basic_publish(
                "",         // default exchange
                &msg.queue, // routing key = queue name
                BasicPublishOptions::default(),
                &msg.payload,
                props,
            )
            .await
            .map_err(|e| RpcError::Publish(format!("amqp: publish to {} failed: {e}", msg.queue)))?;

        log_debug!("[{}] Published to queue: {}", self.transport_id, msg.queue);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ---
        let handles: Vec<JoinHandle<()>> = lock_ignore_poison(&self.consumers).drain(..).collect();
        for handle in handles {
            handle.abort();
        }

        if let Some(channel) = self.channel.get() {
            let _ = channel.close(200, "Normal shutdown").await;
        }
        if let Some(connection) = self.connection.get() {
            let _ = connection.close(200, "Normal shutdown").await;
        }

        log_info!("[{}] AMQP transport closed", self.transport_id);
        Ok(())
    }
}

/// Creates a lapin-based AMQP transport from the given configuration.
///
/// No network activity happens here; the client's connection state machine
/// calls `connect()` when it starts.
///
/// # Errors
///
/// Returns [`RpcError::InvalidConfig`] when the broker URI cannot be built.
pub fn create_transport(config: &RpcConfig) -> Result<TransportPtr> {
    // ---
    let uri = config.amqp_uri()?;
    let endpoint = format!("{}:{}", config.params.host, config.params.port);

    Ok(Arc::new(AmqpTransport {
        transport_id: config.transport_id.clone(),
        uri,
        endpoint,
        connection: OnceCell::new(),
        channel: OnceCell::new(),
        consumers: Mutex::new(Vec::new()),
    }))
}
