//! Remote worker: the peer that answers requests sent by [`RpcClient`](crate::RpcClient).
//!
//! The worker consumes the outbound (request) queue, dispatches each request
//! to the handler registered for its `method`, and publishes a response
//! envelope to the inbound (response) queue with the request's
//! `correlation_id` echoed back. Each handler runs in its own task, so
//! responses may leave in a different order than requests arrived.
//!
//! | outcome                 | status                        |
//! |-------------------------|-------------------------------|
//! | handler returned `Ok`   | `200 OK`, `data` = result     |
//! | handler returned `Err`  | `500 Internal Server Error`   |
//! | no handler for method   | `404 Not Found`               |
//! | body is not a request   | `400 Bad Request`             |
//!
//! Requests without a correlation id cannot be answered and are dropped.

mod handler;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::protocol::{build_response, decode_request, encode_response, Kwargs, RpcResponse};
use crate::util::lock_ignore_poison;
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    Message,
    Result,
    RpcConfig,
    TransportPtr,
};
use handler::{wrap_handler, BoxedHandler};

type HandlerRegistry = Arc<Mutex<HashMap<String, BoxedHandler>>>;

/// RPC worker serving named methods over the request queue.
///
/// # Example
///
/// ```no_run
/// use profits_rpc::{ConnectionParams, MemoryBroker, RpcConfig, RpcWorker};
/// use serde_json::Value;
/// use std::time::Duration;
///
/// # async fn example() -> profits_rpc::Result<()> {
/// let broker = MemoryBroker::new();
/// let config = RpcConfig::new(ConnectionParams::default(), Duration::from_secs(5));
///
/// let worker = RpcWorker::new(broker.transport("worker"), &config);
/// worker.register("echo", |args: Vec<Value>, _kwargs| async move { Ok(args) });
/// let _handle = worker.start().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcWorker {
    // ---
    transport: TransportPtr,
    request_queue: String,
    response_queue: String,
    handlers: HandlerRegistry,
}

impl RpcWorker {
    /// Create a worker using the queue names from `config`.
    ///
    /// The worker consumes `config.outbound_queue` and replies on
    /// `config.inbound_queue`, mirroring the client.
    pub fn new(transport: TransportPtr, config: &RpcConfig) -> Self {
        Self {
            transport,
            request_queue: config.outbound_queue.clone(),
            response_queue: config.inbound_queue.clone(),
            handlers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register an async handler for `method`, replacing any previous one.
    pub fn register<F, Fut, Resp>(&self, method: &str, handler: F)
    where
        F: Fn(Vec<Value>, Kwargs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
        Resp: Serialize + Send + 'static,
    {
        lock_ignore_poison(&self.handlers).insert(method.to_string(), wrap_handler(handler));
    }

    /// Connect, declare both queues and start serving.
    ///
    /// Returns once the request consumer is registered; the returned handle
    /// completes when the consumer stops.
    pub async fn start(&self) -> Result<JoinHandle<()>> {
        // ---
        let t = &self.transport;
        t.connect().await?;
        t.open_channel().await?;
        let request_queue = t.declare_queue(&self.request_queue).await?;
        let response_queue = t.declare_queue(&self.response_queue).await?;
        let mut sub = t.consume(&request_queue).await?;

        log_info!("[{}] Worker listening to \"{request_queue}\" queue", t.transport_id());

        let worker = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(msg) = sub.inbox.recv().await {
                worker.dispatch(&response_queue, msg);
            }
            log_debug!("[{}] Worker stopped", worker.transport.transport_id());
        }))
    }

    /// Close the transport; the serving task ends once its consumer closes.
    pub async fn shutdown(&self) -> Result<()> {
        self.transport.close().await
    }

    fn dispatch(&self, response_queue: &str, msg: Message) {
        // ---
        let tid = self.transport.transport_id().to_string();

        let Some(correlation_id) = msg.correlation_id.clone() else {
            log_warn!("[{tid}] Request without correlation_id, dropped");
            return;
        };

        let request = match decode_request(&msg.payload) {
            Ok(request) => request,
            Err(e) => {
                log_warn!("[{tid}] Undecodable request (ID: {correlation_id}): {e}");
                let response = build_response(400, "Bad Request", Value::String(e.to_string()));
                self.spawn_reply(response_queue, correlation_id, async move { response });
                return;
            }
        };

        let handler = lock_ignore_poison(&self.handlers).get(&request.method).cloned();
        let Some(handler) = handler else {
            log_warn!("[{tid}] No handler for method: {}", request.method);
            let response = build_response(404, "Not Found", Value::String(request.method));
            self.spawn_reply(response_queue, correlation_id, async move { response });
            return;
        };

        log_debug!("[{tid}] Dispatching \"{}\" (ID: {correlation_id})", request.method);
        let fut = handler(request.args, request.kwargs);
        self.spawn_reply(response_queue, correlation_id, async move {
            match fut.await {
                Ok(data) => build_response(200, "OK", data),
                Err(e) => build_response(500, "Internal Server Error", Value::String(e.to_string())),
            }
        });
    }

    fn spawn_reply<Fut>(&self, response_queue: &str, correlation_id: Arc<str>, response: Fut)
    where
        Fut: Future<Output = RpcResponse> + Send + 'static,
    {
        // ---
        let transport = Arc::clone(&self.transport);
        let queue = response_queue.to_string();

        tokio::spawn(async move {
            let response = response.await;
            let payload = match encode_response(&response) {
                Ok(payload) => payload,
                Err(e) => {
                    log_error!("Failed to encode response (ID: {correlation_id}): {e}");
                    return;
                }
            };
            if let Err(e) = transport.publish(Message::json(queue, payload, correlation_id)).await {
                log_error!("Failed to publish response: {e}");
            }
        });
    }
}
