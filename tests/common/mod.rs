#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use profits_rpc::{ConnectionParams, MemoryBroker, Message, RpcClient, RpcConfig};

pub fn config(timeout: Duration) -> RpcConfig {
    RpcConfig::new(ConnectionParams::default(), timeout).with_transport_id("test")
}

pub async fn ready_client(broker: &Arc<MemoryBroker>, timeout: Duration) -> RpcClient {
    // ---
    let client = RpcClient::start(broker.transport("api"), config(timeout)).unwrap();
    client.wait_ready().await.unwrap();
    client
}

/// Poll `cond` until it holds, yielding to the driver in between.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    // ---
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

/// Wait for `n` messages on `queue` and return them.
pub async fn published(broker: &Arc<MemoryBroker>, queue: &str, n: usize) -> Vec<Message> {
    eventually(|| broker.published(queue).len() >= n).await;
    broker.published(queue)
}

pub fn reply(broker: &Arc<MemoryBroker>, correlation_id: &str, body: &'static str) {
    broker.inject(Message::json(
        "server_queue",
        bytes::Bytes::from_static(body.as_bytes()),
        correlation_id,
    ));
}

#[cfg(feature = "logging")]
mod imp {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = env_logger::builder().is_test(true).try_init();
        });
    }
}

#[cfg(not(feature = "logging"))]
mod imp {
    #[inline]
    pub fn init() {}
}

pub fn init_logging() {
    imp::init();
}
