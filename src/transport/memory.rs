//! In-memory transport implementation.
//!
//! A [`MemoryBroker`] simulates a single broker inside the process: named
//! queues with a backlog, no-ack consumers, and round-robin delivery when a
//! queue has more than one consumer. Every [`MemoryTransport`] created from
//! the same broker sees the same queues, exactly as two processes connected
//! to one RabbitMQ would.
//!
//! The broker also lets tests inject failures (connection refused, channel
//! refused, declare failure, publish failure), delay individual queue
//! declarations, and drop consumers to simulate a lost connection.
//!
//! ## Non-Goals
//!
//! Persistence, exchanges other than the default one, and acknowledgements.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::util::lock_ignore_poison;
use crate::{
    // ---
    log_debug,
    log_info,
    Message,
    Result,
    RpcError,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};

struct Consumer {
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct QueueState {
    consumers: Vec<Consumer>,
    backlog: VecDeque<Message>,
    next: usize,
}

impl QueueState {
    /// Hand `msg` to the next live consumer, or keep it in the backlog.
    fn deliver(&mut self, mut msg: Message) {
        // ---
        while !self.consumers.is_empty() {
            let idx = self.next % self.consumers.len();
            match self.consumers[idx].tx.send(msg) {
                Ok(()) => {
                    self.next = idx + 1;
                    return;
                }
                Err(mpsc::error::SendError(returned)) => {
                    // receiver dropped
                    self.consumers.remove(idx);
                    msg = returned;
                }
            }
        }
        self.backlog.push_back(msg);
    }
}

#[derive(Default)]
struct Faults {
    connect: Option<String>,
    channel: Option<String>,
    declare: Option<String>,
    consume: Option<String>,
    publish: Option<String>,
    declare_delay: HashMap<String, Duration>,
}

/// Shared in-process message broker.
///
/// Every published or injected message is also appended to a log read by
/// [`published`](Self::published). The log is never trimmed on its own; call
/// [`clear_published`](Self::clear_published) in long-running use.
pub struct MemoryBroker {
    // ---
    queues: Mutex<HashMap<String, QueueState>>,
    published: Mutex<Vec<Message>>,
    faults: Mutex<Faults>,
    next_consumer: AtomicU64,
}

impl MemoryBroker {
    /// Create a new, empty broker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a transport connected to this broker.
    pub fn transport(self: &Arc<Self>, transport_id: impl Into<String>) -> TransportPtr {
        // ---
        Arc::new(MemoryTransport {
            transport_id: transport_id.into(),
            broker: Arc::clone(self),
            connected: AtomicBool::new(false),
            channel_open: AtomicBool::new(false),
            consumer_ids: Mutex::new(Vec::new()),
        })
    }

    /// Make every following `connect()` fail with `reason`.
    pub fn fail_connect(&self, reason: impl Into<String>) {
        lock_ignore_poison(&self.faults).connect = Some(reason.into());
    }

    /// Make every following `open_channel()` fail with `reason`.
    pub fn fail_channel(&self, reason: impl Into<String>) {
        lock_ignore_poison(&self.faults).channel = Some(reason.into());
    }

    /// Make every following `declare_queue()` fail with `reason`.
    pub fn fail_declare(&self, reason: impl Into<String>) {
        lock_ignore_poison(&self.faults).declare = Some(reason.into());
    }

    /// Make every following `consume()` fail with `reason`.
    pub fn fail_consume(&self, reason: impl Into<String>) {
        lock_ignore_poison(&self.faults).consume = Some(reason.into());
    }

    /// Make publishes fail with `reason`, or succeed again with `None`.
    pub fn fail_publish(&self, reason: Option<String>) {
        lock_ignore_poison(&self.faults).publish = reason;
    }

    /// Delay the declare acknowledgement of one queue.
    pub fn delay_declare(&self, queue: impl Into<String>, delay: Duration) {
        lock_ignore_poison(&self.faults)
            .declare_delay
            .insert(queue.into(), delay);
    }

    /// Names of all declared queues, sorted.
    pub fn declared_queues(&self) -> Vec<String> {
        // ---
        let mut names: Vec<String> = lock_ignore_poison(&self.queues).keys().cloned().collect();
        names.sort();
        names
    }

    /// Every message ever published to `queue`, in publish order.
    pub fn published(&self, queue: &str) -> Vec<Message> {
        // ---
        lock_ignore_poison(&self.published)
            .iter()
            .filter(|m| m.queue.as_ref() == queue)
            .cloned()
            .collect()
    }

    /// Empty the publish log. Queues and backlogs are not touched.
    pub fn clear_published(&self) {
        lock_ignore_poison(&self.published).clear();
    }

    /// Number of messages waiting in `queue` with no consumer to take them.
    pub fn backlog_len(&self, queue: &str) -> usize {
        lock_ignore_poison(&self.queues)
            .get(queue)
            .map_or(0, |q| q.backlog.len())
    }

    /// Put a message on its queue as if a remote peer had published it.
    pub fn inject(&self, msg: Message) {
        // ---
        lock_ignore_poison(&self.published).push(msg.clone());
        let mut queues = lock_ignore_poison(&self.queues);
        queues.entry(msg.queue.to_string()).or_default().deliver(msg);
    }

    /// Cancel every consumer on `queue`; their inboxes close.
    pub fn drop_consumers(&self, queue: &str) {
        // ---
        if let Some(q) = lock_ignore_poison(&self.queues).get_mut(queue) {
            log_info!("memory broker: dropping {} consumer(s) on {queue}", q.consumers.len());
            q.consumers.clear();
        }
    }

    fn fault<T>(&self, pick: impl Fn(&Faults) -> Option<T>) -> Option<T> {
        pick(&lock_ignore_poison(&self.faults))
    }

    fn declare(&self, name: &str) {
        lock_ignore_poison(&self.queues).entry(name.to_string()).or_default();
    }

    fn add_consumer(&self, queue: &str) -> (u64, mpsc::UnboundedReceiver<Message>) {
        // ---
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_consumer.fetch_add(1, Ordering::Relaxed);

        let mut queues = lock_ignore_poison(&self.queues);
        let q = queues.entry(queue.to_string()).or_default();
        q.consumers.push(Consumer { id, tx });

        // Hand over anything that arrived before the consumer existed.
        let backlog: Vec<Message> = q.backlog.drain(..).collect();
        for msg in backlog {
            q.deliver(msg);
        }
        (id, rx)
    }

    fn remove_consumers(&self, ids: &[u64]) {
        // ---
        let mut queues = lock_ignore_poison(&self.queues);
        for q in queues.values_mut() {
            q.consumers.retain(|c| !ids.contains(&c.id));
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            published: Mutex::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
            next_consumer: AtomicU64::new(0),
        }
    }
}

/// One connection to a [`MemoryBroker`].
struct MemoryTransport {
    // ---
    transport_id: String,
    broker: Arc<MemoryBroker>,
    connected: AtomicBool,
    channel_open: AtomicBool,
    consumer_ids: Mutex<Vec<u64>>,
}

impl MemoryTransport {
    fn require_channel(&self) -> Result<()> {
        // ---
        if self.channel_open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(RpcError::Transport("memory: channel not open".into()))
        }
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    async fn connect(&self) -> Result<()> {
        // ---
        if let Some(reason) = self.broker.fault(|f| f.connect.clone()) {
            return Err(RpcError::Transport(format!("memory: connection failed: {reason}")));
        }
        self.connected.store(true, Ordering::Release);
        log_debug!("{}: memory connection open", self.transport_id);
        Ok(())
    }

    async fn open_channel(&self) -> Result<()> {
        // ---
        if !self.connected.load(Ordering::Acquire) {
            return Err(RpcError::Transport("memory: not connected".into()));
        }
        if let Some(reason) = self.broker.fault(|f| f.channel.clone()) {
            return Err(RpcError::Transport(format!("memory: channel failed: {reason}")));
        }
        self.channel_open.store(true, Ordering::Release);
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<String> {
        // ---
        self.require_channel()?;

        if let Some(delay) = self.broker.fault(|f| f.declare_delay.get(name).copied()) {
            tokio::time::sleep(delay).await;
        }

        if let Some(reason) = self.broker.fault(|f| f.declare.clone()) {
            return Err(RpcError::Transport(format!("memory: declare {name} failed: {reason}")));
        }
        self.broker.declare(name);
        log_debug!("{}: declared {name}", self.transport_id);
        Ok(name.to_string())
    }

    async fn consume(&self, queue: &str) -> Result<SubscriptionHandle> {
        // ---
        self.require_channel()?;
        if let Some(reason) = self.broker.fault(|f| f.consume.clone()) {
            return Err(RpcError::Transport(format!("memory: consume {queue} failed: {reason}")));
        }

        let (id, inbox) = self.broker.add_consumer(queue);
        lock_ignore_poison(&self.consumer_ids).push(id);
        log_debug!("{}: consuming {queue}", self.transport_id);
        Ok(SubscriptionHandle { inbox })
    }

    async fn publish(&self, msg: Message) -> Result<()> {
        // ---
        self.require_channel()?;
        if let Some(reason) = self.broker.fault(|f| f.publish.clone()) {
            return Err(RpcError::Publish(format!("memory: {reason}")));
        }
        log_debug!("{}: publish to {}", self.transport_id, msg.queue);
        self.broker.inject(msg);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ---
        let ids: Vec<u64> = lock_ignore_poison(&self.consumer_ids).drain(..).collect();
        self.broker.remove_consumers(&ids);
        self.channel_open.store(false, Ordering::Release);
        self.connected.store(false, Ordering::Release);
        log_debug!("{}: memory transport closed", self.transport_id);
        Ok(())
    }
}
