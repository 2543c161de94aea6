//! RPC client facade and the driver task that owns the broker connection.
//!
//! ## Concurrency model
//!
//! - A single background **driver task** owns the connection state machine,
//!   the queue of calls waiting for the outbound queue, the call deadlines and
//!   the consumer inbox. Broker steps (connect, open channel, the two queue
//!   declarations, consume) run as short spawned tasks that report back to
//!   the driver, so the two declarations complete concurrently and in either
//!   order.
//! - [`RpcClient::call`] never blocks: it registers the result slot in the
//!   correlation table, hands the encoded request to the driver and returns.
//! - The correlation table is the only state shared between callers and the
//!   driver. It sits behind a mutex and every removal takes the resolver out
//!   before sending, so a slot is never resolved twice.
//!
//! ## Failure handling
//!
//! No call is ever left hanging: a connection failure (at any stage, or the
//! consumer stream ending later) fails every pending and future call with
//! [`RpcError::BrokerUnavailable`]; a publish failure fails that call with
//! [`RpcError::Publish`]; a call with no response by its deadline fails with
//! [`RpcError::Timeout`]. Nothing is retried.

mod pending;
mod slot;
mod state;

pub use slot::ResultSlot;
pub use state::{Action, ConnectionMachine, ConnectionState, Event};

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant};

use crate::protocol::{build_request, decode_response, encode_request, Kwargs};
use crate::util::lock_ignore_poison;
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    CorrelationId,
    Message,
    Result,
    RpcConfig,
    RpcError,
    SubscriptionHandle,
    TransportPtr,
};
use pending::CorrelationTable;

type Table = Arc<Mutex<CorrelationTable>>;

/// Anomalies observed by the response consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Responses whose correlation id matched no pending call.
    pub unmatched_responses: u64,
    /// Responses whose body was not a valid response envelope.
    pub decode_failures: u64,
    /// Responses that carried no correlation id at all.
    pub missing_correlation_id: u64,
    /// Calls that reached their deadline.
    pub timeouts: u64,
}

#[derive(Default)]
struct Counters {
    unmatched_responses: AtomicU64,
    decode_failures: AtomicU64,
    missing_correlation_id: AtomicU64,
    timeouts: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ClientStats {
        ClientStats {
            unmatched_responses: self.unmatched_responses.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            missing_correlation_id: self.missing_correlation_id.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

//
// Driver commands
//

enum Cmd {
    Publish {
        id: CorrelationId,
        payload: Bytes,
        /// `None` when the timeout is too large to represent.
        deadline: Option<Instant>,
    },
    Close {
        resp: oneshot::Sender<()>,
    },
}

/// Result of a spawned broker step.
enum Completion {
    Event(Event),
    Consumer(SubscriptionHandle),
}

struct Queued {
    id: CorrelationId,
    payload: Bytes,
}

/// Asynchronous RPC client over a request queue and a response queue.
///
/// Cheap to clone; clones share one connection and one correlation table.
/// The driver stops when the last clone is dropped or [`close`](Self::close)
/// is called.
///
/// # Example
///
/// ```no_run
/// use profits_rpc::{Kwargs, MemoryBroker, RpcClient, RpcConfig, ConnectionParams};
/// use serde_json::json;
/// use std::time::Duration;
///
/// # async fn example() -> profits_rpc::Result<()> {
/// let broker = MemoryBroker::new();
/// let config = RpcConfig::new(ConnectionParams::default(), Duration::from_secs(10));
/// let client = RpcClient::start(broker.transport("api"), config)?;
///
/// let response = client
///     .call("count_profits", vec![json!([])], Kwargs::new())
///     .await?;
/// println!("{} {}", response.status_code, response.status_text);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: RpcConfig,
    table: Table,
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    state_rx: watch::Receiver<ConnectionState>,
    counters: Arc<Counters>,
}

impl RpcClient {
    /// Start a client over `transport`.
    ///
    /// Spawns the driver, which begins connecting immediately. Must be called
    /// from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::InvalidConfig`] if `config` fails validation.
    pub fn start(transport: TransportPtr, config: RpcConfig) -> Result<Self> {
        // ---
        config.validate()?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let table: Table = Arc::new(Mutex::new(CorrelationTable::new()));
        let counters = Arc::new(Counters::default());

        let driver = Driver {
            transport_id: transport.transport_id().to_string(),
            transport,
            machine: ConnectionMachine::new(&config.outbound_queue, &config.inbound_queue),
            table: Arc::clone(&table),
            counters: Arc::clone(&counters),
            state_tx,
            done_tx,
            queued: VecDeque::new(),
            deadlines: BinaryHeap::new(),
            inbox: None,
        };
        tokio::spawn(driver.run(cmd_rx, done_rx));

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                table,
                cmd_tx,
                state_rx,
                counters,
            }),
        })
    }

    /// Start a client connected to RabbitMQ with the lapin transport.
    #[cfg(feature = "transport_lapin")]
    pub fn connect(config: RpcConfig) -> Result<Self> {
        let transport = crate::create_lapin_transport(&config)?;
        Self::start(transport, config)
    }

    /// Call a remote method with the configured request timeout.
    ///
    /// Returns immediately; await the slot for the response envelope.
    pub fn call(&self, method: &str, args: Vec<Value>, kwargs: Kwargs) -> ResultSlot {
        self.call_with_timeout(method, args, kwargs, self.inner.config.request_timeout)
    }

    /// Call a remote method with an explicit deadline for this call only.
    pub fn call_with_timeout(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        timeout: Duration,
    ) -> ResultSlot {
        // ---
        let id = CorrelationId::generate();
        let (tx, rx) = oneshot::channel();
        let slot = ResultSlot::new(id.clone(), rx);

        if let Some(err) = self.terminal_error() {
            let _ = tx.send(Err(err));
            return slot;
        }

        let payload = match encode_request(&build_request(method, args, kwargs)) {
            Ok(payload) => payload,
            Err(e) => {
                let _ = tx.send(Err(e));
                return slot;
            }
        };

        if let Err(tx) = lock_ignore_poison(&self.inner.table).insert(id.clone(), tx) {
            let _ = tx.send(Err(RpcError::Publish(format!("duplicate correlation id {id}"))));
            return slot;
        }

        log_info!("Sending a request \"{method}\" (ID: {id})");

        let cmd = Cmd::Publish {
            id: id.clone(),
            payload,
            deadline: Instant::now().checked_add(timeout),
        };
        if self.inner.cmd_tx.send(cmd).is_err() {
            lock_ignore_poison(&self.inner.table).fail(&id, RpcError::Closed);
        }

        slot
    }

    /// Call a remote method and deserialize `data` from a 2xx response.
    pub async fn call_for<T: DeserializeOwned>(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<T> {
        self.call(method, args, kwargs).await?.into_data()
    }

    /// Wait until the response consumer is registered.
    ///
    /// # Errors
    ///
    /// [`RpcError::BrokerUnavailable`] if the connection fails first,
    /// [`RpcError::Closed`] if the client is closed first.
    pub async fn wait_ready(&self) -> Result<()> {
        // ---
        let mut rx = self.inner.state_rx.clone();
        loop {
            match &*rx.borrow_and_update() {
                ConnectionState::Subscribed => return Ok(()),
                ConnectionState::Failed(reason) => {
                    return Err(RpcError::BrokerUnavailable(reason.clone()))
                }
                ConnectionState::Closed => return Err(RpcError::Closed),
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(RpcError::Closed);
            }
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state_rx.borrow().clone()
    }

    /// Number of calls issued and not yet resolved.
    pub fn pending_count(&self) -> usize {
        lock_ignore_poison(&self.inner.table).len()
    }

    /// Anomaly counters of the response consumer.
    pub fn stats(&self) -> ClientStats {
        self.inner.counters.snapshot()
    }

    /// Configuration the client was started with.
    pub fn config(&self) -> &RpcConfig {
        &self.inner.config
    }

    /// Fail outstanding calls with [`RpcError::Closed`], stop the driver and
    /// close the transport.
    pub async fn close(&self) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();
        if self.inner.cmd_tx.send(Cmd::Close { resp: tx }).is_err() {
            // driver already gone
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    fn terminal_error(&self) -> Option<RpcError> {
        match &*self.inner.state_rx.borrow() {
            ConnectionState::Failed(reason) => Some(RpcError::BrokerUnavailable(reason.clone())),
            ConnectionState::Closed => Some(RpcError::Closed),
            _ => None,
        }
    }
}

/// Background task that executes state machine actions against the transport.
struct Driver {
    // ---
    transport_id: String,
    transport: TransportPtr,
    machine: ConnectionMachine,
    table: Table,
    counters: Arc<Counters>,
    state_tx: watch::Sender<ConnectionState>,
    done_tx: mpsc::UnboundedSender<Completion>,
    queued: VecDeque<Queued>,
    deadlines: Deadlines,
    inbox: Option<mpsc::UnboundedReceiver<Message>>,
}

/// Heap size below which resolved deadlines are left to expire on their own.
const PRUNE_THRESHOLD: usize = 64;

type Deadlines = BinaryHeap<Reverse<(Instant, CorrelationId)>>;

/// Drop deadlines of calls that are no longer pending.
fn prune_resolved(deadlines: &mut Deadlines, table: &CorrelationTable) {
    deadlines.retain(|Reverse((_, id))| table.contains(id));
}

async fn next_message(inbox: &mut Option<mpsc::UnboundedReceiver<Message>>) -> Option<Message> {
    match inbox {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Driver {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
        mut done_rx: mpsc::UnboundedReceiver<Completion>,
    ) {
        // ---
        log_debug!("[{}] RPC driver started", self.transport_id);
        self.on_event(Event::Start).await;

        loop {
            let next_deadline = self.deadlines.peek().map(|Reverse((at, _))| *at);

            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Cmd::Publish { id, payload, deadline }) => {
                        self.on_publish(id, payload, deadline).await;
                    }
                    Some(Cmd::Close { resp }) => {
                        self.on_event(Event::Close).await;
                        let _ = resp.send(());
                        break;
                    }
                    None => {
                        // every client handle dropped
                        self.on_event(Event::Close).await;
                        break;
                    }
                },
                Some(done) = done_rx.recv() => self.on_completion(done).await,
                msg = next_message(&mut self.inbox) => match msg {
                    Some(msg) => self.on_message(msg),
                    None => {
                        self.inbox = None;
                        self.on_event(Event::ConsumerFailed("response consumer stopped".into())).await;
                    }
                },
                _ = sleep_until_opt(next_deadline) => self.expire_due(),
            }
        }

        // calls that raced with shutdown
        cmd_rx.close();
        while let Ok(cmd) = cmd_rx.try_recv() {
            match cmd {
                Cmd::Publish { id, .. } => {
                    lock_ignore_poison(&self.table).fail(&id, RpcError::Closed);
                }
                Cmd::Close { resp } => {
                    let _ = resp.send(());
                }
            }
        }

        log_debug!("[{}] RPC driver stopped", self.transport_id);
    }

    async fn on_event(&mut self, event: Event) {
        // ---
        let actions = match self.machine.apply(event) {
            Ok(actions) => actions,
            Err(e) => {
                log_debug!("[{}] ignored: {e}", self.transport_id);
                return;
            }
        };
        self.state_tx.send_replace(self.machine.state().clone());

        for action in actions {
            self.execute(action).await;
        }
    }

    async fn on_completion(&mut self, done: Completion) {
        // ---
        match done {
            Completion::Event(event) => self.on_event(event).await,
            Completion::Consumer(handle) => {
                if *self.machine.state() == ConnectionState::ChannelOpen {
                    self.inbox = Some(handle.inbox);
                }
                self.on_event(Event::ConsumerStarted).await;
                if *self.machine.state() == ConnectionState::Subscribed {
                    if let Some(queue) = self.machine.inbound_queue() {
                        log_info!("[{}] Listening to \"{queue}\" queue", self.transport_id);
                    }
                }
            }
        }
    }

    fn spawn_step<F, Fut>(&self, step: F)
    where
        F: FnOnce(TransportPtr) -> Fut,
        Fut: Future<Output = Completion> + Send + 'static,
    {
        // ---
        let fut = step(Arc::clone(&self.transport));
        let done = self.done_tx.clone();
        tokio::spawn(async move {
            let _ = done.send(fut.await);
        });
    }

    async fn execute(&mut self, action: Action) {
        // ---
        let tid = self.transport_id.clone();

        match action {
            Action::OpenConnection => {
                log_info!("[{tid}] Connecting to broker");
                self.spawn_step(|t| async move {
                    Completion::Event(match t.connect().await {
                        Ok(()) => Event::ConnectionOpened,
                        Err(e) => Event::ConnectionFailed(e.to_string()),
                    })
                });
            }
            Action::OpenChannel => {
                log_info!("[{tid}] Connection opened, opening a new channel");
                self.spawn_step(|t| async move {
                    Completion::Event(match t.open_channel().await {
                        Ok(()) => Event::ChannelOpened,
                        Err(e) => Event::ChannelFailed(e.to_string()),
                    })
                });
            }
            Action::DeclareOutbound(name) => {
                log_info!("[{tid}] Channel opened, declaring \"{name}\" queue");
                self.spawn_step(move |t| async move {
                    Completion::Event(match t.declare_queue(&name).await {
                        Ok(ack) => Event::OutboundDeclared(ack),
                        Err(e) => Event::DeclareFailed(e.to_string()),
                    })
                });
            }
            Action::DeclareInbound(name) => {
                log_info!("[{tid}] Declaring \"{name}\" queue");
                self.spawn_step(move |t| async move {
                    Completion::Event(match t.declare_queue(&name).await {
                        Ok(ack) => Event::InboundDeclared(ack),
                        Err(e) => Event::DeclareFailed(e.to_string()),
                    })
                });
            }
            Action::StartConsumer(queue) => {
                log_info!("[{tid}] Successfully declared \"{queue}\" queue, subscribing");
                self.spawn_step(move |t| async move {
                    match t.consume(&queue).await {
                        Ok(handle) => Completion::Consumer(handle),
                        Err(e) => Completion::Event(Event::ConsumerFailed(e.to_string())),
                    }
                });
            }
            Action::FlushPublishes(queue) => {
                log_info!(
                    "[{tid}] Successfully declared \"{queue}\" queue, {} request(s) waiting",
                    self.queued.len()
                );
                while let Some(q) = self.queued.pop_front() {
                    self.publish_now(&queue, q.id, q.payload).await;
                }
            }
            Action::FailAll(reason) => {
                let n = lock_ignore_poison(&self.table).fail_all(&RpcError::BrokerUnavailable(reason.clone()));
                self.clear_local();
                log_error!("[{tid}] Broker connection failed: {reason} ({n} pending call(s) failed)");
            }
            Action::Shutdown => {
                let n = lock_ignore_poison(&self.table).fail_all(&RpcError::Closed);
                self.clear_local();
                if let Err(e) = self.transport.close().await {
                    log_warn!("[{tid}] Transport close failed: {e}");
                }
                log_info!("[{tid}] Client closed ({n} pending call(s) failed)");
            }
        }
    }

    fn clear_local(&mut self) {
        self.queued.clear();
        self.deadlines.clear();
        self.inbox = None;
    }

    async fn on_publish(&mut self, id: CorrelationId, payload: Bytes, deadline: Option<Instant>) {
        // ---
        let terminal = match self.machine.state() {
            ConnectionState::Failed(reason) => Some(RpcError::BrokerUnavailable(reason.clone())),
            ConnectionState::Closed => Some(RpcError::Closed),
            _ => None,
        };
        if let Some(err) = terminal {
            lock_ignore_poison(&self.table).fail(&id, err);
            return;
        }

        if let Some(deadline) = deadline {
            if self.deadlines.len() >= PRUNE_THRESHOLD {
                let table = lock_ignore_poison(&self.table);
                if self.deadlines.len() > table.len() * 2 {
                    prune_resolved(&mut self.deadlines, &table);
                }
            }
            self.deadlines.push(Reverse((deadline, id.clone())));
        }

        match self.machine.outbound_queue().map(str::to_string) {
            Some(queue) => self.publish_now(&queue, id, payload).await,
            None => {
                log_debug!("[{}] outbound queue not declared yet, holding {id}", self.transport_id);
                self.queued.push_back(Queued { id, payload });
            }
        }
    }

    async fn publish_now(&mut self, queue: &str, id: CorrelationId, payload: Bytes) {
        // ---
        if !lock_ignore_poison(&self.table).contains(&id) {
            // expired while held back
            return;
        }

        let msg = Message::json(queue, payload, id.as_str());
        if let Err(e) = self.transport.publish(msg).await {
            log_error!("[{}] Failed to publish request {id}: {e}", self.transport_id);
            let err = match e {
                RpcError::Publish(reason) => RpcError::Publish(reason),
                other => RpcError::Publish(other.to_string()),
            };
            lock_ignore_poison(&self.table).fail(&id, err);
        }
    }

    fn on_message(&mut self, msg: Message) {
        // ---
        let Some(raw_id) = msg.correlation_id.as_deref() else {
            Counters::bump(&self.counters.missing_correlation_id);
            log_warn!("[{}] Response on {} without correlation_id, discarded", self.transport_id, msg.queue);
            return;
        };
        let id = CorrelationId::from(raw_id);

        let response = match decode_response(&msg.payload) {
            Ok(response) => response,
            Err(e) => {
                Counters::bump(&self.counters.decode_failures);
                log_warn!("[{}] Undecodable response (ID: {id}): {e}", self.transport_id);
                return;
            }
        };

        log_info!("[{}] Received a response (ID: {id})", self.transport_id);

        if !lock_ignore_poison(&self.table).resolve(&id, response) {
            Counters::bump(&self.counters.unmatched_responses);
            log_warn!("[{}] No pending request for response (ID: {id}), discarded", self.transport_id);
        }
    }

    fn expire_due(&mut self) {
        // ---
        let now = Instant::now();
        while let Some(Reverse((at, _))) = self.deadlines.peek() {
            if *at > now {
                break;
            }
            let Some(Reverse((_, id))) = self.deadlines.pop() else {
                break;
            };
            if lock_ignore_poison(&self.table).fail(&id, RpcError::Timeout) {
                Counters::bump(&self.counters.timeouts);
                log_warn!("[{}] Request {id} timed out", self.transport_id);
            }
        }
    }
}
