//! Asynchronous RPC over AMQP queues with automatic request/response correlation
//!
//! A client publishes `{"method", "args", "kwargs"}` requests to one queue and
//! consumes `{"status_code", "status_text", "data"}` responses from another.
//! Each call is tagged with a fresh correlation ID and handed back as a
//! [`ResultSlot`] that resolves exactly once: with the matching response, a
//! timeout, or the broker failure that made an answer impossible.
//!
//! The [`app`] module holds the job/profit application that drives the
//! `count_profits` worker through this client.
//!

mod macros;
mod util;

// Import all sub modules once...
mod client;
mod domain;
mod server;
mod transport;

mod rpc_config;

mod correlation;
mod error;

pub mod app;
pub mod protocol;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use client::{
    //
    Action,
    ClientStats,
    ConnectionMachine,
    ConnectionState,
    Event,
    ResultSlot,
    RpcClient,
};
pub use server::RpcWorker;

pub use rpc_config::{ConnectionParams, RpcConfig, DEFAULT_INBOUND_QUEUE, DEFAULT_OUTBOUND_QUEUE};

pub use correlation::CorrelationId;
pub use error::{Result, RpcError};

pub use protocol::{Kwargs, RpcRequest, RpcResponse};

pub use transport::MemoryBroker;

#[cfg(feature = "transport_lapin")]
pub use transport::create_lapin_transport;

// --- public re-exports
pub use domain::{
    //
    Message,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};
