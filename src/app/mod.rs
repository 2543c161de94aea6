//! The job/profit application built on top of the RPC client.
//!
//! Owns a [`JobStore`] and an [`RpcClient`](crate::RpcClient); the handlers
//! read jobs from the store, ask the `count_profits` worker to price them and
//! write the answer back.

mod application;
mod error;
mod executor;
mod handlers;
mod models;
mod store;

pub use application::Application;
pub use error::ApiError;
pub use executor::run_blocking;
pub use handlers::{JobsHandler, ProfitsHandler, COUNT_PROFITS};
pub use models::{Job, Profit};
pub use store::{JobStore, MemoryStore, ModelRegistry, StoreError, TableSchema, JOBS_TABLE, PROFITS_TABLE};
