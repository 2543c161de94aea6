//! Request handlers for the `jobs` and `profits` resources.
//!
//! Handlers are plain async methods returning the JSON response body.
//! Object keys in every body are sorted.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use super::models::Profit;
use super::store::JobStore;
use super::{run_blocking, ApiError};
use crate::protocol::Kwargs;
use crate::{log_info, log_warn, RpcClient};

/// Remote method that turns jobs into profit rows.
pub const COUNT_PROFITS: &str = "count_profits";

fn sorted_json<T: Serialize>(rows: &T) -> Result<String, ApiError> {
    // Value maps are ordered by key
    let value: Value = serde_json::to_value(rows)?;
    Ok(value.to_string())
}

/// Handles `/jobs`.
#[derive(Clone)]
pub struct JobsHandler {
    store: Arc<dyn JobStore>,
}

impl JobsHandler {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// `GET /jobs`: every job.
    pub async fn get(&self) -> Result<String, ApiError> {
        // ---
        log_info!("*** GET /jobs");
        let store = Arc::clone(&self.store);
        let jobs = run_blocking(move || store.all_jobs()).await??;
        sorted_json(&jobs)
    }
}

/// Handles `/profits`.
#[derive(Clone)]
pub struct ProfitsHandler {
    store: Arc<dyn JobStore>,
    client: RpcClient,
}

impl ProfitsHandler {
    pub fn new(store: Arc<dyn JobStore>, client: RpcClient) -> Self {
        Self { store, client }
    }

    /// `GET /profits`: every stored profit row.
    pub async fn get(&self) -> Result<String, ApiError> {
        // ---
        log_info!("*** GET /profits");
        let store = Arc::clone(&self.store);
        let profits = run_blocking(move || store.all_profits()).await??;
        sorted_json(&profits)
    }

    /// `POST /profits`: send every job to `count_profits` and store the
    /// returned rows. Returns the inserted rows.
    ///
    /// # Errors
    ///
    /// Broker failures and timeouts map to 503/504, a non-2xx reply or rows
    /// that do not decode to 502, and a rejected insert to 500. Nothing is stored unless every row
    /// can be.
    pub async fn post(&self) -> Result<String, ApiError> {
        // ---
        log_info!("*** POST /profits");

        let store = Arc::clone(&self.store);
        let jobs = run_blocking(move || store.all_jobs()).await??;
        let args = vec![serde_json::to_value(&jobs)?];

        let response = self.client.call(COUNT_PROFITS, args, Kwargs::new()).await?;
        if !response.is_success() {
            log_warn!(
                "{COUNT_PROFITS} replied {} {}",
                response.status_code,
                response.status_text
            );
            return Err(ApiError::Upstream {
                status_code: response.status_code,
                status_text: response.status_text,
            });
        }

        let profits: Vec<Profit> = serde_json::from_value(response.data).map_err(|e| {
            log_warn!("{COUNT_PROFITS} returned undecodable rows: {e}");
            ApiError::UpstreamData(e.to_string())
        })?;
        let body = sorted_json(&profits)?;

        let store = Arc::clone(&self.store);
        let n = run_blocking(move || store.bulk_insert_profits(profits)).await??;
        log_info!("Stored {n} profit row(s) for {} job(s)", jobs.len());

        Ok(body)
    }
}
