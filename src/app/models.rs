//! Rows exchanged between the store, the HTTP-facing handlers and the
//! `count_profits` worker.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// A finished render job.
///
/// Times serialize as ISO-8601 without an offset (`2024-03-01T12:00:00`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub start_time: NaiveDateTime,
    pub completion_time: NaiveDateTime,
    pub nodes_used: i32,
    pub passmark: i32,
}

/// Profit computed for the job with the same `id`.
///
/// The worker may price fractionally, so the amount is kept as sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profit {
    pub id: i64,
    pub profit: f64,
}
