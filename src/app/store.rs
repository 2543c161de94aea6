//! Persistence boundary for jobs and profits.
//!
//! [`ModelRegistry`] is built once at startup and handed to whatever store
//! the application opens; a store refuses to open without the tables it
//! needs. [`JobStore`] is blocking and is called through
//! [`run_blocking`](super::run_blocking) from async code.

use std::collections::BTreeMap;
use std::sync::Mutex;

use thiserror::Error;

use super::models::{Job, Profit};
use crate::util::lock_ignore_poison;

pub const JOBS_TABLE: &str = "jobs";
pub const PROFITS_TABLE: &str = "profits";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("table '{0}' is not registered")]
    MissingTable(String),

    #[error("duplicate key {id} in table '{table}'")]
    DuplicateKey { table: &'static str, id: i64 },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Column layout of one registered table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: &'static str,
    pub primary_key: &'static str,
    pub columns: &'static [&'static str],
}

/// The set of tables known to the application.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    tables: BTreeMap<&'static str, TableSchema>,
}

impl ModelRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `jobs` and `profits` tables.
    pub fn with_default_models() -> Self {
        // ---
        let mut registry = Self::new();
        registry.register(TableSchema {
            name: JOBS_TABLE,
            primary_key: "id",
            columns: &["id", "start_time", "completion_time", "nodes_used", "passmark"],
        });
        registry.register(TableSchema {
            name: PROFITS_TABLE,
            primary_key: "id",
            columns: &["id", "profit"],
        });
        registry
    }

    pub fn register(&mut self, schema: TableSchema) {
        self.tables.insert(schema.name, schema);
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    /// Registered table names, sorted.
    pub fn table_names(&self) -> Vec<&'static str> {
        self.tables.keys().copied().collect()
    }

    fn require(&self, name: &str) -> Result<(), StoreError> {
        match self.table(name) {
            Some(_) => Ok(()),
            None => Err(StoreError::MissingTable(name.to_string())),
        }
    }
}

/// Blocking access to jobs and profits.
pub trait JobStore: Send + Sync {
    /// Every job, ordered by id.
    fn all_jobs(&self) -> Result<Vec<Job>, StoreError>;

    /// Every profit row, ordered by id.
    fn all_profits(&self) -> Result<Vec<Profit>, StoreError>;

    /// Insert jobs; nothing is written if any id already exists.
    fn insert_jobs(&self, jobs: Vec<Job>) -> Result<usize, StoreError>;

    /// Insert profit rows; nothing is written if any id already exists.
    fn bulk_insert_profits(&self, profits: Vec<Profit>) -> Result<usize, StoreError>;
}

#[derive(Default)]
struct Tables {
    jobs: BTreeMap<i64, Job>,
    profits: BTreeMap<i64, Profit>,
    outage: Option<String>,
}

/// In-process [`JobStore`].
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    /// Open a store backed by the tables in `registry`.
    pub fn open(registry: &ModelRegistry) -> Result<Self, StoreError> {
        // ---
        registry.require(JOBS_TABLE)?;
        registry.require(PROFITS_TABLE)?;
        Ok(Self {
            tables: Mutex::new(Tables::default()),
        })
    }

    /// Make every following operation fail with [`StoreError::Unavailable`]
    /// (`None` restores service).
    pub fn set_outage(&self, reason: Option<String>) {
        lock_ignore_poison(&self.tables).outage = reason;
    }
}

fn check_outage(t: &Tables) -> Result<(), StoreError> {
    match &t.outage {
        Some(reason) => Err(StoreError::Unavailable(reason.clone())),
        None => Ok(()),
    }
}

fn insert_all<T: Clone>(
    table: &'static str,
    rows: &mut BTreeMap<i64, T>,
    new_rows: Vec<T>,
    key: impl Fn(&T) -> i64,
) -> Result<usize, StoreError> {
    // ---
    let mut seen = std::collections::HashSet::new();
    for row in &new_rows {
        let id = key(row);
        if rows.contains_key(&id) || !seen.insert(id) {
            return Err(StoreError::DuplicateKey { table, id });
        }
    }
    let n = new_rows.len();
    for row in new_rows {
        rows.insert(key(&row), row);
    }
    Ok(n)
}

impl JobStore for MemoryStore {
    fn all_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let t = lock_ignore_poison(&self.tables);
        check_outage(&t)?;
        Ok(t.jobs.values().cloned().collect())
    }

    fn all_profits(&self) -> Result<Vec<Profit>, StoreError> {
        let t = lock_ignore_poison(&self.tables);
        check_outage(&t)?;
        Ok(t.profits.values().cloned().collect())
    }

    fn insert_jobs(&self, jobs: Vec<Job>) -> Result<usize, StoreError> {
        let mut t = lock_ignore_poison(&self.tables);
        check_outage(&t)?;
        insert_all(JOBS_TABLE, &mut t.jobs, jobs, |j| j.id)
    }

    fn bulk_insert_profits(&self, profits: Vec<Profit>) -> Result<usize, StoreError> {
        let mut t = lock_ignore_poison(&self.tables);
        check_outage(&t)?;
        insert_all(PROFITS_TABLE, &mut t.profits, profits, |p| p.id)
    }
}
