//! Backing store abstraction.
//!
//! A [`Store`] hands out pooled [`Connection`]s; statement text comes from a
//! [`Dialect`](dialect::Dialect) chosen alongside the store. Borrowed
//! connections return to their pool when dropped.

pub mod clickhouse;
pub mod dialect;
pub mod memory;
pub mod probe;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::dispatch::dimension::DimensionResolver;
use crate::value::{Value, ValueKind};

pub use self::dialect::{Dialect, DimensionTable, HistoryRange, InsertRow};
pub use self::probe::{Probe, TcpProbe};

/// Errors surfaced by store drivers, classified for retry decisions.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Idempotent create of an object that already exists.
    #[error("object already exists: {0}")]
    AlreadyExists(String),

    /// Connect, borrow, or ping failure. Retried on the next tick.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("statement failed: {0}")]
    Query(String),

    #[error("decoding result: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

/// A dimension row as read back from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRow {
    pub key: i32,
    /// Value partition recorded for a metric. Sources have none.
    pub kind: Option<ValueKind>,
}

/// One raw row of a history select.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub key: i32,
    pub ts: i64,
    pub val: Value,
    pub ack: bool,
    pub q: i32,
}

/// A borrowed store connection. Dropping it returns it to the pool.
pub trait Connection: Send {
    /// Executes a statement that returns no rows.
    fn execute(&mut self, stmt: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Runs a dimension select and returns the first row, if any.
    fn fetch_key(
        &mut self,
        stmt: &str,
        table: DimensionTable,
    ) -> impl Future<Output = Result<Option<KeyRow>, StoreError>> + Send;

    /// Runs a history select against one value partition.
    fn fetch_history(
        &mut self,
        stmt: &str,
        kind: ValueKind,
    ) -> impl Future<Output = Result<Vec<StoredRow>, StoreError>> + Send;
}

/// A pooled backing store.
pub trait Store: Send + Sync + 'static {
    type Conn: Connection;

    /// Borrows a connection from the pool. May wait while the pool is
    /// exhausted; callers bound it with [`borrow_within`].
    fn borrow(&self) -> impl Future<Output = Result<Self::Conn, StoreError>> + Send;

    /// Closes the pool. Outstanding connections are dropped when returned.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Borrows a connection, failing with [`StoreError::Unavailable`] when the
/// pool does not deliver one within `timeout`.
pub async fn borrow_within<S: Store>(store: &S, timeout: Duration) -> Result<S::Conn, StoreError> {
    match tokio::time::timeout(timeout, store.borrow()).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Unavailable(format!(
            "no connection within {}ms",
            timeout.as_millis()
        ))),
    }
}

/// Shared view of whether the store is currently reachable.
///
/// Written by the dispatcher after each probe and borrow; read by the query
/// engine to pick between store and cache.
#[derive(Debug)]
pub struct StoreStatus {
    available: AtomicBool,
}

impl StoreStatus {
    pub fn new(available: bool) -> Self {
        Self {
            available: AtomicBool::new(available),
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Records the latest reachability result. Returns the previous value.
    pub fn set(&self, available: bool) -> bool {
        self.available.swap(available, Ordering::AcqRel)
    }
}

impl Default for StoreStatus {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Everything a component needs to talk to the store.
pub struct StoreContext<S> {
    pub store: Arc<S>,
    pub dialect: Arc<dyn Dialect>,
    pub resolver: Arc<DimensionResolver>,
    pub status: Arc<StoreStatus>,
    pub borrow_timeout: Duration,
}

impl<S> Clone for StoreContext<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            dialect: Arc::clone(&self.dialect),
            resolver: Arc::clone(&self.resolver),
            status: Arc::clone(&self.status),
            borrow_timeout: self.borrow_timeout,
        }
    }
}

impl<S: Store> StoreContext<S> {
    /// Borrows a connection within the configured timeout, recording the
    /// store as unavailable on failure.
    pub async fn borrow(&self) -> Result<S::Conn, StoreError> {
        match borrow_within(self.store.as_ref(), self.borrow_timeout).await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                if self.status.set(false) {
                    tracing::warn!(error = %e, "store became unavailable");
                }
                Err(e)
            }
        }
    }
}
