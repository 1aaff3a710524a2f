//! In-process store backend.
//!
//! Statements are JSON documents produced by [`MemoryDialect`] and
//! interpreted by [`MemoryStore`]. Data lives for the lifetime of the
//! process. Besides running the agent without a database, the backend
//! exposes switches to simulate outages and failing inserts.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::value::{Value, ValueKind};

use super::probe::Probe;
use super::{
    Connection, Dialect, DimensionTable, HistoryRange, InsertRow, KeyRow, Store, StoreError,
    StoredRow,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Statement {
    Ping,
    Insert {
        kind: u8,
        key: i32,
        source: i32,
        ts: i64,
        val: Value,
        ack: bool,
        q: i32,
    },
    SelectKey {
        table: Table,
        name: String,
    },
    InsertKey {
        table: Table,
        name: String,
        kind: Option<u8>,
    },
    SelectHistory {
        kind: u8,
        key: Option<i32>,
        start: Option<i64>,
        end: i64,
        limit: usize,
    },
    CreateSchema,
    DropSchema,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Table {
    Metric,
    Source,
}

impl From<DimensionTable> for Table {
    fn from(t: DimensionTable) -> Self {
        match t {
            DimensionTable::Metric => Self::Metric,
            DimensionTable::Source => Self::Source,
        }
    }
}

fn encode(stmt: &Statement) -> String {
    // Serializing a plain enum of owned scalars cannot fail.
    serde_json::to_string(stmt).unwrap_or_default()
}

/// Statement generator for [`MemoryStore`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryDialect;

impl Dialect for MemoryDialect {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn ping(&self) -> String {
        encode(&Statement::Ping)
    }

    fn insert(&self, row: &InsertRow<'_>) -> String {
        encode(&Statement::Insert {
            kind: row.val.kind().code(),
            key: row.metric_key,
            source: row.source_key,
            ts: row.ts,
            val: row.val.clone(),
            ack: row.ack,
            q: row.q,
        })
    }

    fn select_dimension_key(&self, table: DimensionTable, name: &str) -> String {
        encode(&Statement::SelectKey {
            table: table.into(),
            name: name.to_string(),
        })
    }

    fn insert_dimension_key(
        &self,
        table: DimensionTable,
        name: &str,
        kind: Option<ValueKind>,
    ) -> String {
        encode(&Statement::InsertKey {
            table: table.into(),
            name: name.to_string(),
            kind: kind.map(ValueKind::code),
        })
    }

    fn select_history(&self, kind: ValueKind, key: Option<i32>, range: &HistoryRange) -> String {
        encode(&Statement::SelectHistory {
            kind: kind.code(),
            key,
            start: range.start,
            end: range.end,
            limit: range.limit,
        })
    }

    fn bootstrap_schema(&self) -> Vec<String> {
        vec![encode(&Statement::CreateSchema)]
    }

    fn drop_schema(&self) -> Vec<String> {
        vec![encode(&Statement::DropSchema)]
    }
}

/// A row recorded by an insert, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertedRow {
    pub kind: ValueKind,
    pub key: i32,
    pub source: i32,
    pub ts: i64,
    pub val: Value,
    pub ack: bool,
    pub q: i32,
}

#[derive(Default)]
struct Tables {
    schema: bool,
    metrics: Vec<(String, i32, Option<ValueKind>)>,
    sources: Vec<(String, i32)>,
    rows: Vec<InsertedRow>,
}

#[derive(Default)]
struct Shared {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
    blocking: AtomicBool,
    failing_inserts: AtomicUsize,
    failing_selects: AtomicUsize,
    insert_delay_ms: AtomicU64,
    key_creates: AtomicUsize,
}

/// In-memory store. Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes borrows and pings fail (false) or succeed (true).
    pub fn set_available(&self, available: bool) {
        self.shared.unavailable.store(!available, Ordering::Release);
    }

    /// Makes borrows wait forever, as an exhausted pool would.
    pub fn set_blocking(&self, blocking: bool) {
        self.shared.blocking.store(blocking, Ordering::Release);
    }

    /// Fails the next `n` inserts with a query error.
    pub fn fail_next_inserts(&self, n: usize) {
        self.shared.failing_inserts.store(n, Ordering::Release);
    }

    /// Fails the next `n` history selects with a query error.
    pub fn fail_next_selects(&self, n: usize) {
        self.shared.failing_selects.store(n, Ordering::Release);
    }

    /// Makes every insert take `delay` before it lands, as a slow server
    /// would.
    pub fn set_insert_delay(&self, delay: Duration) {
        self.shared
            .insert_delay_ms
            .store(delay.as_millis() as u64, Ordering::Release);
    }

    /// Every inserted row, in insert order.
    pub fn rows(&self) -> Vec<InsertedRow> {
        self.shared.tables.lock().rows.clone()
    }

    /// Number of dimension keys created through insert statements.
    pub fn key_creates(&self) -> usize {
        self.shared.key_creates.load(Ordering::Acquire)
    }

    /// Looks up a metric's key without going through a connection.
    pub fn metric_key(&self, name: &str) -> Option<i32> {
        self.shared
            .tables
            .lock()
            .metrics
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, key, _)| *key)
    }

    fn is_available(&self) -> bool {
        !self.shared.unavailable.load(Ordering::Acquire)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

impl Store for MemoryStore {
    type Conn = MemoryConn;

    async fn borrow(&self) -> Result<MemoryConn, StoreError> {
        if self.shared.blocking.load(Ordering::Acquire) {
            std::future::pending::<()>().await;
        }
        if !self.is_available() {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(MemoryConn {
            shared: Arc::clone(&self.shared),
        })
    }

    async fn close(&self) {}
}

impl Probe for MemoryStore {
    async fn ping(&self) -> bool {
        self.is_available()
    }
}

/// Connection to a [`MemoryStore`].
pub struct MemoryConn {
    shared: Arc<Shared>,
}

impl MemoryConn {
    fn parse(stmt: &str) -> Result<Statement, StoreError> {
        serde_json::from_str(stmt).map_err(|e| StoreError::Query(format!("bad statement: {e}")))
    }

    fn check_schema(tables: &Tables) -> Result<(), StoreError> {
        if tables.schema {
            Ok(())
        } else {
            Err(StoreError::Query("schema not created".to_string()))
        }
    }

    fn run(&self, stmt: Statement) -> Result<Option<Vec<StoredRow>>, StoreError> {
        let mut tables = self.shared.tables.lock();
        match stmt {
            Statement::Ping => Ok(None),
            Statement::CreateSchema => {
                if tables.schema {
                    return Err(StoreError::AlreadyExists("schema".to_string()));
                }
                tables.schema = true;
                Ok(None)
            }
            Statement::DropSchema => {
                *tables = Tables::default();
                Ok(None)
            }
            Statement::Insert {
                kind,
                key,
                source,
                ts,
                val,
                ack,
                q,
            } => {
                Self::check_schema(&tables)?;
                if take_one(&self.shared.failing_inserts) {
                    return Err(StoreError::Query("injected insert failure".to_string()));
                }
                let kind = ValueKind::from_code(kind)
                    .ok_or_else(|| StoreError::Query(format!("unknown partition {kind}")))?;
                tables.rows.push(InsertedRow {
                    kind,
                    key,
                    source,
                    ts,
                    val,
                    ack,
                    q,
                });
                Ok(None)
            }
            Statement::InsertKey { table, name, kind } => {
                Self::check_schema(&tables)?;
                self.shared.key_creates.fetch_add(1, Ordering::AcqRel);
                match table {
                    Table::Metric => {
                        let next = tables.metrics.iter().map(|m| m.1).max().unwrap_or(0) + 1;
                        let kind = kind.and_then(ValueKind::from_code);
                        tables.metrics.push((name, next, kind));
                    }
                    Table::Source => {
                        let next = tables.sources.iter().map(|s| s.1).max().unwrap_or(0) + 1;
                        tables.sources.push((name, next));
                    }
                }
                Ok(None)
            }
            Statement::SelectHistory {
                kind,
                key,
                start,
                end,
                limit,
            } => {
                Self::check_schema(&tables)?;
                if take_one(&self.shared.failing_selects) {
                    return Err(StoreError::Query("injected select failure".to_string()));
                }
                let mut rows: Vec<StoredRow> = tables
                    .rows
                    .iter()
                    .filter(|r| r.kind.code() == kind)
                    .filter(|r| key.map_or(true, |k| r.key == k))
                    .filter(|r| r.ts <= end && start.map_or(true, |s| r.ts >= s))
                    .map(|r| StoredRow {
                        key: r.key,
                        ts: r.ts,
                        val: r.val.clone(),
                        ack: r.ack,
                        q: r.q,
                    })
                    .collect();
                rows.sort_by(|a, b| b.ts.cmp(&a.ts));
                rows.truncate(limit);
                Ok(Some(rows))
            }
            Statement::SelectKey { .. } => Err(StoreError::Query(
                "key selects go through fetch_key".to_string(),
            )),
        }
    }
}

impl Connection for MemoryConn {
    async fn execute(&mut self, stmt: &str) -> Result<(), StoreError> {
        let stmt = Self::parse(stmt)?;
        if matches!(stmt, Statement::Insert { .. }) {
            let delay = self.shared.insert_delay_ms.load(Ordering::Acquire);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
        self.run(stmt).map(|_| ())
    }

    async fn fetch_key(
        &mut self,
        stmt: &str,
        table: DimensionTable,
    ) -> Result<Option<KeyRow>, StoreError> {
        let Statement::SelectKey { name, .. } = Self::parse(stmt)? else {
            return Err(StoreError::Query("expected a key select".to_string()));
        };

        let tables = self.shared.tables.lock();
        Self::check_schema(&tables)?;
        let row = match table {
            DimensionTable::Metric => tables
                .metrics
                .iter()
                .find(|(n, _, _)| *n == name)
                .map(|(_, key, kind)| KeyRow {
                    key: *key,
                    kind: *kind,
                }),
            DimensionTable::Source => tables
                .sources
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, key)| KeyRow {
                    key: *key,
                    kind: None,
                }),
        };
        Ok(row)
    }

    async fn fetch_history(
        &mut self,
        stmt: &str,
        _kind: ValueKind,
    ) -> Result<Vec<StoredRow>, StoreError> {
        let stmt = Self::parse(stmt)?;
        Ok(self.run(stmt)?.unwrap_or_default())
    }
}
