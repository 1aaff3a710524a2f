//! Historical range reads.
//!
//! Queries go to the store while it is reachable and fall back to the local
//! cache when it is not, or when the store path fails part-way.

pub mod aggregate;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{CacheEntry, LocalCache};
use crate::export::health::HealthMetrics;
use crate::policy::PolicyTable;
use crate::store::{
    Connection, DimensionTable, HistoryRange, Store, StoreContext, StoreError, StoredRow,
};
use crate::value::{is_valid_epoch_secs, unix_now, Value, ValueKind, MAX_EPOCH_SECS};

pub use self::aggregate::{downsample, Aggregate};

pub const DEFAULT_COUNT: usize = 500;

/// Which metrics a query covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricSelector {
    One(String),
    All,
}

impl MetricSelector {
    /// Parses a request id; `*` selects every metric.
    pub fn parse(id: &str) -> Self {
        if id == "*" {
            Self::All
        } else {
            Self::One(id.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryQuery {
    pub id: MetricSelector,
    /// Inclusive lower bound in unix seconds.
    pub start: Option<i64>,
    /// Inclusive upper bound. Defaults to now plus the configured skew.
    pub end: Option<i64>,
    /// Row cap when no start is given.
    pub count: usize,
    /// Bucket width in seconds for aggregation.
    pub step: Option<i64>,
    pub aggregate: Aggregate,
    /// Row cap of a store select. Defaults to the configured limit.
    pub limit: Option<usize>,
    /// Include the acknowledged flag.
    pub ack: bool,
    /// Include the quality code.
    pub q: bool,
    /// Render timestamps in milliseconds.
    pub ms: bool,
}

impl HistoryQuery {
    pub fn new(id: MetricSelector) -> Self {
        Self {
            id,
            start: None,
            end: None,
            count: DEFAULT_COUNT,
            step: None,
            aggregate: Aggregate::default(),
            limit: None,
            ack: false,
            q: false,
            ms: false,
        }
    }

    fn is_all(&self) -> bool {
        self.id == MetricSelector::All
    }
}

/// One row of a history response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub ts: i64,
    pub val: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<i32>,
    /// Metric id, set on queries over all metrics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Where the rows of a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HistorySource {
    Store,
    Cache,
    /// The metric has no active policy.
    None,
}

impl HistorySource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::Cache => "cache",
            Self::None => "none",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryResponse {
    /// Rows in ascending timestamp order.
    pub rows: Vec<HistoryRow>,
    pub source: HistorySource,
    /// Effective range after defaults and normalization.
    pub start: Option<i64>,
    pub end: i64,
    pub elapsed: Duration,
}

/// Query engine settings.
#[derive(Debug, Clone, Copy)]
pub struct QuerySettings {
    pub limit: usize,
    pub end_skew: Duration,
    /// Decimal digits numbers are rounded to.
    pub round: Option<u32>,
}

pub struct QueryEngine<S> {
    ctx: StoreContext<S>,
    cache: Arc<LocalCache>,
    policies: Arc<PolicyTable>,
    settings: QuerySettings,
    health: Option<Arc<HealthMetrics>>,
}

impl<S: Store> QueryEngine<S> {
    pub fn new(
        ctx: StoreContext<S>,
        cache: Arc<LocalCache>,
        policies: Arc<PolicyTable>,
        settings: QuerySettings,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            ctx,
            cache,
            policies,
            settings,
            health,
        }
    }

    /// Answers a history request. Never fails: store errors fall back to
    /// the cache.
    pub async fn get_history(&self, query: &HistoryQuery) -> HistoryResponse {
        let started = Instant::now();

        let mut start = query.start;
        let mut end = query
            .end
            .unwrap_or_else(|| unix_now() + self.settings.end_skew.as_secs() as i64);
        if let Some(s) = start {
            if s > end {
                start = Some(end);
                end = s;
            }
        }

        let (rows, source) = match &query.id {
            MetricSelector::One(id) if !self.policies.contains(id) => {
                debug!(id = %id, "history requested for metric without policy");
                (Vec::new(), HistorySource::None)
            }
            _ if self.ctx.status.is_available() => {
                match self.from_store(query, start, end).await {
                    Ok(rows) => (rows, HistorySource::Store),
                    Err(e) => {
                        warn!(error = %e, "store history failed, serving from cache");
                        (self.from_cache(query, start, end), HistorySource::Cache)
                    }
                }
            }
            _ => {
                debug!("store unavailable, serving history from cache");
                (self.from_cache(query, start, end), HistorySource::Cache)
            }
        };

        let elapsed = started.elapsed();
        if let Some(health) = &self.health {
            health
                .history_requests
                .with_label_values(&[source.as_str()])
                .inc();
            health.history_duration.observe(elapsed.as_secs_f64());
        }

        HistoryResponse {
            rows,
            source,
            start,
            end,
            elapsed,
        }
    }

    fn row_limit(&self, query: &HistoryQuery, start: Option<i64>) -> usize {
        let limit = query.limit.unwrap_or(self.settings.limit);
        match start {
            Some(_) => limit,
            None => query.count.min(limit),
        }
    }

    async fn from_store(
        &self,
        query: &HistoryQuery,
        start: Option<i64>,
        end: i64,
    ) -> Result<Vec<HistoryRow>, StoreError> {
        let limit = self.row_limit(query, start);
        let range = HistoryRange { start, end, limit };

        let mut conn = self.ctx.borrow().await?;
        let mut rows = Vec::new();

        match &query.id {
            MetricSelector::One(id) => {
                // A metric without stored data gets its key now, typed after
                // the newest cached value.
                let hint = self
                    .cache
                    .last(id)
                    .map_or(ValueKind::Number, |e| e.val.kind());
                let key = self
                    .ctx
                    .resolver
                    .resolve(&mut conn, DimensionTable::Metric, id, Some(hint))
                    .await?;

                // Values land in the partition of their runtime kind, which
                // may differ from the kind recorded with the key.
                for kind in ValueKind::ALL {
                    let stmt = self.ctx.dialect.select_history(kind, Some(key.key), &range);
                    for row in conn.fetch_history(&stmt, kind).await? {
                        rows.push(self.store_row(row, kind, query));
                    }
                }
            }
            MetricSelector::All => {
                for kind in ValueKind::ALL {
                    let stmt = self.ctx.dialect.select_history(kind, None, &range);
                    for row in conn.fetch_history(&stmt, kind).await? {
                        let id = self
                            .ctx
                            .resolver
                            .metric_name(row.key)
                            .unwrap_or_else(|| row.key.to_string());
                        let mut out = self.store_row(row, kind, query);
                        out.id = Some(id);
                        rows.push(out);
                    }
                }
            }
        }

        Ok(newest(rows, limit))
    }

    fn store_row(&self, row: StoredRow, kind: ValueKind, query: &HistoryQuery) -> HistoryRow {
        let val = match (kind, row.val) {
            (ValueKind::Bool, val) => Value::Bool(truthy(&val)),
            (_, val) => self.round(val),
        };

        HistoryRow {
            ts: normalize_legacy_ts(row.ts),
            val,
            ack: query.ack.then_some(row.ack),
            q: query.q.then_some(row.q),
            id: None,
        }
    }

    fn from_cache(&self, query: &HistoryQuery, start: Option<i64>, end: i64) -> Vec<HistoryRow> {
        let ids = match &query.id {
            MetricSelector::One(id) => vec![id.clone()],
            MetricSelector::All => self.cache.list_ids(),
        };

        let mut rows = Vec::new();
        let mut corrupt = 0usize;

        for id in ids {
            let log = self.cache.read_all(&id);
            let mut collected = Vec::new();

            for entry in log.iter().rev() {
                if !is_valid_epoch_secs(entry.ts) {
                    corrupt += 1;
                    continue;
                }
                if start.is_some_and(|s| entry.ts < s) {
                    break;
                }
                if entry.ts > end {
                    continue;
                }

                collected.push(self.cache_row(entry, query, &id));
                if start.is_none() && collected.len() >= query.count {
                    break;
                }
            }

            collected.reverse();
            rows.extend(collected);
        }

        if corrupt > 0 {
            warn!(corrupt, "skipped corrupt cache entries while serving history");
            if let Some(health) = &self.health {
                health
                    .corrupt_entries
                    .with_label_values(&["query"])
                    .inc_by(corrupt as f64);
            }
        }

        if query.is_all() {
            rows.sort_by_key(|r| r.ts);
        }
        rows
    }

    fn cache_row(&self, entry: &CacheEntry, query: &HistoryQuery, id: &str) -> HistoryRow {
        HistoryRow {
            ts: entry.ts,
            val: self.round(entry.val.clone()),
            ack: query.ack.then_some(entry.ack),
            q: query.q.then_some(entry.q),
            id: query.is_all().then(|| id.to_string()),
        }
    }

    fn round(&self, val: Value) -> Value {
        match (val, self.settings.round) {
            (Value::Number(n), Some(digits)) => Value::Number(round_to(n, digits)),
            (val, _) => val,
        }
    }
}

/// Sorts merged partition rows ascending and keeps the newest `limit`.
fn newest(mut rows: Vec<HistoryRow>, limit: usize) -> Vec<HistoryRow> {
    rows.sort_by_key(|r| r.ts);
    let excess = rows.len().saturating_sub(limit);
    rows.drain(..excess);
    rows
}

/// Rounds to `digits` decimal places.
fn round_to(n: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (n * factor).round() / factor
}

/// Scales millisecond (or finer) timestamps written by older versions down
/// to seconds.
fn normalize_legacy_ts(mut ts: i64) -> i64 {
    while ts > MAX_EPOCH_SECS {
        ts = (ts + 500) / 1000;
    }
    ts
}

fn truthy(val: &Value) -> bool {
    match val {
        Value::Bool(b) => *b,
        Value::Number(n) => *n != 0.0,
        Value::Text(s) => !s.is_empty() && s != "0" && s != "false",
    }
}
