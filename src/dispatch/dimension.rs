use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::export::health::HealthMetrics;
use crate::store::{Connection, Dialect, DimensionTable, StoreError};
use crate::value::ValueKind;

/// Surrogate key of a metric or source inside the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimensionKey {
    pub key: i32,
    /// Value partition recorded for a metric. Sources have none.
    pub kind: Option<ValueKind>,
}

/// Resolves metric ids and source names to store keys.
///
/// Resolved keys are cached for the process lifetime; the store's dimension
/// tables are append-only. Creation is serialized so that concurrent callers
/// resolving the same name issue a single create.
pub struct DimensionResolver {
    dialect: Arc<dyn Dialect>,
    metrics: DashMap<String, DimensionKey>,
    sources: DashMap<String, DimensionKey>,
    /// Reverse index of resolved metric keys.
    metric_names: DashMap<i32, String>,
    create_lock: tokio::sync::Mutex<()>,
    health: Option<Arc<HealthMetrics>>,
}

impl DimensionResolver {
    pub fn new(dialect: Arc<dyn Dialect>, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            dialect,
            metrics: DashMap::new(),
            sources: DashMap::new(),
            metric_names: DashMap::new(),
            create_lock: tokio::sync::Mutex::new(()),
            health,
        }
    }

    fn map(&self, table: DimensionTable) -> &DashMap<String, DimensionKey> {
        match table {
            DimensionTable::Metric => &self.metrics,
            DimensionTable::Source => &self.sources,
        }
    }

    /// Returns the cached key for `name` without touching the store.
    pub fn lookup(&self, table: DimensionTable, name: &str) -> Option<DimensionKey> {
        self.map(table).get(name).map(|k| *k)
    }

    /// Returns the metric id a key was resolved from, if known.
    pub fn metric_name(&self, key: i32) -> Option<String> {
        self.metric_names.get(&key).map(|n| n.clone())
    }

    fn remember(&self, table: DimensionTable, name: &str, key: DimensionKey) {
        self.map(table).insert(name.to_string(), key);
        if table == DimensionTable::Metric {
            self.metric_names.insert(key.key, name.to_string());
        }
    }

    /// Fetches the key for `name`, creating it when the store has none.
    /// `kind` is recorded on creation of a metric key.
    pub async fn resolve<C: Connection>(
        &self,
        conn: &mut C,
        table: DimensionTable,
        name: &str,
        kind: Option<ValueKind>,
    ) -> Result<DimensionKey, StoreError> {
        if let Some(key) = self.lookup(table, name) {
            return Ok(key);
        }

        let _create = self.create_lock.lock().await;
        if let Some(key) = self.lookup(table, name) {
            return Ok(key);
        }

        let select = self.dialect.select_dimension_key(table, name);
        if let Some(row) = conn.fetch_key(&select, table).await? {
            let key = DimensionKey {
                key: row.key,
                kind: row.kind,
            };
            self.remember(table, name, key);
            return Ok(key);
        }

        let insert = self.dialect.insert_dimension_key(table, name, kind);
        match conn.execute(&insert).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e),
        }

        if let Some(health) = &self.health {
            health
                .dimension_creates
                .with_label_values(&[table.as_str()])
                .inc();
        }

        let row = conn.fetch_key(&select, table).await?.ok_or_else(|| {
            StoreError::Query(format!("{} key for {name} missing after create", table.as_str()))
        })?;

        let key = DimensionKey {
            key: row.key,
            kind: row.kind,
        };
        debug!(table = table.as_str(), name, key = key.key, "dimension key created");
        self.remember(table, name, key);

        Ok(key)
    }
}
