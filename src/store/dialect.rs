use crate::value::{Value, ValueKind};

/// Dimension tables mapping names to surrogate keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DimensionTable {
    /// Metric ids. Rows also carry the value partition.
    Metric,
    /// Event source names.
    Source,
}

impl DimensionTable {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Metric => "metric",
            Self::Source => "source",
        }
    }
}

/// Everything an insert statement needs. The partition is the value's kind.
#[derive(Debug, Clone, Copy)]
pub struct InsertRow<'a> {
    pub metric_key: i32,
    /// Zero when the entry has no source.
    pub source_key: i32,
    pub ts: i64,
    pub val: &'a Value,
    pub ack: bool,
    pub q: i32,
}

/// Time range and row cap of a history select.
///
/// Rows are selected newest-first with `start <= ts <= end` (no lower bound
/// when `start` is `None`) and at most `limit` rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryRange {
    pub start: Option<i64>,
    pub end: i64,
    pub limit: usize,
}

/// Statement generator for one backend.
pub trait Dialect: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Trivial statement used to verify a connection.
    fn ping(&self) -> String;

    fn insert(&self, row: &InsertRow<'_>) -> String;

    fn select_dimension_key(&self, table: DimensionTable, name: &str) -> String;

    /// Creates a key for `name`. `kind` is recorded for metrics only.
    fn insert_dimension_key(
        &self,
        table: DimensionTable,
        name: &str,
        kind: Option<ValueKind>,
    ) -> String;

    /// Selects history rows from one partition, for one metric key or for
    /// every metric when `key` is `None`.
    fn select_history(&self, kind: ValueKind, key: Option<i32>, range: &HistoryRange) -> String;

    /// Statements creating the schema. Each may fail with
    /// [`StoreError::AlreadyExists`](super::StoreError::AlreadyExists).
    fn bootstrap_schema(&self) -> Vec<String>;

    fn drop_schema(&self) -> Vec<String>;
}

/// Escapes a string value for SQL insertion (single-quote escaping).
pub(crate) fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Splits SQL text into individual statements by semicolons.
///
/// Handles empty lines and whitespace-only segments.
pub(crate) fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_sql() {
        assert_eq!(escape_sql("plain"), "plain");
        assert_eq!(escape_sql("it's"), "it\\'s");
        assert_eq!(escape_sql("a\\b"), "a\\\\b");
    }

    #[test]
    fn test_split_statements_basic() {
        let sql = "CREATE TABLE foo (id Int32); CREATE TABLE bar (id Int32);";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("CREATE TABLE foo"));
        assert!(stmts[1].starts_with("CREATE TABLE bar"));
    }

    #[test]
    fn test_split_statements_with_whitespace() {
        let sql = "
            SELECT 1;

            SELECT 2;

        ";
        assert_eq!(split_statements(sql).len(), 2);
    }

    #[test]
    fn test_split_statements_trailing_semicolons() {
        assert_eq!(split_statements("SELECT 1;;;").len(), 1);
        assert!(split_statements("").is_empty());
    }
}
