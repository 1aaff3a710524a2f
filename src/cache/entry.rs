use serde::{Deserialize, Serialize};

use crate::value::Value;

/// One buffered telemetry sample for a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Position in the metric's log, assigned on append.
    #[serde(default)]
    pub seq: u64,
    /// Sample time in unix seconds.
    pub ts: i64,
    pub val: Value,
    /// Quality code supplied by the event source.
    #[serde(default)]
    pub q: i32,
    #[serde(default)]
    pub ack: bool,
    /// Name of the component that produced the value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Set once the entry has been written to the store. Never reset.
    #[serde(default)]
    pub persisted: bool,
}

impl CacheEntry {
    /// Creates an unpersisted entry. The sequence number is assigned by the
    /// cache on append.
    pub fn new(ts: i64, val: Value) -> Self {
        Self {
            seq: 0,
            ts,
            val,
            q: 0,
            ack: false,
            from: None,
            persisted: false,
        }
    }

    pub fn with_quality(mut self, q: i32) -> Self {
        self.q = q;
        self
    }

    pub fn with_ack(mut self, ack: bool) -> Self {
        self.ack = ack;
        self
    }

    pub fn with_source(mut self, from: Option<String>) -> Self {
        self.from = from;
        self
    }
}
