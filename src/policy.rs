use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

const DAY: Duration = Duration::from_secs(86_400);
const WEEK: Duration = Duration::from_secs(7 * 86_400);

/// Extends a retention of at most a week by one day.
pub fn retention_floor(retention: Duration) -> Duration {
    if retention <= WEEK {
        retention + DAY
    } else {
        retention
    }
}

/// Logging policy of one metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetricPolicy {
    /// Store a value only when it differs from the previous one.
    #[serde(default)]
    pub changes_only: bool,
    /// Trailing-edge debounce window. Zero appends immediately.
    #[serde(default)]
    pub debounce_ms: u64,
    /// Cache retention override. Zero uses the configured default.
    #[serde(default)]
    pub retention_secs: u64,
}

impl MetricPolicy {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Retention horizon for this metric, falling back to `default`.
    pub fn retention(&self, default: Duration) -> Duration {
        if self.retention_secs == 0 {
            default
        } else {
            Duration::from_secs(self.retention_secs)
        }
    }
}

/// Policy as written in configuration files and API requests, where the
/// debounce window may be left to the configured default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PolicySettings {
    #[serde(default)]
    pub changes_only: bool,
    #[serde(default)]
    pub debounce_ms: Option<u64>,
    #[serde(default)]
    pub retention_secs: u64,
}

impl PolicySettings {
    pub fn resolve(self, default_debounce: Duration) -> MetricPolicy {
        MetricPolicy {
            changes_only: self.changes_only,
            debounce_ms: self
                .debounce_ms
                .unwrap_or(default_debounce.as_millis() as u64),
            retention_secs: match self.retention_secs {
                0 => 0,
                secs => retention_floor(Duration::from_secs(secs)).as_secs(),
            },
        }
    }
}

/// Active policies keyed by metric id. A metric without a policy is not
/// logged.
#[derive(Debug, Default)]
pub struct PolicyTable {
    policies: DashMap<String, MetricPolicy>,
}

impl PolicyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<MetricPolicy> {
        self.policies.get(id).map(|p| *p)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.policies.contains_key(id)
    }

    /// Installs (`Some`) or removes (`None`) the policy for `id`. Returns the
    /// previous policy.
    pub fn set(&self, id: &str, policy: Option<MetricPolicy>) -> Option<MetricPolicy> {
        match policy {
            Some(policy) => self.policies.insert(id.to_string(), policy),
            None => self.policies.remove(id).map(|(_, p)| p),
        }
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
