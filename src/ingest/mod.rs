//! Decides which incoming events are written to the local cache.
//!
//! Events pass through, in order: the policy lookup, value coercion, the
//! changes-only filter and the debounce window. Debouncing is trailing-edge:
//! the first event of a window schedules a single timer and later events
//! replace the pending one, so the value appended is the latest seen when
//! the timer fires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, LocalCache};
use crate::export::health::HealthMetrics;
use crate::policy::{MetricPolicy, PolicyTable};
use crate::value::{coerce, Value};

/// An event as delivered by the event source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Loosely typed value; coerced on arrival.
    pub val: serde_json::Value,
    /// Sample time in unix seconds.
    pub ts: i64,
    /// Time the value last changed, when the source tracks it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lc: Option<i64>,
    #[serde(default)]
    pub q: i32,
    #[serde(default)]
    pub ack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

impl RawEvent {
    pub fn new(ts: i64, val: impl Into<serde_json::Value>) -> Self {
        Self {
            val: val.into(),
            ts,
            lc: None,
            q: 0,
            ack: false,
            from: None,
        }
    }
}

/// What happened to an event handed to [`IngestFilter::on_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Appended,
    /// Held in the debounce window.
    Deferred,
    NoPolicy,
    Absent,
    Unchanged,
    Unsupported,
}

impl Disposition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Appended => "appended",
            Self::Deferred => "deferred",
            Self::NoPolicy => "no_policy",
            Self::Absent => "absent",
            Self::Unchanged => "unchanged",
            Self::Unsupported => "unsupported",
        }
    }

    fn reject_reason(self) -> Option<&'static str> {
        match self {
            Self::Appended | Self::Deferred => None,
            other => Some(other.as_str()),
        }
    }
}

struct PendingFlush {
    generation: u64,
    entry: CacheEntry,
}

struct Inner {
    policies: Arc<PolicyTable>,
    cache: Arc<LocalCache>,
    last_seen: DashMap<String, Value>,
    pending: DashMap<String, PendingFlush>,
    next_generation: AtomicU64,
    health: Option<Arc<HealthMetrics>>,
}

impl Inner {
    fn append(&self, id: &str, entry: CacheEntry) {
        self.cache.append(id, entry);
        if let Some(health) = &self.health {
            health.cache_appends.inc();
        }
    }

    fn update_pending_gauge(&self) {
        if let Some(health) = &self.health {
            health.debounce_pending.set(self.pending.len() as f64);
        }
    }
}

/// Ingest filter. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct IngestFilter {
    inner: Arc<Inner>,
}

impl IngestFilter {
    pub fn new(
        policies: Arc<PolicyTable>,
        cache: Arc<LocalCache>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                policies,
                cache,
                last_seen: DashMap::new(),
                pending: DashMap::new(),
                next_generation: AtomicU64::new(0),
                health,
            }),
        }
    }

    pub fn policies(&self) -> &Arc<PolicyTable> {
        &self.inner.policies
    }

    /// Handles one event for `id`. Must be called from within a tokio
    /// runtime when debounced policies are in use.
    pub fn on_event(&self, id: &str, event: Option<RawEvent>) -> Disposition {
        let disposition = self.filter(id, event);

        if let Some(health) = &self.inner.health {
            health.events_received.inc();
            if let Some(reason) = disposition.reject_reason() {
                health.events_rejected.with_label_values(&[reason]).inc();
            }
        }

        disposition
    }

    fn filter(&self, id: &str, event: Option<RawEvent>) -> Disposition {
        let Some(policy) = self.inner.policies.get(id) else {
            debug!(id, "event for metric without policy");
            return Disposition::NoPolicy;
        };
        let Some(event) = event else {
            return Disposition::Absent;
        };

        let val = match coerce(&event.val) {
            Ok(val) => val,
            Err(e) => {
                warn!(id, error = %e, value = %event.val, "dropping event with unsupported value");
                return Disposition::Unsupported;
            }
        };

        if policy.changes_only && !self.changed(id, &event, &val) {
            return Disposition::Unchanged;
        }
        self.inner.last_seen.insert(id.to_string(), val.clone());

        let entry = CacheEntry::new(event.ts, val)
            .with_quality(event.q)
            .with_ack(event.ack)
            .with_source(event.from);

        if policy.debounce_ms == 0 {
            self.inner.append(id, entry);
            return Disposition::Appended;
        }

        self.defer(id, entry, policy.debounce());
        Disposition::Deferred
    }

    /// The first event for an id always counts as a change. After that the
    /// source's last-change time decides when present, the previous value
    /// otherwise.
    fn changed(&self, id: &str, event: &RawEvent, val: &Value) -> bool {
        let Some(previous) = self.inner.last_seen.get(id) else {
            return true;
        };
        match event.lc {
            Some(lc) => lc == event.ts,
            None => *previous != *val,
        }
    }

    fn defer(&self, id: &str, entry: CacheEntry, window: Duration) {
        match self.inner.pending.entry(id.to_string()) {
            Entry::Occupied(mut slot) => {
                slot.get_mut().entry = entry;
            }
            Entry::Vacant(slot) => {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                slot.insert(PendingFlush { generation, entry });
                self.spawn_timer(id.to_string(), generation, window);
            }
        }
        self.inner.update_pending_gauge();
    }

    fn spawn_timer(&self, id: String, generation: u64, window: Duration) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            // A slot replaced after a policy change belongs to another timer.
            let fired = inner
                .pending
                .remove_if(&id, |_, pending| pending.generation == generation);
            if let Some((_, pending)) = fired {
                inner.append(&id, pending.entry);
                inner.update_pending_gauge();
            }
        });
    }

    /// Appends every debounced event now, without waiting for its timer.
    /// Returns the number appended.
    pub fn flush_pending(&self) -> usize {
        let ids: Vec<String> = self
            .inner
            .pending
            .iter()
            .map(|p| p.key().clone())
            .collect();

        let mut flushed = 0;
        for id in ids {
            if let Some((_, pending)) = self.inner.pending.remove(&id) {
                self.inner.append(&id, pending.entry);
                flushed += 1;
            }
        }
        self.inner.update_pending_gauge();

        if flushed > 0 {
            debug!(flushed, "flushed debounced events");
        }
        flushed
    }

    /// Installs, updates or (with `None`) removes the policy for `id`.
    /// Removal also forgets the last value seen and drops any pending event.
    pub fn on_policy_change(&self, id: &str, policy: Option<MetricPolicy>) {
        let previous = self.inner.policies.set(id, policy);

        match (previous, policy) {
            (_, None) => {
                self.inner.last_seen.remove(id);
                self.inner.pending.remove(id);
                self.inner.update_pending_gauge();
                if previous.is_some() {
                    info!(id, "logging disabled");
                }
            }
            (None, Some(policy)) => {
                info!(
                    id,
                    changes_only = policy.changes_only,
                    debounce_ms = policy.debounce_ms,
                    retention_secs = policy.retention_secs,
                    "logging enabled"
                );
            }
            (Some(_), Some(policy)) => {
                debug!(id, ?policy, "policy updated");
            }
        }
    }

    /// Number of metrics with a debounced event waiting.
    pub fn pending_len(&self) -> usize {
        self.inner.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const T0: i64 = 1_700_000_100;

    fn setup(policy: MetricPolicy) -> (tempfile::TempDir, Arc<LocalCache>, IngestFilter) {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = Arc::new(LocalCache::open(dir.path()).expect("cache"));
        let filter = IngestFilter::new(Arc::new(PolicyTable::new()), Arc::clone(&cache), None);
        filter.on_policy_change("m", Some(policy));
        (dir, cache, filter)
    }

    fn values(cache: &LocalCache, id: &str) -> Vec<Value> {
        cache.read_all(id).into_iter().map(|e| e.val).collect()
    }

    #[tokio::test]
    async fn test_no_policy_or_absent_event_is_discarded() {
        let (_dir, cache, filter) = setup(MetricPolicy::default());
        assert_eq!(
            filter.on_event("other", Some(RawEvent::new(T0, 1))),
            Disposition::NoPolicy
        );
        assert_eq!(filter.on_event("m", None), Disposition::Absent);
        assert!(cache.list_ids().is_empty());
    }

    #[tokio::test]
    async fn test_immediate_append_coerces_value() {
        let (_dir, cache, filter) = setup(MetricPolicy::default());
        let mut event = RawEvent::new(T0, "21.5");
        event.ack = true;
        event.q = 2;
        event.from = Some("system.adapter.x".into());

        assert_eq!(filter.on_event("m", Some(event)), Disposition::Appended);
        let log = cache.read_all("m");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].val, Value::Number(21.5));
        assert!(log[0].ack);
        assert_eq!(log[0].q, 2);
        assert_eq!(log[0].from.as_deref(), Some("system.adapter.x"));
        assert!(!log[0].persisted);
    }

    #[tokio::test]
    async fn test_unsupported_values_are_dropped() {
        let (_dir, cache, filter) = setup(MetricPolicy::default());
        assert_eq!(
            filter.on_event("m", Some(RawEvent::new(T0, json!({"a": 1})))),
            Disposition::Unsupported
        );
        assert_eq!(
            filter.on_event("m", Some(RawEvent::new(T0, serde_json::Value::Null))),
            Disposition::Unsupported
        );
        assert!(cache.read_all("m").is_empty());
    }

    #[tokio::test]
    async fn test_changes_only_drops_repeats() {
        let (_dir, cache, filter) = setup(MetricPolicy {
            changes_only: true,
            ..Default::default()
        });

        filter.on_event("m", Some(RawEvent::new(T0, 1)));
        assert_eq!(
            filter.on_event("m", Some(RawEvent::new(T0 + 1, 1))),
            Disposition::Unchanged
        );
        filter.on_event("m", Some(RawEvent::new(T0 + 2, 2)));
        filter.on_event("m", Some(RawEvent::new(T0 + 3, "2")));

        assert_eq!(values(&cache, "m"), vec![Value::Number(1.0), Value::Number(2.0)]);
    }

    #[tokio::test]
    async fn test_changes_only_prefers_last_change_time() {
        let (_dir, cache, filter) = setup(MetricPolicy {
            changes_only: true,
            ..Default::default()
        });

        let mut first = RawEvent::new(T0, 1);
        first.lc = Some(T0 - 50);
        // The first event for a metric always passes.
        assert_eq!(filter.on_event("m", Some(first)), Disposition::Appended);

        // Same value, but the source says it changed at this instant.
        let mut touched = RawEvent::new(T0 + 1, 1);
        touched.lc = Some(T0 + 1);
        assert_eq!(filter.on_event("m", Some(touched)), Disposition::Appended);

        let mut stale = RawEvent::new(T0 + 2, 5);
        stale.lc = Some(T0 + 1);
        assert_eq!(filter.on_event("m", Some(stale)), Disposition::Unchanged);

        assert_eq!(cache.read_all("m").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces_to_latest_value() {
        let (_dir, cache, filter) = setup(MetricPolicy {
            debounce_ms: 1000,
            ..Default::default()
        });

        for (i, v) in [1, 2, 3].into_iter().enumerate() {
            let disposition = filter.on_event("m", Some(RawEvent::new(T0 + i as i64, v)));
            assert_eq!(disposition, Disposition::Deferred);
        }
        assert!(cache.read_all("m").is_empty());
        assert_eq!(filter.pending_len(), 1);

        tokio::time::sleep(Duration::from_millis(1010)).await;

        let log = cache.read_all("m");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].val, Value::Number(3.0));
        assert_eq!(log[0].ts, T0 + 2);
        assert_eq!(filter.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_windows_are_per_metric() {
        let (_dir, cache, filter) = setup(MetricPolicy {
            debounce_ms: 1000,
            ..Default::default()
        });
        filter.on_policy_change("fast", Some(MetricPolicy::default()));

        filter.on_event("m", Some(RawEvent::new(T0, 1)));
        filter.on_event("fast", Some(RawEvent::new(T0, 7)));
        assert_eq!(values(&cache, "fast"), vec![Value::Number(7.0)]);

        tokio::time::sleep(Duration::from_millis(1010)).await;
        filter.on_event("m", Some(RawEvent::new(T0 + 5, 2)));
        tokio::time::sleep(Duration::from_millis(1010)).await;

        assert_eq!(values(&cache, "m"), vec![Value::Number(1.0), Value::Number(2.0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_removal_cancels_pending() {
        let (_dir, cache, filter) = setup(MetricPolicy {
            debounce_ms: 1000,
            ..Default::default()
        });

        filter.on_event("m", Some(RawEvent::new(T0, 1)));
        filter.on_policy_change("m", None);
        // Re-enable; the old timer must not flush the new window early.
        filter.on_policy_change(
            "m",
            Some(MetricPolicy {
                debounce_ms: 1000,
                ..Default::default()
            }),
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
        filter.on_event("m", Some(RawEvent::new(T0 + 1, 2)));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(cache.read_all("m").is_empty());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(values(&cache, "m"), vec![Value::Number(2.0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_pending_appends_immediately() {
        let (_dir, cache, filter) = setup(MetricPolicy {
            debounce_ms: 60_000,
            ..Default::default()
        });

        filter.on_event("m", Some(RawEvent::new(T0, true)));
        assert_eq!(filter.flush_pending(), 1);
        assert_eq!(values(&cache, "m"), vec![Value::Bool(true)]);

        // The timer finds nothing to do.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(cache.read_all("m").len(), 1);
    }

    #[test]
    fn test_raw_event_deserializes_with_defaults() {
        let event: RawEvent = serde_json::from_str(r#"{"val": "on", "ts": 1700000000}"#)
            .expect("parse");
        assert_eq!(event, RawEvent::new(1_700_000_000, "on"));
    }
}
