//! Drains unpersisted cache entries into the store.

pub mod dimension;

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, LocalCache};
use crate::export::health::HealthMetrics;
use crate::store::{
    Connection, DimensionTable, InsertRow, Probe, Store, StoreContext, StoreError,
};
use crate::sweep::{SweepOutcome, SweepSlot, SweepStats};
use crate::value::is_valid_epoch_secs;

const SWEEP_LABEL: &str = "dispatch";

/// Timer-driven writer of cached entries to the store.
///
/// Each run probes the store, borrows one connection and walks every
/// metric's unpersisted entries in order, one insert at a time. Entries that
/// fail stay unpersisted and are retried by the next run.
pub struct Dispatcher<S, P> {
    ctx: StoreContext<S>,
    probe: Arc<P>,
    cache: Arc<LocalCache>,
    slot: SweepSlot,
    health: Option<Arc<HealthMetrics>>,
}

impl<S: Store, P: Probe> Dispatcher<S, P> {
    pub fn new(
        ctx: StoreContext<S>,
        probe: Arc<P>,
        cache: Arc<LocalCache>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            ctx,
            probe,
            cache,
            slot: SweepSlot::new(),
            health,
        }
    }

    /// Runs one dispatch sweep.
    pub async fn run_once(&self) -> SweepOutcome {
        if !self.probe.ping().await {
            if self.ctx.status.set(false) {
                warn!("store unreachable, dispatch paused");
            }
            self.set_available_gauge(false);
            return self.finish(SweepOutcome::StoreUnavailable, None);
        }

        let Some(_guard) = self.slot.try_acquire() else {
            debug!("dispatch sweep already running, skipping tick");
            return self.finish(SweepOutcome::Busy, None);
        };

        let started = Instant::now();

        let mut conn = match self.ctx.borrow().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "borrowing store connection for dispatch");
                self.set_available_gauge(false);
                return self.finish(SweepOutcome::StoreUnavailable, Some(started));
            }
        };

        if !self.ctx.status.set(true) {
            info!("store reachable, dispatch resumed");
        }
        self.set_available_gauge(true);

        let mut stats = SweepStats::default();
        for id in self.cache.list_ids() {
            let pending = self.cache.unpersisted(&id);
            if pending.is_empty() {
                continue;
            }
            stats.metrics += 1;
            self.drain_metric(&mut conn, &id, &pending, &mut stats).await;
        }

        drop(conn);

        if stats.persisted > 0 {
            if let Err(e) = self.cache.flush().await {
                warn!(error = %e, "flushing cache after dispatch");
            }
        }

        if stats.persisted > 0 || stats.failed > 0 {
            info!(
                metrics = stats.metrics,
                persisted = stats.persisted,
                failed = stats.failed,
                corrupt = stats.corrupt,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "dispatch sweep completed"
            );
        }

        self.finish(SweepOutcome::Completed(stats), Some(started))
    }

    /// Inserts the pending entries of one metric, in order.
    async fn drain_metric(
        &self,
        conn: &mut S::Conn,
        id: &str,
        pending: &[CacheEntry],
        stats: &mut SweepStats,
    ) {
        let mut metric_key = None;

        for (idx, entry) in pending.iter().enumerate() {
            if !is_valid_epoch_secs(entry.ts) {
                stats.corrupt += 1;
                if let Some(health) = &self.health {
                    health.corrupt_entries.with_label_values(&["dispatch"]).inc();
                }
                warn!(id, ts = entry.ts, "skipping cache entry with implausible timestamp");
                continue;
            }

            let key = match metric_key {
                Some(key) => key,
                None => match self
                    .ctx
                    .resolver
                    .resolve(conn, DimensionTable::Metric, id, Some(entry.val.kind()))
                    .await
                {
                    Ok(resolved) => {
                        metric_key = Some(resolved.key);
                        resolved.key
                    }
                    Err(e) => {
                        // Later entries wait so per-metric order holds.
                        let remaining = pending.len() - idx;
                        stats.failed += remaining;
                        warn!(id, error = %e, remaining, "resolving metric key, skipping metric");
                        return;
                    }
                },
            };

            let source_key = match &entry.from {
                Some(from) => match self
                    .ctx
                    .resolver
                    .resolve(conn, DimensionTable::Source, from, None)
                    .await
                {
                    Ok(resolved) => resolved.key,
                    Err(e) => {
                        stats.failed += 1;
                        warn!(id, from = %from, error = %e, "resolving source key");
                        continue;
                    }
                },
                None => 0,
            };

            let stmt = self.ctx.dialect.insert(&InsertRow {
                metric_key: key,
                source_key,
                ts: entry.ts,
                val: &entry.val,
                ack: entry.ack,
                q: entry.q,
            });

            match conn.execute(&stmt).await {
                Ok(()) => {}
                Err(e) if e.is_already_exists() => {}
                Err(e) => {
                    self.record_insert_error(id, entry, &e);
                    stats.failed += 1;
                    continue;
                }
            }

            self.cache.mark_persisted(id, entry.seq);
            stats.persisted += 1;
            if let Some(health) = &self.health {
                health.entries_persisted.inc();
            }
        }
    }

    fn record_insert_error(&self, id: &str, entry: &CacheEntry, err: &StoreError) {
        if let Some(health) = &self.health {
            health.insert_errors.inc();
        }
        warn!(id, ts = entry.ts, error = %err, "insert failed, will retry");
    }

    fn set_available_gauge(&self, available: bool) {
        if let Some(health) = &self.health {
            health.store_available.set(if available { 1.0 } else { 0.0 });
        }
    }

    fn finish(&self, outcome: SweepOutcome, started: Option<Instant>) -> SweepOutcome {
        if let Some(health) = &self.health {
            health
                .sweeps
                .with_label_values(&[SWEEP_LABEL, outcome.as_str()])
                .inc();
            if let Some(started) = started {
                health
                    .sweep_duration
                    .with_label_values(&[SWEEP_LABEL])
                    .observe(started.elapsed().as_secs_f64());
            }
        }
        outcome
    }
}
