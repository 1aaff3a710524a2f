use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::cache::LocalCache;
use crate::export::health::HealthMetrics;
use crate::policy::PolicyTable;
use crate::sweep::{SweepOutcome, SweepSlot, SweepStats};
use crate::value::unix_now;

const SWEEP_LABEL: &str = "retention";

/// Removes cache entries that are persisted and older than their metric's
/// retention horizon. Unpersisted entries are kept regardless of age.
///
/// Runs on its own slot, independently of the dispatcher.
pub struct RetentionPruner {
    cache: Arc<LocalCache>,
    policies: Arc<PolicyTable>,
    default_retention: Duration,
    slot: SweepSlot,
    health: Option<Arc<HealthMetrics>>,
}

impl RetentionPruner {
    pub fn new(
        cache: Arc<LocalCache>,
        policies: Arc<PolicyTable>,
        default_retention: Duration,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            cache,
            policies,
            default_retention,
            slot: SweepSlot::new(),
            health,
        }
    }

    /// Runs one retention sweep against the current wall clock.
    pub async fn run_once(&self) -> SweepOutcome {
        self.run_at(unix_now()).await
    }

    /// Runs one retention sweep as if the time were `now` (unix seconds).
    pub async fn run_at(&self, now: i64) -> SweepOutcome {
        let Some(_guard) = self.slot.try_acquire() else {
            debug!("retention sweep already running, skipping tick");
            return self.finish(SweepOutcome::Busy, None);
        };

        let started = Instant::now();
        let mut stats = SweepStats::default();

        for id in self.cache.list_ids() {
            let retention = self
                .policies
                .get(&id)
                .map_or(self.default_retention, |p| p.retention(self.default_retention));
            let cutoff = now - retention.as_secs() as i64;

            let mut removed = 0usize;
            self.cache.replace_with(&id, |entries| {
                let kept: Vec<_> = entries
                    .iter()
                    .filter(|e| !e.persisted || e.ts >= cutoff)
                    .cloned()
                    .collect();
                removed = entries.len() - kept.len();
                (removed > 0).then_some(kept)
            });

            if removed > 0 {
                stats.metrics += 1;
                stats.removed += removed;
                debug!(id = %id, removed, cutoff, "pruned cache entries");
            }
        }

        if let Err(e) = self.cache.flush().await {
            warn!(error = %e, "flushing cache after retention");
        }

        if let Some(health) = &self.health {
            health.retention_removed.inc_by(stats.removed as f64);
        }
        if stats.removed > 0 {
            info!(
                metrics = stats.metrics,
                removed = stats.removed,
                "retention sweep completed"
            );
        }

        self.finish(SweepOutcome::Completed(stats), Some(started))
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
