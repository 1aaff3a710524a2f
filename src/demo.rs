//! Synthetic history written straight into the store, for trying out
//! queries without a live source.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::policy::{MetricPolicy, PolicyTable};
use crate::store::{Connection, DimensionTable, InsertRow, Store, StoreContext, StoreError};
use crate::value::{is_valid_epoch_secs, Value, ValueKind};

const DAY_SECS: i64 = 86_400;

/// Upper bound on rows written by one request.
pub const MAX_POINTS: u64 = 1_000_000;

/// Policy installed for every demo metric.
pub const DEMO_POLICY: MetricPolicy = MetricPolicy {
    changes_only: false,
    debounce_ms: 1000,
    retention_secs: 365 * 86_400,
};

/// Shape of the generated series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Curve {
    Sin,
    #[default]
    Inc,
    Dec,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DemoRequest {
    /// Metric name below the `demo.` prefix.
    #[serde(default = "default_demo_id")]
    pub id: String,
    pub start: i64,
    pub end: i64,
    /// Seconds between points.
    #[serde(default = "default_step")]
    pub step: i64,
    #[serde(default)]
    pub curve: Curve,
}

fn default_demo_id() -> String {
    "Demo_Data".to_string()
}

fn default_step() -> i64 {
    60
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemoSummary {
    pub id: String,
    pub inserted: usize,
}

#[derive(Error, Debug)]
pub enum DemoError {
    #[error("start and end must be plausible unix seconds")]
    InvalidRange,

    #[error("step must be positive")]
    InvalidStep,

    #[error("{0} points requested, at most {max} allowed", max = MAX_POINTS)]
    TooManyPoints(u64),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Points of a demo series, one every `step` seconds after `start` until
/// the end of the day containing `end`.
#[derive(Debug, Clone)]
pub struct DemoSeries {
    curve: Curve,
    ts: i64,
    end: i64,
    step: i64,
    value: f64,
    /// Sine argument in tenths, wrapping after 6.2.
    tenths: u32,
}

impl DemoSeries {
    pub fn new(req: &DemoRequest) -> Result<Self, DemoError> {
        if !is_valid_epoch_secs(req.start) || !is_valid_epoch_secs(req.end) {
            return Err(DemoError::InvalidRange);
        }
        if req.step <= 0 {
            return Err(DemoError::InvalidStep);
        }

        let (start, end) = if req.end < req.start {
            (req.end, req.start)
        } else {
            (req.start, req.end)
        };
        let end = end - end.rem_euclid(DAY_SECS) + DAY_SECS;

        let points = ((end - start) / req.step) as u64;
        if points > MAX_POINTS {
            return Err(DemoError::TooManyPoints(points));
        }

        Ok(Self {
            curve: req.curve,
            ts: start,
            end,
            step: req.step,
            value: 1.0,
            tenths: 1,
        })
    }

    fn next_value(&mut self) -> f64 {
        match self.curve {
            Curve::Sin => {
                self.tenths = if self.tenths == 62 { 0 } else { self.tenths + 1 };
                let x = f64::from(self.tenths) / 10.0;
                (x.sin() * 10_000.0).round() / 100.0
            }
            Curve::Inc => {
                self.value += 1.0;
                self.value
            }
            Curve::Dec => {
                self.value -= 1.0;
                self.value
            }
        }
    }
}

impl Iterator for DemoSeries {
    type Item = (i64, f64);

    fn next(&mut self) -> Option<(i64, f64)> {
        let ts = self.ts.checked_add(self.step)?;
        if ts > self.end {
            return None;
        }
        self.ts = ts;
        Some((ts, self.next_value()))
    }
}

/// Writes demo series into the store and installs their policy.
pub struct DemoGenerator<S> {
    ctx: StoreContext<S>,
    policies: Arc<PolicyTable>,
}

impl<S: Store> DemoGenerator<S> {
    pub fn new(ctx: StoreContext<S>, policies: Arc<PolicyTable>) -> Self {
        Self { ctx, policies }
    }

    pub async fn generate(&self, req: &DemoRequest) -> Result<DemoSummary, DemoError> {
        let series = DemoSeries::new(req)?;
        let id = format!("demo.{}", req.id);

        let mut conn = self.ctx.borrow().await?;
        self.policies.set(&id, Some(DEMO_POLICY));

        let key = self
            .ctx
            .resolver
            .resolve(&mut conn, DimensionTable::Metric, &id, Some(ValueKind::Number))
            .await?;

        let mut inserted = 0usize;
        for (ts, v) in series {
            let val = Value::Number(v);
            let stmt = self.ctx.dialect.insert(&InsertRow {
                metric_key: key.key,
                source_key: 0,
                ts,
                val: &val,
                ack: true,
                q: 0,
            });
            match conn.execute(&stmt).await {
                Ok(()) => {}
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e.into()),
            }
            inserted += 1;
        }

        info!(id = %id, inserted, curve = ?req.curve, "demo data generated");
        Ok(DemoSummary { id, inserted })
    }
}
