use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::Value;

use super::{HistoryQuery, HistoryRow};

/// Reduction applied to each bucket when downsampling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregate {
    /// Pass rows through unchanged.
    None,
    #[default]
    Average,
    Min,
    Max,
    Total,
}

#[derive(Default)]
struct Bucket {
    sum: f64,
    count: u32,
    min: f64,
    max: f64,
}

impl Bucket {
    fn add(&mut self, v: f64) {
        if self.count == 0 {
            self.min = v;
            self.max = v;
        } else {
            self.min = self.min.min(v);
            self.max = self.max.max(v);
        }
        self.sum += v;
        self.count += 1;
    }

    fn reduce(&self, aggregate: Aggregate) -> f64 {
        match aggregate {
            Aggregate::Min => self.min,
            Aggregate::Max => self.max,
            Aggregate::Total => self.sum,
            Aggregate::Average | Aggregate::None => self.sum / f64::from(self.count),
        }
    }
}

/// Bucket width for a query: the explicit step, or the range split into
/// `count` buckets when there are more rows than requested.
fn bucket_width(query: &HistoryQuery, start: Option<i64>, end: i64, rows: usize) -> Option<i64> {
    if let Some(step) = query.step.filter(|s| *s > 0) {
        return Some(step);
    }
    let start = start?;
    if rows <= query.count || query.count == 0 {
        return None;
    }
    let count = i64::try_from(query.count).unwrap_or(i64::MAX);
    Some((end.saturating_sub(start) / count).max(1))
}

/// Downsamples numeric rows into fixed-width buckets, one output row per
/// non-empty bucket and metric, stamped with the bucket start. Non-numeric
/// rows pass through untouched.
pub fn downsample(
    rows: Vec<HistoryRow>,
    query: &HistoryQuery,
    start: Option<i64>,
    end: i64,
) -> Vec<HistoryRow> {
    if query.aggregate == Aggregate::None {
        return rows;
    }
    let Some(width) = bucket_width(query, start, end, rows.len()) else {
        return rows;
    };
    let Some(origin) = start.or_else(|| rows.first().map(|r| r.ts)) else {
        return rows;
    };

    let mut buckets: BTreeMap<(i64, Option<String>), Bucket> = BTreeMap::new();
    let mut out = Vec::new();

    for row in rows {
        match row.val {
            Value::Number(v) => {
                let slot = row.ts.saturating_sub(origin).div_euclid(width);
                buckets.entry((slot, row.id)).or_default().add(v);
            }
            _ => out.push(row),
        }
    }

    out.extend(buckets.into_iter().map(|((slot, id), bucket)| HistoryRow {
        ts: origin.saturating_add(slot.saturating_mul(width)),
        val: Value::Number(bucket.reduce(query.aggregate)),
        ack: None,
        q: None,
        id,
    }));
    out.sort_by_key(|r| r.ts);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::MetricSelector;

    fn row(ts: i64, v: f64) -> HistoryRow {
        HistoryRow {
            ts,
            val: Value::Number(v),
            ack: None,
            q: None,
            id: None,
        }
    }

    fn query(step: Option<i64>, aggregate: Aggregate) -> HistoryQuery {
        HistoryQuery {
            step,
            aggregate,
            ..HistoryQuery::new(MetricSelector::parse("m"))
        }
    }

    fn values(rows: &[HistoryRow]) -> Vec<(i64, Value)> {
        rows.iter().map(|r| (r.ts, r.val.clone())).collect()
    }

    #[test]
    fn test_step_buckets_reduce() {
        let rows = vec![row(0, 1.0), row(5, 3.0), row(10, 10.0), row(19, 20.0)];

        let avg = downsample(rows.clone(), &query(Some(10), Aggregate::Average), Some(0), 30);
        assert_eq!(
            values(&avg),
            vec![(0, Value::Number(2.0)), (10, Value::Number(15.0))]
        );

        let max = downsample(rows.clone(), &query(Some(10), Aggregate::Max), Some(0), 30);
        assert_eq!(values(&max)[1], (10, Value::Number(20.0)));

        let min = downsample(rows.clone(), &query(Some(10), Aggregate::Min), Some(0), 30);
        assert_eq!(values(&min)[0], (0, Value::Number(1.0)));

        let total = downsample(rows, &query(Some(10), Aggregate::Total), Some(0), 30);
        assert_eq!(values(&total)[1], (10, Value::Number(30.0)));
    }

    #[test]
    fn test_none_and_small_results_pass_through() {
        let rows = vec![row(0, 1.0), row(1, 2.0)];
        assert_eq!(
            downsample(rows.clone(), &query(Some(10), Aggregate::None), Some(0), 10),
            rows
        );
        // Fewer rows than count and no step: nothing to do.
        assert_eq!(
            downsample(rows.clone(), &query(None, Aggregate::Average), Some(0), 10),
            rows
        );
    }

    #[test]
    fn test_count_derives_bucket_width() {
        let rows: Vec<HistoryRow> = (0..100).map(|i| row(i, 1.0)).collect();
        let mut q = query(None, Aggregate::Total);
        q.count = 4;

        let out = downsample(rows, &q, Some(0), 100);
        assert_eq!(
            values(&out),
            vec![
                (0, Value::Number(25.0)),
                (25, Value::Number(25.0)),
                (50, Value::Number(25.0)),
                (75, Value::Number(25.0)),
            ]
        );
    }

    #[test]
    fn test_extreme_range_does_not_overflow() {
        let rows = vec![row(0, 1.0), row(10, 2.0)];
        let mut q = query(None, Aggregate::Max);
        q.count = 1;

        let out = downsample(rows, &q, Some(-1), i64::MAX);
        assert_eq!(values(&out), vec![(-1, Value::Number(2.0))]);
    }

    #[test]
    fn test_non_numeric_rows_pass_through() {
        let mut text = row(3, 0.0);
        text.val = Value::Text("on".into());
        let rows = vec![row(0, 1.0), text.clone(), row(4, 3.0)];

        let out = downsample(rows, &query(Some(10), Aggregate::Average), Some(0), 10);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].val, Value::Number(2.0));
        assert_eq!(out[1], text);
    }
}
