mod common;

use std::time::Duration;

use historian::ingest::{Disposition, RawEvent};
use historian::policy::MetricPolicy;
use historian::query::{HistoryQuery, HistorySource, MetricSelector};
use historian::sweep::SweepOutcome;
use historian::value::Value;

use common::{bootstrapped_store, Harness};

const T: i64 = 1_700_000_100;

fn range_query(id: &str, start: i64, end: i64) -> HistoryQuery {
    HistoryQuery {
        start: Some(start),
        end: Some(end),
        ..HistoryQuery::new(MetricSelector::parse(id))
    }
}

fn numbers(rows: &[historian::query::HistoryRow]) -> Vec<(i64, Value)> {
    rows.iter().map(|r| (r.ts, r.val.clone())).collect()
}

#[tokio::test]
async fn test_changes_only_event_flows_to_store_and_back() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = bootstrapped_store().await;
    let h = Harness::open(dir.path(), &store);
    h.set_policy(
        "sensor",
        MetricPolicy {
            changes_only: true,
            ..Default::default()
        },
    );

    assert_eq!(
        h.ingest.on_event("sensor", Some(RawEvent::new(T, 1))),
        Disposition::Appended
    );
    assert_eq!(
        h.ingest.on_event("sensor", Some(RawEvent::new(T + 1, 1))),
        Disposition::Unchanged
    );
    assert_eq!(h.cache.read_all("sensor").len(), 1);

    let stats = h.dispatcher.run_once().await.stats().expect("completed");
    assert_eq!(stats.persisted, 1);
    assert!(h.cache.read_all("sensor")[0].persisted);
    assert_eq!(store.rows().len(), 1);

    // Ten minutes later the entry is still inside the retention window.
    let stats = h.pruner.run_at(T + 600).await.stats().expect("completed");
    assert_eq!(stats.removed, 0);
    assert_eq!(h.cache.read_all("sensor").len(), 1);

    let resp = h.query.get_history(&range_query("sensor", T - 100, T + 100)).await;
    assert_eq!(resp.source, HistorySource::Store);
    assert_eq!(numbers(&resp.rows), vec![(T, Value::Number(1.0))]);
}

#[tokio::test]
async fn test_outage_serves_cache_then_drains_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = bootstrapped_store().await;
    let h = Harness::open(dir.path(), &store);
    h.set_policy("m", MetricPolicy::default());

    store.set_available(false);
    for (offset, v) in [(0, 1.0), (10, 2.0), (20, 3.0)] {
        h.ingest.on_event("m", Some(RawEvent::new(T + offset, v)));
    }

    assert_eq!(h.dispatcher.run_once().await, SweepOutcome::StoreUnavailable);
    assert!(!h.status.is_available());

    let resp = h.query.get_history(&range_query("m", T - 1, T + 100)).await;
    assert_eq!(resp.source, HistorySource::Cache);
    assert_eq!(
        numbers(&resp.rows),
        vec![
            (T, Value::Number(1.0)),
            (T + 10, Value::Number(2.0)),
            (T + 20, Value::Number(3.0)),
        ]
    );

    // Without a start the newest `count` entries are returned, ascending.
    let mut latest = HistoryQuery::new(MetricSelector::parse("m"));
    latest.end = Some(T + 100);
    latest.count = 2;
    let resp = h.query.get_history(&latest).await;
    assert_eq!(
        resp.rows.iter().map(|r| r.ts).collect::<Vec<_>>(),
        vec![T + 10, T + 20]
    );

    store.set_available(true);
    let stats = h.dispatcher.run_once().await.stats().expect("completed");
    assert_eq!(stats.persisted, 3);
    assert!(h.status.is_available());
    assert_eq!(
        store.rows().iter().map(|r| r.ts).collect::<Vec<_>>(),
        vec![T, T + 10, T + 20]
    );

    let resp = h.query.get_history(&range_query("m", T - 1, T + 100)).await;
    assert_eq!(resp.source, HistorySource::Store);
    assert_eq!(resp.rows.len(), 3);
}

#[tokio::test]
async fn test_persisted_entries_are_never_reinserted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = bootstrapped_store().await;
    let h = Harness::open(dir.path(), &store);
    h.set_policy("m", MetricPolicy::default());

    h.ingest.on_event("m", Some(RawEvent::new(T, 1.0)));
    h.dispatcher.run_once().await;
    h.ingest.on_event("m", Some(RawEvent::new(T + 1, 2.0)));
    h.dispatcher.run_once().await;
    h.dispatcher.run_once().await;

    assert_eq!(store.rows().len(), 2);
    assert!(h.cache.read_all("m").iter().all(|e| e.persisted));
}

#[tokio::test]
async fn test_restart_keeps_unpersisted_entries_and_keys() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = bootstrapped_store().await;

    {
        let h = Harness::open(dir.path(), &store);
        h.set_policy("m", MetricPolicy::default());
        h.ingest.on_event("m", Some(RawEvent::new(T, 1.0)));
        h.dispatcher.run_once().await;

        store.set_available(false);
        h.ingest.on_event("m", Some(RawEvent::new(T + 1, 2.0)));
        h.cache.flush().await.expect("flush");
    }
    assert_eq!(store.key_creates(), 1);

    store.set_available(true);
    let h = Harness::open(dir.path(), &store);
    let log = h.cache.read_all("m");
    assert_eq!(log.len(), 2);
    assert!(log[0].persisted);
    assert!(!log[1].persisted);

    let stats = h.dispatcher.run_once().await.stats().expect("completed");
    assert_eq!(stats.persisted, 1);
    assert_eq!(store.rows().len(), 2);
    // The fresh resolver found the existing key instead of creating one.
    assert_eq!(store.key_creates(), 1);
}

#[tokio::test]
async fn test_retention_only_drops_persisted_entries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = bootstrapped_store().await;
    let h = Harness::open(dir.path(), &store);
    h.set_policy("m", MetricPolicy::default());

    h.ingest.on_event("m", Some(RawEvent::new(T, 1.0)));
    h.dispatcher.run_once().await;
    store.set_available(false);
    h.ingest.on_event("m", Some(RawEvent::new(T + 1, 2.0)));
    h.dispatcher.run_once().await;

    let thirty_days = 30 * common::DAY.as_secs() as i64;
    let stats = h.pruner.run_at(T + thirty_days).await.stats().expect("completed");
    assert_eq!(stats.removed, 1);

    let log = h.cache.read_all("m");
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].ts, T + 1);
    assert!(!log[0].persisted);
}

#[tokio::test(start_paused = true)]
async fn test_debounced_burst_stores_latest_value() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = bootstrapped_store().await;
    let h = Harness::open(dir.path(), &store);
    h.set_policy(
        "door",
        MetricPolicy {
            debounce_ms: 500,
            ..Default::default()
        },
    );

    for (offset, v) in [(0, "open"), (1, "closed"), (2, "open")] {
        assert_eq!(
            h.ingest.on_event("door", Some(RawEvent::new(T + offset, v))),
            Disposition::Deferred
        );
    }
    assert!(h.cache.read_all("door").is_empty());

    tokio::time::sleep(Duration::from_millis(600)).await;

    let log = h.cache.read_all("door");
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].val, Value::Text("open".into()));
    assert_eq!(log[0].ts, T + 2);

    h.dispatcher.run_once().await;
    let rows = store.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].val, Value::Text("open".into()));
}

#[tokio::test]
async fn test_history_over_all_metrics_is_labelled() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = bootstrapped_store().await;
    let h = Harness::open(dir.path(), &store);
    h.set_policy("a", MetricPolicy::default());
    h.set_policy("b", MetricPolicy::default());

    h.ingest.on_event("a", Some(RawEvent::new(T + 1, 1.0)));
    h.ingest.on_event("b", Some(RawEvent::new(T, true)));
    h.dispatcher.run_once().await;

    let resp = h.query.get_history(&range_query("*", T - 10, T + 10)).await;
    assert_eq!(resp.source, HistorySource::Store);
    let labelled: Vec<_> = resp
        .rows
        .iter()
        .map(|r| (r.id.clone(), r.val.clone()))
        .collect();
    assert_eq!(
        labelled,
        vec![
            (Some("b".to_string()), Value::Bool(true)),
            (Some("a".to_string()), Value::Number(1.0)),
        ]
    );
}

#[tokio::test]
async fn test_metric_queried_before_first_value_returns_stored_bool() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = bootstrapped_store().await;
    let h = Harness::open(dir.path(), &store);
    h.set_policy("flag", MetricPolicy::default());
    h.status.set(true);

    let before = h.query.get_history(&range_query("flag", T - 10, T + 10)).await;
    assert_eq!(before.source, HistorySource::Store);
    assert!(before.rows.is_empty());

    h.ingest.on_event("flag", Some(RawEvent::new(T, true)));
    let stats = h.dispatcher.run_once().await.stats().expect("completed");
    assert_eq!(stats.persisted, 1);

    let after = h.query.get_history(&range_query("flag", T - 10, T + 10)).await;
    assert_eq!(after.source, HistorySource::Store);
    assert_eq!(numbers(&after.rows), vec![(T, Value::Bool(true))]);
}
