//! Failure scenario tests
//!
//! Devices that answer garbage, devices with no history, and repeated
//! failures must degrade per-device - never fail a cycle.

use std::sync::Arc;

use minerwatch::rules::default_rules;
use minerwatch::scheduler::MonitorHandle;
use minerwatch::store::{MemoryStore, ReadingStore};

use crate::helpers::*;

#[tokio::test]
async fn test_garbage_device_falls_back_to_history() {
    // responds, but not with JSON
    let port = spawn_miner("127.0.0.1", 0, "BMMiner says hello".to_string()).await;

    let store = Arc::new(MemoryStore::new());
    for rule in default_rules() {
        store.upsert_rule(rule).await;
    }
    // recent, healthy history: no rule should fire
    store
        .append_reading(stale_reading("127.0.0.1", 2, 100.0, 65.0))
        .await
        .unwrap();

    let sink = Arc::new(RecordingSink::new());
    let handle = MonitorHandle::spawn(
        create_test_config("127.0.0.0/30", port),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        sink.clone(),
    );

    let report = handle.cycle_now().await.unwrap();

    assert_eq!(report.discovered, 1);
    assert_eq!(report.live, 0);
    assert_eq!(report.fallback, 1);
    assert_eq!(report.alerts_created, 0);
    assert_eq!(sink.count(), 0);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_garbage_device_is_omitted() {
    let port = spawn_miner("127.0.0.1", 0, "not json".to_string()).await;

    let store = Arc::new(MemoryStore::new());
    for rule in default_rules() {
        store.upsert_rule(rule).await;
    }

    let sink = Arc::new(RecordingSink::new());
    let handle = MonitorHandle::spawn(
        create_test_config("127.0.0.0/30", port),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        sink,
    );

    let report = handle.cycle_now().await.unwrap();

    // discovered but neither live nor fallback: simply absent
    assert_eq!(report.discovered, 1);
    assert_eq!(report.live, 0);
    assert_eq!(report.fallback, 0);
    assert_eq!(report.alerts_created, 0);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_persistently_dead_device_is_stable() {
    // silent device with stale history: every cycle serves the same
    // fallback reading and the offline alert fires exactly once
    let port = spawn_silent_miner("127.0.0.1", 0).await;

    let store = Arc::new(MemoryStore::new());
    for rule in default_rules() {
        store.upsert_rule(rule).await;
    }
    let stale = stale_reading("127.0.0.1", 40, 50.0, 65.0);
    store.append_reading(stale.clone()).await.unwrap();

    let sink = Arc::new(RecordingSink::new());
    let handle = MonitorHandle::spawn(
        create_test_config("127.0.0.0/30", port),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        sink.clone(),
    );

    let first = handle.cycle_now().await.unwrap();
    assert_eq!(first.fallback, 1);
    assert_eq!(first.alerts_created, 1);

    let second = handle.cycle_now().await.unwrap();
    assert_eq!(second.fallback, 1);
    assert_eq!(second.alerts_created, 0);

    // the fallback never mutated the stored history
    let latest = store.latest_reading("127.0.0.1").await.unwrap().unwrap();
    assert_eq!(latest, stale);
    assert_eq!(sink.count(), 1);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_broken_rule_does_not_abort_cycle() {
    let port = spawn_miner(
        "127.0.0.1",
        0,
        healthy_summary_json(100_000.0, 90.0, 4000.0),
    )
    .await;

    let store = Arc::new(MemoryStore::new());
    let mut rules = default_rules();
    // sabotage the offline rule's threshold; the temp rule must still fire
    for rule in &mut rules {
        if rule.id == 2 {
            rule.thresholds.insert(
                "max_age_minutes".to_string(),
                serde_json::Value::from("ten minutes"),
            );
        }
    }
    for rule in rules {
        store.upsert_rule(rule).await;
    }

    let sink = Arc::new(RecordingSink::new());
    let handle = MonitorHandle::spawn(
        create_test_config("127.0.0.0/30", port),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        sink,
    );

    let report = handle.cycle_now().await.unwrap();
    assert_eq!(report.alerts_created, 1);

    let alerts = store.alerts_for_device("127.0.0.1").await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, minerwatch::rules::RuleType::Temp);

    handle.shutdown().await.unwrap();
}
