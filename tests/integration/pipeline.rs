//! End-to-end pipeline tests
//!
//! Full discovery→fetch→evaluate cycles against mock miners on the
//! loopback network. Linux binds any 127.0.0.0/8 address, so several
//! "devices" can share one port.

use std::sync::Arc;

use pretty_assertions::assert_eq;

use minerwatch::alerts::AlertStatus;
use minerwatch::rules::{RuleType, default_rules};
use minerwatch::scheduler::MonitorHandle;
use minerwatch::store::{MemoryStore, ReadingStore};

use crate::helpers::*;

#[tokio::test]
async fn test_one_cycle_mixed_fleet() {
    // device A answers live and healthy; device B accepts the probe but
    // never replies, and its last known reading is 40 minutes old and hot
    let port = spawn_miner(
        "127.0.0.1",
        0,
        healthy_summary_json(100_000.0, 70.0, 4000.0),
    )
    .await;
    spawn_silent_miner("127.0.0.2", port).await;

    let store = Arc::new(MemoryStore::new());
    for rule in default_rules() {
        store.upsert_rule(rule).await;
    }
    store
        .append_reading(stale_reading("127.0.0.2", 40, 50.0, 90.0))
        .await
        .unwrap();

    let sink = Arc::new(RecordingSink::new());
    let handle = MonitorHandle::spawn(
        create_test_config("127.0.0.0/29", port),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        sink.clone(),
    );

    let report = handle.cycle_now().await.unwrap();

    assert_eq!(report.discovered, 2);
    assert_eq!(report.live, 1);
    assert_eq!(report.fallback, 1);
    assert_eq!(report.alerts_created, 2);

    // A is healthy: no alerts, live reading persisted
    assert!(store.alerts_for_device("127.0.0.1").await.is_empty());
    let latest_a = store.latest_reading("127.0.0.1").await.unwrap().unwrap();
    assert_eq!(latest_a.hashrate_ths, 100.0);
    assert_eq!(latest_a.avg_temp_c, 70.0);

    // B got exactly an offline alert and a temp alert
    let alerts_b = store.alerts_for_device("127.0.0.2").await;
    assert_eq!(alerts_b.len(), 2);
    let mut types: Vec<RuleType> = alerts_b.iter().map(|a| a.alert_type).collect();
    types.sort_by_key(|t| t.to_string());
    assert_eq!(types, vec![RuleType::Offline, RuleType::Temp]);
    assert!(alerts_b.iter().all(|a| a.status == AlertStatus::Active));

    // both alerts reached the notification sink, scoped to B
    assert_eq!(sink.count(), 2);
    assert!(sink.events().iter().all(|(_, device)| device == "127.0.0.2"));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_persistent_condition_alerts_once_across_cycles() {
    // a miner that stays hot: the temp rule fires on the first cycle
    // and is suppressed by its cooldown on the second
    let port = spawn_miner(
        "127.0.0.1",
        0,
        healthy_summary_json(100_000.0, 90.0, 4000.0),
    )
    .await;

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
        sink.clone(),
    );

    let first = handle.cycle_now().await.unwrap();
    assert_eq!(first.alerts_created, 1);

    let second = handle.cycle_now().await.unwrap();
    assert_eq!(second.alerts_created, 0);

    let alerts = store.alerts_for_device("127.0.0.1").await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, RuleType::Temp);
    assert_eq!(sink.count(), 1);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_on_demand_evaluate_without_fetch() {
    // evaluateRulesOnce works on stored data alone, no network involved
    let store = Arc::new(MemoryStore::new());
    for rule in default_rules() {
        store.upsert_rule(rule).await;
    }
    store
        .append_reading(stale_reading("10.0.0.9", 40, 50.0, 70.0))
        .await
        .unwrap();

    let sink = Arc::new(RecordingSink::new());
    let handle = MonitorHandle::spawn(
        create_test_config("127.0.0.0/32", 4028),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        sink,
    );

    let created = handle.evaluate_now().await.unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].alert_type, RuleType::Offline);
    assert_eq!(created[0].device_id, "10.0.0.9");

    handle.shutdown().await.unwrap();
}
