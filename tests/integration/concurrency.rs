//! Concurrency and worker-pool bound tests

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use minerwatch::discovery::{DiscoverySource, Ipv4Cidr, discover};
use minerwatch::fetcher::fetch_all;
use minerwatch::rules::default_rules;
use minerwatch::scheduler::MonitorHandle;
use minerwatch::store::{MemoryStore, ReadingStore};

use crate::helpers::*;

#[tokio::test]
async fn test_fetch_pool_bounds_wall_clock() {
    // 8 devices that all run into the per-device timeout, worker pool
    // of 4: two rounds of ~300ms each, nowhere near the serial 2.4s
    let port = spawn_silent_miner("127.0.0.1", 0).await;
    let mut addresses = vec![Ipv4Addr::new(127, 0, 0, 1)];
    for host in 2..=8u8 {
        spawn_silent_miner(&format!("127.0.0.{host}"), port).await;
        addresses.push(Ipv4Addr::new(127, 0, 0, host));
    }

    let store: Arc<dyn ReadingStore> = Arc::new(MemoryStore::new());

    let started = Instant::now();
    let results = fetch_all(&addresses, port, Duration::from_millis(300), 4, &store).await;
    let elapsed = started.elapsed();

    // nothing answered and nothing had history
    assert!(results.is_empty());

    assert!(
        elapsed >= Duration::from_millis(500),
        "finished suspiciously fast: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_millis(1500),
        "worker pool did not bound wall clock: {elapsed:?}"
    );
}

#[tokio::test]
async fn test_discovery_pool_smaller_than_host_count() {
    let port = spawn_miner(
        "127.0.0.5",
        0,
        healthy_summary_json(95_000.0, 60.0, 4000.0),
    )
    .await;

    // 14 hosts, 3 workers
    let network: Ipv4Cidr = "127.0.0.0/28".parse().unwrap();
    let found = discover(&network, port, Duration::from_millis(300), 3, false).await;

    assert_eq!(found.len(), 1);
    assert_eq!(
        found.get(&Ipv4Addr::new(127, 0, 0, 5)),
        Some(&DiscoverySource::Probe)
    );
}

#[tokio::test]
async fn test_handle_commands_are_serialized_not_lost() {
    let store = Arc::new(MemoryStore::new());
    for rule in default_rules() {
        store.upsert_rule(rule).await;
    }

    let handle = MonitorHandle::spawn(
        create_test_config("127.0.0.0/32", 4028),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        Arc::new(RecordingSink::new()),
    );

    // fire several evaluation requests concurrently; the actor services
    // them one at a time and none may be dropped
    let mut tasks = Vec::new();
    for _ in 0..4 {
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move { handle.evaluate_now().await }));
    }

    for task in tasks {
        assert!(task.await.unwrap().is_ok());
    }

    handle.shutdown().await.unwrap();
}
