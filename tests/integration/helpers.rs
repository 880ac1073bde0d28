//! Helper functions for integration tests

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use minerwatch::Reading;
use minerwatch::alerts::Alert;
use minerwatch::config::{Config, DiscoveryConfig, EvaluatorConfig, FetchConfig};
use minerwatch::notify::NotificationSink;
use minerwatch::rules::Rule;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub fn create_test_config(network: &str, port: u16) -> Config {
    Config {
        discovery: DiscoveryConfig {
            network: network.to_string(),
            port,
            probe_timeout_ms: 300,
            concurrency: 16,
            use_broadcast: false,
        },
        fetch: FetchConfig {
            timeout_secs: 1,
            max_concurrency: 8,
        },
        evaluator: EvaluatorConfig::default(),
        // keep the interval timer out of the way; tests drive cycles
        // through the handle
        cycle_interval_secs: 3600,
    }
}

/// Mock miner that serves `response` to every connection until dropped.
///
/// Pass `port: 0` to get an ephemeral port; pass a concrete port to put
/// a second miner on another loopback address of the same port.
pub async fn spawn_miner(ip: &str, port: u16, response: String) -> u16 {
    let listener = TcpListener::bind((ip, port)).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let response = response.clone();
            tokio::spawn(async move {
                let mut cmd = [0u8; 64];
                let _ = socket.read(&mut cmd).await;
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    });

    port
}

/// Mock miner that accepts connections but never says anything, so
/// every exchange runs into the client timeout.
pub async fn spawn_silent_miner(ip: &str, port: u16) -> u16 {
    let listener = TcpListener::bind((ip, port)).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            // keep the socket open without responding
            held.push(socket);
        }
    });

    port
}

/// A healthy cgminer-style response: summary, status epoch, and stats
/// in one payload (the normalizer picks the sections it needs).
pub fn healthy_summary_json(ghs_5s: f64, temp_c: f64, fan_rpm: f64) -> String {
    serde_json::json!({
        "STATUS": [{"STATUS": "S", "When": Utc::now().timestamp()}],
        "SUMMARY": [{"GHS 5s": ghs_5s, "Elapsed": 86400}],
        "STATS": [{"temp1": temp_c, "temp2": temp_c, "fan1": fan_rpm, "fan2": fan_rpm}],
    })
    .to_string()
}

pub fn stale_reading(device_id: &str, minutes_old: i64, ths: f64, temp_c: f64) -> Reading {
    Reading {
        device_id: device_id.to_string(),
        timestamp: Utc::now() - chrono::Duration::minutes(minutes_old),
        hashrate_ths: ths,
        power_w: 0.0,
        avg_temp_c: temp_c,
        avg_fan_rpm: 4000.0,
        elapsed_s: 86400,
        model: String::new(),
    }
}

/// Notification sink that records what it was handed.
pub struct RecordingSink {
    notified: Mutex<Vec<(i64, String)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            notified: Mutex::new(Vec::new()),
        }
    }

    pub fn count(&self) -> usize {
        self.notified.lock().unwrap().len()
    }

    pub fn events(&self) -> Vec<(i64, String)> {
        self.notified.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(&self, alert: &Alert, rule: &Rule) {
        self.notified
            .lock()
            .unwrap()
            .push((rule.id, alert.device_id.clone()));
    }
}
