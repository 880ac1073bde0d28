//! Fan-out fetcher
//!
//! Polls every discovered device concurrently through a fixed worker
//! pool. Per-device failures are isolated: a device that cannot be
//! reached live degrades to its last stored reading, and a device with
//! neither is simply omitted from the result. One unreachable device
//! can never fail the pass or starve the others - the pool is sized by
//! configuration, not by fleet size, and every exchange is bounded by
//! the per-device timeout.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, instrument, trace, warn};

use crate::protocol::MinerClient;
use crate::store::ReadingStore;
use crate::{DataSource, FetchedReading};

/// Fetch readings for all addresses, live where possible, falling back
/// to stored history otherwise.
///
/// Each returned entry records whether its data is live or a fallback,
/// so callers can report a degraded state per device.
#[instrument(skip_all, fields(devices = addresses.len()))]
pub async fn fetch_all(
    addresses: &[Ipv4Addr],
    port: u16,
    per_device_timeout: Duration,
    max_concurrency: usize,
    readings: &Arc<dyn ReadingStore>,
) -> HashMap<String, FetchedReading> {
    let concurrency = max_concurrency.clamp(1, addresses.len().max(1));

    // each worker owns every concurrency-th address
    let workers = (0..concurrency).map(|offset| {
        let chunk: Vec<Ipv4Addr> = addresses
            .iter()
            .copied()
            .skip(offset)
            .step_by(concurrency)
            .collect();
        let readings = readings.clone();

        async move {
            let mut fetched = Vec::new();
            for ip in chunk {
                if let Some(entry) =
                    fetch_one(ip, port, per_device_timeout, readings.as_ref()).await
                {
                    fetched.push(entry);
                }
            }
            fetched
        }
    });

    let results: HashMap<String, FetchedReading> =
        join_all(workers).await.into_iter().flatten().collect();

    debug!("fetched {} of {} devices", results.len(), addresses.len());
    results
}

async fn fetch_one(
    ip: Ipv4Addr,
    port: u16,
    per_device_timeout: Duration,
    readings: &dyn ReadingStore,
) -> Option<(String, FetchedReading)> {
    let client = MinerClient::new(ip, port, per_device_timeout);
    let device_id = client.device_id();

    match client.fetch_reading().await {
        Ok(reading) => {
            trace!("{device_id}: live reading ({:.1} TH/s)", reading.hashrate_ths);
            Some((
                device_id,
                FetchedReading {
                    reading,
                    source: DataSource::Live,
                },
            ))
        }
        Err(e) => {
            debug!("{device_id}: live fetch failed ({e}), trying last known reading");
            match readings.latest_reading(&device_id).await {
                Ok(Some(reading)) => Some((
                    device_id,
                    FetchedReading {
                        reading,
                        source: DataSource::Fallback,
                    },
                )),
                Ok(None) => {
                    debug!("{device_id}: no stored reading either, omitting");
                    None
                }
                Err(e) => {
                    warn!("{device_id}: fallback lookup failed: {e}");
                    None
                }
            }
        }
    }
}
