//! Device discovery
//!
//! Candidate devices are found two ways:
//!
//! 1. **Port probe**: every host in the configured IPv4 network is
//!    probed for an open device API port through a fixed-size worker
//!    pool. A refused or timed-out probe means "absent" - it is never
//!    an error.
//! 2. **Service broadcast** (optional): a query datagram is sent to the
//!    subnet broadcast address and replies carrying the service name
//!    are collected for a short fixed window.
//!
//! The result is the union of both, tagged with where each address was
//! seen.

use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use futures::future::join_all;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{Instant, timeout};
use tracing::{debug, instrument, trace, warn};

/// How long the broadcast listener stays open
const BROADCAST_WINDOW: Duration = Duration::from_secs(2);

/// Service name expected in broadcast replies (cgminer-style APIs
/// answer a "<name>-" query with "<name>-APIPORT=...")
const SERVICE_NAME: &str = "cgminer";

/// An IPv4 network in CIDR notation.
///
/// Host bits are masked off on construction, so "192.168.1.5/24"
/// normalizes to "192.168.1.0/24".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    network: Ipv4Addr,
    prefix: u8,
}

#[derive(Debug)]
pub struct ParseCidrError(String);

impl fmt::Display for ParseCidrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid CIDR network: {}", self.0)
    }
}

impl std::error::Error for ParseCidrError {}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, ParseCidrError> {
        if prefix > 32 {
            return Err(ParseCidrError(format!("prefix /{prefix} out of range")));
        }
        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        Ok(Self {
            network: Ipv4Addr::from(u32::from(addr) & mask),
            prefix,
        })
    }

    /// All usable host addresses. Network and broadcast addresses are
    /// excluded for prefixes below /31; /31 and /32 yield every address
    /// (RFC 3021 point-to-point).
    pub fn hosts(&self) -> Vec<Ipv4Addr> {
        let base = u32::from(self.network) as u64;
        let size = 1u64 << (32 - self.prefix);

        let range = if self.prefix >= 31 {
            0..size
        } else {
            1..size - 1
        };

        range.map(|offset| Ipv4Addr::from((base + offset) as u32)).collect()
    }

    /// Directed broadcast address of this network.
    pub fn broadcast(&self) -> Ipv4Addr {
        let size = 1u64 << (32 - self.prefix);
        Ipv4Addr::from((u32::from(self.network) as u64 + size - 1) as u32)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = ParseCidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| ParseCidrError(format!("'{s}' is missing a /prefix")))?;

        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| ParseCidrError(format!("'{addr}' is not an IPv4 address")))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| ParseCidrError(format!("'{prefix}' is not a prefix length")))?;

        Self::new(addr, prefix)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Where a discovered address was seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverySource {
    Probe,
    Broadcast,
    Both,
}

/// Find candidate devices on the given network.
///
/// Probing uses a pool of `concurrency` workers, not one task per
/// host, so a /16 cannot spawn 65k connects at once.
#[instrument(skip_all, fields(network = %network))]
pub async fn discover(
    network: &Ipv4Cidr,
    port: u16,
    probe_timeout: Duration,
    concurrency: usize,
    use_broadcast: bool,
) -> HashMap<Ipv4Addr, DiscoverySource> {
    let hosts = network.hosts();
    debug!(
        "probing {} hosts on port {port} with {concurrency} workers",
        hosts.len()
    );

    let mut found: HashMap<Ipv4Addr, DiscoverySource> =
        probe_hosts(&hosts, port, probe_timeout, concurrency)
            .await
            .into_iter()
            .map(|ip| (ip, DiscoverySource::Probe))
            .collect();

    if use_broadcast {
        for ip in listen_for_broadcast(network.broadcast(), port).await {
            found
                .entry(ip)
                .and_modify(|source| *source = DiscoverySource::Both)
                .or_insert(DiscoverySource::Broadcast);
        }
    }

    debug!("discovered {} devices", found.len());
    found
}

async fn probe_hosts(
    hosts: &[Ipv4Addr],
    port: u16,
    probe_timeout: Duration,
    concurrency: usize,
) -> Vec<Ipv4Addr> {
    let concurrency = concurrency.clamp(1, hosts.len().max(1));

    // each worker owns every concurrency-th host
    let workers = (0..concurrency).map(|offset| {
        let chunk: Vec<Ipv4Addr> = hosts
            .iter()
            .copied()
            .skip(offset)
            .step_by(concurrency)
            .collect();

        async move {
            let mut open = Vec::new();
            for ip in chunk {
                if probe_one(ip, port, probe_timeout).await {
                    open.push(ip);
                }
            }
            open
        }
    });

    join_all(workers).await.into_iter().flatten().collect()
}

async fn probe_one(ip: Ipv4Addr, port: u16, probe_timeout: Duration) -> bool {
    let addr = SocketAddr::from((ip, port));
    match timeout(probe_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => {
            trace!("{ip}: port {port} open");
            true
        }
        // refused or timed out - the host is simply absent
        _ => false,
    }
}

async fn listen_for_broadcast(broadcast_addr: Ipv4Addr, port: u16) -> Vec<Ipv4Addr> {
    let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("failed to bind broadcast socket: {e}");
            return Vec::new();
        }
    };

    if let Err(e) = socket.set_broadcast(true) {
        warn!("failed to enable broadcast: {e}");
        return Vec::new();
    }

    // solicit replies; unsolicited announcements within the window are
    // accepted too
    let query = format!("{SERVICE_NAME}-");
    if let Err(e) = socket.send_to(query.as_bytes(), (broadcast_addr, port)).await {
        warn!("failed to send discovery query: {e}");
    }

    let deadline = Instant::now() + BROADCAST_WINDOW;
    let mut buf = [0u8; 1024];
    let mut found = Vec::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        match timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, SocketAddr::V4(peer)))) => {
                let payload = String::from_utf8_lossy(&buf[..len]);
                if payload.contains(SERVICE_NAME) {
                    trace!("{}: service broadcast reply", peer.ip());
                    found.push(*peer.ip());
                }
            }
            Ok(Ok(_)) => {} // non-IPv4 peer, ignore
            Ok(Err(e)) => {
                warn!("broadcast receive error: {e}");
                break;
            }
            Err(_) => break, // window elapsed
        }
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_cidr_parse_and_display() {
        let cidr: Ipv4Cidr = "192.168.1.0/24".parse().unwrap();
        assert_eq!(cidr.to_string(), "192.168.1.0/24");
    }

    #[test]
    fn test_cidr_masks_host_bits() {
        let cidr: Ipv4Cidr = "192.168.1.57/24".parse().unwrap();
        assert_eq!(cidr.to_string(), "192.168.1.0/24");
    }

    #[test]
    fn test_cidr_rejects_garbage() {
        assert!("192.168.1.0".parse::<Ipv4Cidr>().is_err());
        assert!("192.168.1.0/33".parse::<Ipv4Cidr>().is_err());
        assert!("not-an-ip/24".parse::<Ipv4Cidr>().is_err());
    }

    #[test]
    fn test_hosts_excludes_network_and_broadcast() {
        let cidr: Ipv4Cidr = "192.168.1.0/24".parse().unwrap();
        let hosts = cidr.hosts();

        assert_eq!(hosts.len(), 254);
        assert_eq!(hosts[0], Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(hosts[253], Ipv4Addr::new(192, 168, 1, 254));
        assert_eq!(cidr.broadcast(), Ipv4Addr::new(192, 168, 1, 255));
    }

    #[test]
    fn test_small_prefixes() {
        let cidr: Ipv4Cidr = "10.0.0.0/30".parse().unwrap();
        assert_eq!(
            cidr.hosts(),
            vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]
        );

        // RFC 3021: /31 has no network/broadcast addresses
        let cidr: Ipv4Cidr = "10.0.0.0/31".parse().unwrap();
        assert_eq!(
            cidr.hosts(),
            vec![Ipv4Addr::new(10, 0, 0, 0), Ipv4Addr::new(10, 0, 0, 1)]
        );

        let cidr: Ipv4Cidr = "10.0.0.7/32".parse().unwrap();
        assert_eq!(cidr.hosts(), vec![Ipv4Addr::new(10, 0, 0, 7)]);
    }

    #[tokio::test]
    async fn test_probe_finds_listening_host() {
        // loopback allows binding any 127.0.0.0/8 address on Linux
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let network: Ipv4Cidr = "127.0.0.0/30".parse().unwrap();
        let found = discover(
            &network,
            port,
            Duration::from_millis(500),
            8,
            false,
        )
        .await;

        assert_eq!(found.len(), 1);
        assert_eq!(
            found.get(&Ipv4Addr::new(127, 0, 0, 1)),
            Some(&DiscoverySource::Probe)
        );
    }

    #[tokio::test]
    async fn test_probe_empty_network_finds_nothing() {
        // bind-then-drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let network: Ipv4Cidr = "127.0.0.0/30".parse().unwrap();
        let found = discover(&network, port, Duration::from_millis(200), 2, false).await;

        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_single_worker_probes_every_host() {
        let listener = TcpListener::bind("127.0.0.2:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let network: Ipv4Cidr = "127.0.0.0/29".parse().unwrap();
        let found = discover(&network, port, Duration::from_millis(500), 1, false).await;

        assert_eq!(
            found.get(&Ipv4Addr::new(127, 0, 0, 2)),
            Some(&DiscoverySource::Probe)
        );
    }
}
