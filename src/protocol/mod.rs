//! Device API client
//!
//! Miners speak a line-oriented JSON-over-TCP protocol (cgminer/bmminer
//! style, default port 4028): one command keyword plus a newline per
//! connection, one JSON object back, then the device closes the socket.
//! Field names vary wildly between vendors and firmware versions, so
//! responses are handled as raw JSON and normalized separately.

pub mod normalize;

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{instrument, trace};

use crate::Reading;

pub use normalize::normalize;

/// Errors talking to one device. All of them are recoverable: the
/// fetcher reacts by falling back to stored data.
#[derive(Debug)]
pub enum ProtocolError {
    /// Connection refused or otherwise failed
    Connect(String),

    /// Connect, send, or receive exceeded the configured timeout
    Timeout,

    /// I/O error mid-exchange
    IoError(std::io::Error),

    /// The response contained no parseable JSON object
    Malformed(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Connect(msg) => write!(f, "failed to connect to device: {}", msg),
            ProtocolError::Timeout => write!(f, "device did not respond within timeout"),
            ProtocolError::IoError(err) => write!(f, "I/O error: {}", err),
            ProtocolError::Malformed(snippet) => {
                write!(f, "unable to parse device response: {}", snippet)
            }
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProtocolError::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        ProtocolError::IoError(err)
    }
}

/// Client for one device. Cheap to construct; every command opens its
/// own connection because the device closes the socket after each
/// response.
#[derive(Debug, Clone)]
pub struct MinerClient {
    ip: Ipv4Addr,
    port: u16,
    timeout: Duration,
}

impl MinerClient {
    pub fn new(ip: Ipv4Addr, port: u16, timeout: Duration) -> Self {
        Self { ip, port, timeout }
    }

    pub fn device_id(&self) -> String {
        self.ip.to_string()
    }

    /// Send one command and parse the JSON object out of the reply.
    ///
    /// Connect, send, and receive are each bounded by the configured
    /// timeout. bmminer pads replies with NULs, and some firmwares
    /// prepend banners, so the reply is split on newlines/NULs and the
    /// first valid JSON object wins.
    #[instrument(skip(self), fields(device = %self.ip))]
    pub async fn send_command(&self, cmd: &str) -> Result<Value, ProtocolError> {
        let addr = SocketAddr::from((self.ip, self.port));

        let mut stream = timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ProtocolError::Timeout)?
            .map_err(|e| ProtocolError::Connect(e.to_string()))?;

        let payload = format!("{}\n", cmd.trim());
        timeout(self.timeout, stream.write_all(payload.as_bytes()))
            .await
            .map_err(|_| ProtocolError::Timeout)??;

        let mut raw = Vec::new();
        timeout(self.timeout, stream.read_to_end(&mut raw))
            .await
            .map_err(|_| ProtocolError::Timeout)??;

        trace!("received {} bytes", raw.len());

        parse_response(&raw)
    }

    pub async fn summary(&self) -> Result<Value, ProtocolError> {
        self.send_command("summary").await
    }

    pub async fn stats(&self) -> Result<Value, ProtocolError> {
        self.send_command("stats").await
    }

    pub async fn pools(&self) -> Result<Value, ProtocolError> {
        self.send_command("pools").await
    }

    pub async fn version(&self) -> Result<Value, ProtocolError> {
        self.send_command("version").await
    }

    /// Fetch and normalize one reading.
    ///
    /// The summary is mandatory; stats and version are best-effort
    /// (many firmwares answer summary but choke on the others), so
    /// their failures degrade to empty objects.
    #[instrument(skip(self), fields(device = %self.ip))]
    pub async fn fetch_reading(&self) -> Result<Reading, ProtocolError> {
        let summary = self.summary().await?;
        let stats = self
            .stats()
            .await
            .unwrap_or_else(|_| Value::Object(Map::new()));
        let version = self
            .version()
            .await
            .unwrap_or_else(|_| Value::Object(Map::new()));

        Ok(normalize(
            &self.device_id(),
            &summary,
            &stats,
            &version,
            Utc::now(),
        ))
    }
}

fn parse_response(raw: &[u8]) -> Result<Value, ProtocolError> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());

    for line in text.replace('\0', "\n").lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(line)
            && value.is_object()
        {
            return Ok(value);
        }
    }

    Err(ProtocolError::Malformed(text.chars().take(200).collect()))
}
