use tracing::trace;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub evaluator: EvaluatorConfig,

    /// Seconds between monitoring cycles
    #[serde(default = "crate::util::get_default_poll_interval")]
    pub cycle_interval_secs: u64,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct DiscoveryConfig {
    /// IPv4 network to probe, CIDR notation (e.g. "192.168.1.0/24")
    pub network: String,

    /// Device API port probed on every host
    #[serde(default = "crate::util::get_default_api_port")]
    pub port: u16,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Size of the probe worker pool (not one task per host)
    #[serde(default = "default_probe_concurrency")]
    pub concurrency: usize,

    /// Also listen for service broadcasts for a short window
    #[serde(default)]
    pub use_broadcast: bool,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct FetchConfig {
    /// Per-device timeout for one summary/stats exchange
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,

    /// Size of the fan-out worker pool
    #[serde(default = "default_fetch_concurrency")]
    pub max_concurrency: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout_secs(),
            max_concurrency: default_fetch_concurrency(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct EvaluatorConfig {
    /// Default temperature limit (°C) when a temp rule carries no threshold
    #[serde(default = "default_temp_limit")]
    pub temp_limit_c: f64,

    /// Default fraction of baseline below which a hashrate rule fires
    #[serde(default = "default_hashrate_drop_fraction")]
    pub hashrate_drop_fraction: f64,

    /// Default cooldown between alerts for the same (rule, device)
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: i64,

    /// Samples used for the rolling hashrate baseline
    #[serde(default = "default_rolling_window_samples")]
    pub rolling_window_samples: usize,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            temp_limit_c: default_temp_limit(),
            hashrate_drop_fraction: default_hashrate_drop_fraction(),
            cooldown_minutes: default_cooldown_minutes(),
            rolling_window_samples: default_rolling_window_samples(),
        }
    }
}

fn default_probe_timeout_ms() -> u64 {
    800
}

fn default_probe_concurrency() -> usize {
    64
}

fn default_fetch_timeout_secs() -> u64 {
    5
}

fn default_fetch_concurrency() -> usize {
    16
}

fn default_temp_limit() -> f64 {
    80.0
}

fn default_hashrate_drop_fraction() -> f64 {
    0.9
}

fn default_cooldown_minutes() -> i64 {
    30
}

fn default_rolling_window_samples() -> usize {
    10
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|_| anyhow::anyhow!("Invalid configuration file provided!"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}
