// Pool defaults and environment override helpers.
use std::sync::OnceLock;
use std::time::Duration;
use tracing::warn;

pub(crate) const DEFAULT_MAX_PER_DESTINATION: usize = 4;
pub(crate) const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60_000;
pub(crate) const DEFAULT_SWEEP_INTERVAL_MS: u64 = 5_000;

/// Pool sizing and idle-eviction knobs.
///
/// Connections here are multiplexed, so `max_per_destination` bounds how
/// far load spreads per destination rather than limiting concurrency;
/// many exchanges share one connection.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on pooled connections per destination key.
    pub max_per_destination: usize,
    /// A connection with no in-flight exchanges for this long is evicted
    /// and destroyed by the sweep.
    pub idle_timeout: Duration,
    /// Cadence of the background idle sweep.
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_destination: DEFAULT_MAX_PER_DESTINATION,
            idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS),
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS),
        }
    }
}

impl PoolConfig {
    /// Defaults with `STRAND_*` environment overrides applied:
    /// `STRAND_MAX_CONNS_PER_DEST`, `STRAND_IDLE_TIMEOUT_MS`,
    /// `STRAND_SWEEP_INTERVAL_MS`.
    pub fn from_env() -> Self {
        Self {
            max_per_destination: env_parse(
                "STRAND_MAX_CONNS_PER_DEST",
                DEFAULT_MAX_PER_DESTINATION,
            )
            .max(1),
            idle_timeout: Duration::from_millis(env_parse(
                "STRAND_IDLE_TIMEOUT_MS",
                DEFAULT_IDLE_TIMEOUT_MS,
            )),
            sweep_interval: Duration::from_millis(
                env_parse("STRAND_SWEEP_INTERVAL_MS", DEFAULT_SWEEP_INTERVAL_MS).max(1),
            ),
        }
    }
}

/// Environment-derived config, resolved once per process.
pub(crate) fn runtime_pool_config() -> &'static PoolConfig {
    static RUNTIME: OnceLock<PoolConfig> = OnceLock::new();
    RUNTIME.get_or_init(PoolConfig::from_env)
}

fn env_parse<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => parse_override(name, &raw, default),
        Err(_) => default,
    }
}

fn parse_override<T: std::str::FromStr + Copy>(name: &str, raw: &str, default: T) -> T {
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(name, raw, "ignoring unparseable environment override");
            default
        }
    }
}
