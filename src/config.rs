//! Environment-driven configuration
//!
//! All knobs are read from the process environment; credentials are never
//! persisted alongside pool state.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Settings for the pool manager and its background loops
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Master gate: when false, selection returns nothing and no
    /// background activity or file I/O happens at all.
    pub use_proxies: bool,
    /// Provider name resolved through the provider factory
    pub provider: String,
    /// Snapshot file location
    pub cache_path: PathBuf,
    /// Minimum age of the pool before a provider re-fetch
    pub refresh_interval: Duration,
    /// How often the refresh loop wakes up to check staleness
    pub refresh_tick: Duration,
    /// Sleep after a failed provider fetch
    pub error_backoff: Duration,
    /// Pause between health check sweeps
    pub health_interval: Duration,
    /// Upper bound on concurrent validation probes per sweep
    pub health_concurrency: usize,
    /// Consecutive failures before a proxy is blacklisted
    pub blacklist_threshold: u32,
    /// Chance that a single report triggers a snapshot write
    pub save_probability: f64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            use_proxies: false,
            provider: "luminati".to_string(),
            cache_path: PathBuf::from("proxy_cache.json"),
            refresh_interval: Duration::from_secs(3600),
            refresh_tick: Duration::from_secs(300),
            error_backoff: Duration::from_secs(60),
            health_interval: Duration::from_secs(900),
            health_concurrency: 32,
            blacklist_threshold: 3,
            save_probability: 0.1,
        }
    }
}

impl PoolSettings {
    pub fn from_env() -> Self {
        Self {
            use_proxies: env_flag("USE_PROXIES"),
            provider: env::var("PROXY_SERVICE").unwrap_or_else(|_| "luminati".to_string()),
            cache_path: env::var("PROXY_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("proxy_cache.json")),
            ..Self::default()
        }
    }
}

/// Credentials and zone for the Luminati/Bright Data provider
#[derive(Debug, Clone, Default)]
pub struct LuminatiSettings {
    pub username: Option<String>,
    pub password: Option<String>,
    pub zone: Option<String>,
}

impl LuminatiSettings {
    pub fn from_env() -> Self {
        Self {
            username: env_nonempty("LUMINATI_USERNAME"),
            password: env_nonempty("LUMINATI_PASSWORD"),
            zone: env_nonempty("LUMINATI_ZONE"),
        }
    }
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on"))
        .unwrap_or(false)
}

fn env_nonempty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}
