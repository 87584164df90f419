//! Configuration parsing for the BTS feed.
//!
//! All components read their settings from a single JSON config file. Every
//! section is optional; `effective_*()` helpers supply the defaults.
//!
//! # Example config
//!
//! ```json
//! {
//!   "BtsFeed": { "module_name": "bts-feed", "log_path": "/tmp/log" },
//!   "server": { "bind": "0.0.0.0:8765", "ping_interval_sec": 20 },
//!   "cadence": { "fast_interval_sec": 5, "slow_interval_sec": 60 },
//!   "broadcast": {
//!     "idle_interval_sec": 5,
//!     "classes": {
//!       "dashboard": { "enabled": true, "interval_sec": 5, "keys": ["*"] },
//!       "screening": { "enabled": false, "interval_sec": 60 }
//!     }
//!   },
//!   "rate_limits": { "coingecko": { "max_requests": 30, "window_sec": 60, "min_interval_ms": 2000 } },
//!   "sources": [
//!     { "source": "upbit", "min_interval_sec": 6 },
//!     { "source": "coingecko_global", "validators": { "global.ethDominance": { "rule": "always" } } }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::BtsError;
use crate::guard::ValidityRule;

/// Background intervals an operator may choose from, in seconds.
pub const DEFAULT_ALLOWED_SLOW_INTERVALS_SEC: [u64; 7] = [10, 30, 60, 300, 600, 1200, 1800];

/// Top-level application config, deserialized from a JSON file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// Module metadata (name, log path).
    #[serde(rename = "BtsFeed")]
    pub meta: Option<ModuleMeta>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub cadence: CadenceConfig,

    #[serde(default)]
    pub broadcast: BroadcastConfig,

    /// Rate-limit groups by name; merged over the built-in defaults.
    #[serde(default)]
    pub rate_limits: BTreeMap<String, RateLimitConfig>,

    /// One entry per data source.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

/// Module metadata block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModuleMeta {
    pub module_name: Option<String>,
    pub log_path: Option<String>,
    /// Write the log file as JSON lines.
    pub log_json: Option<bool>,
}

impl AppConfig {
    /// Returns the module name, defaulting to `"bts-feed"`.
    pub fn module_name(&self) -> String {
        self.meta
            .as_ref()
            .and_then(|m| m.module_name.clone())
            .unwrap_or_else(|| "bts-feed".into())
    }

    /// Returns the log path.
    pub fn log_path(&self) -> Option<String> {
        self.meta.as_ref().and_then(|m| m.log_path.clone())
    }

    pub fn log_json(&self) -> bool {
        self.meta.as_ref().and_then(|m| m.log_json).unwrap_or(false)
    }

    /// Built-in rate-limit groups overlaid with the configured ones.
    pub fn effective_rate_limits(&self) -> BTreeMap<String, RateLimitConfig> {
        let mut groups = default_rate_limits();
        groups.extend(self.rate_limits.iter().map(|(k, v)| (k.clone(), v.clone())));
        groups
    }

    /// Sources to run: the configured list, or every built-in source when
    /// the list is empty.
    pub fn effective_sources(&self) -> Vec<SourceConfig> {
        if self.sources.is_empty() {
            return ["upbit", "fx", "coingecko_global", "coingecko_markets"]
                .into_iter()
                .map(SourceConfig::named)
                .collect();
        }
        self.sources.clone()
    }

    /// Cross-field checks that serde cannot express.
    pub fn validate(&self) -> Result<(), BtsError> {
        let allowed = self.cadence.effective_allowed_slow_intervals_sec();
        let slow = self.cadence.effective_slow_interval_sec();
        if !allowed.contains(&slow) {
            return Err(BtsError::Config(format!(
                "cadence.slow_interval_sec {slow} is not one of {allowed:?}"
            )));
        }
        if self.cadence.effective_fast_interval_sec() == 0 {
            return Err(BtsError::Config(
                "cadence.fast_interval_sec must be greater than zero".into(),
            ));
        }

        let groups = self.effective_rate_limits();
        for (name, group) in &groups {
            if group.max_requests == 0 || group.window_sec == 0 {
                return Err(BtsError::Config(format!(
                    "rate_limits.{name}: max_requests and window_sec must be > 0"
                )));
            }
        }
        for source in self.effective_sources() {
            if let Some(group) = &source.rate_group {
                if !groups.contains_key(group) {
                    return Err(BtsError::Config(format!(
                        "source '{}' references unknown rate group '{group}'",
                        source.label()
                    )));
                }
            }
        }

        let bind = self.server.effective_bind();
        bind.parse::<std::net::SocketAddr>()
            .map_err(|e| BtsError::Config(format!("server.bind '{bind}': {e}")))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// HTTP/WebSocket server settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    /// Listen address (default `0.0.0.0:8765`).
    pub bind: Option<String>,
    /// WebSocket ping interval in seconds (default 20).
    pub ping_interval_sec: Option<u64>,
    /// Bounded push queue depth per connection (default 16).
    pub queue_depth: Option<usize>,
}

impl ServerConfig {
    pub fn effective_bind(&self) -> String {
        self.bind.clone().unwrap_or_else(|| "0.0.0.0:8765".into())
    }

    pub fn effective_ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_sec.unwrap_or(20))
    }

    pub fn effective_queue_depth(&self) -> usize {
        self.queue_depth.unwrap_or(crate::registry::DEFAULT_QUEUE_DEPTH)
    }
}

// ---------------------------------------------------------------------------
// Cadence
// ---------------------------------------------------------------------------

/// Collector cadence: fast while the interactive class is connected, slow
/// otherwise.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CadenceConfig {
    /// Class whose presence selects the fast interval (default `dashboard`).
    pub interactive_class: Option<String>,
    pub fast_interval_sec: Option<u64>,
    /// Must be one of `allowed_slow_intervals_sec`.
    pub slow_interval_sec: Option<u64>,
    pub allowed_slow_intervals_sec: Option<Vec<u64>>,
}

impl CadenceConfig {
    pub fn effective_interactive_class(&self) -> String {
        self.interactive_class.clone().unwrap_or_else(|| "dashboard".into())
    }

    pub fn effective_fast_interval_sec(&self) -> u64 {
        self.fast_interval_sec.unwrap_or(5)
    }

    pub fn effective_slow_interval_sec(&self) -> u64 {
        self.slow_interval_sec.unwrap_or(60)
    }

    pub fn effective_allowed_slow_intervals_sec(&self) -> Vec<u64> {
        self.allowed_slow_intervals_sec
            .clone()
            .unwrap_or_else(|| DEFAULT_ALLOWED_SLOW_INTERVALS_SEC.to_vec())
    }
}

// ---------------------------------------------------------------------------
// Broadcast
// ---------------------------------------------------------------------------

/// Broadcaster settings and per-class policies.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BroadcastConfig {
    /// Sleep while no enabled class has a connection (default 5).
    pub idle_interval_sec: Option<u64>,
    /// Class name → policy. Replaces the defaults entirely when present.
    pub classes: Option<BTreeMap<String, ClassPolicyConfig>>,
}

/// Broadcast policy of one subscriber class.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClassPolicyConfig {
    pub enabled: bool,
    pub interval_sec: u64,
    /// Metric selectors; defaults to `["*"]`.
    pub keys: Option<Vec<String>>,
}

impl ClassPolicyConfig {
    fn new(enabled: bool, interval_sec: u64) -> Self {
        Self {
            enabled,
            interval_sec,
            keys: None,
        }
    }

    pub fn effective_keys(&self) -> Vec<String> {
        self.keys.clone().unwrap_or_else(|| vec!["*".into()])
    }
}

impl BroadcastConfig {
    pub fn effective_idle_interval(&self) -> Duration {
        Duration::from_secs(self.idle_interval_sec.unwrap_or(5))
    }

    pub fn effective_classes(&self) -> BTreeMap<String, ClassPolicyConfig> {
        self.classes.clone().unwrap_or_else(|| {
            BTreeMap::from([
                ("dashboard".into(), ClassPolicyConfig::new(true, 5)),
                ("screening".into(), ClassPolicyConfig::new(false, 60)),
                ("filtering".into(), ClassPolicyConfig::new(false, 60)),
                ("portfolio".into(), ClassPolicyConfig::new(false, 30)),
                ("setting".into(), ClassPolicyConfig::new(false, 0)),
                ("unknown".into(), ClassPolicyConfig::new(false, 0)),
            ])
        })
    }
}

// ---------------------------------------------------------------------------
// Rate limits
// ---------------------------------------------------------------------------

/// Request budget of one upstream rate-limit group.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per window.
    pub max_requests: u32,
    pub window_sec: u64,
    /// Minimum spacing between two requests (default 0).
    pub min_interval_ms: Option<u64>,
    /// Longest a caller blocks waiting for budget (default 10000).
    pub max_wait_ms: Option<u64>,
    /// Cool-down after an upstream 429 (default 60).
    pub cooldown_sec: Option<u64>,
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window_sec: u64, min_interval_ms: u64) -> Self {
        Self {
            max_requests,
            window_sec,
            min_interval_ms: Some(min_interval_ms),
            max_wait_ms: None,
            cooldown_sec: None,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_sec)
    }

    pub fn effective_min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms.unwrap_or(0))
    }

    pub fn effective_max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms.unwrap_or(10_000))
    }

    pub fn effective_cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_sec.unwrap_or(60))
    }
}

fn default_rate_limits() -> BTreeMap<String, RateLimitConfig> {
    BTreeMap::from([
        ("coingecko".into(), RateLimitConfig::new(30, 60, 2_000)),
        ("upbit".into(), RateLimitConfig::new(100, 60, 600)),
        ("currency_api".into(), RateLimitConfig::new(100, 3_600, 0)),
    ])
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// One data source instance.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceConfig {
    /// Source kind: `"upbit"`, `"fx"`, `"coingecko_global"`, `"coingecko_markets"`.
    pub source: String,
    /// Instance label used in logs (defaults to the kind).
    pub label: Option<String>,
    pub enabled: Option<bool>,
    /// Rate-limit group (defaults per kind).
    pub rate_group: Option<String>,
    /// HTTP timeout in seconds (defaults per kind).
    pub timeout_sec: Option<u64>,
    /// Safe minimum polling interval in seconds (defaults per kind).
    pub min_interval_sec: Option<u64>,
    /// Override of the upstream base URL.
    pub base_url: Option<String>,
    /// Number of ranked entries (coin lists only).
    pub limit: Option<u32>,
    /// Per-key validity rules overriding the source defaults.
    pub validators: Option<BTreeMap<String, ValidityRule>>,
}

impl SourceConfig {
    pub fn named(kind: &str) -> Self {
        Self {
            source: kind.to_string(),
            ..Default::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn label(&self) -> String {
        self.label.clone().unwrap_or_else(|| self.source.clone())
    }

    /// Configured rule for `key`, if any.
    pub fn validator_for(&self, key: &str) -> Option<&ValidityRule> {
        self.validators.as_ref().and_then(|v| v.get(key))
    }
}

/// Load and parse a JSON config file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_json::from_str(&content)?;
    config.validate()?;
    Ok(config)
}
