use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Scheduling constants shared by the library defaults and the config layer.
pub const DEFAULT_TICK_SECS: u64 = 1; // tick dispatcher polling cadence
pub const DEFAULT_REFRESH_TICKS: u32 = 10; // cache resync every N ticks
pub const DEFAULT_LOOKAHEAD_TICKS: u32 = 10; // claim window = N × tick
pub const DEFAULT_WORKERS: usize = 4; // worker pool slots
pub const DEFAULT_AUTO_UPDATE_SECS: u64 = 30; // alarm re-resolution fallback
pub const DEFAULT_MIN_ALARM_DELAY_MS: u64 = 100; // floor for timer arming

/// Top-level config (chime.toml + CHIME_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChimeConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Dispatch engine tuning. Every field has a safe default; most deployments
/// never set any of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Tick dispatcher polling interval in seconds.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// The due-soon cache is resynchronized with the store every N ticks.
    #[serde(default = "default_refresh_ticks")]
    pub refresh_ticks: u32,
    /// Claim window, expressed as a multiple of the tick interval.
    #[serde(default = "default_lookahead_ticks")]
    pub lookahead_ticks: u32,
    /// Worker pool size for the tick dispatcher.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Alarm dispatcher auto-update interval in seconds.
    #[serde(default = "default_auto_update_secs")]
    pub auto_update_secs: u64,
    /// Minimum delay before an armed alarm timer may fire, in milliseconds.
    #[serde(default = "default_min_alarm_delay_ms")]
    pub min_alarm_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: DEFAULT_TICK_SECS,
            refresh_ticks: DEFAULT_REFRESH_TICKS,
            lookahead_ticks: DEFAULT_LOOKAHEAD_TICKS,
            workers: DEFAULT_WORKERS,
            auto_update_secs: DEFAULT_AUTO_UPDATE_SECS,
            min_alarm_delay_ms: DEFAULT_MIN_ALARM_DELAY_MS,
        }
    }
}

impl ChimeConfig {
    /// Load config from a TOML file with CHIME_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.chime/chime.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: ChimeConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CHIME_").split("_"))
            .extract()
            .map_err(|e| crate::error::ChimeError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_tick_secs() -> u64 {
    DEFAULT_TICK_SECS
}
fn default_refresh_ticks() -> u32 {
    DEFAULT_REFRESH_TICKS
}
fn default_lookahead_ticks() -> u32 {
    DEFAULT_LOOKAHEAD_TICKS
}
fn default_workers() -> usize {
    DEFAULT_WORKERS
}
fn default_auto_update_secs() -> u64 {
    DEFAULT_AUTO_UPDATE_SECS
}
fn default_min_alarm_delay_ms() -> u64 {
    DEFAULT_MIN_ALARM_DELAY_MS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.chime/chime.db", home)
}
fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.chime/chime.toml", home)
}
