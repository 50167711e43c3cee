use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub bind: String,
    #[serde(default = "default_listener_timeout")]
    pub read_timeout_ms: u64,
}

fn default_listener_timeout() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct BaratronConfig {
    pub address: String,
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HippoConfig {
    pub bind: String,
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub output_dir: PathBuf,
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,
    #[serde(default = "default_join_timeout")]
    pub join_timeout_ms: u64,
}

fn default_sample_interval() -> u64 {
    1000
}

fn default_join_timeout() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig { max_attempts: 1, initial_backoff_ms: 100, max_backoff_ms: 100 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClockConfig {
    /// Host queried over ssh for its wall clock. No remote snapshot when unset.
    pub daq_host: Option<String>,
    pub skew_warning_secs: i64,
    pub ssh_timeout_ms: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        ClockConfig { daq_host: None, skew_warning_secs: 10, ssh_timeout_ms: 5000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub listener: ListenerConfig,
    pub baratron: BaratronConfig,
    pub hippo: HippoConfig,
    pub session: SessionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub clock: ClockConfig,
}

impl AppConfig {
    pub fn load_default() -> anyhow::Result<Self> {
        let default = include_str!("../config/default.toml");
        let cfg: AppConfig = toml::from_str(default)?;
        Ok(cfg)
    }

    pub fn load_from(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let p = path.into();
        let s = fs::read_to_string(&p)?;
        let cfg: AppConfig = toml::from_str(&s)?;
        Ok(cfg)
    }
}

impl ListenerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl BaratronConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl HippoConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl SessionConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}
