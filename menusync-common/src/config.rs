//! Configuration loading
//!
//! Resolution follows a fixed priority order (highest first):
//! 1. Command-line flags (applied by the binary after loading)
//! 2. Environment variables (`MENUSYNC_*`)
//! 3. TOML config file
//! 4. Compiled defaults
//!
//! A missing config file is not an error: a warning is logged and the
//! compiled defaults are used. A malformed file or an out-of-range value is.

use crate::time::millis_to_duration;
use crate::{Backend, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Prefix shared by every recognized environment variable
pub const ENV_PREFIX: &str = "MENUSYNC_";

/// Idle budget per pipeline stage
///
/// Later stages are slower, so each stage has its own budget; stages without
/// an entry use `default_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTimeouts {
    pub stage1_ms: u64,
    pub stage2_ms: u64,
    pub stage3_ms: u64,
    pub stage4_ms: u64,
    pub default_ms: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            stage1_ms: 60_000,
            stage2_ms: 90_000,
            stage3_ms: 120_000,
            stage4_ms: 300_000,
            default_ms: 120_000,
        }
    }
}

impl StageTimeouts {
    /// Same budget for every stage (handy in tests)
    pub fn uniform(ms: u64) -> Self {
        Self {
            stage1_ms: ms,
            stage2_ms: ms,
            stage3_ms: ms,
            stage4_ms: ms,
            default_ms: ms,
        }
    }

    /// Idle budget for `stage`
    pub fn for_stage(&self, stage: u8) -> Duration {
        let ms = match stage {
            1 => self.stage1_ms,
            2 => self.stage2_ms,
            3 => self.stage3_ms,
            4 => self.stage4_ms,
            _ => self.default_ms,
        };
        millis_to_duration(ms)
    }
}

/// Tuning for category-to-image name matching
///
/// Policy is fixed (exact > substring > prefix); only the thresholds move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageMatchConfig {
    /// Shortest contained name (in chars) accepted as a substring match
    pub min_substring_len: usize,
    /// Minimum shorter/longer length ratio for a substring match
    pub min_overlap_ratio: f64,
    /// Shortest shared prefix (in chars) accepted as a prefix match
    pub min_prefix_len: usize,
}

impl Default for ImageMatchConfig {
    fn default() -> Self {
        Self {
            min_substring_len: 3,
            min_overlap_ratio: 0.5,
            min_prefix_len: 5,
        }
    }
}

/// Logging section of the TOML file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Optional log file path
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Complete client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Pipeline service base URL (no trailing path)
    pub base_url: String,
    /// API version segment, e.g. `v1`
    pub api_version: String,
    pub stage_timeouts: StageTimeouts,
    /// Stages whose idle timeout may be soft-recovered from partial data
    pub soft_timeout_stages: Vec<u8>,
    /// Reconnect attempts before a transport failure becomes fatal
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    /// Deadline for single request/response calls
    pub request_timeout_ms: u64,
    /// Consecutive primary failures that raise a warning; twice this pins
    /// the secondary backend
    pub fallback_error_threshold: u32,
    pub health_poll_interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Percentage (0-100) of sessions that prefer the durable backend
    pub durable_rollout_percent: u8,
    pub primary_backend: Backend,
    /// How long a finished session stays attached before eviction
    pub completion_grace_ms: u64,
    pub image_match: ImageMatchConfig,
    pub image_cache_ttl_secs: u64,
    pub image_cache_capacity: usize,
    pub event_bus_capacity: usize,
    pub logging: LoggingConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            api_version: "v1".to_string(),
            stage_timeouts: StageTimeouts::default(),
            soft_timeout_stages: vec![4],
            reconnect_attempts: 3,
            reconnect_delay_ms: 2_000,
            request_timeout_ms: 30_000,
            fallback_error_threshold: 3,
            health_poll_interval_ms: 30_000,
            probe_timeout_ms: 5_000,
            durable_rollout_percent: 0,
            primary_backend: Backend::Ephemeral,
            completion_grace_ms: 30_000,
            image_match: ImageMatchConfig::default(),
            image_cache_ttl_secs: 3_600,
            image_cache_capacity: 512,
            event_bus_capacity: 256,
            logging: LoggingConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from TOML (explicit path or platform default),
    /// then overlay environment variables and validate.
    ///
    /// An explicit `path` that does not exist is an error; a missing default
    /// file only logs a warning.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                if !p.exists() {
                    return Err(Error::Config(format!(
                        "Config file not found: {}",
                        p.display()
                    )));
                }
                Self::from_toml_file(p)?
            }
            None => match default_config_path() {
                Some(p) if p.exists() => Self::from_toml_file(&p)?,
                Some(p) => {
                    warn!(
                        "No config file at {}, using compiled defaults",
                        p.display()
                    );
                    Self::default()
                }
                None => {
                    warn!("Could not determine config directory, using compiled defaults");
                    Self::default()
                }
            },
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file; absent keys keep their defaults
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read TOML failed: {}", e)))?;
        let config = Self::from_toml_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Parse TOML text; absent keys keep their defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
    }

    /// Overlay recognized `MENUSYNC_*` environment variables.
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("MENUSYNC_BASE_URL") {
            self.base_url = v;
        }
        if let Ok(v) = std::env::var("MENUSYNC_API_VERSION") {
            self.api_version = v;
        }
        env_parse("MENUSYNC_STAGE1_TIMEOUT_MS", &mut self.stage_timeouts.stage1_ms);
        env_parse("MENUSYNC_STAGE2_TIMEOUT_MS", &mut self.stage_timeouts.stage2_ms);
        env_parse("MENUSYNC_STAGE3_TIMEOUT_MS", &mut self.stage_timeouts.stage3_ms);
        env_parse("MENUSYNC_STAGE4_TIMEOUT_MS", &mut self.stage_timeouts.stage4_ms);
        env_parse("MENUSYNC_DEFAULT_TIMEOUT_MS", &mut self.stage_timeouts.default_ms);
        env_parse("MENUSYNC_RECONNECT_ATTEMPTS", &mut self.reconnect_attempts);
        env_parse("MENUSYNC_RECONNECT_DELAY_MS", &mut self.reconnect_delay_ms);
        env_parse("MENUSYNC_REQUEST_TIMEOUT_MS", &mut self.request_timeout_ms);
        env_parse(
            "MENUSYNC_FALLBACK_ERROR_THRESHOLD",
            &mut self.fallback_error_threshold,
        );
        env_parse(
            "MENUSYNC_HEALTH_POLL_INTERVAL_MS",
            &mut self.health_poll_interval_ms,
        );
        env_parse(
            "MENUSYNC_DURABLE_ROLLOUT_PERCENT",
            &mut self.durable_rollout_percent,
        );
        env_parse("MENUSYNC_PRIMARY_BACKEND", &mut self.primary_backend);
        if let Ok(v) = std::env::var("MENUSYNC_LOG_LEVEL") {
            self.logging.level = v;
        }
    }

    /// Reject values that would make the client misbehave
    pub fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "base_url must be an http(s) URL, got '{}'",
                self.base_url
            )));
        }
        if self.api_version.trim().is_empty() {
            return Err(Error::Config("api_version must not be empty".to_string()));
        }
        if self.durable_rollout_percent > 100 {
            return Err(Error::Config(format!(
                "durable_rollout_percent must be 0-100, got {}",
                self.durable_rollout_percent
            )));
        }
        if self.fallback_error_threshold == 0 {
            return Err(Error::Config(
                "fallback_error_threshold must be at least 1".to_string(),
            ));
        }
        let t = &self.stage_timeouts;
        for (name, ms) in [
            ("stage_timeouts.stage1_ms", t.stage1_ms),
            ("stage_timeouts.stage2_ms", t.stage2_ms),
            ("stage_timeouts.stage3_ms", t.stage3_ms),
            ("stage_timeouts.stage4_ms", t.stage4_ms),
            ("stage_timeouts.default_ms", t.default_ms),
            ("reconnect_delay_ms", self.reconnect_delay_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("health_poll_interval_ms", self.health_poll_interval_ms),
        ] {
            if ms == 0 {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }
        if let Some(stage) = self.soft_timeout_stages.iter().find(|s| !(1..=6).contains(*s)) {
            return Err(Error::Config(format!(
                "soft_timeout_stages contains invalid stage {}",
                stage
            )));
        }
        if !(0.0..=1.0).contains(&self.image_match.min_overlap_ratio) {
            return Err(Error::Config(format!(
                "image_match.min_overlap_ratio must be within 0.0-1.0, got {}",
                self.image_match.min_overlap_ratio
            )));
        }
        if self.image_cache_capacity == 0 || self.event_bus_capacity == 0 {
            return Err(Error::Config(
                "image_cache_capacity and event_bus_capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// `{base_url}/api/{api_version}` without a trailing slash
    pub fn api_root(&self) -> String {
        format!(
            "{}/api/{}",
            self.base_url.trim_end_matches('/'),
            self.api_version.trim_matches('/')
        )
    }

    pub fn reconnect_delay(&self) -> Duration {
        millis_to_duration(self.reconnect_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        millis_to_duration(self.request_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        millis_to_duration(self.probe_timeout_ms)
    }

    pub fn health_poll_interval(&self) -> Duration {
        millis_to_duration(self.health_poll_interval_ms)
    }

    pub fn completion_grace(&self) -> Duration {
        millis_to_duration(self.completion_grace_ms)
    }
}

/// Platform config file location: `<config_dir>/menusync/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("menusync").join("config.toml"))
}

fn env_parse<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        match raw.trim().parse::<T>() {
            Ok(value) => {
                debug!(variable = name, "Applied environment override");
                *target = value;
            }
            Err(_) => warn!(variable = name, value = %raw, "Ignoring unparseable environment override"),
        }
    }
}
