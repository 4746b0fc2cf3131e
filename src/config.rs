//! Platform configuration.
//!
//! TOML-backed `Config`: same `from_file`/`from_str`/`toml` parsing pattern
//! used elsewhere, new schema. This carries the platform constants used
//! throughout the coordinators (timeouts, ceilings) so they are not buried
//! as magic numbers.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::model::TeamLimits;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub feature_flags: FeatureFlagsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Default sandbox timeout when the caller does not specify one.
    #[serde(default = "default_sandbox_timeout_secs")]
    pub sandbox_timeout_secs: u64,
    /// Default team limits applied when a team record carries none.
    #[serde(default)]
    pub team_limits: TeamLimits,
    /// Minimum envd version required to mint an access token.
    #[serde(default = "default_min_envd_version")]
    pub min_envd_version: String,
}

fn default_sandbox_timeout_secs() -> u64 {
    300
}

fn default_min_envd_version() -> String {
    "0.1.0".to_string()
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            sandbox_timeout_secs: default_sandbox_timeout_secs(),
            team_limits: TeamLimits::default(),
            min_envd_version: default_min_envd_version(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// TTL of the proxy-resume distributed lock.
    #[serde(default = "default_resume_lock_ttl_secs")]
    pub resume_lock_ttl_secs: u64,
    /// How long a caller waits on an in-progress resume.
    #[serde(default = "default_proxy_resume_wait_secs")]
    pub proxy_resume_wait_secs: u64,
    /// Rolling window clamp for log queries.
    #[serde(default = "default_sandbox_logs_max_range_secs")]
    pub sandbox_logs_max_time_range_secs: u64,
    /// Global timeout composed with the request deadline for bulk
    /// sandbox metrics fetches.
    #[serde(default = "default_metrics_fetch_timeout_secs")]
    pub get_sandboxes_metrics_timeout_secs: u64,
}

fn default_resume_lock_ttl_secs() -> u64 {
    5 * 60
}

fn default_proxy_resume_wait_secs() -> u64 {
    30
}

fn default_sandbox_logs_max_range_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_metrics_fetch_timeout_secs() -> u64 {
    30
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            resume_lock_ttl_secs: default_resume_lock_ttl_secs(),
            proxy_resume_wait_secs: default_proxy_resume_wait_secs(),
            sandbox_logs_max_time_range_secs: default_sandbox_logs_max_range_secs(),
            get_sandboxes_metrics_timeout_secs: default_metrics_fetch_timeout_secs(),
        }
    }
}

impl TimeoutsConfig {
    pub fn resume_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.resume_lock_ttl_secs)
    }

    pub fn proxy_resume_wait(&self) -> Duration {
        Duration::from_secs(self.proxy_resume_wait_secs)
    }

    pub fn sandbox_logs_max_time_range(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.sandbox_logs_max_time_range_secs as i64)
    }

    pub fn get_sandboxes_metrics_timeout(&self) -> Duration {
        Duration::from_secs(self.get_sandboxes_metrics_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Bounds concurrency of the bulk sandbox metrics fetch.
    #[serde(default = "default_max_concurrent_metric_fetches")]
    pub max_concurrent_metric_fetches: usize,
    /// Checkpoints per sandbox. Kept configurable only so tests can
    /// shrink it; production should leave it at the default of 10.
    #[serde(default = "default_max_checkpoints_per_sandbox")]
    pub max_checkpoints_per_sandbox: usize,
}

fn default_max_concurrent_metric_fetches() -> usize {
    30
}

fn default_max_checkpoints_per_sandbox() -> usize {
    crate::model::MAX_CHECKPOINTS_PER_SANDBOX
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_metric_fetches: default_max_concurrent_metric_fetches(),
            max_checkpoints_per_sandbox: default_max_checkpoints_per_sandbox(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlagsConfig {
    /// Gate for ClickHouse-backed metrics reads.
    #[serde(default = "default_true")]
    pub metrics_read: bool,
    /// Gate for volume mount resolution.
    #[serde(default = "default_true")]
    pub volume_mounts: bool,
    /// Overridable default firecracker version for new builds.
    #[serde(default = "default_firecracker_version")]
    pub build_firecracker_version: String,
    /// Template-engine version handed to builds started by a recognized SDK
    /// whose own version is still below `beta_below_sdk_version`. `None`
    /// means every build gets the stable version above.
    #[serde(default)]
    pub beta_firecracker_version: Option<String>,
    /// SDK release threshold for the beta engine: recognized SDKs older
    /// than this negotiate the beta engine, everyone at or past it gets
    /// stable.
    #[serde(default)]
    pub beta_below_sdk_version: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_firecracker_version() -> String {
    "1.7.0".to_string()
}

impl Default for FeatureFlagsConfig {
    fn default() -> Self {
        Self {
            metrics_read: default_true(),
            volume_mounts: default_true(),
            build_firecracker_version: default_firecracker_version(),
            beta_firecracker_version: None,
            beta_below_sdk_version: None,
        }
    }
}

impl PlatformConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML configuration")
    }
}
