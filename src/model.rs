//! Data model shared by every coordinator.
//!
//! These are plain records, not actors: invariants (ownership checks, state
//! machine legality, tag reservation, ...) live in the components that
//! mutate the records -- bare `serde`-derived structs with a handful of
//! constructor helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-team resource ceilings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeamLimits {
    pub max_length_hours: u32,
    pub max_vcpu: u32,
    pub max_ram_mb: u64,
    pub disk_mb: u64,
    pub max_concurrent: u32,
}

impl Default for TeamLimits {
    fn default() -> Self {
        Self {
            max_length_hours: 24,
            max_vcpu: 8,
            max_ram_mb: 16_384,
            disk_mb: 20_480,
            max_concurrent: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Team {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub cluster_id: Option<Uuid>,
    pub limits: TeamLimits,
    pub tier: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Template {
    pub id: String,
    pub team_id: Uuid,
    pub public: bool,
    pub cluster_id: Option<Uuid>,
    pub created_by: Option<Uuid>,
}

/// A human-facing name for a template, optionally namespaced by team slug.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alias {
    pub identifier: String,
    pub team_id: Uuid,
    pub template_id: String,
    pub public: bool,
}

/// `(templateID, tag) -> buildID`. `latest` is reserved and cannot be deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag {
    pub template_id: String,
    pub tag: String,
    pub build_id: Uuid,
}

pub const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Waiting,
    Building,
    Failed,
    Succeeded,
}

impl BuildStatus {
    /// Builds in these states occupy the template's single in-flight slot.
    pub fn is_in_progress(self) -> bool {
        matches!(self, BuildStatus::Waiting | BuildStatus::Building)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CpuInfo {
    pub architecture: String,
    pub family: String,
    pub model: String,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvBuild {
    pub id: Uuid,
    pub template_id: String,
    pub status: BuildStatus,
    pub vcpu: u32,
    pub ram_mb: u64,
    pub free_disk_mb: u64,
    pub kernel_version: String,
    pub firecracker_version: String,
    pub envd_version: Option<String>,
    pub dockerfile: Option<String>,
    pub start_cmd: Option<String>,
    pub ready_cmd: Option<String>,
    pub cluster_node_id: Option<Uuid>,
    pub cpu_info: Option<CpuInfo>,
}

impl EnvBuild {
    pub fn new_waiting(template_id: &str, vcpu: u32, ram_mb: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            template_id: template_id.to_string(),
            status: BuildStatus::Waiting,
            vcpu,
            ram_mb,
            free_disk_mb: 0,
            kernel_version: String::new(),
            firecracker_version: String::new(),
            envd_version: None,
            dockerfile: None,
            start_cmd: None,
            ready_cmd: None,
            cluster_node_id: None,
            cpu_info: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Running,
    Pausing,
    Paused,
    Killing,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    #[serde(default = "default_allow_public_access")]
    pub allow_public_access: bool,
    #[serde(default)]
    pub mask_request_host: Option<String>,
    #[serde(default)]
    pub allow_out: Vec<String>,
    #[serde(default)]
    pub deny_out: Vec<String>,
}

fn default_allow_public_access() -> bool {
    true
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            allow_public_access: true,
            mask_request_host: None,
            allow_out: Vec::new(),
            deny_out: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sandbox {
    pub id: String,
    pub team_id: Uuid,
    pub cluster_id: Uuid,
    pub node_id: Uuid,
    pub template_id: String,
    pub build_id: Uuid,
    pub state: SandboxState,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub auto_pause: bool,
    pub allow_internet_access: bool,
    /// Private-ingress hardening: envd only accepts authenticated calls.
    pub secure: bool,
    pub network_config: NetworkConfig,
    pub metadata: std::collections::HashMap<String, String>,
    pub envd_access_token: Option<String>,
    pub volume_mounts: Vec<ResolvedMount>,
}

/// Auto-resume policy attached to a snapshot, consulted by the proxy resume
/// fast path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AutoResumeConfig {
    /// `"any"` allows the proxy fast path to resume on behalf of any caller.
    pub policy: String,
}

impl AutoResumeConfig {
    pub fn allows_any(&self) -> bool {
        self.policy == "any"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub id: Uuid,
    pub source_sandbox_id: String,
    pub team_id: Uuid,
    pub env_build: EnvBuild,
    pub origin_node_id: Uuid,
    pub auto_pause: bool,
    pub env_secure: bool,
    pub base_env_id: Option<String>,
    pub metadata: std::collections::HashMap<String, String>,
    pub network_config: NetworkConfig,
    pub allow_internet_access: bool,
    pub auto_resume_config: Option<AutoResumeConfig>,
    pub created_at: DateTime<Utc>,
}

pub const CHECKPOINT_PREFIX: &str = "chk_";
pub const MAX_CHECKPOINTS_PER_SANDBOX: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub id: Uuid,
    pub sandbox_id: String,
    pub team_id: Uuid,
    pub template_id: String,
    pub build_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Volume {
    pub id: Uuid,
    pub team_id: Uuid,
    pub name: String,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeMountRequest {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolvedMount {
    pub volume_id: Uuid,
    pub path: String,
}
