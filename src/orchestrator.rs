//! Sandbox orchestrator facade.
//!
//! The orchestrator (node agents, scheduler, cluster registry) is an
//! external collaborator; this is the typed RPC surface the lifecycle
//! coordinator calls against it. Same shape as a `backend::Sandbox` trait
//! (one trait, several backend implementations selected at runtime) --
//! generalized here from "spawn locally" to "call the cluster". The
//! in-memory implementation stands in for the real RPC client the way
//! `InMemoryStore` stands in for the relational store.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::model::{NetworkConfig, Sandbox, SandboxState};

#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub id: Uuid,
    pub cluster_id: Uuid,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct CreateSandboxSpec {
    /// When set (resuming a previously known sandbox id from a snapshot),
    /// the orchestrator reuses it instead of minting a fresh one.
    pub sandbox_id: Option<String>,
    pub team_id: Uuid,
    pub cluster_id: Uuid,
    pub template_id: String,
    pub build_id: Uuid,
    pub vcpu: u32,
    pub ram_mb: u64,
    pub timeout_secs: u64,
    pub auto_pause: bool,
    pub allow_internet_access: bool,
    pub secure: bool,
    pub network_config: NetworkConfig,
    pub metadata: HashMap<String, String>,
    pub volume_mounts: Vec<crate::model::ResolvedMount>,
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn get_sandbox(&self, sandbox_id: &str) -> ApiResult<Option<Sandbox>>;
    async fn create_sandbox(&self, spec: CreateSandboxSpec) -> ApiResult<Sandbox>;
    async fn remove_sandbox(&self, sandbox_id: &str) -> ApiResult<()>;
    /// Extends the sandbox's `end_time` so it survives at least `duration`
    /// longer (a keep-alive refresh), without changing its lifecycle state.
    async fn keep_alive_for(&self, sandbox_id: &str, duration: Duration) -> ApiResult<()>;
    async fn update_sandbox_lifecycle(&self, sandbox_id: &str, state: SandboxState) -> ApiResult<Sandbox>;
    /// Mutates the auto-pause setting on a running sandbox.
    async fn set_auto_pause(&self, sandbox_id: &str, auto_pause: bool) -> ApiResult<Sandbox>;
    /// Blocks until the sandbox leaves `from`, or `timeout` elapses (the
    /// "wait for pause" step on the proxy resume path).
    async fn wait_for_state_change(&self, sandbox_id: &str, from: SandboxState, timeout: Duration) -> ApiResult<Sandbox>;
    async fn get_node(&self, node_id: Uuid) -> ApiResult<Option<NodeInfo>>;
    /// Any node of the given cluster, for read-side calls (log/metric
    /// queries) that route by cluster rather than by sandbox placement.
    async fn find_cluster_node(&self, cluster_id: Uuid) -> ApiResult<Option<NodeInfo>>;
    /// Running/pausing/paused sandboxes currently charged against a team's
    /// concurrency ceiling (the admission check).
    async fn count_active_for_team(&self, team_id: Uuid) -> ApiResult<usize>;
}

#[derive(Default)]
pub struct InMemoryOrchestrator {
    sandboxes: DashMap<String, Sandbox>,
    nodes: DashMap<Uuid, NodeInfo>,
    notifiers: DashMap<String, Arc<Notify>>,
}

impl InMemoryOrchestrator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_node(&self, node: NodeInfo) {
        self.nodes.insert(node.id, node);
    }

    fn notifier_for(&self, sandbox_id: &str) -> Arc<Notify> {
        self.notifiers.entry(sandbox_id.to_string()).or_insert_with(|| Arc::new(Notify::new())).clone()
    }
}

#[async_trait]
impl Orchestrator for InMemoryOrchestrator {
    async fn get_sandbox(&self, sandbox_id: &str) -> ApiResult<Option<Sandbox>> {
        Ok(self.sandboxes.get(sandbox_id).map(|s| s.clone()))
    }

    async fn create_sandbox(&self, spec: CreateSandboxSpec) -> ApiResult<Sandbox> {
        let node_id = self
            .nodes
            .iter()
            .find(|n| n.cluster_id == spec.cluster_id)
            .map(|n| n.id)
            .unwrap_or_else(Uuid::new_v4);

        let now = chrono::Utc::now();
        let sandbox = Sandbox {
            id: spec.sandbox_id.unwrap_or_else(|| format!("sbx_{}", Uuid::new_v4().simple())),
            team_id: spec.team_id,
            cluster_id: spec.cluster_id,
            node_id,
            template_id: spec.template_id,
            build_id: spec.build_id,
            state: SandboxState::Running,
            start_time: now,
            end_time: now + chrono::Duration::seconds(spec.timeout_secs as i64),
            auto_pause: spec.auto_pause,
            allow_internet_access: spec.allow_internet_access,
            secure: spec.secure,
            network_config: spec.network_config,
            metadata: spec.metadata,
            envd_access_token: None,
            volume_mounts: spec.volume_mounts,
        };
        self.sandboxes.insert(sandbox.id.clone(), sandbox.clone());
        Ok(sandbox)
    }

    async fn remove_sandbox(&self, sandbox_id: &str) -> ApiResult<()> {
        self.sandboxes.remove(sandbox_id);
        self.notifiers.remove(sandbox_id);
        Ok(())
    }

    async fn keep_alive_for(&self, sandbox_id: &str, duration: Duration) -> ApiResult<()> {
        let mut sandbox = self
            .sandboxes
            .get_mut(sandbox_id)
            .ok_or_else(|| ApiError::not_found("sandbox not found"))?;
        let extended = chrono::Utc::now() + chrono::Duration::from_std(duration).unwrap_or_default();
        if extended > sandbox.end_time {
            sandbox.end_time = extended;
        }
        Ok(())
    }

    async fn update_sandbox_lifecycle(&self, sandbox_id: &str, state: SandboxState) -> ApiResult<Sandbox> {
        let mut sandbox = self
            .sandboxes
            .get_mut(sandbox_id)
            .ok_or_else(|| ApiError::not_found("sandbox not found"))?;
        sandbox.state = state;
        let updated = sandbox.clone();
        drop(sandbox);
        self.notifier_for(sandbox_id).notify_waiters();
        Ok(updated)
    }

    async fn set_auto_pause(&self, sandbox_id: &str, auto_pause: bool) -> ApiResult<Sandbox> {
        let mut sandbox = self
            .sandboxes
            .get_mut(sandbox_id)
            .ok_or_else(|| ApiError::not_found("sandbox not found"))?;
        if sandbox.state != SandboxState::Running {
            return Err(ApiError::conflict("auto-pause can only change on a running sandbox"));
        }
        sandbox.auto_pause = auto_pause;
        Ok(sandbox.clone())
    }

    async fn wait_for_state_change(&self, sandbox_id: &str, from: SandboxState, timeout: Duration) -> ApiResult<Sandbox> {
        let notifier = self.notifier_for(sandbox_id);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let current = self
                .sandboxes
                .get(sandbox_id)
                .map(|s| s.clone())
                .ok_or_else(|| ApiError::not_found("sandbox not found"))?;
            if current.state != from {
                return Ok(current);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(ApiError::timeout("timed out waiting for sandbox state change"));
            }
            let _ = tokio::time::timeout(remaining, notifier.notified()).await;
        }
    }

    async fn get_node(&self, node_id: Uuid) -> ApiResult<Option<NodeInfo>> {
        Ok(self.nodes.get(&node_id).map(|n| n.clone()))
    }

    async fn find_cluster_node(&self, cluster_id: Uuid) -> ApiResult<Option<NodeInfo>> {
        Ok(self.nodes.iter().find(|n| n.cluster_id == cluster_id).map(|n| n.clone()))
    }

    async fn count_active_for_team(&self, team_id: Uuid) -> ApiResult<usize> {
        Ok(self
            .sandboxes
            .iter()
            .filter(|s| s.team_id == team_id && s.state != SandboxState::Killing)
            .count())
    }
}
