//! Resume de-duplication / proxy fast path.
//!
//! The edge proxy calls this directly (over gRPC, see `proto/resume.proto`)
//! whenever a request arrives for a sandbox that might be paused. The goal
//! is to answer "what orchestrator node is this sandbox running on *right
//! now*" as fast as possible, collapsing concurrent callers hitting the same
//! paused sandbox into a single resume rather than racing N resumes against
//! each other. Built on `lock.rs`'s fencing-token lock plus
//! `orchestrator.rs`'s `wait_for_state_change`, in the same lock/orchestrator
//! idiom used by the rest of this crate.

use std::sync::Arc;

use crate::config::PlatformConfig;
use crate::error::{ApiError, ApiResult};
use crate::lifecycle::LifecycleCoordinator;
use crate::lock::{DistributedLock, LockOutcome};
use crate::model::SandboxState;
use crate::orchestrator::{NodeInfo, Orchestrator};
use crate::store::Store;

/// Where a now-running sandbox lives, handed back to the proxy so it can
/// route the original request there.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingInfo {
    pub node: NodeInfo,
}

pub struct ResumeCoordinator {
    store: Arc<dyn Store>,
    orchestrator: Arc<dyn Orchestrator>,
    lock: Arc<dyn DistributedLock>,
    lifecycle: Arc<LifecycleCoordinator>,
    config: PlatformConfig,
}

impl ResumeCoordinator {
    pub fn new(store: Arc<dyn Store>, orchestrator: Arc<dyn Orchestrator>, lock: Arc<dyn DistributedLock>, lifecycle: Arc<LifecycleCoordinator>, config: PlatformConfig) -> Self {
        Self {
            store,
            orchestrator,
            lock,
            lifecycle,
            config,
        }
    }

    fn lock_key(sandbox_id: &str) -> String {
        format!("proxy-resume:{sandbox_id}")
    }

    /// Resumes a sandbox on the proxy fast path. No caller
    /// identity is involved here -- the proxy has already authenticated the
    /// original request upstream and is asking purely "where does this
    /// sandbox live" -- so ownership is never re-checked; only the
    /// auto-resume policy gate stands between a paused sandbox and a resume.
    pub async fn resume_for_proxy(&self, sandbox_id: &str) -> ApiResult<RoutingInfo> {
        if let Some(sandbox) = self.orchestrator.get_sandbox(sandbox_id).await? {
            match sandbox.state {
                SandboxState::Running => return self.routing_info(sandbox.node_id).await,
                SandboxState::Pausing => {
                    let settled = self
                        .orchestrator
                        .wait_for_state_change(sandbox_id, SandboxState::Pausing, self.config.timeouts.proxy_resume_wait())
                        .await?;
                    if settled.state == SandboxState::Running {
                        return self.routing_info(settled.node_id).await;
                    }
                    // Fell to Paused (or worse); take the lock path below.
                }
                SandboxState::Paused => {}
                SandboxState::Killing => return Err(ApiError::not_found("sandbox is being terminated")),
            }
        }
        // Already reaped, or paused: the snapshot-restore path below
        // enforces the auto-resume policy before recreating anything.

        let team_id = self.resolve_team_id(sandbox_id).await?;
        let snapshot = self
            .store
            .get_last_snapshot(sandbox_id, team_id)
            .await?
            .ok_or_else(|| ApiError::not_found("no snapshot to resume from"))?;

        let key = Self::lock_key(sandbox_id);
        match self.lock.acquire(&key, self.config.timeouts.resume_lock_ttl()).await? {
            LockOutcome::Acquired(token) => {
                let result = self.resume_under_lock(sandbox_id, &snapshot, team_id).await;
                self.lock.release(&token).await?;
                result
            }
            LockOutcome::NotObtained => {
                // Someone else is already resuming it; wait for them to
                // finish instead of racing a second resume. The lock is
                // released as soon as it is granted -- it is only used as a
                // "the other resume finished" signal here.
                if let LockOutcome::Acquired(token) = self
                    .lock
                    .acquire_wait(&key, self.config.timeouts.resume_lock_ttl(), self.config.timeouts.proxy_resume_wait())
                    .await?
                {
                    self.lock.release(&token).await?;
                }
                match self.orchestrator.get_sandbox(sandbox_id).await? {
                    Some(sandbox) if sandbox.state == SandboxState::Running => self.routing_info(sandbox.node_id).await,
                    _ => Err(ApiError::unavailable("sandbox did not reach a running state in time")),
                }
            }
        }
    }

    /// The resume critical section, entered only while holding the
    /// per-sandbox lock. The caller releases the lock on every exit path.
    async fn resume_under_lock(&self, sandbox_id: &str, snapshot: &crate::model::Snapshot, team_id: uuid::Uuid) -> ApiResult<RoutingInfo> {
        let allowed = snapshot.auto_resume_config.as_ref().map(|c| c.allows_any()).unwrap_or(false);
        if !allowed {
            return Err(ApiError::not_found("auto-resume disabled"));
        }

        // Re-check after winning the lock: another caller may have moved
        // the sandbox while this one was acquiring.
        if let Some(sandbox) = self.orchestrator.get_sandbox(sandbox_id).await? {
            match sandbox.state {
                SandboxState::Running => return self.routing_info(sandbox.node_id).await,
                SandboxState::Killing => return Err(ApiError::not_found("sandbox is being terminated")),
                SandboxState::Pausing => {
                    self.orchestrator
                        .wait_for_state_change(sandbox_id, SandboxState::Pausing, self.config.timeouts.proxy_resume_wait())
                        .await?;
                }
                SandboxState::Paused => {}
            }
        }

        let team = self.store.get_team(team_id).await?;
        let ctx = crate::context::RequestContext::for_team("proxy-resume", team.id);
        let resumed = self.lifecycle.resume_sandbox(&ctx, &team, sandbox_id).await?;
        self.routing_info(resumed.node_id).await
    }

    /// The proxy only has a sandbox id, not a team id. If the orchestrator
    /// still knows the sandbox, its team id is authoritative; otherwise the
    /// team is recovered from whichever snapshot was taken of it last.
    async fn resolve_team_id(&self, sandbox_id: &str) -> ApiResult<uuid::Uuid> {
        if let Some(sandbox) = self.orchestrator.get_sandbox(sandbox_id).await? {
            return Ok(sandbox.team_id);
        }
        self.store
            .find_team_for_sandbox(sandbox_id)
            .await?
            .ok_or_else(|| ApiError::not_found("sandbox not found"))
    }

    async fn routing_info(&self, node_id: uuid::Uuid) -> ApiResult<RoutingInfo> {
        let node = self
            .orchestrator
            .get_node(node_id)
            .await?
            .ok_or_else(|| ApiError::internal("routing info not available yet"))?;
        Ok(RoutingInfo { node })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::InMemoryDistributedLock;
    use crate::model::{AutoResumeConfig, BuildStatus, EnvBuild, Snapshot};
    use crate::orchestrator::InMemoryOrchestrator;
    use crate::orchestrator::CreateSandboxSpec;
    use crate::store::InMemoryStore;
    use std::collections::HashMap;

    async fn setup_with_policy(allow: bool) -> (ResumeCoordinator, Arc<InMemoryOrchestrator>, String, crate::model::Team) {
        let store = InMemoryStore::new();
        let team = store.seed_team("acme").await;
        store.seed_template("tpl1", team.id, false).await;
        store.seed_alias("acme/app", team.id, "tpl1", false).await;
        let mut build = EnvBuild::new_waiting("tpl1", 1, 512);
        build.status = BuildStatus::Succeeded;
        build.envd_version = Some("0.2.0".to_string());
        let build = store.seed_build(build).await;
        store.assign_tags("tpl1", &[(crate::model::DEFAULT_TAG.to_string(), build.id)]).await.unwrap();

        let orchestrator = InMemoryOrchestrator::new();
        orchestrator.register_node(NodeInfo {
            id: team.cluster_id.unwrap(),
            cluster_id: team.cluster_id.unwrap(),
            address: "10.0.0.5:9000".to_string(),
        });

        let sandbox = orchestrator
            .create_sandbox(CreateSandboxSpec {
                sandbox_id: Some("sbx_resume_test".to_string()),
                team_id: team.id,
                cluster_id: team.cluster_id.unwrap(),
                template_id: "tpl1".to_string(),
                build_id: build.id,
                vcpu: 1,
                ram_mb: 512,
                timeout_secs: 300,
                auto_pause: true,
                allow_internet_access: true,
                secure: false,
                network_config: Default::default(),
                metadata: HashMap::new(),
                volume_mounts: Vec::new(),
            })
            .await
            .unwrap();
        orchestrator.update_sandbox_lifecycle(&sandbox.id, SandboxState::Paused).await.unwrap();

        store
            .insert_snapshot(Snapshot {
                id: uuid::Uuid::new_v4(),
                source_sandbox_id: sandbox.id.clone(),
                team_id: team.id,
                env_build: build,
                origin_node_id: team.cluster_id.unwrap(),
                auto_pause: true,
                env_secure: false,
                base_env_id: None,
                metadata: HashMap::new(),
                network_config: Default::default(),
                allow_internet_access: true,
                auto_resume_config: Some(AutoResumeConfig {
                    policy: if allow { "any".to_string() } else { "none".to_string() },
                }),
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let cache = Arc::new(crate::cache::TemplateCache::new());
        let config = PlatformConfig::default();
        let lifecycle = Arc::new(LifecycleCoordinator::new(store.clone(), orchestrator.clone(), cache, config.clone(), b"test-key".to_vec()));
        let lock = InMemoryDistributedLock::new();
        let coordinator = ResumeCoordinator::new(store.clone(), orchestrator.clone(), lock, lifecycle, config);
        (coordinator, orchestrator, sandbox.id, team)
    }

    #[tokio::test]
    async fn already_running_sandbox_routes_immediately() {
        let (coordinator, orchestrator, sandbox_id, _team) = setup_with_policy(true).await;
        orchestrator.update_sandbox_lifecycle(&sandbox_id, SandboxState::Running).await.unwrap();

        let routing = coordinator.resume_for_proxy(&sandbox_id).await.unwrap();
        assert_eq!(routing.node.address, "10.0.0.5:9000");
    }

    #[tokio::test]
    async fn paused_sandbox_with_allow_any_policy_resumes() {
        let (coordinator, orchestrator, sandbox_id, _team) = setup_with_policy(true).await;

        let routing = coordinator.resume_for_proxy(&sandbox_id).await.unwrap();
        assert_eq!(routing.node.address, "10.0.0.5:9000");
        let sandbox = orchestrator.get_sandbox(&sandbox_id).await.unwrap().unwrap();
        assert_eq!(sandbox.state, SandboxState::Running);
    }

    #[tokio::test]
    async fn paused_sandbox_without_allow_any_policy_is_not_found() {
        // Indistinguishable from "no such sandbox": the proxy is not told
        // whether auto-resume is disabled or the sandbox never existed.
        let (coordinator, _orchestrator, sandbox_id, _team) = setup_with_policy(false).await;

        let err = coordinator.resume_for_proxy(&sandbox_id).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn resume_of_a_killing_sandbox_is_not_found() {
        let (coordinator, orchestrator, sandbox_id, _team) = setup_with_policy(true).await;
        orchestrator.update_sandbox_lifecycle(&sandbox_id, SandboxState::Killing).await.unwrap();

        let err = coordinator.resume_for_proxy(&sandbox_id).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn concurrent_resumes_of_the_same_sandbox_only_resume_once() {
        let (coordinator, orchestrator, sandbox_id, _team) = setup_with_policy(true).await;
        let coordinator = Arc::new(coordinator);

        let c1 = coordinator.clone();
        let id1 = sandbox_id.clone();
        let c2 = coordinator.clone();
        let id2 = sandbox_id.clone();

        let (r1, r2) = tokio::join!(tokio::spawn(async move { c1.resume_for_proxy(&id1).await }), tokio::spawn(async move { c2.resume_for_proxy(&id2).await }));

        assert!(r1.unwrap().is_ok());
        assert!(r2.unwrap().is_ok());
        let sandbox = orchestrator.get_sandbox(&sandbox_id).await.unwrap().unwrap();
        assert_eq!(sandbox.state, SandboxState::Running);
    }

    #[tokio::test]
    async fn unknown_sandbox_is_not_found() {
        let (coordinator, _orchestrator, _sandbox_id, _team) = setup_with_policy(true).await;
        let err = coordinator.resume_for_proxy("sbx_does_not_exist").await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }
}
