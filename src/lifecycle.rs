//! Sandbox lifecycle coordinator.
//!
//! The largest coordinator: every sandbox operation callers see directly
//! (create, pause, kill, refresh, resume, snapshot, checkpoint, restore,
//! clone) funnels through here, which enforces team ownership, quota, and
//! the lifecycle state machine before delegating the actual work to the
//! orchestrator. Same "validate then delegate" admission shape a local
//! sandbox pool would use, minus the part that actually spawns VMs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::cache::AliasInfo;
use crate::config::PlatformConfig;
use crate::context::{assert_owns_team, Identity, RequestContext};
use crate::error::{ApiError, ApiResult};
use crate::model::{Checkpoint, NetworkConfig, Sandbox, SandboxState, Snapshot, Team, VolumeMountRequest, CHECKPOINT_PREFIX, DEFAULT_TAG};
use crate::orchestrator::{CreateSandboxSpec, Orchestrator};
use crate::store::Store;
use crate::{network_policy, tags, token, volumes};

pub struct LifecycleCoordinator {
    store: Arc<dyn Store>,
    orchestrator: Arc<dyn Orchestrator>,
    cache: Arc<crate::cache::TemplateCache>,
    config: PlatformConfig,
    signing_key: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateSandboxRequest {
    pub template_identifier: String,
    pub tag: Option<String>,
    pub timeout_secs: Option<u64>,
    pub auto_pause: bool,
    pub allow_internet_access: bool,
    /// Require envd-token authentication inside the sandbox. Mandatory when
    /// the network config disables public ingress.
    pub secure: bool,
    pub network_config: NetworkConfig,
    pub metadata: HashMap<String, String>,
    pub volume_mounts: Vec<VolumeMountRequest>,
}

/// Which `(current, target)` lifecycle transitions a caller is allowed to
/// ask for directly. `Pausing -> Paused` is orchestrator-driven, never
/// requested by a caller, so it isn't in this table.
fn assert_legal_transition(current: SandboxState, target: SandboxState) -> ApiResult<()> {
    use SandboxState::*;
    let legal = matches!(
        (current, target),
        (Running, Pausing) | (Running, Killing) | (Paused, Running) | (Paused, Killing) | (Pausing, Killing)
    );
    if legal {
        Ok(())
    } else {
        Err(ApiError::conflict(format!("cannot move sandbox from {current:?} to {target:?}")))
    }
}

impl LifecycleCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        orchestrator: Arc<dyn Orchestrator>,
        cache: Arc<crate::cache::TemplateCache>,
        config: PlatformConfig,
        signing_key: Vec<u8>,
    ) -> Self {
        Self {
            store,
            orchestrator,
            cache,
            config,
            signing_key,
        }
    }

    async fn owned_sandbox(&self, ctx: &RequestContext, team: &Team, sandbox_id: &str) -> ApiResult<Sandbox> {
        let sandbox = self
            .orchestrator
            .get_sandbox(sandbox_id)
            .await?
            .ok_or_else(|| ApiError::not_found("sandbox not found"))?;
        if sandbox.team_id != team.id {
            return Err(ApiError::not_found("sandbox not found"));
        }
        assert_owns_team(&*self.store, ctx, team.id).await?;
        Ok(sandbox)
    }

    /// Resolves a template identifier for this caller. Team-token callers
    /// resolve aliases in their team's namespace; user-token callers may
    /// belong to several teams, where an alias is ambiguous, so only bare
    /// template ids are accepted for them.
    async fn resolve_template(&self, ctx: &RequestContext, team: &Team, identifier: &str, tag: &str) -> ApiResult<AliasInfo> {
        if let Identity::User(_) = &ctx.identity {
            let store = self.store.clone();
            let identifier_owned = identifier.to_string();
            let tag_owned = tag.to_string();
            let result = self
                .cache
                .get_by_id(identifier, tag, move || {
                    async move { tags::load_template_info(&*store, &identifier_owned, &tag_owned).await }
                })
                .await;
            if let Err(err) = &result {
                if err.kind == crate::error::ErrorKind::NotFound
                    && self.store.resolve_alias(identifier, Some(&team.slug)).await?.is_some()
                {
                    return Err(ApiError::invalid_input(
                        "template aliases are ambiguous across teams; pass the template id",
                    ));
                }
            }
            return result;
        }

        let store = self.store.clone();
        let team_slug = team.slug.clone();
        let identifier_owned = identifier.to_string();
        let tag_owned = tag.to_string();
        self.cache
            .resolve_alias(identifier, Some(&team.slug), tag, move || {
                async move { tags::load_alias_info(&*store, &team_slug, &identifier_owned, &tag_owned).await }
            })
            .await
    }

    fn mint_token(&self, sandbox_id: &str, envd_version: Option<&str>) -> ApiResult<String> {
        token::mint_access_token(&self.signing_key, sandbox_id, envd_version, &self.config.defaults.min_envd_version)
    }

    fn clamp_timeout(&self, requested: Option<u64>, team: &Team) -> u64 {
        let max_timeout_secs = team.limits.max_length_hours as u64 * 3600;
        requested.unwrap_or(self.config.defaults.sandbox_timeout_secs).min(max_timeout_secs).max(1)
    }

    /// Creates a new sandbox against a resolved template/build.
    pub async fn create_sandbox(&self, ctx: &RequestContext, team: &Team, req: CreateSandboxRequest) -> ApiResult<Sandbox> {
        assert_owns_team(&*self.store, ctx, team.id).await?;

        let active = self.orchestrator.count_active_for_team(team.id).await?;
        if active >= team.limits.max_concurrent as usize {
            return Err(ApiError::quota_exceeded("team has reached its concurrent sandbox limit"));
        }

        let tag = req.tag.as_deref().unwrap_or(DEFAULT_TAG);
        let alias_info = self.resolve_template(ctx, team, &req.template_identifier, tag).await?;
        if alias_info.team_id != team.id && !alias_info.public {
            return Err(ApiError::forbidden("template is private to another team"));
        }

        let network_config = network_policy::validate(&req.network_config)?;
        if !network_config.allow_public_access && !req.secure {
            return Err(ApiError::invalid_input("sandboxes without public ingress must be created with secure=true"));
        }
        let volume_mounts = volumes::resolve_mounts(&*self.store, &self.config, team, &req.volume_mounts).await?;

        let timeout_secs = self.clamp_timeout(req.timeout_secs, team);

        // The real token needs the orchestrator-assigned sandbox id, but an
        // envd too old to honor tokens must reject the request before any
        // VM starts.
        if req.secure {
            self.mint_token("preflight", alias_info.build.envd_version.as_deref())?;
        }

        let cluster_id = team.cluster_id.unwrap_or_else(Uuid::new_v4);
        let mut sandbox = self
            .orchestrator
            .create_sandbox(CreateSandboxSpec {
                sandbox_id: None,
                team_id: team.id,
                cluster_id,
                template_id: alias_info.template_id,
                build_id: alias_info.build.id,
                vcpu: alias_info.build.vcpu,
                ram_mb: alias_info.build.ram_mb,
                timeout_secs,
                auto_pause: req.auto_pause,
                allow_internet_access: req.allow_internet_access,
                secure: req.secure,
                network_config,
                metadata: req.metadata,
                volume_mounts,
            })
            .await?;

        if req.secure {
            sandbox.envd_access_token = Some(self.mint_token(&sandbox.id, alias_info.build.envd_version.as_deref())?);
        }
        Ok(sandbox)
    }

    /// `PauseSandbox(ctx, team, sandboxID)`. Also captures the snapshot the
    /// eventual resume needs -- taken at the moment the pause is requested,
    /// not when the orchestrator reports `Paused`, so the control plane
    /// doesn't need a callback for it.
    pub async fn pause_sandbox(&self, ctx: &RequestContext, team: &Team, sandbox_id: &str) -> ApiResult<Sandbox> {
        let sandbox = self.owned_sandbox(ctx, team, sandbox_id).await?;
        assert_legal_transition(sandbox.state, SandboxState::Pausing)?;

        self.capture_snapshot(team, &sandbox).await?;
        self.orchestrator.update_sandbox_lifecycle(sandbox_id, SandboxState::Pausing).await
    }

    async fn capture_snapshot(&self, team: &Team, sandbox: &Sandbox) -> ApiResult<Snapshot> {
        let build = self
            .store
            .get_build(sandbox.build_id)
            .await?
            .ok_or_else(|| ApiError::internal("sandbox references a build that no longer exists"))?;
        let snapshot = Snapshot {
            id: Uuid::new_v4(),
            source_sandbox_id: sandbox.id.clone(),
            team_id: team.id,
            env_build: build,
            origin_node_id: sandbox.node_id,
            auto_pause: sandbox.auto_pause,
            env_secure: sandbox.secure,
            base_env_id: Some(sandbox.template_id.clone()),
            metadata: sandbox.metadata.clone(),
            network_config: sandbox.network_config.clone(),
            allow_internet_access: sandbox.allow_internet_access,
            auto_resume_config: None,
            created_at: chrono::Utc::now(),
        };
        self.store.insert_snapshot(snapshot.clone()).await?;
        Ok(snapshot)
    }

    /// `KillSandbox(ctx, team, sandboxID)`. Idempotent: killing an
    /// already-killing sandbox is a no-op, not an error.
    pub async fn kill_sandbox(&self, ctx: &RequestContext, team: &Team, sandbox_id: &str) -> ApiResult<()> {
        let sandbox = self.owned_sandbox(ctx, team, sandbox_id).await?;
        if sandbox.state == SandboxState::Killing {
            return Ok(());
        }
        assert_legal_transition(sandbox.state, SandboxState::Killing)?;
        self.orchestrator.update_sandbox_lifecycle(sandbox_id, SandboxState::Killing).await?;
        self.orchestrator.remove_sandbox(sandbox_id).await
    }

    /// `RefreshSandbox(ctx, team, sandboxID, extendBy)`. The extension is
    /// never shorter than the platform default and never pushes the
    /// end-time past the team's maximum sandbox length; only a running
    /// sandbox can be refreshed -- a paused one has no wall-clock deadline
    /// to extend.
    pub async fn refresh_sandbox(&self, ctx: &RequestContext, team: &Team, sandbox_id: &str, extend_by: Duration) -> ApiResult<Sandbox> {
        let sandbox = self.owned_sandbox(ctx, team, sandbox_id).await?;
        if sandbox.state != SandboxState::Running {
            return Err(ApiError::conflict("only a running sandbox can be refreshed"));
        }
        let extend_secs = self.clamp_timeout(Some(extend_by.as_secs().max(self.config.defaults.sandbox_timeout_secs)), team);
        self.orchestrator.keep_alive_for(sandbox_id, Duration::from_secs(extend_secs)).await?;
        self.orchestrator
            .get_sandbox(sandbox_id)
            .await?
            .ok_or_else(|| ApiError::not_found("sandbox not found"))
    }

    /// `UpdateSandboxLifecycle(ctx, team, sandboxID, autoPause)`.
    pub async fn update_sandbox_lifecycle(&self, ctx: &RequestContext, team: &Team, sandbox_id: &str, auto_pause: bool) -> ApiResult<Sandbox> {
        self.owned_sandbox(ctx, team, sandbox_id).await?;
        self.orchestrator.set_auto_pause(sandbox_id, auto_pause).await
    }

    /// Resumes a paused sandbox in place, or recreates one from its last
    /// snapshot if the orchestrator has already reaped it. A sandbox that is
    /// already `running` is a 409, not a no-op; one that is `pausing` is
    /// waited on rather than rejected; one that is `killing` has no
    /// snapshot left to resume from and is a 404, the one exception to the
    /// 409-by-default rule `assert_legal_transition` otherwise enforces.
    pub async fn resume_sandbox(&self, ctx: &RequestContext, team: &Team, sandbox_id: &str) -> ApiResult<Sandbox> {
        assert_owns_team(&*self.store, ctx, team.id).await?;

        if let Some(sandbox) = self.orchestrator.get_sandbox(sandbox_id).await? {
            if sandbox.team_id != team.id {
                return Err(ApiError::not_found("sandbox not found"));
            }
            match sandbox.state {
                SandboxState::Running => return Err(ApiError::conflict("sandbox is already running")),
                SandboxState::Killing => return Err(ApiError::not_found("no snapshot to resume from")),
                SandboxState::Pausing => {
                    let settled = self.orchestrator.wait_for_state_change(sandbox_id, SandboxState::Pausing, self.config.timeouts.proxy_resume_wait()).await?;
                    if settled.state != SandboxState::Paused {
                        return Err(ApiError::conflict(format!("cannot resume a sandbox in state {:?}", settled.state)));
                    }
                }
                SandboxState::Paused => {}
            }
            assert_legal_transition(SandboxState::Paused, SandboxState::Running)?;

            let mut resumed = self.orchestrator.update_sandbox_lifecycle(sandbox_id, SandboxState::Running).await?;
            if resumed.secure && resumed.envd_access_token.is_none() {
                let build = self.store.get_build(resumed.build_id).await?;
                resumed.envd_access_token = Some(self.mint_token(sandbox_id, build.and_then(|b| b.envd_version))?);
            }
            return Ok(resumed);
        }

        let snapshot = self
            .store
            .get_last_snapshot(sandbox_id, team.id)
            .await?
            .ok_or_else(|| ApiError::not_found("sandbox not found"))?;
        self.recreate_from_snapshot(team, sandbox_id, snapshot).await
    }

    async fn recreate_from_snapshot(&self, team: &Team, sandbox_id: &str, snapshot: Snapshot) -> ApiResult<Sandbox> {
        let cluster_id = self
            .orchestrator
            .get_node(snapshot.origin_node_id)
            .await?
            .map(|n| n.cluster_id)
            .or(team.cluster_id)
            .unwrap_or_else(Uuid::new_v4);

        let mut sandbox = self
            .orchestrator
            .create_sandbox(CreateSandboxSpec {
                sandbox_id: Some(sandbox_id.to_string()),
                team_id: team.id,
                cluster_id,
                template_id: snapshot.env_build.template_id.clone(),
                build_id: snapshot.env_build.id,
                vcpu: snapshot.env_build.vcpu,
                ram_mb: snapshot.env_build.ram_mb,
                timeout_secs: self.config.defaults.sandbox_timeout_secs,
                auto_pause: snapshot.auto_pause,
                allow_internet_access: snapshot.allow_internet_access,
                secure: snapshot.env_secure,
                network_config: snapshot.network_config,
                metadata: snapshot.metadata,
                volume_mounts: Vec::new(),
            })
            .await?;

        if snapshot.env_secure {
            sandbox.envd_access_token = Some(self.mint_token(&sandbox.id, snapshot.env_build.envd_version.as_deref())?);
        }
        Ok(sandbox)
    }

    /// Puts a sandbox the coordinator itself paused back into `Running`.
    /// Best-effort by design: snapshot and checkpoint callers already have
    /// what they asked for when this runs, so a failed resume is logged,
    /// not surfaced.
    async fn resume_in_place_soft(&self, sandbox_id: &str) {
        if let Err(err) = self.orchestrator.update_sandbox_lifecycle(sandbox_id, SandboxState::Running).await {
            tracing::warn!(sandbox_id, error = %err, "failed to resume sandbox after snapshot; leaving it paused");
        }
    }

    /// `SnapshotSandbox(ctx, team, sandboxID)`: pause, persist the
    /// snapshot, and put the sandbox back on its node.
    pub async fn snapshot_sandbox(&self, ctx: &RequestContext, team: &Team, sandbox_id: &str) -> ApiResult<Snapshot> {
        let sandbox = self.owned_sandbox(ctx, team, sandbox_id).await?;
        if sandbox.state != SandboxState::Running {
            return Err(ApiError::conflict("only a running sandbox can be snapshotted"));
        }

        self.orchestrator.update_sandbox_lifecycle(sandbox_id, SandboxState::Pausing).await?;
        let snapshot = self.capture_snapshot(team, &sandbox).await?;
        self.resume_in_place_soft(sandbox_id).await;
        Ok(snapshot)
    }

    /// Creates a named checkpoint of a sandbox: pause, snapshot, record the
    /// pointer at the snapshot's build, resume. A sandbox's checkpoint
    /// count is bounded; this rejects a new one rather than silently
    /// evicting the oldest.
    pub async fn checkpoint_sandbox(&self, ctx: &RequestContext, team: &Team, sandbox_id: &str, name: Option<String>) -> ApiResult<Checkpoint> {
        let sandbox = self.owned_sandbox(ctx, team, sandbox_id).await?;
        if sandbox.state != SandboxState::Running {
            return Err(ApiError::conflict("only a running sandbox can be checkpointed"));
        }

        let existing = self.store.list_checkpoints(sandbox_id, team.id).await?;
        if existing.len() >= self.config.concurrency.max_checkpoints_per_sandbox {
            return Err(ApiError::quota_exceeded("sandbox has reached its checkpoint limit"));
        }

        self.orchestrator.update_sandbox_lifecycle(sandbox_id, SandboxState::Pausing).await?;
        let snapshot = self.capture_snapshot(team, &sandbox).await?;

        let checkpoint = Checkpoint {
            id: Uuid::new_v4(),
            sandbox_id: sandbox.id.clone(),
            team_id: team.id,
            template_id: sandbox.template_id.clone(),
            build_id: snapshot.env_build.id,
            name: name.unwrap_or_else(|| format!("{CHECKPOINT_PREFIX}{}", Uuid::new_v4().simple())),
            created_at: chrono::Utc::now(),
        };
        self.store.insert_checkpoint(checkpoint.clone()).await?;

        self.resume_in_place_soft(sandbox_id).await;
        Ok(checkpoint)
    }

    pub async fn list_checkpoints(&self, ctx: &RequestContext, team: &Team, sandbox_id: &str) -> ApiResult<Vec<Checkpoint>> {
        assert_owns_team(&*self.store, ctx, team.id).await?;
        self.store.list_checkpoints(sandbox_id, team.id).await
    }

    /// Cursor is an opaque offset; `next_offset` is `None` once the listing
    /// is exhausted.
    pub async fn list_snapshots(
        &self,
        ctx: &RequestContext,
        team: &Team,
        sandbox_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> ApiResult<(Vec<Snapshot>, Option<usize>)> {
        assert_owns_team(&*self.store, ctx, team.id).await?;
        let (page, total) = self.store.list_snapshots(sandbox_id, team.id, limit, offset).await?;
        let consumed = offset + page.len();
        let next_offset = (consumed < total).then_some(consumed);
        Ok((page, next_offset))
    }

    /// `RestoreCheckpoint(ctx, team, sandboxID, checkpointID)`. The sandbox
    /// comes back under its original id, running the checkpointed build on
    /// the node the checkpoint was taken on; a still-running instance is
    /// hard-killed first.
    pub async fn restore_checkpoint(&self, ctx: &RequestContext, team: &Team, sandbox_id: &str, checkpoint_id: Uuid) -> ApiResult<Sandbox> {
        assert_owns_team(&*self.store, ctx, team.id).await?;
        let checkpoint = self
            .store
            .get_checkpoint(checkpoint_id, sandbox_id, team.id)
            .await?
            .ok_or_else(|| ApiError::not_found("checkpoint not found"))?;
        let build = self
            .store
            .get_build(checkpoint.build_id)
            .await?
            .ok_or_else(|| ApiError::internal("checkpoint references a build that no longer exists"))?;

        let mut origin_node_id = None;
        if let Some(current) = self.orchestrator.get_sandbox(sandbox_id).await? {
            if current.team_id != team.id {
                return Err(ApiError::not_found("sandbox not found"));
            }
            origin_node_id = Some(current.node_id);
            self.orchestrator.update_sandbox_lifecycle(sandbox_id, SandboxState::Killing).await?;
            self.orchestrator.remove_sandbox(sandbox_id).await?;
        }

        let cluster_id = match origin_node_id {
            Some(node_id) => self.orchestrator.get_node(node_id).await?.map(|n| n.cluster_id),
            None => None,
        }
        .or(team.cluster_id)
        .unwrap_or_else(Uuid::new_v4);

        self.orchestrator
            .create_sandbox(CreateSandboxSpec {
                sandbox_id: Some(sandbox_id.to_string()),
                team_id: team.id,
                cluster_id,
                template_id: checkpoint.template_id,
                build_id: checkpoint.build_id,
                vcpu: build.vcpu,
                ram_mb: build.ram_mb,
                timeout_secs: self.config.defaults.sandbox_timeout_secs,
                auto_pause: false,
                allow_internet_access: true,
                secure: false,
                network_config: NetworkConfig::default(),
                metadata: HashMap::new(),
                volume_mounts: Vec::new(),
            })
            .await
    }

    /// `CloneSandbox(ctx, team, sandboxID)`: pause the original to capture
    /// a consistent snapshot, put it back, then start an independent copy
    /// from the snapshot on the same node. A failure after the pause is
    /// surfaced to the caller; the original may be left paused.
    pub async fn clone_sandbox(&self, ctx: &RequestContext, team: &Team, sandbox_id: &str) -> ApiResult<Sandbox> {
        let source = self.owned_sandbox(ctx, team, sandbox_id).await?;

        let snapshot = match source.state {
            SandboxState::Running => {
                self.orchestrator.update_sandbox_lifecycle(sandbox_id, SandboxState::Pausing).await?;
                let snapshot = self.capture_snapshot(team, &source).await?;
                self.orchestrator.update_sandbox_lifecycle(sandbox_id, SandboxState::Running).await?;
                snapshot
            }
            SandboxState::Paused => self
                .store
                .get_last_snapshot(sandbox_id, team.id)
                .await?
                .ok_or_else(|| ApiError::not_found("no snapshot to clone from"))?,
            other => return Err(ApiError::conflict(format!("cannot clone a sandbox in state {other:?}"))),
        };

        let mut clone = self
            .orchestrator
            .create_sandbox(CreateSandboxSpec {
                sandbox_id: None,
                team_id: team.id,
                cluster_id: source.cluster_id,
                template_id: snapshot.env_build.template_id.clone(),
                build_id: snapshot.env_build.id,
                vcpu: snapshot.env_build.vcpu,
                ram_mb: snapshot.env_build.ram_mb,
                timeout_secs: self.config.defaults.sandbox_timeout_secs,
                auto_pause: snapshot.auto_pause,
                allow_internet_access: snapshot.allow_internet_access,
                secure: snapshot.env_secure,
                network_config: snapshot.network_config.clone(),
                metadata: snapshot.metadata.clone(),
                volume_mounts: source.volume_mounts.clone(),
            })
            .await?;

        if snapshot.env_secure {
            clone.envd_access_token = Some(self.mint_token(&clone.id, snapshot.env_build.envd_version.as_deref())?);
        }
        Ok(clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BuildStatus, EnvBuild};
    use crate::orchestrator::InMemoryOrchestrator;
    use crate::store::InMemoryStore;

    async fn setup() -> (LifecycleCoordinator, Arc<InMemoryStore>, Team) {
        let store = InMemoryStore::new();
        let team = store.seed_team("acme").await;
        store.seed_template("tpl1", team.id, false).await;
        store.seed_alias("acme/app", team.id, "tpl1", false).await;
        let mut build = EnvBuild::new_waiting("tpl1", 1, 512);
        build.status = BuildStatus::Succeeded;
        build.envd_version = Some("0.2.0".to_string());
        let build = store.seed_build(build).await;
        store.assign_tags("tpl1", &[(DEFAULT_TAG.to_string(), build.id)]).await.unwrap();

        let orchestrator = InMemoryOrchestrator::new();
        let cache = Arc::new(crate::cache::TemplateCache::new());
        let config = PlatformConfig::default();
        let coordinator = LifecycleCoordinator::new(store.clone(), orchestrator, cache, config, b"test-key".to_vec());
        (coordinator, store, team)
    }

    fn create_req() -> CreateSandboxRequest {
        CreateSandboxRequest {
            template_identifier: "app".to_string(),
            auto_pause: true,
            allow_internet_access: true,
            secure: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn secure_create_mints_an_access_token() {
        let (coordinator, store, team) = setup().await;
        let ctx = RequestContext::for_team("t1", team.id);
        let sandbox = coordinator.create_sandbox(&ctx, &team, create_req()).await.unwrap();
        assert_eq!(sandbox.state, SandboxState::Running);
        assert!(sandbox.secure);
        assert!(sandbox.envd_access_token.is_some());
        drop(store);
    }

    #[tokio::test]
    async fn insecure_create_skips_the_access_token() {
        let (coordinator, _store, team) = setup().await;
        let ctx = RequestContext::for_team("t1", team.id);
        let req = CreateSandboxRequest {
            secure: false,
            ..create_req()
        };
        let sandbox = coordinator.create_sandbox(&ctx, &team, req).await.unwrap();
        assert!(sandbox.envd_access_token.is_none());
    }

    #[tokio::test]
    async fn private_ingress_requires_secure() {
        let (coordinator, _store, team) = setup().await;
        let ctx = RequestContext::for_team("t1", team.id);
        let req = CreateSandboxRequest {
            secure: false,
            network_config: NetworkConfig {
                allow_public_access: false,
                ..Default::default()
            },
            ..create_req()
        };
        let err = coordinator.create_sandbox(&ctx, &team, req).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn create_sandbox_rejects_past_concurrency_limit() {
        let (coordinator, store, team) = setup().await;
        let team = store.seed_team_with_limits("limited", crate::model::TeamLimits { max_concurrent: 1, ..team.limits }).await;
        store.seed_template("tpl2", team.id, false).await;
        store.seed_alias("limited/app2", team.id, "tpl2", false).await;
        let mut build = EnvBuild::new_waiting("tpl2", 1, 512);
        build.status = BuildStatus::Succeeded;
        build.envd_version = Some("0.2.0".to_string());
        let build = store.seed_build(build).await;
        store.assign_tags("tpl2", &[(DEFAULT_TAG.to_string(), build.id)]).await.unwrap();

        let ctx = RequestContext::for_team("t1", team.id);
        let req = CreateSandboxRequest {
            template_identifier: "app2".to_string(),
            secure: true,
            ..Default::default()
        };
        coordinator.create_sandbox(&ctx, &team, req.clone()).await.unwrap();
        let err = coordinator.create_sandbox(&ctx, &team, req).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::QuotaExceeded);
    }

    #[tokio::test]
    async fn pause_then_resume_round_trips_through_a_snapshot() {
        let (coordinator, _store, team) = setup().await;
        let ctx = RequestContext::for_team("t1", team.id);
        let created = coordinator.create_sandbox(&ctx, &team, create_req()).await.unwrap();

        let paused = coordinator.pause_sandbox(&ctx, &team, &created.id).await.unwrap();
        assert_eq!(paused.state, SandboxState::Pausing);

        // Only the orchestrator ever drives Pausing -> Paused; simulate it directly here.
        coordinator.orchestrator.update_sandbox_lifecycle(&created.id, SandboxState::Paused).await.unwrap();

        let resumed = coordinator.resume_sandbox(&ctx, &team, &created.id).await.unwrap();
        assert_eq!(resumed.state, SandboxState::Running);
        assert!(resumed.envd_access_token.is_some());
    }

    #[tokio::test]
    async fn kill_is_idempotent() {
        let (coordinator, _store, team) = setup().await;
        let ctx = RequestContext::for_team("t1", team.id);
        let created = coordinator.create_sandbox(&ctx, &team, create_req()).await.unwrap();

        coordinator.kill_sandbox(&ctx, &team, &created.id).await.unwrap();
        coordinator.kill_sandbox(&ctx, &team, &created.id).await.unwrap_err();
    }

    #[tokio::test]
    async fn update_sandbox_lifecycle_flips_auto_pause() {
        let (coordinator, _store, team) = setup().await;
        let ctx = RequestContext::for_team("t1", team.id);
        let created = coordinator.create_sandbox(&ctx, &team, create_req()).await.unwrap();
        assert!(created.auto_pause);

        let updated = coordinator.update_sandbox_lifecycle(&ctx, &team, &created.id, false).await.unwrap();
        assert!(!updated.auto_pause);
    }

    #[tokio::test]
    async fn snapshot_pauses_and_puts_the_sandbox_back() {
        let (coordinator, store, team) = setup().await;
        let ctx = RequestContext::for_team("t1", team.id);
        let created = coordinator.create_sandbox(&ctx, &team, create_req()).await.unwrap();

        let snapshot = coordinator.snapshot_sandbox(&ctx, &team, &created.id).await.unwrap();
        assert_eq!(snapshot.source_sandbox_id, created.id);
        assert!(snapshot.env_secure);

        let after = coordinator.orchestrator.get_sandbox(&created.id).await.unwrap().unwrap();
        assert_eq!(after.state, SandboxState::Running);
        assert!(store.get_last_snapshot(&created.id, team.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn checkpoint_then_restore_replaces_the_sandbox_in_place() {
        let (coordinator, _store, team) = setup().await;
        let ctx = RequestContext::for_team("t1", team.id);
        let created = coordinator.create_sandbox(&ctx, &team, create_req()).await.unwrap();

        let checkpoint = coordinator.checkpoint_sandbox(&ctx, &team, &created.id, Some("v1".to_string())).await.unwrap();
        assert_eq!(checkpoint.name, "v1");

        // The checkpointed sandbox is back to running and gets hard-killed
        // by the restore, which recreates it under the same id.
        let restored = coordinator.restore_checkpoint(&ctx, &team, &created.id, checkpoint.id).await.unwrap();
        assert_eq!(restored.id, created.id);
        assert_eq!(restored.build_id, checkpoint.build_id);
        assert_eq!(restored.state, SandboxState::Running);
    }

    #[tokio::test]
    async fn checkpoint_limit_is_enforced() {
        let (coordinator, _store, team) = setup().await;
        let ctx = RequestContext::for_team("t1", team.id);
        let created = coordinator.create_sandbox(&ctx, &team, create_req()).await.unwrap();

        for _ in 0..coordinator.config.concurrency.max_checkpoints_per_sandbox {
            coordinator.checkpoint_sandbox(&ctx, &team, &created.id, None).await.unwrap();
        }
        let err = coordinator.checkpoint_sandbox(&ctx, &team, &created.id, None).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::QuotaExceeded);
    }

    #[tokio::test]
    async fn generated_checkpoint_names_carry_the_checkpoint_prefix() {
        let (coordinator, _store, team) = setup().await;
        let ctx = RequestContext::for_team("t1", team.id);
        let created = coordinator.create_sandbox(&ctx, &team, create_req()).await.unwrap();

        let checkpoint = coordinator.checkpoint_sandbox(&ctx, &team, &created.id, None).await.unwrap();
        assert!(checkpoint.name.starts_with(CHECKPOINT_PREFIX));

        let listed = coordinator.list_checkpoints(&ctx, &team, &created.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, checkpoint.id);
    }

    #[tokio::test]
    async fn clone_leaves_the_original_running() {
        let (coordinator, _store, team) = setup().await;
        let ctx = RequestContext::for_team("t1", team.id);
        let created = coordinator.create_sandbox(&ctx, &team, create_req()).await.unwrap();

        let cloned = coordinator.clone_sandbox(&ctx, &team, &created.id).await.unwrap();
        assert_ne!(cloned.id, created.id);
        assert_eq!(cloned.template_id, created.template_id);
        assert_eq!(cloned.state, SandboxState::Running);

        let original = coordinator.orchestrator.get_sandbox(&created.id).await.unwrap().unwrap();
        assert_eq!(original.state, SandboxState::Running);
    }

    #[tokio::test]
    async fn snapshot_listing_pages_with_an_offset_cursor() {
        let (coordinator, _store, team) = setup().await;
        let ctx = RequestContext::for_team("t1", team.id);
        let created = coordinator.create_sandbox(&ctx, &team, create_req()).await.unwrap();

        for _ in 0..3 {
            coordinator.snapshot_sandbox(&ctx, &team, &created.id).await.unwrap();
        }

        let (page1, next) = coordinator.list_snapshots(&ctx, &team, Some(&created.id), 2, 0).await.unwrap();
        assert_eq!(page1.len(), 2);
        assert_eq!(next, Some(2));

        let (page2, next) = coordinator.list_snapshots(&ctx, &team, Some(&created.id), 2, 2).await.unwrap();
        assert_eq!(page2.len(), 1);
        assert_eq!(next, None);
    }

    #[tokio::test]
    async fn cannot_pause_a_sandbox_that_is_already_pausing() {
        let (coordinator, _store, team) = setup().await;
        let ctx = RequestContext::for_team("t1", team.id);
        let created = coordinator.create_sandbox(&ctx, &team, create_req()).await.unwrap();
        coordinator.pause_sandbox(&ctx, &team, &created.id).await.unwrap();

        let err = coordinator.pause_sandbox(&ctx, &team, &created.id).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn foreign_team_sandbox_access_is_not_found() {
        let (coordinator, store, team) = setup().await;
        let ctx = RequestContext::for_team("t1", team.id);
        let created = coordinator.create_sandbox(&ctx, &team, create_req()).await.unwrap();

        let other_team = store.seed_team("other").await;
        let other_ctx = RequestContext::for_team("t2", other_team.id);
        let err = coordinator.pause_sandbox(&other_ctx, &other_team, &created.id).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn user_identity_must_use_bare_template_ids() {
        let (coordinator, store, team) = setup().await;
        let user = store.seed_user_in_team(team.id, true).await;
        let ctx = RequestContext::for_user("t1", user);

        // The alias resolves for team tokens but is ambiguous for a user.
        let err = coordinator
            .create_sandbox(
                &ctx,
                &team,
                CreateSandboxRequest {
                    template_identifier: "app".to_string(),
                    secure: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidInput);

        let sandbox = coordinator
            .create_sandbox(
                &ctx,
                &team,
                CreateSandboxRequest {
                    template_identifier: "tpl1".to_string(),
                    secure: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(sandbox.template_id, "tpl1");
    }
}
