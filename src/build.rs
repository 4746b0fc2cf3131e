//! Build coordinator.
//!
//! Turns a register-build request into a `waiting` build row, moves
//! it through `building`, and on completion claims the `latest` tag the way
//! every successful build does. CPU/RAM are clamped to the owning team's
//! limits rather than rejected outright, the same `config::TeamLimits`-
//! clamping style a local admission path would use.

use std::sync::Arc;
use uuid::Uuid;

use crate::cache::TemplateCache;
use crate::config::PlatformConfig;
use crate::context::{assert_owns_team, RequestContext};
use crate::error::{ApiError, ApiResult};
use crate::model::{BuildStatus, CpuInfo, EnvBuild, Team, Template};
use crate::store::Store;
use crate::template_manager::TemplateManager;

#[derive(Debug, Clone, Default)]
pub struct RegisterBuildRequest {
    pub alias: String,
    pub vcpu: Option<u32>,
    pub ram_mb: Option<u64>,
    pub dockerfile: Option<String>,
    pub start_cmd: Option<String>,
    pub ready_cmd: Option<String>,
    pub cluster_id: Option<Uuid>,
}

/// What a builder reports back once it finishes.
#[derive(Debug, Clone)]
pub enum BuildOutcome {
    Succeeded {
        envd_version: String,
        kernel_version: String,
        free_disk_mb: u64,
        cpu_info: Option<CpuInfo>,
    },
    Failed {
        reason: String,
    },
}

/// RAM below this floor can't hold the guest kernel plus envd.
const MIN_RAM_MB: u64 = 128;

/// Clamp a requested (vcpu, ram_mb) down to the team's ceiling, filling in
/// the ceiling itself when the caller didn't ask for anything specific.
/// RAM must be even (the hypervisor splits it across two NUMA-aligned
/// regions) and at least the platform floor.
fn clamp_to_team_limits(vcpu: Option<u32>, ram_mb: Option<u64>, team: &Team) -> ApiResult<(u32, u64)> {
    if let Some(ram) = ram_mb {
        if ram % 2 != 0 {
            return Err(ApiError::invalid_input(format!("ram_mb must be even, got {ram}")));
        }
        if ram < MIN_RAM_MB {
            return Err(ApiError::invalid_input(format!("ram_mb must be at least {MIN_RAM_MB}, got {ram}")));
        }
    }
    let vcpu = vcpu.unwrap_or(team.limits.max_vcpu).min(team.limits.max_vcpu).max(1);
    let ram_mb = ram_mb.unwrap_or(team.limits.max_ram_mb).min(team.limits.max_ram_mb).max(MIN_RAM_MB);
    Ok((vcpu, ram_mb))
}

/// A builder node is an external collaborator; this just hands back a
/// placeholder assignment so the rest of the coordinator has something to
/// store. Honors an explicit cluster request when one is given.
fn select_builder_node(cluster_id: Option<Uuid>) -> Uuid {
    cluster_id.unwrap_or_else(Uuid::new_v4)
}

/// Stand-in for the CPU info a real builder node would report about itself
/// once claimed.
fn placeholder_cpu_info() -> CpuInfo {
    CpuInfo {
        architecture: "x86_64".to_string(),
        family: "unknown".to_string(),
        model: "unknown".to_string(),
        flags: Vec::new(),
    }
}

/// SDK user-agent prefixes this platform recognizes for engine negotiation.
const KNOWN_SDK_PREFIXES: &[&str] = &["agentkernel-python", "agentkernel-js", "agentkernel-cli"];

/// Picks which template-engine version a build runs against, from the
/// caller's SDK user-agent (`<sdk-name>/<version>`). A recognized SDK whose
/// version predates the release threshold keeps getting the beta engine it
/// was written against; everyone else -- newer SDKs, unknown agents, no
/// agent at all -- gets the latest. Never rejects.
fn select_engine_version(user_agent: Option<&str>, stable: &str, beta: Option<&str>, threshold: Option<&str>) -> String {
    let (Some(beta), Some(threshold), Some(ua)) = (beta, threshold, user_agent) else {
        return stable.to_string();
    };
    let Some((name, version)) = ua.split_once('/') else {
        return stable.to_string();
    };
    if KNOWN_SDK_PREFIXES.contains(&name) && !crate::token::version_at_least(version, threshold) {
        beta.to_string()
    } else {
        stable.to_string()
    }
}

/// A template has at most one in-progress build at a time, so starting this
/// one cancels every other `waiting` or `building` sibling rather than
/// letting them race it. A sibling already dispatched to a builder is
/// cancelled at the template manager first; failure to cancel there is
/// fatal to this start.
async fn cancel_concurrent_builds(store: &dyn Store, template_manager: &dyn TemplateManager, build: &EnvBuild) -> ApiResult<()> {
    for mut sibling in store.list_builds_for_template(&build.template_id).await? {
        if sibling.id != build.id && sibling.status.is_in_progress() {
            if sibling.status == BuildStatus::Building {
                template_manager.delete_build(&sibling).await?;
            }
            sibling.status = BuildStatus::Failed;
            store.update_build(sibling).await?;
        }
    }
    Ok(())
}

/// Mints a fresh template id when `alias` doesn't already resolve to one
/// this team owns, otherwise reuses it -- a register-build call against an
/// existing alias is a rebuild of that template, not a new one.
async fn resolve_or_mint_template(store: &dyn Store, team: &Team, alias: &str) -> ApiResult<Template> {
    let bare = alias.rsplit('/').next().unwrap_or(alias);
    if let Some(existing) = store.resolve_alias(bare, Some(&team.slug)).await? {
        if existing.team_id != team.id {
            return Err(ApiError::invalid_input("alias taken by another team"));
        }
        if let Some(template) = store.get_template(&existing.template_id).await? {
            return Ok(template);
        }
    }
    Ok(Template {
        id: format!("tpl_{}", Uuid::new_v4().simple()),
        team_id: team.id,
        public: false,
        cluster_id: None,
        created_by: None,
    })
}

/// Registers a new build for a template alias. Returns the (possibly freshly
/// minted) template and the new `waiting` build.
pub async fn register_build(
    store: &dyn Store,
    ctx: &RequestContext,
    config: &PlatformConfig,
    team: &Team,
    req: RegisterBuildRequest,
) -> ApiResult<(Template, EnvBuild)> {
    assert_owns_team(store, ctx, team.id).await?;

    if req.alias.is_empty() {
        return Err(ApiError::invalid_input("alias must not be empty"));
    }

    let (vcpu, ram_mb) = clamp_to_team_limits(req.vcpu, req.ram_mb, team)?;
    let template = resolve_or_mint_template(store, team, &req.alias).await?;

    let mut build = EnvBuild::new_waiting(&template.id, vcpu, ram_mb);
    build.dockerfile = req.dockerfile;
    build.start_cmd = req.start_cmd;
    build.ready_cmd = req.ready_cmd;
    build.firecracker_version = config.feature_flags.build_firecracker_version.clone();
    build.cluster_node_id = Some(select_builder_node(req.cluster_id));

    let alias_identifier = format!("{}/{}", team.slug, req.alias.rsplit('/').next().unwrap_or(&req.alias));
    let (template, build, _claimed_aliases) = store.register_build(template, &alias_identifier, build).await?;

    Ok((template, build))
}

/// `StartBuild(ctx, team, buildID)`: verifies ownership, cancels any other
/// in-progress sibling build for the same template, claims a builder node,
/// picks the template-engine version for the caller's SDK channel, and
/// dispatches the build to the template manager. Moves `waiting` ->
/// `building` only once that dispatch succeeds.
pub async fn start_build(
    store: &dyn Store,
    template_manager: &dyn TemplateManager,
    config: &PlatformConfig,
    ctx: &RequestContext,
    team: &Team,
    build_id: Uuid,
) -> ApiResult<EnvBuild> {
    assert_owns_team(store, ctx, team.id).await?;

    let mut build = store
        .get_build(build_id)
        .await?
        .ok_or_else(|| ApiError::not_found("build not found"))?;

    let template = store
        .get_template(&build.template_id)
        .await?
        .ok_or_else(|| ApiError::internal("build references a template that no longer exists"))?;
    if template.team_id != team.id {
        return Err(ApiError::forbidden("build belongs to a different team"));
    }

    cancel_concurrent_builds(store, template_manager, &build).await?;

    if build.status != BuildStatus::Waiting {
        return Err(ApiError::conflict(format!("build is already {:?}", build.status)));
    }

    build.cluster_node_id = Some(select_builder_node(build.cluster_node_id));
    build.cpu_info = Some(placeholder_cpu_info());
    build.firecracker_version = select_engine_version(
        ctx.user_agent.as_deref(),
        &config.feature_flags.build_firecracker_version,
        config.feature_flags.beta_firecracker_version.as_deref(),
        config.feature_flags.beta_below_sdk_version.as_deref(),
    );

    template_manager.create_template(&build).await?;

    build.status = BuildStatus::Building;
    store.update_build(build.clone()).await?;
    Ok(build)
}

/// Marks a build finished. A successful build claims `latest`
/// for its template, same as every other explicit tag assignment, so identity
/// resolution and the lifecycle coordinator see it through the same cache path.
pub async fn complete_build(
    store: &Arc<dyn Store>,
    cache: &TemplateCache,
    build_id: Uuid,
    outcome: BuildOutcome,
) -> ApiResult<EnvBuild> {
    let mut build = store
        .get_build(build_id)
        .await?
        .ok_or_else(|| ApiError::not_found("build not found"))?;

    match outcome {
        BuildOutcome::Succeeded {
            envd_version,
            kernel_version,
            free_disk_mb,
            cpu_info,
        } => {
            build.status = BuildStatus::Succeeded;
            build.envd_version = Some(envd_version);
            build.kernel_version = kernel_version;
            build.free_disk_mb = free_disk_mb;
            build.cpu_info = cpu_info;
        }
        BuildOutcome::Failed { reason } => {
            build.status = BuildStatus::Failed;
            tracing::warn!(build_id = %build_id, reason, "build failed");
        }
    }
    store.update_build(build.clone()).await?;

    if build.status == BuildStatus::Succeeded {
        store
            .assign_tags(&build.template_id, &[(crate::model::DEFAULT_TAG.to_string(), build.id)])
            .await?;
        cache.invalidate(&build.template_id, crate::model::DEFAULT_TAG);
    }

    Ok(build)
}
