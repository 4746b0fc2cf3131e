//! Demo HTTP surface.
//!
//! A thin REST front door over the coordinators, kept deliberately small:
//! real deployments are expected to speak the platform's own wire protocol
//! (plus the gRPC fast path in `proxy_service.rs`), but this gives every
//! coordinator a reachable entry point without standing up a full API
//! gateway. Raw `hyper` + path-segment match + `ApiResponse<T>` envelope,
//! covering this platform's lifecycle, build, and tag operations.

use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use uuid::Uuid;

use crate::build::{self, BuildOutcome, RegisterBuildRequest};
use crate::config::PlatformConfig;
use crate::context::{self, Identity, RequestContext};
use crate::error::ApiError;
use crate::lifecycle::{CreateSandboxRequest, LifecycleCoordinator};
use crate::model::{CpuInfo, NetworkConfig, VolumeMountRequest};
use crate::orchestrator::Orchestrator;
use crate::store::Store;
use crate::tags::{self, TagAssignment};
use crate::template_manager::TemplateManager;

type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, hyper::Error>;

fn full<T: Into<bytes::Bytes>>(chunk: T) -> BoxBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

#[derive(Debug, Serialize)]
struct ApiResponse<T: Serialize> {
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self { data: Some(data), error: None }
    }
}

impl ApiResponse<()> {
    fn err(msg: impl Into<String>) -> Self {
        Self { data: None, error: Some(msg.into()) }
    }
}

fn json_response<T: Serialize>(status: StatusCode, data: &T) -> Response<BoxBody> {
    let body = serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string());
    Response::builder().status(status).header("Content-Type", "application/json").body(full(body)).unwrap()
}

fn ok<T: Serialize>(data: T) -> Response<BoxBody> {
    json_response(StatusCode::OK, &ApiResponse::ok(data))
}

fn created<T: Serialize>(data: T) -> Response<BoxBody> {
    json_response(StatusCode::CREATED, &ApiResponse::ok(data))
}

fn from_api_error(err: ApiError) -> Response<BoxBody> {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(status, &ApiResponse::<()>::err(err.client_msg.clone()))
}

async fn read_json_body<T: for<'de> Deserialize<'de>>(req: Request<Incoming>) -> Result<T, Response<BoxBody>> {
    let bytes = req
        .collect()
        .await
        .map_err(|_| json_response(StatusCode::BAD_REQUEST, &ApiResponse::<()>::err("failed to read request body")))?
        .to_bytes();
    serde_json::from_slice(&bytes).map_err(|e| json_response(StatusCode::BAD_REQUEST, &ApiResponse::<()>::err(format!("invalid JSON: {e}"))))
}

/// Demo identity extraction: a team-scoped deployment key in `x-team-id`,
/// or nothing, which resolves to [`Identity::Anonymous`]. A real deployment
/// replaces this with JWT/API-key verification upstream of the handlers --
/// authentication is assumed already done by the time a [`RequestContext`]
/// exists.
fn extract_context(req: &Request<Incoming>) -> RequestContext {
    let trace_id = req.headers().get("x-trace-id").and_then(|v| v.to_str().ok()).unwrap_or("unset").to_string();
    let identity = req
        .headers()
        .get("x-team-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .map(|team_id| Identity::Team(context::TeamIdentity { team_id }))
        .unwrap_or(Identity::Anonymous);
    let mut ctx = RequestContext::new(trace_id, identity);
    if let Some(ua) = req.headers().get("user-agent").and_then(|v| v.to_str().ok()) {
        ctx = ctx.with_user_agent(ua.to_string());
    }
    ctx
}

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub cache: Arc<crate::cache::TemplateCache>,
    pub lifecycle: Arc<LifecycleCoordinator>,
    pub template_manager: Arc<dyn TemplateManager>,
    pub logs: Arc<crate::logs::LogsBridge>,
    pub config: PlatformConfig,
}

async fn handle_request(req: Request<Incoming>, state: Arc<AppState>) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let ctx = extract_context(&req);

    let response = match (method, segments.as_slice()) {
        (Method::GET, ["health"]) => ok("ok"),

        (Method::POST, ["sandboxes"]) => handle_create_sandbox(req, &ctx, &state).await,
        (Method::GET, ["sandboxes", id]) => handle_get_sandbox(id, &ctx, &state).await,
        (Method::DELETE, ["sandboxes", id]) => handle_kill_sandbox(id, &ctx, &state).await,
        (Method::POST, ["sandboxes", id, "pause"]) => handle_pause_sandbox(id, &ctx, &state).await,
        (Method::POST, ["sandboxes", id, "resume"]) => handle_resume_sandbox(id, &ctx, &state).await,
        (Method::POST, ["sandboxes", id, "refresh"]) => handle_refresh_sandbox(req, id, &ctx, &state).await,
        (Method::POST, ["sandboxes", id, "snapshot"]) => handle_snapshot_sandbox(id, &ctx, &state).await,
        (Method::POST, ["sandboxes", id, "clone"]) => handle_clone_sandbox(id, &ctx, &state).await,
        (Method::PATCH, ["sandboxes", id, "lifecycle"]) => handle_update_lifecycle(req, id, &ctx, &state).await,
        (Method::POST, ["sandboxes", id, "checkpoints"]) => handle_checkpoint_sandbox(req, id, &ctx, &state).await,
        (Method::GET, ["sandboxes", id, "checkpoints"]) => handle_list_checkpoints(id, &ctx, &state).await,
        (Method::POST, ["sandboxes", id, "checkpoints", checkpoint_id, "restore"]) => handle_restore_checkpoint(id, checkpoint_id, &ctx, &state).await,
        (Method::GET, ["snapshots"]) => handle_list_snapshots(req, &ctx, &state).await,

        (Method::POST, ["builds"]) => handle_register_build(req, &ctx, &state).await,
        (Method::POST, ["builds", build_id, "start"]) => handle_start_build(build_id, &ctx, &state).await,
        (Method::POST, ["builds", build_id, "complete"]) => handle_complete_build(req, build_id, &state).await,

        (Method::POST, ["tags"]) => handle_assign_tags(req, &ctx, &state).await,
        (Method::DELETE, ["templates", identifier, "tags"]) => handle_delete_tags(req, identifier, &ctx, &state).await,
        (Method::PATCH, ["templates", template_id]) => handle_update_template(req, template_id, &ctx, &state).await,
        (Method::GET, ["templates", "aliases", identifier]) => handle_resolve_alias(None, identifier, &ctx, &state).await,
        (Method::GET, ["templates", "aliases", namespace, identifier]) => handle_resolve_alias(Some(*namespace), identifier, &ctx, &state).await,

        (Method::GET, ["sandboxes", id, "logs"]) => handle_fetch_logs(req, id, &ctx, &state).await,
        (Method::POST, ["sandboxes", "metrics"]) => handle_get_sandboxes_metrics(req, &ctx, &state).await,
        (Method::GET, ["teams", team_id, "metrics"]) => handle_team_metrics(req, team_id, &ctx, &state).await,

        _ => json_response(StatusCode::NOT_FOUND, &ApiResponse::<()>::err("not found")),
    };

    Ok(response)
}

async fn resolve_team(ctx: &RequestContext, state: &AppState) -> Result<crate::model::Team, Response<BoxBody>> {
    context::get_team(&*state.store, ctx, None).await.map_err(from_api_error)
}

#[derive(Debug, Deserialize)]
struct CreateSandboxBody {
    template: String,
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    auto_pause: bool,
    #[serde(default = "default_true")]
    allow_internet_access: bool,
    #[serde(default)]
    secure: bool,
    #[serde(default)]
    network_config: NetworkConfig,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    volume_mounts: Vec<VolumeMountRequest>,
}

fn default_true() -> bool {
    true
}

async fn handle_create_sandbox(req: Request<Incoming>, ctx: &RequestContext, state: &AppState) -> Response<BoxBody> {
    let body: CreateSandboxBody = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let team = match resolve_team(ctx, state).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    let result = state
        .lifecycle
        .create_sandbox(
            ctx,
            &team,
            CreateSandboxRequest {
                template_identifier: body.template,
                tag: body.tag,
                timeout_secs: body.timeout_secs,
                auto_pause: body.auto_pause,
                allow_internet_access: body.allow_internet_access,
                secure: body.secure,
                network_config: body.network_config,
                metadata: body.metadata,
                volume_mounts: body.volume_mounts,
            },
        )
        .await;

    match result {
        Ok(sandbox) => created(sandbox),
        Err(e) => from_api_error(e),
    }
}

async fn handle_get_sandbox(id: &str, ctx: &RequestContext, state: &AppState) -> Response<BoxBody> {
    let team = match resolve_team(ctx, state).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match state.orchestrator.get_sandbox(id).await {
        Ok(Some(sandbox)) if sandbox.team_id == team.id => ok(sandbox),
        Ok(_) => json_response(StatusCode::NOT_FOUND, &ApiResponse::<()>::err("sandbox not found")),
        Err(e) => from_api_error(e),
    }
}

async fn handle_kill_sandbox(id: &str, ctx: &RequestContext, state: &AppState) -> Response<BoxBody> {
    let team = match resolve_team(ctx, state).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match state.lifecycle.kill_sandbox(ctx, &team, id).await {
        Ok(()) => ok("killed"),
        Err(e) => from_api_error(e),
    }
}

async fn handle_pause_sandbox(id: &str, ctx: &RequestContext, state: &AppState) -> Response<BoxBody> {
    let team = match resolve_team(ctx, state).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match state.lifecycle.pause_sandbox(ctx, &team, id).await {
        Ok(sandbox) => ok(sandbox),
        Err(e) => from_api_error(e),
    }
}

async fn handle_resume_sandbox(id: &str, ctx: &RequestContext, state: &AppState) -> Response<BoxBody> {
    let team = match resolve_team(ctx, state).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match state.lifecycle.resume_sandbox(ctx, &team, id).await {
        Ok(sandbox) => ok(sandbox),
        Err(e) => from_api_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct RefreshBody {
    extend_secs: u64,
}

async fn handle_refresh_sandbox(req: Request<Incoming>, id: &str, ctx: &RequestContext, state: &AppState) -> Response<BoxBody> {
    let body: RefreshBody = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let team = match resolve_team(ctx, state).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match state.lifecycle.refresh_sandbox(ctx, &team, id, std::time::Duration::from_secs(body.extend_secs)).await {
        Ok(sandbox) => ok(sandbox),
        Err(e) => from_api_error(e),
    }
}

async fn handle_snapshot_sandbox(id: &str, ctx: &RequestContext, state: &AppState) -> Response<BoxBody> {
    let team = match resolve_team(ctx, state).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match state.lifecycle.snapshot_sandbox(ctx, &team, id).await {
        Ok(snapshot) => created(snapshot),
        Err(e) => from_api_error(e),
    }
}

async fn handle_clone_sandbox(id: &str, ctx: &RequestContext, state: &AppState) -> Response<BoxBody> {
    let team = match resolve_team(ctx, state).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match state.lifecycle.clone_sandbox(ctx, &team, id).await {
        Ok(sandbox) => created(sandbox),
        Err(e) => from_api_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct UpdateLifecycleBody {
    auto_pause: bool,
}

async fn handle_update_lifecycle(req: Request<Incoming>, id: &str, ctx: &RequestContext, state: &AppState) -> Response<BoxBody> {
    let body: UpdateLifecycleBody = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let team = match resolve_team(ctx, state).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match state.lifecycle.update_sandbox_lifecycle(ctx, &team, id, body.auto_pause).await {
        Ok(sandbox) => ok(sandbox),
        Err(e) => from_api_error(e),
    }
}

async fn handle_list_checkpoints(id: &str, ctx: &RequestContext, state: &AppState) -> Response<BoxBody> {
    let team = match resolve_team(ctx, state).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match state.lifecycle.list_checkpoints(ctx, &team, id).await {
        Ok(checkpoints) => ok(checkpoints),
        Err(e) => from_api_error(e),
    }
}

async fn handle_list_snapshots(req: Request<Incoming>, ctx: &RequestContext, state: &AppState) -> Response<BoxBody> {
    let team = match resolve_team(ctx, state).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let params = query_params(&req);
    let sandbox_id = params.get("sandbox_id").map(String::as_str);
    let limit = params.get("limit").and_then(|s| s.parse().ok()).unwrap_or(50);
    let offset = params.get("next_token").and_then(|s| s.parse().ok()).unwrap_or(0);

    match state.lifecycle.list_snapshots(ctx, &team, sandbox_id, limit, offset).await {
        Ok((snapshots, next_offset)) => ok(serde_json::json!({
            "snapshots": snapshots,
            "next_token": next_offset.map(|o| o.to_string()),
        })),
        Err(e) => from_api_error(e),
    }
}

#[derive(Debug, Deserialize, Default)]
struct CheckpointBody {
    #[serde(default)]
    name: Option<String>,
}

async fn handle_checkpoint_sandbox(req: Request<Incoming>, id: &str, ctx: &RequestContext, state: &AppState) -> Response<BoxBody> {
    let body: CheckpointBody = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let team = match resolve_team(ctx, state).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match state.lifecycle.checkpoint_sandbox(ctx, &team, id, body.name).await {
        Ok(checkpoint) => created(checkpoint),
        Err(e) => from_api_error(e),
    }
}

async fn handle_restore_checkpoint(id: &str, checkpoint_id: &str, ctx: &RequestContext, state: &AppState) -> Response<BoxBody> {
    let Ok(checkpoint_id) = Uuid::parse_str(checkpoint_id) else {
        return json_response(StatusCode::BAD_REQUEST, &ApiResponse::<()>::err("invalid checkpoint id"));
    };
    let team = match resolve_team(ctx, state).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match state.lifecycle.restore_checkpoint(ctx, &team, id, checkpoint_id).await {
        Ok(sandbox) => created(sandbox),
        Err(e) => from_api_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct RegisterBuildBody {
    alias: String,
    #[serde(default)]
    vcpu: Option<u32>,
    #[serde(default)]
    ram_mb: Option<u64>,
    #[serde(default)]
    dockerfile: Option<String>,
    #[serde(default)]
    start_cmd: Option<String>,
    #[serde(default)]
    ready_cmd: Option<String>,
    #[serde(default)]
    cluster_id: Option<Uuid>,
}

async fn handle_register_build(req: Request<Incoming>, ctx: &RequestContext, state: &AppState) -> Response<BoxBody> {
    let body: RegisterBuildBody = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let team = match resolve_team(ctx, state).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    let result = build::register_build(
        &*state.store,
        ctx,
        &state.config,
        &team,
        RegisterBuildRequest {
            alias: body.alias,
            vcpu: body.vcpu,
            ram_mb: body.ram_mb,
            dockerfile: body.dockerfile,
            start_cmd: body.start_cmd,
            ready_cmd: body.ready_cmd,
            cluster_id: body.cluster_id,
        },
    )
    .await;

    match result {
        Ok((template, build)) => created(serde_json::json!({"template": template, "build": build})),
        Err(e) => from_api_error(e),
    }
}

async fn handle_start_build(build_id: &str, ctx: &RequestContext, state: &AppState) -> Response<BoxBody> {
    let Ok(build_id) = Uuid::parse_str(build_id) else {
        return json_response(StatusCode::BAD_REQUEST, &ApiResponse::<()>::err("invalid build id"));
    };
    let team = match resolve_team(ctx, state).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match build::start_build(&*state.store, &*state.template_manager, &state.config, ctx, &team, build_id).await {
        Ok(build) => ok(build),
        Err(e) => from_api_error(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum BuildOutcomeBody {
    Succeeded {
        envd_version: String,
        kernel_version: String,
        free_disk_mb: u64,
        #[serde(default)]
        cpu_info: Option<CpuInfo>,
    },
    Failed {
        reason: String,
    },
}

async fn handle_complete_build(req: Request<Incoming>, build_id: &str, state: &AppState) -> Response<BoxBody> {
    let Ok(build_id) = Uuid::parse_str(build_id) else {
        return json_response(StatusCode::BAD_REQUEST, &ApiResponse::<()>::err("invalid build id"));
    };
    let body: BuildOutcomeBody = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let outcome = match body {
        BuildOutcomeBody::Succeeded {
            envd_version,
            kernel_version,
            free_disk_mb,
            cpu_info,
        } => BuildOutcome::Succeeded {
            envd_version,
            kernel_version,
            free_disk_mb,
            cpu_info,
        },
        BuildOutcomeBody::Failed { reason } => BuildOutcome::Failed { reason },
    };

    match build::complete_build(&state.store, &state.cache, build_id, outcome).await {
        Ok(build) => ok(build),
        Err(e) => from_api_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct AssignTagsBody {
    assignments: Vec<TagAssignmentBody>,
}

#[derive(Debug, Deserialize)]
struct TagAssignmentBody {
    target: String,
    build_id: Uuid,
}

async fn handle_assign_tags(req: Request<Incoming>, ctx: &RequestContext, state: &AppState) -> Response<BoxBody> {
    let body: AssignTagsBody = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let team = match resolve_team(ctx, state).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    let assignments: Vec<TagAssignment> = body
        .assignments
        .into_iter()
        .map(|a| TagAssignment {
            target: a.target,
            build_id: a.build_id,
        })
        .collect();

    match tags::assign_tags(&*state.store, &state.cache, ctx, &team, &assignments).await {
        Ok(assigned) => ok(assigned),
        Err(e) => from_api_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct DeleteTagsBody {
    tags: Vec<String>,
}

async fn handle_delete_tags(req: Request<Incoming>, identifier: &str, ctx: &RequestContext, state: &AppState) -> Response<BoxBody> {
    let body: DeleteTagsBody = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let team = match resolve_team(ctx, state).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match tags::delete_tags(&*state.store, &state.cache, ctx, &team, identifier, &body.tags).await {
        Ok(()) => ok("deleted"),
        Err(e) => from_api_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct UpdateTemplateBody {
    public: bool,
}

async fn handle_update_template(req: Request<Incoming>, template_id: &str, ctx: &RequestContext, state: &AppState) -> Response<BoxBody> {
    let body: UpdateTemplateBody = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let team = match resolve_team(ctx, state).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let template = match state.store.get_template(template_id).await {
        Ok(Some(t)) if t.team_id == team.id => t,
        Ok(_) => return json_response(StatusCode::NOT_FOUND, &ApiResponse::<()>::err("template not found")),
        Err(e) => return from_api_error(e),
    };
    match state.store.set_template_public(&template.id, body.public).await {
        Ok(()) => {
            state.cache.invalidate_all_tags(&template.id);
            ok("updated")
        }
        Err(e) => from_api_error(e),
    }
}

/// Namespaced aliases only resolve inside the caller's own team slug; a
/// mismatched namespace reads the same as an absent alias.
async fn handle_resolve_alias(namespace: Option<&str>, identifier: &str, ctx: &RequestContext, state: &AppState) -> Response<BoxBody> {
    let team = match resolve_team(ctx, state).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    if let Some(ns) = namespace
        && ns != team.slug
    {
        return json_response(StatusCode::NOT_FOUND, &ApiResponse::<()>::err("alias not found"));
    }
    let alias = match state.store.resolve_alias(identifier, namespace).await {
        Ok(Some(alias)) if alias.team_id == team.id || alias.public => alias,
        Ok(_) => return json_response(StatusCode::NOT_FOUND, &ApiResponse::<()>::err("alias not found")),
        Err(e) => return from_api_error(e),
    };
    ok(serde_json::json!({
        "template_id": alias.template_id,
        "public": alias.public,
    }))
}

async fn handle_team_metrics(req: Request<Incoming>, team_id: &str, ctx: &RequestContext, state: &AppState) -> Response<BoxBody> {
    let Ok(team_id) = Uuid::parse_str(team_id) else {
        return json_response(StatusCode::BAD_REQUEST, &ApiResponse::<()>::err("invalid team id"));
    };
    let team = match context::get_team(&*state.store, ctx, Some(team_id)).await {
        Ok(t) => t,
        Err(e) => return from_api_error(e),
    };

    let params = query_params(&req);
    let start = params.get("start").and_then(|s| s.parse::<chrono::DateTime<chrono::Utc>>().ok());
    let end = params.get("end").and_then(|s| s.parse::<chrono::DateTime<chrono::Utc>>().ok());

    match crate::logs::get_team_metrics(&state.logs, &*state.orchestrator, &state.config, &team, start, end).await {
        Ok(metrics) => ok(metrics),
        Err(e) => from_api_error(e),
    }
}

fn query_params(req: &Request<Incoming>) -> HashMap<String, String> {
    req.uri()
        .query()
        .map(|q| {
            q.split('&')
                .filter_map(|pair| {
                    let mut parts = pair.splitn(2, '=');
                    Some((parts.next()?.to_string(), parts.next().unwrap_or("").to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

async fn handle_fetch_logs(req: Request<Incoming>, id: &str, ctx: &RequestContext, state: &AppState) -> Response<BoxBody> {
    let team = match resolve_team(ctx, state).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let sandbox = match state.orchestrator.get_sandbox(id).await {
        Ok(Some(sandbox)) if sandbox.team_id == team.id => sandbox,
        Ok(_) => return json_response(StatusCode::NOT_FOUND, &ApiResponse::<()>::err("sandbox not found")),
        Err(e) => return from_api_error(e),
    };
    let node = match state.orchestrator.get_node(sandbox.node_id).await {
        Ok(Some(node)) => node,
        Ok(None) => return from_api_error(ApiError::internal("sandbox node is not registered")),
        Err(e) => return from_api_error(e),
    };

    let params = query_params(&req);
    let direction = match params.get("direction").map(|s| s.as_str()) {
        Some("backward") => crate::logs::LogDirection::Backward,
        _ => crate::logs::LogDirection::Forward,
    };
    let query = crate::logs::LogsQuery {
        sandbox_id: id.to_string(),
        start: params.get("start").and_then(|s| s.parse::<chrono::DateTime<chrono::Utc>>().ok()),
        end: params.get("end").and_then(|s| s.parse::<chrono::DateTime<chrono::Utc>>().ok()),
        cursor: params.get("cursor").and_then(|s| s.parse().ok()),
        limit: params.get("limit").and_then(|s| s.parse().ok()).unwrap_or(200),
        direction,
    };

    match state.logs.fetch_logs(&node, &query, &state.config).await {
        Ok(page) => ok(page),
        Err(e) => from_api_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct GetSandboxesMetricsBody {
    sandbox_ids: Vec<String>,
}

async fn handle_get_sandboxes_metrics(req: Request<Incoming>, ctx: &RequestContext, state: &AppState) -> Response<BoxBody> {
    let body: GetSandboxesMetricsBody = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let team = match resolve_team(ctx, state).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    match crate::logs::get_sandboxes_metrics(state.logs.clone(), state.orchestrator.clone(), &state.config, team.id, body.sandbox_ids).await {
        Ok(metrics) => ok(metrics),
        Err(e) => from_api_error(e),
    }
}

/// Runs the demo HTTP server: one task per connection, `http1` only (no
/// need for an h2 front door alongside the dedicated gRPC port).
pub async fn run_server(addr: SocketAddr, state: Arc<AppState>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "http api listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let state = state.clone();
                handle_request(req, state)
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                tracing::warn!(error = %err, "error serving http connection");
            }
        });
    }
}
