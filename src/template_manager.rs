//! Template manager facade.
//!
//! The template manager (the separate service that actually turns a
//! `waiting` build into a running Firecracker image build) is an external
//! collaborator, the same way the cluster scheduler behind `orchestrator.rs`
//! is: one trait the build coordinator calls against, an in-memory stand-in
//! here for tests, a real RPC client elsewhere.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::model::EnvBuild;

#[async_trait]
pub trait TemplateManager: Send + Sync {
    /// Dispatches a `building` image construction job for `build`. The
    /// caller (the build coordinator) has already claimed the build and
    /// picked a builder node; this just hands it off.
    async fn create_template(&self, build: &EnvBuild) -> ApiResult<()>;

    /// Cancels an in-flight build on its builder node. Called before a new
    /// build of the same template may start; a failure here is fatal to
    /// that start, since two builders racing the same template would both
    /// try to claim its `latest`.
    async fn delete_build(&self, build: &EnvBuild) -> ApiResult<()>;
}

/// Records every build id it was asked to build or cancel, and fails
/// whichever id was queued via `fail_next` -- lets a test exercise the
/// dispatch- and cancel-failure paths without a real template manager.
#[derive(Default)]
pub struct InMemoryTemplateManager {
    dispatched: DashSet<Uuid>,
    cancelled: DashSet<Uuid>,
    failing: DashSet<Uuid>,
}

impl InMemoryTemplateManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, build_id: Uuid) {
        self.failing.insert(build_id);
    }

    pub fn was_dispatched(&self, build_id: Uuid) -> bool {
        self.dispatched.contains(&build_id)
    }

    pub fn was_cancelled(&self, build_id: Uuid) -> bool {
        self.cancelled.contains(&build_id)
    }
}

#[async_trait]
impl TemplateManager for InMemoryTemplateManager {
    async fn create_template(&self, build: &EnvBuild) -> ApiResult<()> {
        if self.failing.remove(&build.id).is_some() {
            return Err(ApiError::internal("template manager rejected the build"));
        }
        self.dispatched.insert(build.id);
        Ok(())
    }

    async fn delete_build(&self, build: &EnvBuild) -> ApiResult<()> {
        if self.failing.remove(&build.id).is_some() {
            return Err(ApiError::internal("template manager could not cancel the build"));
        }
        self.cancelled.insert(build.id);
        Ok(())
    }
}
