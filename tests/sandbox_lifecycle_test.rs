//! End-to-end sandbox lifecycle: create, pause, resume-from-snapshot after
//! the orchestrator reaps the sandbox entirely, checkpoint/restore, clone,
//! and kill -- exercised against the in-memory ports.

use std::sync::Arc;

use agentkernel_ctl::cache::TemplateCache;
use agentkernel_ctl::config::PlatformConfig;
use agentkernel_ctl::context::RequestContext;
use agentkernel_ctl::error::ErrorKind;
use agentkernel_ctl::lifecycle::{CreateSandboxRequest, LifecycleCoordinator};
use agentkernel_ctl::model::{BuildStatus, EnvBuild, SandboxState, DEFAULT_TAG};
use agentkernel_ctl::orchestrator::InMemoryOrchestrator;
use agentkernel_ctl::store::InMemoryStore;

async fn build_coordinator() -> (LifecycleCoordinator, Arc<InMemoryStore>, agentkernel_ctl::model::Team) {
    let store = InMemoryStore::new();
    let team = store.seed_team("acme").await;
    store.seed_template("tpl1", team.id, false).await;
    store.seed_alias("acme/app", team.id, "tpl1", false).await;

    let mut build = EnvBuild::new_waiting("tpl1", 2, 1024);
    build.status = BuildStatus::Succeeded;
    build.envd_version = Some("0.3.0".to_string());
    let build = store.seed_build(build).await;
    store.assign_tags("tpl1", &[(DEFAULT_TAG.to_string(), build.id)]).await.unwrap();

    let orchestrator = InMemoryOrchestrator::new();
    let cache = Arc::new(TemplateCache::new());
    let config = PlatformConfig::default();
    let coordinator = LifecycleCoordinator::new(store.clone(), orchestrator, cache, config, b"integration-test-key".to_vec());
    (coordinator, store, team)
}

#[tokio::test]
async fn full_lifecycle_survives_a_reap_and_recreate_cycle() {
    let (coordinator, _store, team) = build_coordinator().await;
    let ctx = RequestContext::for_team("trace-1", team.id);

    let created = coordinator
        .create_sandbox(
            &ctx,
            &team,
            CreateSandboxRequest {
                template_identifier: "app".to_string(),
                allow_internet_access: true,
                secure: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(created.state, SandboxState::Running);
    let original_id = created.id.clone();

    // Pausing captures a snapshot immediately -- simulate the orchestrator
    // confirming the pause and then fully reaping the sandbox (e.g. the
    // node it lived on was reclaimed).
    let paused = coordinator.pause_sandbox(&ctx, &team, &original_id).await.unwrap();
    assert_eq!(paused.state, SandboxState::Pausing);
    coordinator.kill_sandbox(&ctx, &team, &original_id).await.unwrap();

    // The orchestrator has no record of it anymore; resume must fall back
    // to the last snapshot and recreate it under the same id.
    let resumed = coordinator.resume_sandbox(&ctx, &team, &original_id).await.unwrap();
    assert_eq!(resumed.id, original_id);
    assert_eq!(resumed.state, SandboxState::Running);
    assert!(resumed.envd_access_token.is_some());
}

#[tokio::test]
async fn checkpoint_restore_clone_and_kill_round_trip() {
    let (coordinator, _store, team) = build_coordinator().await;
    let ctx = RequestContext::for_team("trace-2", team.id);

    let created = coordinator
        .create_sandbox(
            &ctx,
            &team,
            CreateSandboxRequest {
                template_identifier: "app".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let checkpoint = coordinator.checkpoint_sandbox(&ctx, &team, &created.id, Some("before-risky-step".to_string())).await.unwrap();
    assert_eq!(checkpoint.name, "before-risky-step");

    let listed = coordinator.list_checkpoints(&ctx, &team, &created.id).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "before-risky-step");

    // Restore hard-kills the running original and brings it back under the
    // same id, on the checkpointed build.
    let restored = coordinator.restore_checkpoint(&ctx, &team, &created.id, checkpoint.id).await.unwrap();
    assert_eq!(restored.id, created.id);
    assert_eq!(restored.build_id, checkpoint.build_id);
    assert_eq!(restored.state, SandboxState::Running);

    let cloned = coordinator.clone_sandbox(&ctx, &team, &created.id).await.unwrap();
    assert_ne!(cloned.id, created.id);

    coordinator.kill_sandbox(&ctx, &team, &created.id).await.unwrap();
    coordinator.kill_sandbox(&ctx, &team, &cloned.id).await.unwrap();

    let err = coordinator.refresh_sandbox(&ctx, &team, &created.id, std::time::Duration::from_secs(60)).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn quota_is_enforced_across_the_whole_team_not_per_template() {
    let (coordinator, store, team) = build_coordinator().await;
    let team = store
        .seed_team_with_limits(
            "tight",
            agentkernel_ctl::model::TeamLimits {
                max_concurrent: 1,
                ..team.limits
            },
        )
        .await;
    store.seed_template("tpl2", team.id, false).await;
    store.seed_alias("tight/app2", team.id, "tpl2", false).await;
    let mut build2 = EnvBuild::new_waiting("tpl2", 1, 256);
    build2.status = BuildStatus::Succeeded;
    let build2 = store.seed_build(build2).await;
    store.assign_tags("tpl2", &[(DEFAULT_TAG.to_string(), build2.id)]).await.unwrap();

    let ctx = RequestContext::for_team("trace-3", team.id);
    let req = CreateSandboxRequest {
        template_identifier: "app2".to_string(),
        ..Default::default()
    };
    let first = coordinator.create_sandbox(&ctx, &team, req.clone()).await.unwrap();
    let err = coordinator.create_sandbox(&ctx, &team, req).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::QuotaExceeded);

    coordinator.kill_sandbox(&ctx, &team, &first.id).await.unwrap();
    let second = coordinator.create_sandbox(&ctx, &team, CreateSandboxRequest {
        template_identifier: "app2".to_string(),
        ..Default::default()
    }).await.unwrap();
    assert_ne!(second.id, first.id);
}
