//! Stop and verify runs against started clients

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use ethdeploy::engine::lifecycle::{started_records, stop_clients, verify_clients};
use ethdeploy::engine::RunStatus;
use ethdeploy::inventory::InventoryStore;
use ethdeploy::models::host::Host;
use ethdeploy::models::request::{DeploymentRequest, SyncMode};
use ethdeploy::models::step::{SkipReason, StepOutcome};
use ethdeploy::resolver::TargetResolver;

use crate::common::{engine, fast_policy, temp_state, Behavior, ScriptedBackend};

const DEFAULT_STOP: &str = "/usr/local/bin/sedge down --path /opt/ethdeploy/sepolia-lodestar";

async fn local_inventory() -> InventoryStore {
    let inventory = InventoryStore::new(None);
    inventory.upsert(Host::localhost().with_tag("sepolia")).await.unwrap();
    inventory
}

#[tokio::test]
async fn test_deploy_stop_deploy_stop_runs_both_stops() {
    let inventory = local_inventory().await;
    let request = DeploymentRequest::new("sepolia", "lodestar", SyncMode::Fast);
    let plan = TargetResolver::new(&inventory).plan(&request).unwrap();

    let (dir, state) = temp_state("lifecycle-restart").await;
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine(backend.clone(), state);
    let policy = fast_policy();
    let cancel = CancellationToken::new();

    for round in 1..=2 {
        let deployed = engine.run(&plan, &policy, &cancel).await.unwrap();
        assert_eq!(deployed.status, RunStatus::Completed);
        let start = deployed.results.iter().find(|r| r.step_id == "start-client").unwrap();
        assert_eq!(start.outcome, StepOutcome::Succeeded, "round {}", round);

        let stopped = stop_clients(&engine, &inventory, &request, &[], &policy, &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stopped.results.len(), 1);
        assert_eq!(stopped.results[0].outcome, StepOutcome::Succeeded, "round {}", round);
        assert_eq!(backend.call_count("localhost", DEFAULT_STOP), round);
        assert!(started_records(&engine, &request, &[]).is_empty());
    }

    // Nothing left running.
    let idle = stop_clients(&engine, &inventory, &request, &[], &policy, &cancel).await.unwrap();
    assert!(idle.is_none());
    assert_eq!(backend.call_count("localhost", DEFAULT_STOP), 2);

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_stop_uses_deploy_overrides() {
    let inventory = local_inventory().await;
    let deployed_with = DeploymentRequest::new("sepolia", "lodestar", SyncMode::Fast)
        .with_override("deploy_root", "/srv/eth");
    let plan = TargetResolver::new(&inventory).plan(&deployed_with).unwrap();

    let (dir, state) = temp_state("lifecycle-overrides").await;
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine(backend.clone(), state);
    let cancel = CancellationToken::new();
    engine.run(&plan, &fast_policy(), &cancel).await.unwrap();

    let records = started_records(&engine, &deployed_with, &[]);
    assert_eq!(records[0].overrides["deploy_root"], "/srv/eth");

    // The stop request carries no --set at all.
    let bare = DeploymentRequest::new("sepolia", "lodestar", SyncMode::Fast);
    let run = stop_clients(&engine, &inventory, &bare, &[], &fast_policy(), &cancel)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(
        backend.call_count("localhost", "/usr/local/bin/sedge down --path /srv/eth/sepolia-lodestar"),
        1
    );
    assert_eq!(backend.call_count("localhost", DEFAULT_STOP), 0);

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_failed_stop_keeps_client_recorded() {
    let inventory = local_inventory().await;
    let request = DeploymentRequest::new("sepolia", "lodestar", SyncMode::Fast);
    let plan = TargetResolver::new(&inventory).plan(&request).unwrap();

    let (dir, state) = temp_state("lifecycle-failed-stop").await;
    let backend = Arc::new(ScriptedBackend::new());
    backend.script("localhost", DEFAULT_STOP, &[Behavior::Fail(1)]);
    let engine = engine(backend.clone(), state);
    let cancel = CancellationToken::new();
    engine.run(&plan, &fast_policy(), &cancel).await.unwrap();

    let run = stop_clients(&engine, &inventory, &request, &[], &fast_policy(), &cancel)
        .await
        .unwrap()
        .unwrap();
    assert!(run.results[0].outcome.is_failed());
    assert_eq!(started_records(&engine, &request, &[]).len(), 1);

    // A retried stop runs again rather than reporting convergence.
    let run = stop_clients(&engine, &inventory, &request, &[], &fast_policy(), &cancel)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.results[0].outcome, StepOutcome::Succeeded);
    assert_eq!(backend.call_count("localhost", DEFAULT_STOP), 2);

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_stop_limited_to_named_hosts() {
    let inventory = InventoryStore::new(None);
    inventory.upsert(Host::localhost().with_tag("sepolia")).await.unwrap();
    inventory
        .upsert(Host::new("box", ethdeploy::models::host::ConnectionKind::Local, "").with_tag("sepolia"))
        .await
        .unwrap();
    let request = DeploymentRequest::new("sepolia", "lodestar", SyncMode::Fast);
    let plan = TargetResolver::new(&inventory).plan(&request).unwrap();

    let (dir, state) = temp_state("lifecycle-named").await;
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine(backend.clone(), state);
    let cancel = CancellationToken::new();
    engine.run(&plan, &fast_policy(), &cancel).await.unwrap();

    let run = stop_clients(&engine, &inventory, &request, &["box".to_string()], &fast_policy(), &cancel)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.results.len(), 1);
    assert_eq!(run.results[0].host, "box");

    let remaining: Vec<String> = started_records(&engine, &request, &[]).into_iter().map(|r| r.host).collect();
    assert_eq!(remaining, ["localhost"]);

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_verify_without_started_clients() {
    let inventory = local_inventory().await;
    let (dir, state) = temp_state("lifecycle-verify-idle").await;
    let engine = engine(Arc::new(ScriptedBackend::new()), state);
    let request = DeploymentRequest::new("sepolia", "lodestar", SyncMode::Fast);

    let run = verify_clients(&engine, &inventory, &request, &[], &fast_policy(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(run.is_none());

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_dry_run_stop_keeps_records() {
    let inventory = local_inventory().await;
    let request = DeploymentRequest::new("sepolia", "lodestar", SyncMode::Fast);
    let plan = TargetResolver::new(&inventory).plan(&request).unwrap();

    let (dir, state) = temp_state("lifecycle-dry-run").await;
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine(backend.clone(), state);
    let cancel = CancellationToken::new();
    engine.run(&plan, &fast_policy(), &cancel).await.unwrap();

    let mut policy = fast_policy();
    policy.dry_run = true;
    let run = stop_clients(&engine, &inventory, &request, &[], &policy, &cancel)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(run.results[0].outcome, StepOutcome::Skipped(SkipReason::DryRun));
    assert_eq!(backend.call_count("localhost", DEFAULT_STOP), 0);
    assert_eq!(started_records(&engine, &request, &[]).len(), 1);

    dir.delete().await.unwrap();
}
