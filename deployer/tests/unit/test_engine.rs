//! Convergence engine tests

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use ethdeploy::engine::RunStatus;
use ethdeploy::inventory::InventoryStore;
use ethdeploy::models::host::Host;
use ethdeploy::models::request::{DeploymentRequest, SyncMode};
use ethdeploy::models::step::{FailureReason, Phase, SkipReason, StepOutcome};
use ethdeploy::resolver::TargetResolver;

use crate::common::{engine, fast_policy, node_chain, plan, step, temp_state, Behavior, ScriptedBackend};

fn ids(results: &[ethdeploy::models::step::StepResult]) -> Vec<&str> {
    results.iter().map(|r| r.step_id.as_str()).collect()
}

#[tokio::test]
async fn test_sepolia_lodestar_plan_completes() {
    let inventory = InventoryStore::new(None);
    inventory.upsert(Host::localhost().with_tag("sepolia")).await.unwrap();
    let request = DeploymentRequest::new("sepolia", "lodestar", SyncMode::Fast);
    let plan = TargetResolver::new(&inventory).plan(&request).unwrap();

    let (dir, state) = temp_state("engine-sepolia").await;
    let backend = Arc::new(ScriptedBackend::new());
    let run = engine(backend.clone(), state)
        .run(&plan, &fast_policy(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        ids(&run.results),
        ["ensure-container", "install-client", "configure-client", "start-client"]
    );
    assert!(run.results.iter().all(|r| r.outcome == StepOutcome::Succeeded));
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.exit_code(), 0);
    assert_eq!(backend.calls().len(), 4);
    assert_eq!(run.state.len(), 4);

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_timeout_twice_aborts_dependent_steps() {
    let plan = plan(node_chain("node-a"));
    let (dir, state) = temp_state("engine-timeout").await;
    let backend = Arc::new(ScriptedBackend::new());
    backend.script("node-a", "install-client", &[Behavior::Hang, Behavior::Hang]);

    let mut policy = fast_policy();
    policy.max_retries = 1;
    policy.step_timeout = Duration::from_millis(50);

    let run = engine(backend.clone(), state)
        .run(&plan, &policy, &CancellationToken::new())
        .await
        .unwrap();

    let install = &run.results[1];
    assert_eq!(install.outcome, StepOutcome::Failed(FailureReason::Timeout));
    assert_eq!(install.retries, 1);
    assert_eq!(backend.call_count("node-a", "install-client"), 2);
    assert_eq!(backend.call_count("node-a", "configure-client"), 0);
    assert_eq!(
        run.results[2].outcome,
        StepOutcome::Skipped(SkipReason::DependencyFailed)
    );
    assert_eq!(run.status, RunStatus::Aborted);
    assert_eq!(run.exit_code(), 2);

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_independent_host_failure_is_partial() {
    let mut steps = node_chain("node-a");
    steps.extend(node_chain("node-b"));
    let plan = plan(steps);

    let (dir, state) = temp_state("engine-partial").await;
    let backend = Arc::new(ScriptedBackend::new());
    backend.script("node-b", "ensure-container", &[Behavior::Fail(1)]);

    let mut policy = fast_policy();
    policy.continue_on_error = true;

    let run = engine(backend.clone(), state)
        .run(&plan, &policy, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.exit_code(), 1);
    assert!(run
        .results
        .iter()
        .filter(|r| r.host == "node-a")
        .all(|r| r.outcome == StepOutcome::Succeeded));
    assert_eq!(backend.commands_on("node-b"), ["ensure-container"]);

    let failures: Vec<_> = run.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].host, "node-b");
    assert_eq!(failures[0].outcome, StepOutcome::Failed(FailureReason::ExitStatus(1)));
    assert!(failures[0].output.contains("failed"));

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_failure_without_continue_aborts_other_chains() {
    let mut steps = node_chain("node-a");
    steps.extend(node_chain("node-b"));
    let plan = plan(steps);

    let (dir, state) = temp_state("engine-abort").await;
    let backend = Arc::new(ScriptedBackend::new());
    backend.script("node-a", "ensure-container", &[Behavior::Fail(3)]);

    // One chain at a time: node-b is still waiting for the pool when node-a fails.
    let mut policy = fast_policy();
    policy.parallelism = Some(1);

    let run = engine(backend.clone(), state)
        .run(&plan, &policy, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Aborted);
    assert!(backend.commands_on("node-b").is_empty());
    assert!(run
        .results
        .iter()
        .filter(|r| r.host == "node-b")
        .all(|r| r.outcome == StepOutcome::Skipped(SkipReason::Aborted)));

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_completed_plan_rerun_has_no_side_effects() {
    let mut steps = node_chain("node-a");
    steps.extend(node_chain("node-b"));
    let plan = plan(steps);
    let (dir, state) = temp_state("engine-idempotent").await;

    let first = Arc::new(ScriptedBackend::new());
    let run = engine(first.clone(), state.clone())
        .run(&plan, &fast_policy(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(first.calls().len(), 8);

    let second = Arc::new(ScriptedBackend::new());
    let rerun = engine(second.clone(), state)
        .run(&plan, &fast_policy(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(second.calls().is_empty());
    assert_eq!(rerun.status, RunStatus::Completed);
    assert!(rerun
        .results
        .iter()
        .all(|r| r.outcome == StepOutcome::Skipped(SkipReason::Converged)));
    assert_eq!(rerun.state, run.state);

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_force_rerun_executes_converged_steps() {
    let plan = plan(node_chain("node-a"));
    let (dir, state) = temp_state("engine-force").await;

    engine(Arc::new(ScriptedBackend::new()), state.clone())
        .run(&plan, &fast_policy(), &CancellationToken::new())
        .await
        .unwrap();

    let backend = Arc::new(ScriptedBackend::new());
    let mut policy = fast_policy();
    policy.force_rerun = true;
    engine(backend.clone(), state)
        .run(&plan, &policy, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(backend.calls().len(), 4);
    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_rerun_after_failure_resumes_at_failed_step() {
    let plan = plan(node_chain("node-a"));
    let (dir, state) = temp_state("engine-resume").await;

    let first = Arc::new(ScriptedBackend::new());
    first.script("node-a", "configure-client", &[Behavior::Fail(1)]);
    let run = engine(first, state.clone())
        .run(&plan, &fast_policy(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Aborted);

    let second = Arc::new(ScriptedBackend::new());
    let rerun = engine(second.clone(), state)
        .run(&plan, &fast_policy(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(rerun.status, RunStatus::Completed);
    assert_eq!(second.commands_on("node-a"), ["configure-client", "start-client"]);

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_executor_invoked_at_most_retries_plus_one() {
    for max_retries in 0..3u32 {
        let plan = plan(vec![step("install-client", "node-a", Phase::Install)]);
        let (dir, state) = temp_state("engine-retries").await;
        let backend = Arc::new(ScriptedBackend::new());
        backend.script("node-a", "install-client", &[Behavior::Fail(1); 5]);

        let mut policy = fast_policy();
        policy.max_retries = max_retries;
        let run = engine(backend.clone(), state)
            .run(&plan, &policy, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            backend.call_count("node-a", "install-client"),
            max_retries as usize + 1
        );
        assert_eq!(run.results[0].retries, max_retries);
        dir.delete().await.unwrap();
    }
}

#[tokio::test]
async fn test_retry_recovers_from_transient_failure() {
    let plan = plan(vec![step("install-client", "node-a", Phase::Install)]);
    let (dir, state) = temp_state("engine-transient").await;
    let backend = Arc::new(ScriptedBackend::new());
    backend.script("node-a", "install-client", &[Behavior::Fail(1)]);

    let mut policy = fast_policy();
    policy.max_retries = 2;
    let run = engine(backend.clone(), state)
        .run(&plan, &policy, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.results[0].retries, 1);
    assert_eq!(backend.call_count("node-a", "install-client"), 2);
    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_host_chains_keep_their_order() {
    let hosts = ["node-a", "node-b", "node-c"];
    let steps = hosts.iter().flat_map(|h| node_chain(h)).collect();
    let plan = plan(steps);

    let (dir, state) = temp_state("engine-order").await;
    let backend = Arc::new(ScriptedBackend::new().with_delay(Duration::from_millis(5)));
    let run = engine(backend.clone(), state)
        .run(&plan, &fast_policy(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    for host in hosts {
        assert_eq!(
            backend.commands_on(host),
            ["ensure-container", "install-client", "configure-client", "start-client"]
        );
    }
    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_skip_tags_and_dry_run() {
    let mut tagged = step("configure-validator", "node-a", Phase::Configure);
    tagged.tags.insert("validator".to_string());
    let plan = plan(vec![step("install-client", "node-a", Phase::Install), tagged]);
    let (dir, state) = temp_state("engine-skip").await;

    let backend = Arc::new(ScriptedBackend::new());
    let mut policy = fast_policy();
    policy.skip_tags.insert("validator".to_string());
    let run = engine(backend.clone(), state.clone())
        .run(&plan, &policy, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(backend.commands_on("node-a"), ["install-client"]);
    assert_eq!(
        run.results[1].outcome,
        StepOutcome::Skipped(SkipReason::Tag("validator".to_string()))
    );
    assert_eq!(run.status, RunStatus::Completed);

    let dry = Arc::new(ScriptedBackend::new());
    let mut policy = fast_policy();
    policy.dry_run = true;
    policy.force_rerun = true;
    let before = state.len();
    let run = engine(dry.clone(), state.clone())
        .run(&plan, &policy, &CancellationToken::new())
        .await
        .unwrap();

    assert!(dry.calls().is_empty());
    assert_eq!(state.len(), before);
    assert!(run
        .results
        .iter()
        .all(|r| r.outcome == StepOutcome::Skipped(SkipReason::DryRun)));
    assert_eq!(run.results[0].output, "install-client");

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_plan_starts_nothing() {
    let plan = plan(node_chain("node-a"));
    let (dir, state) = temp_state("engine-cancel").await;
    let backend = Arc::new(ScriptedBackend::new());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let run = engine(backend.clone(), state)
        .run(&plan, &fast_policy(), &cancel)
        .await
        .unwrap();

    assert!(backend.calls().is_empty());
    assert_eq!(run.status, RunStatus::Aborted);
    assert!(run
        .results
        .iter()
        .all(|r| r.outcome == StepOutcome::Skipped(SkipReason::Aborted)));
    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_cancel_lets_in_flight_step_finish() {
    let plan = plan(node_chain("node-a"));
    let (dir, state) = temp_state("engine-inflight").await;
    let backend = Arc::new(ScriptedBackend::new().with_delay(Duration::from_millis(100)));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let run = engine(backend.clone(), state.clone())
        .run(&plan, &fast_policy(), &cancel)
        .await
        .unwrap();

    assert_eq!(run.results[0].outcome, StepOutcome::Succeeded);
    assert_eq!(backend.calls().len(), 1);
    assert_eq!(run.status, RunStatus::Aborted);
    assert_eq!(state.len(), 1);
    dir.delete().await.unwrap();
}
