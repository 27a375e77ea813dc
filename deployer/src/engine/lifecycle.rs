//! Follow-up runs against clients a deploy left running

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::{ConvergenceEngine, ConvergencePolicy, PlanRun};
use crate::errors::OrchestratorError;
use crate::inventory::InventoryStore;
use crate::models::request::DeploymentRequest;
use crate::resolver::catalog::STOP_STEP;
use crate::resolver::TargetResolver;
use crate::state::{StateSnapshotter, StepRecord};

/// Step whose success marks a running client
pub const START_STEP: &str = "start-client";

/// Succeeded `start-client` records for the request, limited to `only_hosts`
/// when it is non-empty
pub fn started_records(
    engine: &ConvergenceEngine,
    request: &DeploymentRequest,
    only_hosts: &[String],
) -> Vec<StepRecord> {
    StateSnapshotter::new(engine.state().clone())
        .succeeded_records(START_STEP, request.network(), request.client())
        .into_iter()
        .filter(|r| only_hosts.is_empty() || only_hosts.contains(&r.host))
        .collect()
}

/// Stop the client on every host where it was started
///
/// Returns `None` when no host has a running client. Stop commands are
/// rendered from the overrides each host was deployed with, and the
/// `start-client` records of stopped hosts are dropped so the next deploy
/// starts them again.
pub async fn stop_clients(
    engine: &ConvergenceEngine,
    inventory: &InventoryStore,
    request: &DeploymentRequest,
    only_hosts: &[String],
    policy: &ConvergencePolicy,
    cancel: &CancellationToken,
) -> Result<Option<PlanRun>, OrchestratorError> {
    let started = started_records(engine, request, only_hosts);
    if started.is_empty() {
        return Ok(None);
    }

    let plan = TargetResolver::new(inventory).stop_plan(request, &started)?;
    let run = engine.run(&plan, policy, cancel).await?;

    if !policy.dry_run {
        forget_started(engine, request, &run).await?;
    }
    Ok(Some(run))
}

/// Check the nodes on every host where the client was started
pub async fn verify_clients(
    engine: &ConvergenceEngine,
    inventory: &InventoryStore,
    request: &DeploymentRequest,
    only_hosts: &[String],
    policy: &ConvergencePolicy,
    cancel: &CancellationToken,
) -> Result<Option<PlanRun>, OrchestratorError> {
    let started = started_records(engine, request, only_hosts);
    if started.is_empty() {
        return Ok(None);
    }

    let plan = TargetResolver::new(inventory).verify_plan(request, &started)?;
    engine.run(&plan, policy, cancel).await.map(Some)
}

async fn forget_started(
    engine: &ConvergenceEngine,
    request: &DeploymentRequest,
    run: &PlanRun,
) -> Result<(), OrchestratorError> {
    let stopped: Vec<&str> = run
        .results
        .iter()
        .filter(|r| r.step_id == STOP_STEP.id && r.outcome.is_succeeded())
        .map(|r| r.host.as_str())
        .collect();

    let state = engine.state();
    let keys: Vec<String> = state
        .state()
        .records()
        .filter(|r| {
            r.step_id == START_STEP
                && r.network == request.network()
                && r.client == request.client()
                && stopped.contains(&r.host.as_str())
        })
        .map(|r| r.idempotency_key.clone())
        .collect();
    if !keys.is_empty() {
        info!("Forgetting {} start records after stop", keys.len());
    }
    state.remove(keys).await
}
