//! Convergence engine
//!
//! Drives a `StepPlan` to completion. Each host's steps form a chain that
//! runs strictly in order; chains for different hosts run concurrently on a
//! bounded pool.

pub mod fsm;
pub mod lifecycle;
pub mod policy;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::deploy::executor::StepExecutor;
use crate::errors::OrchestratorError;
use crate::models::host::Host;
use crate::models::step::{SkipReason, Step, StepOutcome, StepPlan, StepResult};
use crate::state::{DeploymentState, StateStore, StepRecord};
use crate::utils::calc_exp_backoff;

use fsm::{StepEvent, StepFsm};
pub use policy::ConvergencePolicy;

/// Terminal status of a plan run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Every step succeeded or was skipped
    Completed,

    /// Some host chains failed while others finished cleanly
    Partial,

    /// A failure or cancellation stopped the plan
    Aborted,
}

impl RunStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Completed => 0,
            RunStatus::Partial => 1,
            RunStatus::Aborted => 2,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Partial => write!(f, "partial"),
            RunStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// Outcome of `ConvergenceEngine::run`
#[derive(Debug, Clone, Serialize)]
pub struct PlanRun {
    pub status: RunStatus,

    /// One result per plan step, in plan order
    pub results: Vec<StepResult>,

    /// Persisted records for the plan's steps after the run
    pub state: DeploymentState,
}

impl PlanRun {
    pub fn failures(&self) -> impl Iterator<Item = &StepResult> {
        self.results.iter().filter(|r| r.outcome.is_failed())
    }

    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }
}

#[derive(Debug, Default)]
struct ChainReport {
    results: Vec<StepResult>,
    failed: bool,
    aborted: bool,
}

#[derive(Clone)]
pub struct ConvergenceEngine {
    executor: StepExecutor,
    state: Arc<StateStore>,
    interrupt: CancellationToken,
}

impl ConvergenceEngine {
    pub fn new(executor: StepExecutor, state: Arc<StateStore>) -> Self {
        Self {
            executor,
            state,
            interrupt: CancellationToken::new(),
        }
    }

    /// Token that aborts in-flight steps when cancelled
    ///
    /// Plan-level cancellation passed to `run` only prevents new steps from
    /// starting; this one is handed to the executor.
    pub fn with_interrupt(mut self, interrupt: CancellationToken) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    /// Run `plan` under `policy` until every step has an outcome
    ///
    /// Step failures are reported in the returned `PlanRun`. An error is
    /// returned only when the state store cannot be written.
    pub async fn run(
        &self,
        plan: &StepPlan,
        policy: &ConvergencePolicy,
        cancel: &CancellationToken,
    ) -> Result<PlanRun, OrchestratorError> {
        let chains = plan.chains();
        let pool = policy.pool_size(chains.len());
        info!(
            "Running plan for {}/{}: {} steps on {} hosts (pool {})",
            plan.network(),
            plan.client(),
            plan.len(),
            chains.len(),
            pool
        );

        let semaphore = Arc::new(Semaphore::new(pool));
        let abort = cancel.child_token();

        let reports = join_all(chains.iter().map(|(host, steps)| {
            self.run_chain(plan, host, steps, policy, &semaphore, &abort)
        }))
        .await;

        let mut by_key: HashMap<String, StepResult> = HashMap::new();
        let mut first_error = None;
        let mut any_failed = false;
        let mut any_aborted = false;
        let mut any_clean = false;
        for report in reports {
            match report {
                Ok(report) => {
                    any_failed |= report.failed;
                    any_aborted |= report.aborted;
                    any_clean |= !report.failed && !report.aborted;
                    for result in report.results {
                        by_key.insert(result.idempotency_key.clone(), result);
                    }
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            error!("Plan run stopped: {}", e);
            return Err(e);
        }

        let results: Vec<StepResult> = plan
            .steps()
            .iter()
            .filter_map(|step| by_key.remove(&step.idempotency_key))
            .collect();

        let status = if !any_failed && !any_aborted {
            RunStatus::Completed
        } else if any_failed && !any_aborted && policy.continue_on_error && any_clean {
            RunStatus::Partial
        } else {
            RunStatus::Aborted
        };

        let mut state = DeploymentState::new();
        for step in plan.steps() {
            if let Some(record) = self.state.get(&step.idempotency_key) {
                state.insert(record);
            }
        }

        info!("Plan finished: {}", status);
        Ok(PlanRun {
            status,
            results,
            state,
        })
    }

    async fn run_chain(
        &self,
        plan: &StepPlan,
        host_name: &str,
        steps: &[Step],
        policy: &ConvergencePolicy,
        semaphore: &Semaphore,
        abort: &CancellationToken,
    ) -> Result<ChainReport, OrchestratorError> {
        let mut report = ChainReport::default();

        let _permit = tokio::select! {
            permit = semaphore.acquire() => permit.map_err(|e| OrchestratorError::Internal(e.to_string()))?,
            _ = abort.cancelled() => {
                report.aborted = true;
                report.results = steps.iter().map(|s| StepResult::skipped(s, SkipReason::Aborted)).collect();
                return Ok(report);
            }
        };

        let Some(host) = plan.host(host_name) else {
            return Err(OrchestratorError::HostNotFound(host_name.to_string()));
        };

        for step in steps {
            let result = if report.failed {
                StepResult::skipped(step, SkipReason::DependencyFailed)
            } else if abort.is_cancelled() {
                report.aborted = true;
                StepResult::skipped(step, SkipReason::Aborted)
            } else if let Some(tag) = policy.skips(&step.tags) {
                StepResult::skipped(step, SkipReason::Tag(tag))
            } else if policy.dry_run {
                let mut result = StepResult::skipped(step, SkipReason::DryRun);
                result.output = step.command.clone();
                result
            } else {
                self.converge_step(plan, step, host, policy, abort).await?
            };

            match &result.outcome {
                StepOutcome::Failed(reason) => {
                    warn!(
                        "[{}] {} failed after {} retries: {}",
                        host.name, step.id, result.retries, reason
                    );
                    report.failed = true;
                    if !policy.continue_on_error {
                        abort.cancel();
                    }
                }
                StepOutcome::Skipped(reason) => debug!("[{}] {} skipped: {}", host.name, step.id, reason),
                StepOutcome::Succeeded => info!("[{}] {} succeeded", host.name, step.id),
            }
            report.results.push(result);
        }
        Ok(report)
    }

    /// Execute one step with retries unless state shows it already converged
    ///
    /// Steps marked `rerun` skip the convergence check.
    async fn converge_step(
        &self,
        plan: &StepPlan,
        step: &Step,
        host: &Host,
        policy: &ConvergencePolicy,
        abort: &CancellationToken,
    ) -> Result<StepResult, OrchestratorError> {
        let lock = self.state.key_lock(&step.idempotency_key);
        let _guard = lock.lock().await;

        if !policy.force_rerun && !step.rerun {
            if let Some(record) = self.state.get(&step.idempotency_key) {
                if record.result.outcome.is_succeeded() && record.request_hash == plan.request_hash() {
                    return Ok(StepResult::skipped(step, SkipReason::Converged));
                }
            }
        }

        let started = Instant::now();
        let mut fsm = StepFsm::new();
        let mut result = loop {
            fsm.process(StepEvent::Start).map_err(OrchestratorError::Internal)?;
            let result = self
                .executor
                .execute(step, host, policy.step_timeout, &self.interrupt)
                .await;

            let reason = match &result.outcome {
                StepOutcome::Failed(reason) => reason.clone(),
                _ => {
                    fsm.process(StepEvent::Succeed).map_err(OrchestratorError::Internal)?;
                    break result;
                }
            };
            fsm.process(StepEvent::Fail(reason.to_string()))
                .map_err(OrchestratorError::Internal)?;
            if !reason.is_retryable() || !fsm.can_retry(policy.max_retries) {
                break result;
            }

            fsm.process(StepEvent::Retry).map_err(OrchestratorError::Internal)?;
            let delay = calc_exp_backoff(&policy.cooldown, fsm.retries());
            debug!("[{}] retrying {} in {:?} ({})", host.name, step.id, delay, reason);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = abort.cancelled() => {
                    fsm.process(StepEvent::GiveUp).map_err(OrchestratorError::Internal)?;
                    break result;
                }
            }
        };
        result.retries = fsm.retries();
        result.duration = started.elapsed();

        self.state
            .record(StepRecord {
                host: host.name.clone(),
                step_id: step.id.clone(),
                idempotency_key: step.idempotency_key.clone(),
                request_hash: plan.request_hash().to_string(),
                network: plan.network().to_string(),
                client: plan.client().to_string(),
                overrides: plan.overrides_for(&host.name),
                result: result.clone(),
                recorded_at: Utc::now(),
            })
            .await?;
        Ok(result)
    }
}
