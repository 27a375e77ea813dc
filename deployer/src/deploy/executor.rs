//! Step executor

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::deploy::backend::BackendRegistry;
use crate::deploy::verify::{self, NodeCheck};
use crate::errors::OrchestratorError;
use crate::models::host::Host;
use crate::models::step::{FailureReason, Step, StepOutcome, StepResult};
use crate::utils::tail;

/// Bytes of captured output kept per step result
pub const OUTPUT_LIMIT: usize = 64 * 1024;

/// Runs one step against one host through the backend for its connection kind
#[derive(Debug, Clone)]
pub struct StepExecutor {
    backends: BackendRegistry,
}

impl StepExecutor {
    pub fn new(backends: BackendRegistry) -> Self {
        Self { backends }
    }

    /// Execute `step` once
    ///
    /// Never returns an error: every failure mode, including timeout and
    /// cancellation, is reported as a failed `StepResult`. On timeout or
    /// cancellation the backend future is dropped, which aborts the
    /// underlying process or request.
    pub async fn execute(
        &self,
        step: &Step,
        host: &Host,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> StepResult {
        let started = Instant::now();

        let Some(backend) = self.backends.get(host.connection) else {
            warn!("No backend registered for {} hosts", host.connection);
            return StepResult::for_step(
                step,
                StepOutcome::Failed(FailureReason::Backend(format!(
                    "no backend for connection kind '{}'",
                    host.connection
                ))),
                started.elapsed(),
                String::new(),
            );
        };

        debug!("[{}] executing {} (timeout {:?})", host.name, step.id, timeout);
        let (outcome, output) = tokio::select! {
            result = async {
                if NodeCheck::matches(&step.command) {
                    verify::run_check(backend.as_ref(), host, &step.command).await
                } else {
                    backend.run(host, &step.command).await
                }
            } => match result {
                Ok(out) if out.is_success() => (StepOutcome::Succeeded, out.output),
                Ok(out) => (StepOutcome::Failed(FailureReason::ExitStatus(out.exit_code)), out.output),
                Err(e) if e.is_retryable() => (StepOutcome::Failed(FailureReason::Backend(e.to_string())), e.to_string()),
                Err(e) => (StepOutcome::Failed(FailureReason::Invalid(e.to_string())), e.to_string()),
            },
            _ = tokio::time::sleep(timeout) => {
                (StepOutcome::Failed(FailureReason::Timeout), OrchestratorError::StepTimeout(timeout).to_string())
            }
            _ = cancel.cancelled() => {
                (StepOutcome::Failed(FailureReason::Cancelled), OrchestratorError::Cancelled.to_string())
            }
        };

        StepResult::for_step(step, outcome, started.elapsed(), tail(&output, OUTPUT_LIMIT))
    }
}
