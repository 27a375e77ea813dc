//! Steps, plans and step results

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::OrchestratorError;
use crate::models::host::Host;
use crate::utils::{duration_millis, sha256_hash};

/// Ordering class of a step; lower phases always run first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Create or ensure the compute resource
    Provision,

    /// Install software onto the resource
    Install,

    /// Write configuration
    Configure,

    /// Start services
    Start,

    /// Check that started services answer
    Verify,

    /// Stop services
    Stop,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Provision => "provision",
            Phase::Install => "install",
            Phase::Configure => "configure",
            Phase::Start => "start",
            Phase::Verify => "verify",
            Phase::Stop => "stop",
        };
        f.write_str(name)
    }
}

/// Derive the idempotency key of a step
pub fn idempotency_key(step_id: &str, host: &str, request_hash: &str) -> String {
    sha256_hash(format!("{}\0{}\0{}", step_id, host, request_hash).as_bytes())
}

/// A unit of work against one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Step id from the template catalog, e.g. `install-client`
    pub id: String,

    /// Target host name
    pub host: String,

    pub phase: Phase,

    /// Command resolved at plan time; its meaning depends on the backend
    pub command: String,

    /// Tags matched against the policy's skip tags
    pub tags: BTreeSet<String>,

    pub idempotency_key: String,

    /// Execute even when state already records a success for this key
    #[serde(default)]
    pub rerun: bool,
}

/// Ordered steps for one deployment request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepPlan {
    request_hash: String,
    network: String,
    client: String,
    steps: Vec<Step>,
    hosts: BTreeMap<String, Host>,
    /// Request overrides the commands were rendered with, per host
    #[serde(default)]
    overrides: BTreeMap<String, BTreeMap<String, String>>,
}

impl StepPlan {
    /// Build a plan, rejecting duplicate idempotency keys and steps whose
    /// host is not part of the plan's host snapshot
    pub fn new(
        request_hash: impl Into<String>,
        network: impl Into<String>,
        client: impl Into<String>,
        steps: Vec<Step>,
        hosts: BTreeMap<String, Host>,
    ) -> Result<Self, OrchestratorError> {
        let mut seen = HashSet::with_capacity(steps.len());
        for step in &steps {
            if !seen.insert(step.idempotency_key.as_str()) {
                return Err(OrchestratorError::DuplicateStep {
                    step: step.id.clone(),
                    host: step.host.clone(),
                });
            }
            if !hosts.contains_key(&step.host) {
                return Err(OrchestratorError::HostNotFound(step.host.clone()));
            }
        }

        Ok(Self {
            request_hash: request_hash.into(),
            network: network.into(),
            client: client.into(),
            steps,
            hosts,
            overrides: BTreeMap::new(),
        })
    }

    /// Record the overrides a host's commands were rendered with
    pub fn with_overrides(mut self, host: impl Into<String>, overrides: BTreeMap<String, String>) -> Self {
        self.overrides.insert(host.into(), overrides);
        self
    }

    /// Overrides a host's commands were rendered with; empty when none
    pub fn overrides_for(&self, host: &str) -> BTreeMap<String, String> {
        self.overrides.get(host).cloned().unwrap_or_default()
    }

    pub fn request_hash(&self) -> &str {
        &self.request_hash
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn host(&self, name: &str) -> Option<&Host> {
        self.hosts.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Steps grouped into per-host chains
    ///
    /// Chains are returned in order of each host's first appearance in the
    /// plan, and each chain keeps the plan's relative step order.
    pub fn chains(&self) -> Vec<(String, Vec<Step>)> {
        let mut chains: Vec<(String, Vec<Step>)> = Vec::new();
        for step in &self.steps {
            match chains.iter_mut().find(|(host, _)| *host == step.host) {
                Some((_, chain)) => chain.push(step.clone()),
                None => chains.push((step.host.clone(), vec![step.clone()])),
            }
        }
        chains
    }
}

/// Why a step failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    ExitStatus(i32),
    Backend(String),
    /// The backend refused the command itself; retrying cannot help
    Invalid(String),
    Cancelled,
}

impl FailureReason {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureReason::Invalid(_) | FailureReason::Cancelled)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::ExitStatus(code) => write!(f, "exit status {}", code),
            FailureReason::Backend(msg) => write!(f, "backend error: {}", msg),
            FailureReason::Invalid(msg) => write!(f, "invalid command: {}", msg),
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Why a step was not executed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    /// Matched a skip tag
    Tag(String),

    /// Already succeeded for the same request
    Converged,

    DryRun,

    /// An earlier step on the same host failed
    DependencyFailed,

    /// The plan was aborted or cancelled before this step started
    Aborted,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Tag(tag) => write!(f, "skip tag '{}'", tag),
            SkipReason::Converged => write!(f, "already converged"),
            SkipReason::DryRun => write!(f, "dry run"),
            SkipReason::DependencyFailed => write!(f, "dependency failed"),
            SkipReason::Aborted => write!(f, "aborted"),
        }
    }
}

/// Outcome of a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Failed(FailureReason),
    Skipped(SkipReason),
}

impl StepOutcome {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, StepOutcome::Succeeded)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, StepOutcome::Skipped(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            StepOutcome::Succeeded => "succeeded",
            StepOutcome::Failed(_) => "failed",
            StepOutcome::Skipped(_) => "skipped",
        }
    }
}

/// Result of running (or not running) one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub host: String,
    pub idempotency_key: String,
    pub outcome: StepOutcome,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    /// Tail of the captured output
    pub output: String,
    /// Attempts beyond the first
    pub retries: u32,
}

impl StepResult {
    pub fn skipped(step: &Step, reason: SkipReason) -> Self {
        Self::for_step(step, StepOutcome::Skipped(reason), Duration::ZERO, String::new())
    }

    pub fn for_step(step: &Step, outcome: StepOutcome, duration: Duration, output: String) -> Self {
        Self {
            step_id: step.id.clone(),
            host: step.host.clone(),
            idempotency_key: step.idempotency_key.clone(),
            outcome,
            duration,
            output,
            retries: 0,
        }
    }
}
