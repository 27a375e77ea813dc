//! Step backends

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use crate::errors::OrchestratorError;
use crate::models::host::{ConnectionKind, Host};

/// What a backend observed when running a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendOutput {
    /// Exit code; 0 means success
    pub exit_code: i32,

    /// Combined stdout and stderr (or response body)
    pub output: String,
}

impl BackendOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            output: output.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Transport that runs a resolved step command against a host
///
/// Dropping the future returned by `run` must abort the underlying
/// operation; the executor relies on this for timeouts and cancellation.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Connection kind this backend serves
    fn kind(&self) -> ConnectionKind;

    /// Run `command` against `host`
    ///
    /// `Err` is reserved for failures to reach the host or start the
    /// command; a command that ran and failed is an `Ok` with a non-zero
    /// exit code.
    async fn run(&self, host: &Host, command: &str) -> Result<BackendOutput, OrchestratorError>;
}

/// Backends keyed by the connection kind they serve
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<ConnectionKind, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend, replacing any previous one for the same kind
    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        self.backends.insert(backend.kind(), backend);
    }

    pub fn with(mut self, backend: Arc<dyn Backend>) -> Self {
        self.register(backend);
        self
    }

    pub fn get(&self, kind: ConnectionKind) -> Option<Arc<dyn Backend>> {
        self.backends.get(&kind).cloned()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("kinds", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Run a prepared process to completion, capturing stdout and stderr
///
/// The child is killed if the returned future is dropped.
pub async fn run_process(mut command: Command) -> Result<BackendOutput, OrchestratorError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = command.output().await?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&stderr);
    }

    Ok(BackendOutput {
        // Killed by a signal: no exit code.
        exit_code: output.status.code().unwrap_or(-1),
        output: combined,
    })
}
