//! Local shell backend

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::deploy::backend::{run_process, Backend, BackendOutput};
use crate::errors::OrchestratorError;
use crate::models::host::{ConnectionKind, Host};

/// Runs step commands with `sh -c` on this machine
#[derive(Debug, Clone)]
pub struct LocalBackend {
    shell: String,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Local
    }

    async fn run(&self, host: &Host, command: &str) -> Result<BackendOutput, OrchestratorError> {
        debug!("[{}] local: {}", host.name, command);
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(command);
        run_process(cmd).await
    }
}
