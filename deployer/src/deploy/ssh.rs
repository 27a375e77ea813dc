//! SSH backend built on the system `ssh` client

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::deploy::backend::{run_process, Backend, BackendOutput};
use crate::errors::OrchestratorError;
use crate::models::host::{ConnectionKind, Host};
use crate::storage::settings::SshSettings;

/// Runs step commands over `ssh` in batch mode
///
/// Host vars `ssh_user` and `ssh_port` override the settings; the host's
/// `credentials_ref`, when set, is used as the identity file.
#[derive(Debug, Clone)]
pub struct SshBackend {
    settings: SshSettings,
}

impl SshBackend {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }

    /// Arguments passed to the ssh binary
    pub fn ssh_args(&self, host: &Host, command: &str) -> Result<Vec<String>, OrchestratorError> {
        if host.address.is_empty() {
            return Err(OrchestratorError::ValidationError(format!(
                "ssh host '{}' has no address",
                host.name
            )));
        }

        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.settings.connect_timeout_secs),
        ];
        for option in &self.settings.options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        if let Some(port) = host.var("ssh_port") {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(identity) = &host.credentials_ref {
            args.push("-i".to_string());
            args.push(identity.clone());
        }

        let user = host.var("ssh_user").unwrap_or(&self.settings.user);
        args.push(format!("{}@{}", user, host.address));
        args.push("--".to_string());
        args.push(command.to_string());
        Ok(args)
    }
}

#[async_trait]
impl Backend for SshBackend {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Ssh
    }

    async fn run(&self, host: &Host, command: &str) -> Result<BackendOutput, OrchestratorError> {
        let args = self.ssh_args(host, command)?;
        debug!("[{}] ssh {}: {}", host.name, host.address, command);

        let mut cmd = Command::new(&self.settings.binary);
        cmd.args(&args);
        let output = run_process(cmd).await?;

        // ssh itself exits 255 when the connection fails.
        if output.exit_code == 255 {
            return Err(OrchestratorError::StepFailed(format!(
                "ssh connection to {} failed: {}",
                host.address,
                output.output.trim()
            )));
        }
        Ok(output)
    }
}
