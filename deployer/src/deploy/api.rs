//! HTTP API backend for Proxmox-style resources
//!
//! Step commands for `api` hosts have the form
//!
//! ```text
//! [UNLESS <guard-path> [<field>=<value>]] <METHOD> <path> [<json-body>]
//! ```
//!
//! With `UNLESS`, the guard path is fetched first and the request is skipped when
//! the guard succeeds (and, if given, `data.<field>` equals `<value>`). This
//! is what keeps "ensure" steps idempotent. Responses that carry a Proxmox
//! task id (`UPID:...`) are followed until the task stops.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Method};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::deploy::backend::{Backend, BackendOutput};
use crate::errors::OrchestratorError;
use crate::models::host::{ConnectionKind, Host};

const DEFAULT_TASK_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Condition guarding an API request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guard {
    pub path: String,
    pub expect: Option<(String, String)>,
}

/// Parsed API step command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCommand {
    pub unless: Option<Guard>,
    pub method: String,
    pub path: String,
    pub body: Option<String>,
}

fn split_token(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.find(char::is_whitespace) {
        Some(idx) => (&input[..idx], input[idx..].trim_start()),
        None => (input, ""),
    }
}

fn is_method(token: &str) -> bool {
    matches!(token, "GET" | "POST" | "PUT" | "DELETE" | "PATCH")
}

impl ApiCommand {
    pub fn parse(command: &str) -> Result<Self, String> {
        let mut rest = command.trim();
        let mut unless = None;

        let (first, tail) = split_token(rest);
        if first == "UNLESS" {
            let (path, tail) = split_token(tail);
            if path.is_empty() {
                return Err("UNLESS without a guard path".to_string());
            }
            let (next, after) = split_token(tail);
            let expect = match next.split_once('=') {
                Some((field, value)) if !is_method(next) => {
                    rest = after;
                    Some((field.to_string(), value.to_string()))
                }
                _ => {
                    rest = tail;
                    None
                }
            };
            unless = Some(Guard {
                path: path.to_string(),
                expect,
            });
        }

        let (method, tail) = split_token(rest);
        if !is_method(method) {
            return Err(format!("expected HTTP method, found '{}'", method));
        }
        let (path, body) = split_token(tail);
        if !path.starts_with('/') {
            return Err(format!("expected absolute API path, found '{}'", path));
        }

        Ok(Self {
            unless,
            method: method.to_string(),
            path: path.to_string(),
            body: (!body.is_empty()).then(|| body.to_string()),
        })
    }
}

/// Runs API step commands against the host's base URL
pub struct ApiBackend {
    client: Client,
    /// Authorization header values keyed by host `credentials_ref`
    credentials: HashMap<String, SecretString>,
    task_poll_interval: Duration,
}

impl ApiBackend {
    pub fn new(credentials: HashMap<String, SecretString>, insecure_tls: bool) -> Result<Self, OrchestratorError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .danger_accept_invalid_certs(insecure_tls)
            .build()?;
        Ok(Self {
            client,
            credentials,
            task_poll_interval: DEFAULT_TASK_POLL_INTERVAL,
        })
    }

    /// Delay between task status lookups while following a `UPID`
    pub fn with_task_poll_interval(mut self, interval: Duration) -> Self {
        self.task_poll_interval = interval;
        self
    }

    fn url(&self, host: &Host, path: &str) -> Result<Url, OrchestratorError> {
        Url::parse(&host.address)
            .and_then(|base| base.join(path))
            .map_err(|e| OrchestratorError::ValidationError(format!("bad API URL for '{}': {}", host.name, e)))
    }

    async fn send(
        &self,
        host: &Host,
        method: Method,
        path: &str,
        body: Option<&str>,
    ) -> Result<(bool, Value, String), OrchestratorError> {
        let url = self.url(host, path)?;
        debug!("[{}] {} {}", host.name, method, url);

        let mut request = self.client.request(method, url);
        if let Some(secret) = host.credentials_ref.as_ref().and_then(|r| self.credentials.get(r)) {
            request = request.header(header::AUTHORIZATION, secret.expose_secret());
        }
        if let Some(body) = body {
            let json: Value = serde_json::from_str(body)?;
            request = request.json(&json);
        }

        let response = request.send().await?;
        let success = response.status().is_success();
        let status = response.status();
        let text = response.text().await?;
        let value = serde_json::from_str(&text).unwrap_or(Value::Null);
        Ok((success, value, format!("{} {}", status, text)))
    }

    async fn guard_satisfied(&self, host: &Host, guard: &Guard) -> Result<bool, OrchestratorError> {
        let (success, value, _) = self.send(host, Method::GET, &guard.path, None).await?;
        if !success {
            return Ok(false);
        }
        Ok(match &guard.expect {
            None => true,
            Some((field, expected)) => value
                .get("data")
                .and_then(|d| d.get(field))
                .and_then(Value::as_str)
                .map(|actual| actual == expected)
                .unwrap_or(false),
        })
    }

    /// Poll a Proxmox task until it stops; returns its exit status
    async fn await_task(&self, host: &Host, upid: &str) -> Result<String, OrchestratorError> {
        let node = upid.split(':').nth(1).unwrap_or_default();
        let path = format!("/api2/json/nodes/{}/tasks/{}/status", node, upid);
        loop {
            let (success, value, raw) = self.send(host, Method::GET, &path, None).await?;
            if !success {
                return Err(OrchestratorError::StepFailed(format!("task status lookup failed: {}", raw)));
            }
            let data = &value["data"];
            if data["status"].as_str() == Some("stopped") {
                return Ok(data["exitstatus"].as_str().unwrap_or("unknown").to_string());
            }
            tokio::time::sleep(self.task_poll_interval).await;
        }
    }
}

#[async_trait]
impl Backend for ApiBackend {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Api
    }

    async fn run(&self, host: &Host, command: &str) -> Result<BackendOutput, OrchestratorError> {
        let command = ApiCommand::parse(command).map_err(OrchestratorError::ValidationError)?;

        if let Some(guard) = &command.unless {
            if self.guard_satisfied(host, guard).await? {
                return Ok(BackendOutput::success(format!("{} already satisfied", guard.path)));
            }
        }

        let method = Method::from_bytes(command.method.as_bytes())
            .map_err(|e| OrchestratorError::ValidationError(e.to_string()))?;
        let (success, value, raw) = self
            .send(host, method, &command.path, command.body.as_deref())
            .await?;
        if !success {
            return Ok(BackendOutput {
                exit_code: 1,
                output: raw,
            });
        }

        if let Some(upid) = value["data"].as_str().filter(|d| d.starts_with("UPID:")) {
            let exit_status = self.await_task(host, upid).await?;
            let output = format!("task {} finished: {}", upid, exit_status);
            let exit_code = if exit_status == "OK" { 0 } else { 1 };
            return Ok(BackendOutput { exit_code, output });
        }
        Ok(BackendOutput::success(raw))
    }
}
