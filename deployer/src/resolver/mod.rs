//! Expands deployment requests into ordered step plans

pub mod catalog;
pub mod template;

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::errors::OrchestratorError;
use crate::inventory::InventoryStore;
use crate::models::host::{ConnectionKind, Host};
use crate::models::request::DeploymentRequest;
use crate::models::step::{idempotency_key, Step, StepPlan};
use crate::resolver::catalog::{NetworkFamily, StepTemplate, DEFAULT_VARS, STOP_STEP, VERIFY_STEP};
use crate::state::StepRecord;

/// Override naming an explicit, comma-separated target host list
pub const HOSTS_OVERRIDE: &str = "hosts";

/// Turns a `DeploymentRequest` into a `StepPlan` against an inventory
pub struct TargetResolver<'a> {
    inventory: &'a InventoryStore,
    verify: bool,
}

impl<'a> TargetResolver<'a> {
    pub fn new(inventory: &'a InventoryStore) -> Self {
        Self {
            inventory,
            verify: false,
        }
    }

    /// Append a `verify-node` check after each host's `start-client`
    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Build the deployment plan for `request`
    ///
    /// Fails without producing a partial plan when the template, a host or a
    /// placeholder cannot be resolved.
    pub fn plan(&self, request: &DeploymentRequest) -> Result<StepPlan, OrchestratorError> {
        let unknown = || OrchestratorError::UnknownTemplate {
            network: request.network().to_string(),
            client: request.client().to_string(),
        };
        let family = NetworkFamily::of(request.network()).ok_or_else(unknown)?;
        let entry = catalog::lookup(family, request.client()).ok_or_else(unknown)?;

        let targets = self.select_targets(request)?;
        let request_hash = request.request_hash();

        let mut steps = Vec::new();
        for host in &targets {
            let vars = template_vars(request, host)?;
            for template in entry
                .steps
                .iter()
                .filter(|t| t.applies(request.validator(), self.verify))
            {
                if let Some(step) = build_step(template, host, &vars, &request_hash)? {
                    steps.push(step);
                }
            }
        }

        // Stable: same-phase steps keep host selection order, then catalog order.
        steps.sort_by_key(|step| step.phase);

        info!(
            "Planned {} steps on {} hosts for {}/{}",
            steps.len(),
            targets.len(),
            request.network(),
            request.client()
        );
        let overrides = recordable_overrides(request);
        let names: Vec<String> = targets.iter().map(|h| h.name.clone()).collect();
        let plan = StepPlan::new(
            request_hash,
            request.network(),
            request.client(),
            steps,
            into_host_map(targets),
        )?;
        Ok(names
            .into_iter()
            .fold(plan, |plan, name| plan.with_overrides(name, overrides.clone())))
    }

    /// Build a plan stopping the client each `started` record describes
    ///
    /// `started` are succeeded `start-client` records. Each stop command is
    /// rendered with the overrides its host was deployed with; overrides on
    /// `request` win over recorded ones.
    pub fn stop_plan(
        &self,
        request: &DeploymentRequest,
        started: &[StepRecord],
    ) -> Result<StepPlan, OrchestratorError> {
        self.followup_plan(&STOP_STEP, request, started)
    }

    /// Build a plan checking the nodes `started` records describe
    pub fn verify_plan(
        &self,
        request: &DeploymentRequest,
        started: &[StepRecord],
    ) -> Result<StepPlan, OrchestratorError> {
        self.followup_plan(&VERIFY_STEP, request, started)
    }

    fn followup_plan(
        &self,
        template: &StepTemplate,
        request: &DeploymentRequest,
        started: &[StepRecord],
    ) -> Result<StepPlan, OrchestratorError> {
        let mut targets = Vec::with_capacity(started.len());
        let mut steps = Vec::with_capacity(started.len());
        let mut rendered_with = Vec::with_capacity(started.len());

        for record in started {
            let host = self.inventory.resolve(&record.host)?;
            let deployed = as_deployed(request, &record.overrides);
            let vars = template_vars(&deployed, &host)?;
            if let Some(step) = build_step(template, &host, &vars, &deployed.request_hash())? {
                steps.push(step);
                rendered_with.push((host.name.clone(), recordable_overrides(&deployed)));
            }
            targets.push(host);
        }

        let plan = StepPlan::new(
            request.request_hash(),
            request.network(),
            request.client(),
            steps,
            into_host_map(targets),
        )?;
        Ok(rendered_with
            .into_iter()
            .fold(plan, |plan, (host, overrides)| plan.with_overrides(host, overrides)))
    }

    /// Explicit `hosts` override, else every host tagged with the network
    fn select_targets(&self, request: &DeploymentRequest) -> Result<Vec<Host>, OrchestratorError> {
        if let Some(names) = request.get_override(HOSTS_OVERRIDE) {
            let mut seen = BTreeSet::new();
            let mut hosts = Vec::new();
            for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                if seen.insert(name) {
                    hosts.push(self.inventory.resolve(name)?);
                }
            }
            if hosts.is_empty() {
                return Err(OrchestratorError::NoTargets(request.network().to_string()));
            }
            return Ok(hosts);
        }

        let network_tag = format!("network:{}", request.network());
        let hosts: Vec<Host> = self
            .inventory
            .hosts()
            .into_iter()
            .filter(|h| h.has_tag(request.network()) || h.has_tag(&network_tag))
            .collect();

        if hosts.is_empty() {
            return Err(OrchestratorError::NoTargets(request.network().to_string()));
        }
        debug!("Selected {} hosts tagged for {}", hosts.len(), request.network());
        Ok(hosts)
    }
}

/// Overrides worth persisting alongside step records
fn recordable_overrides(request: &DeploymentRequest) -> BTreeMap<String, String> {
    request
        .overrides()
        .iter()
        .filter(|(k, _)| k.as_str() != HOSTS_OVERRIDE)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// `request` with `recorded` overrides filled in where it sets none
fn as_deployed(request: &DeploymentRequest, recorded: &BTreeMap<String, String>) -> DeploymentRequest {
    recorded
        .iter()
        .filter(|(k, _)| request.get_override(k).is_none())
        .fold(request.clone(), |req, (k, v)| req.with_override(k.clone(), v.clone()))
}

fn into_host_map(hosts: Vec<Host>) -> BTreeMap<String, Host> {
    hosts.into_iter().map(|h| (h.name.clone(), h)).collect()
}

fn build_step(
    template: &StepTemplate,
    host: &Host,
    vars: &BTreeMap<String, String>,
    request_hash: &str,
) -> Result<Option<Step>, OrchestratorError> {
    let Some(command) = template.command_for(host.connection) else {
        return Ok(None);
    };
    let command = template::render(command, vars).map_err(|message| OrchestratorError::Template {
        step: template.id.to_string(),
        message,
    })?;

    Ok(Some(Step {
        id: template.id.to_string(),
        host: host.name.clone(),
        phase: template.phase,
        command,
        tags: template.tags.iter().map(|t| t.to_string()).collect(),
        idempotency_key: idempotency_key(template.id, &host.name, request_hash),
        rerun: template.rerun,
    }))
}

/// Variables visible to command templates, lowest precedence first:
/// catalog defaults, host vars, request overrides, request fields
fn template_vars(
    request: &DeploymentRequest,
    host: &Host,
) -> Result<BTreeMap<String, String>, OrchestratorError> {
    let mut vars: BTreeMap<String, String> = DEFAULT_VARS
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    vars.extend(host.vars.clone());
    vars.extend(
        request
            .overrides()
            .iter()
            .filter(|(k, _)| k.as_str() != HOSTS_OVERRIDE)
            .map(|(k, v)| (k.clone(), v.clone())),
    );

    let stack = format!("{}-{}", request.network(), request.client());
    if !vars.contains_key("workdir") {
        let workdir = format!("{}/{}", vars["deploy_root"], stack);
        vars.insert("workdir".to_string(), workdir);
    }
    vars.entry("container_name".to_string()).or_insert(stack);
    if !vars.contains_key("jwt_secret_file") {
        let secret = format!("{}/jwtsecret", vars["workdir"]);
        vars.insert("jwt_secret_file".to_string(), secret);
    }
    if !vars.contains_key("node_address") {
        let address = match host.connection {
            ConnectionKind::Ssh if !host.address.is_empty() => host.address.clone(),
            _ => "127.0.0.1".to_string(),
        };
        vars.insert("node_address".to_string(), address);
    }

    let validator_flags = if request.validator() {
        let recipient = vars.get("fee_recipient").ok_or_else(|| OrchestratorError::Template {
            step: "configure-client".to_string(),
            message: "validator mode requires the 'fee_recipient' override".to_string(),
        })?;
        format!("--fee-recipient={}", recipient)
    } else {
        "--no-validator".to_string()
    };

    vars.insert("validator_flags".to_string(), validator_flags);
    vars.insert(
        "sync_flags".to_string(),
        catalog::sync_flags(request.network(), request.sync_mode()),
    );
    vars.insert("network".to_string(), request.network().to_string());
    vars.insert("client".to_string(), request.client().to_string());
    vars.insert("sync_mode".to_string(), request.sync_mode().to_string());
    vars.insert("host".to_string(), host.name.clone());
    vars.insert("address".to_string(), host.address.clone());
    Ok(vars)
}
