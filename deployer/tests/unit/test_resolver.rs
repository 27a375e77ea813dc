//! Target resolver tests

use std::time::Duration;

use chrono::Utc;

use ethdeploy::errors::OrchestratorError;
use ethdeploy::inventory::InventoryStore;
use ethdeploy::models::host::{ConnectionKind, Host, HostEntry, InventoryDocument};
use ethdeploy::models::request::{DeploymentRequest, SyncMode};
use ethdeploy::models::step::{Phase, StepOutcome, StepResult};
use ethdeploy::resolver::TargetResolver;
use ethdeploy::state::StepRecord;

fn inventory(hosts: Vec<Host>) -> InventoryStore {
    let document = InventoryDocument {
        hosts: hosts.into_iter().map(HostEntry::from).collect(),
    };
    InventoryStore::load(&[document], None).unwrap()
}

fn step_ids(plan: &ethdeploy::models::step::StepPlan) -> Vec<(&str, &str)> {
    plan.steps()
        .iter()
        .map(|s| (s.host.as_str(), s.id.as_str()))
        .collect()
}

#[test]
fn test_sepolia_lodestar_on_local_host() {
    let store = inventory(vec![Host::localhost().with_tag("sepolia")]);
    let request = DeploymentRequest::new("sepolia", "lodestar", SyncMode::Fast);
    let plan = TargetResolver::new(&store).plan(&request).unwrap();

    let ids: Vec<&str> = plan.steps().iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, ["ensure-container", "install-client", "configure-client", "start-client"]);
    assert_eq!(plan.request_hash(), request.request_hash());

    let configure = &plan.steps()[2];
    assert!(configure.command.contains("--network sepolia"));
    assert!(configure.command.contains("--consensus lodestar"));
    assert!(configure.command.contains("--no-validator"));
    assert!(configure.command.contains("checkpoint"));
}

#[test]
fn test_phases_order_globally_across_hosts() {
    let store = inventory(vec![
        Host::new("node-a", ConnectionKind::Ssh, "10.0.0.1").with_tag("network:mainnet"),
        Host::new("node-b", ConnectionKind::Ssh, "10.0.0.2").with_tag("mainnet"),
    ]);
    let plan = TargetResolver::new(&store)
        .plan(&DeploymentRequest::new("mainnet", "teku", SyncMode::Full))
        .unwrap();

    assert_eq!(
        step_ids(&plan),
        [
            ("node-a", "ensure-container"),
            ("node-b", "ensure-container"),
            ("node-a", "install-client"),
            ("node-b", "install-client"),
            ("node-a", "configure-client"),
            ("node-b", "configure-client"),
            ("node-a", "start-client"),
            ("node-b", "start-client"),
        ]
    );
    let phases: Vec<Phase> = plan.steps().iter().map(|s| s.phase).collect();
    assert!(phases.windows(2).all(|w| w[0] <= w[1]));

    let chains = plan.chains();
    assert_eq!(chains.len(), 2);
    assert_eq!(chains[0].0, "node-a");
    assert_eq!(chains[0].1.len(), 4);
}

#[test]
fn test_idempotency_keys_are_unique_and_stable() {
    let store = inventory(vec![
        Host::new("node-a", ConnectionKind::Ssh, "10.0.0.1").with_tag("holesky"),
        Host::new("node-b", ConnectionKind::Ssh, "10.0.0.2").with_tag("holesky"),
    ]);
    let resolver = TargetResolver::new(&store);
    let request = DeploymentRequest::new("holesky", "prysm", SyncMode::Fast);

    let first = resolver.plan(&request).unwrap();
    let second = resolver.plan(&request).unwrap();
    let keys: Vec<&str> = first.steps().iter().map(|s| s.idempotency_key.as_str()).collect();
    let mut unique = keys.clone();
    unique.sort();
    unique.dedup();

    assert_eq!(unique.len(), keys.len());
    assert_eq!(
        keys,
        second.steps().iter().map(|s| s.idempotency_key.as_str()).collect::<Vec<_>>()
    );

    let other = resolver
        .plan(&DeploymentRequest::new("holesky", "prysm", SyncMode::Archive))
        .unwrap();
    assert_ne!(first.steps()[0].idempotency_key, other.steps()[0].idempotency_key);
}

#[test]
fn test_unknown_template() {
    let store = inventory(vec![Host::localhost().with_tag("gnosis").with_tag("sepolia")]);
    let resolver = TargetResolver::new(&store);

    for (network, client) in [("gnosis", "prysm"), ("sepolia", "erigon"), ("ropsten", "teku")] {
        let result = resolver.plan(&DeploymentRequest::new(network, client, SyncMode::Fast));
        assert!(
            matches!(result, Err(OrchestratorError::UnknownTemplate { .. })),
            "{}/{} should have no template",
            network,
            client
        );
    }
}

#[test]
fn test_target_selection_errors() {
    let store = inventory(vec![Host::localhost().with_tag("sepolia")]);
    let resolver = TargetResolver::new(&store);

    let untargeted = resolver.plan(&DeploymentRequest::new("mainnet", "lighthouse", SyncMode::Fast));
    assert!(matches!(untargeted, Err(OrchestratorError::NoTargets(_))));

    let missing = resolver.plan(
        &DeploymentRequest::new("mainnet", "lighthouse", SyncMode::Fast).with_override("hosts", "localhost,ghost"),
    );
    assert!(matches!(missing, Err(OrchestratorError::HostNotFound(name)) if name == "ghost"));

    let explicit = resolver
        .plan(&DeploymentRequest::new("mainnet", "lighthouse", SyncMode::Fast).with_override("hosts", "localhost"))
        .unwrap();
    assert_eq!(explicit.len(), 4);
}

#[test]
fn test_unknown_placeholder_fails_plan() {
    let store = inventory(vec![Host::new("pve", ConnectionKind::Api, "https://pve.lan:8006").with_tag("chiado")]);
    let result = TargetResolver::new(&store).plan(&DeploymentRequest::new("chiado", "lighthouse", SyncMode::Fast));

    // No proxmox_node / vmid vars for the API templates.
    assert!(matches!(result, Err(OrchestratorError::Template { .. })));
}

fn started(host: &str, overrides: &[(&str, &str)]) -> StepRecord {
    StepRecord {
        host: host.to_string(),
        step_id: "start-client".to_string(),
        idempotency_key: format!("{}/start-client", host),
        request_hash: "request-hash".to_string(),
        network: "sepolia".to_string(),
        client: "lodestar".to_string(),
        overrides: overrides.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        result: StepResult {
            step_id: "start-client".to_string(),
            host: host.to_string(),
            idempotency_key: format!("{}/start-client", host),
            outcome: StepOutcome::Succeeded,
            duration: Duration::from_secs(1),
            output: String::new(),
            retries: 0,
        },
        recorded_at: Utc::now(),
    }
}

#[test]
fn test_stop_plan() {
    let store = inventory(vec![
        Host::new("node-a", ConnectionKind::Ssh, "10.0.0.1").with_tag("sepolia"),
        Host::new("node-b", ConnectionKind::Ssh, "10.0.0.2").with_tag("sepolia"),
    ]);
    let request = DeploymentRequest::new("sepolia", "lodestar", SyncMode::Fast);
    let plan = TargetResolver::new(&store)
        .stop_plan(&request, &[started("node-b", &[])])
        .unwrap();

    assert_eq!(step_ids(&plan), [("node-b", "stop-client")]);
    assert_eq!(plan.steps()[0].phase, Phase::Stop);
    assert!(plan.steps()[0].rerun);
    assert!(plan.steps()[0].command.contains("down --path /opt/ethdeploy/sepolia-lodestar"));
}

#[test]
fn test_stop_plan_uses_recorded_overrides() {
    let store = inventory(vec![
        Host::new("node-a", ConnectionKind::Ssh, "10.0.0.1").with_tag("sepolia"),
        Host::new("node-b", ConnectionKind::Ssh, "10.0.0.2").with_tag("sepolia"),
    ]);
    let records = [
        started("node-a", &[("deploy_root", "/srv/eth")]),
        started("node-b", &[("deploy_root", "/srv/eth"), ("sedge_bin", "/opt/sedge")]),
    ];

    let request = DeploymentRequest::new("sepolia", "lodestar", SyncMode::Fast);
    let plan = TargetResolver::new(&store).stop_plan(&request, &records).unwrap();
    assert_eq!(plan.steps()[0].command, "/usr/local/bin/sedge down --path /srv/eth/sepolia-lodestar");
    assert_eq!(plan.steps()[1].command, "/opt/sedge down --path /srv/eth/sepolia-lodestar");
    assert_eq!(plan.overrides_for("node-b")["sedge_bin"], "/opt/sedge");

    // Overrides given at stop time win over recorded ones.
    let request = request.with_override("deploy_root", "/mnt/eth");
    let plan = TargetResolver::new(&store).stop_plan(&request, &records).unwrap();
    assert_eq!(plan.steps()[0].command, "/usr/local/bin/sedge down --path /mnt/eth/sepolia-lodestar");
}

#[test]
fn test_verify_plan_targets_started_hosts() {
    let store = inventory(vec![
        Host::new("node-a", ConnectionKind::Ssh, "10.0.0.1").with_tag("sepolia"),
        Host::localhost().with_tag("sepolia"),
    ]);
    let request = DeploymentRequest::new("sepolia", "lodestar", SyncMode::Fast);
    let plan = TargetResolver::new(&store)
        .verify_plan(&request, &[started("localhost", &[("rpc_ws_port", "18545")])])
        .unwrap();

    assert_eq!(step_ids(&plan), [("localhost", "verify-node")]);
    assert_eq!(
        plan.steps()[0].command,
        "CHECK ws://127.0.0.1:18545 ws://127.0.0.1:8551 /opt/ethdeploy/sepolia-lodestar/jwtsecret"
    );
}
