//! Fixed step template catalog keyed by (network family, consensus client)

use crate::models::host::ConnectionKind;
use crate::models::request::SyncMode;
use crate::models::step::Phase;

/// Group of networks sharing the same deployment recipe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkFamily {
    EthereumMainnet,
    EthereumTestnet,
    Gnosis,
}

impl NetworkFamily {
    /// Family of a network id, `None` when the network is unknown
    pub fn of(network: &str) -> Option<Self> {
        match network {
            "mainnet" => Some(NetworkFamily::EthereumMainnet),
            "sepolia" | "holesky" | "hoodi" => Some(NetworkFamily::EthereumTestnet),
            "gnosis" | "chiado" => Some(NetworkFamily::Gnosis),
            _ => None,
        }
    }
}

/// Public checkpoint-sync endpoint per network
pub fn checkpoint_url(network: &str) -> Option<&'static str> {
    match network {
        "mainnet" => Some("https://mainnet.checkpoint.sigp.io"),
        "sepolia" => Some("https://checkpoint-sync.sepolia.ethpandaops.io"),
        "holesky" => Some("https://checkpoint-sync.holesky.ethpandaops.io"),
        "hoodi" => Some("https://checkpoint-sync.hoodi.ethpandaops.io"),
        "gnosis" => Some("https://checkpoint.gnosischain.com"),
        "chiado" => Some("https://checkpoint.chiadochain.net"),
        _ => None,
    }
}

/// Extra `sedge generate` flags for a sync mode
pub fn sync_flags(network: &str, mode: SyncMode) -> String {
    match mode {
        SyncMode::Fast => checkpoint_url(network)
            .map(|url| format!("--checkpoint-sync-url={}", url))
            .unwrap_or_default(),
        SyncMode::Full => String::new(),
        SyncMode::Archive => "--el-extra-flag=--gcmode=archive --cl-extra-flag=--archive".to_string(),
    }
}

/// When a template applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Always,
    ValidatorOnly,
    /// Only when the resolver was asked to verify started nodes
    VerifyOnly,
}

/// One step of a recipe
#[derive(Debug, Clone, Copy)]
pub struct StepTemplate {
    pub id: &'static str,
    pub phase: Phase,
    pub tags: &'static [&'static str],
    pub condition: Condition,
    /// Run every time, never skipped as already converged
    pub rerun: bool,
    /// Command for hosts reached through a shell (`local`, `ssh`)
    pub shell: Option<&'static str>,
    /// Command for `api` hosts
    pub api: Option<&'static str>,
}

impl StepTemplate {
    /// Command template for a host of `kind`, `None` when the step does not
    /// apply to that kind of host
    pub fn command_for(&self, kind: ConnectionKind) -> Option<&'static str> {
        match kind {
            ConnectionKind::Local | ConnectionKind::Ssh => self.shell,
            ConnectionKind::Api => self.api,
        }
    }

    pub fn applies(&self, validator: bool, verify: bool) -> bool {
        match self.condition {
            Condition::Always => true,
            Condition::ValidatorOnly => validator,
            Condition::VerifyOnly => verify,
        }
    }
}

/// Catalog entry: which clients a family supports and the recipe to use
#[derive(Debug)]
pub struct CatalogEntry {
    pub family: NetworkFamily,
    pub clients: &'static [&'static str],
    pub steps: &'static [StepTemplate],
}

const ETHEREUM_CLIENTS: &[&str] = &["lighthouse", "lodestar", "nimbus", "prysm", "teku"];

// Prysm has no Gnosis support.
const GNOSIS_CLIENTS: &[&str] = &["lighthouse", "lodestar", "nimbus", "teku"];

const NODE_STEPS: &[StepTemplate] = &[
    StepTemplate {
        id: "ensure-container",
        phase: Phase::Provision,
        tags: &["provision", "container"],
        condition: Condition::Always,
        rerun: false,
        shell: Some("docker info >/dev/null && mkdir -p {{workdir}}"),
        api: Some(
            r#"UNLESS /api2/json/nodes/{{proxmox_node}}/lxc/{{vmid}}/config POST /api2/json/nodes/{{proxmox_node}}/lxc {"vmid": {{vmid}}, "hostname": "{{container_name}}", "ostemplate": "{{ostemplate}}", "storage": "{{storage}}", "cores": {{cores}}, "memory": {{memory}}, "rootfs": "{{storage}}:{{disk_gb}}", "net0": "name=eth0,bridge={{bridge}},ip=dhcp", "features": "nesting=1", "unprivileged": 1}"#,
        ),
    },
    StepTemplate {
        id: "start-container",
        phase: Phase::Provision,
        tags: &["provision", "container"],
        condition: Condition::Always,
        rerun: false,
        shell: None,
        api: Some(
            "UNLESS /api2/json/nodes/{{proxmox_node}}/lxc/{{vmid}}/status/current status=running POST /api2/json/nodes/{{proxmox_node}}/lxc/{{vmid}}/status/start",
        ),
    },
    StepTemplate {
        id: "install-client",
        phase: Phase::Install,
        tags: &["install", "sedge"],
        condition: Condition::Always,
        rerun: false,
        shell: Some(
            "command -v {{sedge_bin}} >/dev/null 2>&1 || { curl -fsSL -o {{sedge_bin}} {{sedge_url}} && chmod +x {{sedge_bin}}; }",
        ),
        api: None,
    },
    StepTemplate {
        id: "configure-client",
        phase: Phase::Configure,
        tags: &["configure", "sedge"],
        condition: Condition::Always,
        rerun: false,
        shell: Some(
            "{{sedge_bin}} generate full-node --network {{network}} --consensus {{client}} --execution {{execution}} {{validator_flags}} {{sync_flags}} --path {{workdir}}",
        ),
        api: None,
    },
    StepTemplate {
        id: "configure-validator",
        phase: Phase::Configure,
        tags: &["configure", "validator", "keys"],
        condition: Condition::ValidatorOnly,
        rerun: false,
        shell: Some(
            "{{sedge_bin}} import-key --from {{keystore_dir}} --network {{network}} --path {{workdir}} {{client}}",
        ),
        api: None,
    },
    StepTemplate {
        id: "start-client",
        phase: Phase::Start,
        tags: &["start", "service"],
        condition: Condition::Always,
        rerun: false,
        shell: Some("{{sedge_bin}} run --path {{workdir}} --skip-docker-check"),
        api: None,
    },
    VERIFY_STEP,
];

/// Post-start node check
///
/// Subscribes to `newHeads` on the JSON-RPC WebSocket and calls
/// `engine_exchangeCapabilities` on the JWT-authenticated Engine API. The
/// JWT secret is read on the host itself.
pub const VERIFY_STEP: StepTemplate = StepTemplate {
    id: "verify-node",
    phase: Phase::Verify,
    tags: &["verify", "check"],
    condition: Condition::VerifyOnly,
    rerun: true,
    shell: Some(
        "CHECK ws://{{node_address}}:{{rpc_ws_port}} ws://{{node_address}}:{{engine_port}} {{jwt_secret_file}}",
    ),
    api: None,
};

/// Stopping a node is the same on every network
pub const STOP_STEP: StepTemplate = StepTemplate {
    id: "stop-client",
    phase: Phase::Stop,
    tags: &["stop", "service"],
    condition: Condition::Always,
    rerun: true,
    shell: Some("{{sedge_bin}} down --path {{workdir}}"),
    api: Some(
        "UNLESS /api2/json/nodes/{{proxmox_node}}/lxc/{{vmid}}/status/current status=stopped POST /api2/json/nodes/{{proxmox_node}}/lxc/{{vmid}}/status/shutdown",
    ),
};

const CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        family: NetworkFamily::EthereumMainnet,
        clients: ETHEREUM_CLIENTS,
        steps: NODE_STEPS,
    },
    CatalogEntry {
        family: NetworkFamily::EthereumTestnet,
        clients: ETHEREUM_CLIENTS,
        steps: NODE_STEPS,
    },
    CatalogEntry {
        family: NetworkFamily::Gnosis,
        clients: GNOSIS_CLIENTS,
        steps: NODE_STEPS,
    },
];

/// Find the recipe for a network family and client
pub fn lookup(family: NetworkFamily, client: &str) -> Option<&'static CatalogEntry> {
    CATALOG
        .iter()
        .find(|entry| entry.family == family && entry.clients.contains(&client))
}

/// Default template variables; request overrides and host vars win
pub const DEFAULT_VARS: &[(&str, &str)] = &[
    ("deploy_root", "/opt/ethdeploy"),
    ("execution", "geth"),
    ("sedge_bin", "/usr/local/bin/sedge"),
    (
        "sedge_url",
        "https://github.com/NethermindEth/sedge/releases/latest/download/sedge-linux-amd64",
    ),
    ("keystore_dir", "/opt/ethdeploy/keystore"),
    ("ostemplate", "local:vztmpl/ubuntu-24.04-standard_24.04-2_amd64.tar.zst"),
    ("storage", "local-lvm"),
    ("bridge", "vmbr0"),
    ("cores", "4"),
    ("memory", "16384"),
    ("disk_gb", "500"),
    ("rpc_ws_port", "8545"),
    ("engine_port", "8551"),
];
