//! Proxmox VE discovery: turns cluster VMs and containers into inventory hosts

use futures::future::join_all;
use reqwest::{header, Client};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::errors::OrchestratorError;
use crate::inventory::store::InventoryStore;
use crate::models::host::{ConnectionKind, Host};

/// Envelope used by every Proxmox API response
#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    data: T,
}

/// Entry of `/cluster/resources?type=vm`
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterResource {
    /// `qemu` or `lxc`
    #[serde(rename = "type")]
    pub kind: String,
    pub node: String,
    pub vmid: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    /// Semicolon separated
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub template: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct QemuAgentInterfaces {
    #[serde(default)]
    result: Vec<GuestInterface>,
}

#[derive(Debug, Deserialize)]
struct GuestInterface {
    #[serde(default)]
    name: String,
    #[serde(default, rename = "ip-addresses")]
    ip_addresses: Vec<GuestAddress>,
}

#[derive(Debug, Deserialize)]
struct GuestAddress {
    #[serde(rename = "ip-address")]
    ip_address: String,
    #[serde(rename = "ip-address-type")]
    ip_address_type: String,
}

#[derive(Debug, Deserialize)]
struct LxcInterface {
    #[serde(default)]
    name: String,
    #[serde(default)]
    inet: Option<String>,
}

/// Minimal Proxmox API client authenticated with an API token
pub struct ProxmoxClient {
    client: Client,
    base_url: Url,
    authorization: SecretString,
}

impl ProxmoxClient {
    /// `token_id` looks like `user@realm!name`
    pub fn new(
        base_url: &str,
        token_id: &str,
        token_secret: SecretString,
        insecure_tls: bool,
    ) -> Result<Self, OrchestratorError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| OrchestratorError::ConfigError(format!("invalid Proxmox URL: {}", e)))?;
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .danger_accept_invalid_certs(insecure_tls)
            .build()?;
        let authorization = SecretString::from(format!(
            "PVEAPIToken={}={}",
            token_id,
            token_secret.expose_secret()
        ));

        Ok(Self {
            client,
            base_url,
            authorization,
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, OrchestratorError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| OrchestratorError::ConfigError(format!("invalid API path {}: {}", path, e)))?;
        debug!("GET {}", url);

        let response = self
            .client
            .get(url)
            .header(header::AUTHORIZATION, self.authorization.expose_secret())
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::StepFailed(format!(
                "Proxmox GET {} failed: {} - {}",
                path, status, body
            )));
        }

        let envelope: ApiEnvelope<T> = response.json().await?;
        Ok(envelope.data)
    }

    /// List VMs and containers across the cluster
    pub async fn cluster_resources(&self) -> Result<Vec<ClusterResource>, OrchestratorError> {
        self.get("/api2/json/cluster/resources?type=vm").await
    }

    /// Best-effort IPv4 address of a running guest
    pub async fn guest_address(&self, resource: &ClusterResource) -> Option<String> {
        let result = match resource.kind.as_str() {
            "qemu" => {
                let path = format!(
                    "/api2/json/nodes/{}/qemu/{}/agent/network-get-interfaces",
                    resource.node, resource.vmid
                );
                self.get::<QemuAgentInterfaces>(&path).await.map(|r| {
                    r.result
                        .into_iter()
                        .filter(|iface| iface.name != "lo")
                        .flat_map(|iface| iface.ip_addresses)
                        .find(|addr| addr.ip_address_type == "ipv4")
                        .map(|addr| addr.ip_address)
                })
            }
            "lxc" => {
                let path = format!(
                    "/api2/json/nodes/{}/lxc/{}/interfaces",
                    resource.node, resource.vmid
                );
                self.get::<Vec<LxcInterface>>(&path).await.map(|ifaces| {
                    ifaces
                        .into_iter()
                        .filter(|iface| iface.name != "lo")
                        .find_map(|iface| iface.inet)
                        .map(|inet| inet.split('/').next().unwrap_or_default().to_string())
                })
            }
            _ => Ok(None),
        };

        match result {
            Ok(address) => address,
            Err(e) => {
                warn!("Could not read address of {} {}: {}", resource.kind, resource.vmid, e);
                None
            }
        }
    }
}

/// Map a cluster resource to an inventory host
///
/// Guests without a reported address fall back to their name, which is
/// expected to resolve through DNS.
pub fn host_from_resource(resource: &ClusterResource, address: Option<String>) -> Host {
    let name = resource
        .name
        .clone()
        .unwrap_or_else(|| format!("{}-{}", resource.kind, resource.vmid));
    let address = address.unwrap_or_else(|| name.clone());

    let mut host = Host::new(name, ConnectionKind::Ssh, address)
        .with_tag("proxmox")
        .with_tag(format!("proxmox-node:{}", resource.node))
        .with_tag(resource.kind.clone())
        .with_var("proxmox_node", resource.node.clone())
        .with_var("vmid", resource.vmid.to_string())
        .with_var("vm_type", resource.kind.clone());

    if let Some(tags) = &resource.tags {
        for tag in tags.split(';').map(str::trim).filter(|t| !t.is_empty()) {
            host.tags.insert(tag.to_string());
        }
    }
    host
}

/// Discover running guests and upsert them into the inventory
///
/// Returns the names of the hosts that were upserted.
pub async fn discover(
    client: &ProxmoxClient,
    inventory: &InventoryStore,
) -> Result<Vec<String>, OrchestratorError> {
    let resources: Vec<ClusterResource> = client
        .cluster_resources()
        .await?
        .into_iter()
        .filter(|r| r.template.unwrap_or(0) == 0)
        .filter(|r| r.status.as_deref() == Some("running"))
        .collect();
    info!("Proxmox reports {} running guests", resources.len());

    let addresses = join_all(resources.iter().map(|r| client.guest_address(r))).await;

    let mut names = Vec::with_capacity(resources.len());
    for (resource, address) in resources.iter().zip(addresses) {
        let host = host_from_resource(resource, address);
        names.push(host.name.clone());
        inventory.upsert(host).await?;
    }
    Ok(names)
}
