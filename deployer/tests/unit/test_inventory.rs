//! Inventory store tests

use std::sync::Arc;

use ethdeploy::errors::OrchestratorError;
use ethdeploy::filesys::dir::Dir;
use ethdeploy::inventory::export::render_ansible_ini;
use ethdeploy::inventory::InventoryStore;
use ethdeploy::models::host::{ConnectionKind, Host, InventoryDocument};

fn doc(json: &str) -> InventoryDocument {
    serde_json::from_str(json).unwrap()
}

#[test]
fn test_load_merges_sources_in_order() {
    let base = doc(
        r#"{"hosts": [
            {"name": "node-1", "connection": "ssh", "address": "10.0.0.1", "tags": ["sepolia"], "vars": {"ssh_user": "root"}},
            {"name": "node-2", "connection": "local"}
        ]}"#,
    );
    let site = doc(
        r#"{"hosts": [
            {"name": "node-1", "address": "10.0.0.2", "tags": ["validator"], "vars": {"ssh_user": "ubuntu"}}
        ]}"#,
    );

    let store = InventoryStore::load(&[base, site], None).unwrap();
    let node = store.resolve("node-1").unwrap();

    assert_eq!(store.len(), 2);
    assert_eq!(node.connection, ConnectionKind::Ssh);
    assert_eq!(node.address, "10.0.0.2");
    assert!(node.has_tag("sepolia") && node.has_tag("validator"));
    assert_eq!(node.var("ssh_user"), Some("ubuntu"));
}

#[test]
fn test_new_host_without_connection_is_rejected() {
    let result = InventoryStore::load(&[doc(r#"{"hosts": [{"name": "ghost"}]}"#)], None);
    assert!(matches!(result, Err(OrchestratorError::ValidationError(_))));
}

#[test]
fn test_resolve_missing_host() {
    let store = InventoryStore::new(None);
    match store.resolve("nope") {
        Err(OrchestratorError::HostNotFound(name)) => assert_eq!(name, "nope"),
        other => panic!("expected HostNotFound, got {:?}", other),
    }
}

#[tokio::test]
async fn test_upsert_persists_merged_inventory() {
    let dir = Dir::create_temp_dir("inventory-persist").await.unwrap();
    let source = dir.file("static.json");
    source
        .write_string(r#"{"hosts": [{"name": "node-1", "connection": "ssh", "address": "10.0.0.1", "tags": ["mainnet"]}]}"#)
        .await
        .unwrap();
    let persisted = dir.file("inventory.json");

    let store = InventoryStore::open(&[source.clone()], persisted.clone()).await.unwrap();
    store
        .upsert(Host::new("vm-120", ConnectionKind::Ssh, "10.0.0.120").with_tag("proxmox"))
        .await
        .unwrap();
    assert!(persisted.exists().await);

    let reopened = InventoryStore::open(&[source], persisted).await.unwrap();
    assert_eq!(reopened.len(), 2);
    assert!(reopened.resolve("vm-120").unwrap().has_tag("proxmox"));
    assert!(reopened.resolve("node-1").unwrap().has_tag("mainnet"));

    let document: InventoryDocument = dir.file("inventory.json").read_json().await.unwrap();
    let names: Vec<&str> = document.hosts.iter().map(|h| h.name.as_str()).collect();
    assert_eq!(names, ["vm-120"]);

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_source_edit_wins_after_upsert_of_other_host() {
    let dir = Dir::create_temp_dir("inventory-source-edit").await.unwrap();
    let source = dir.file("static.json");
    let persisted = dir.file("inventory.json");
    source
        .write_string(r#"{"hosts": [{"name": "node-1", "connection": "ssh", "address": "10.0.0.1"}]}"#)
        .await
        .unwrap();

    let store = InventoryStore::open(&[source.clone()], persisted.clone()).await.unwrap();
    store
        .upsert(Host::new("vm-120", ConnectionKind::Ssh, "10.0.0.120"))
        .await
        .unwrap();

    source
        .write_string(r#"{"hosts": [{"name": "node-1", "connection": "ssh", "address": "10.0.0.2"}]}"#)
        .await
        .unwrap();
    let reopened = InventoryStore::open(&[source.clone()], persisted.clone()).await.unwrap();
    assert_eq!(reopened.resolve("node-1").unwrap().address, "10.0.0.2");
    assert_eq!(reopened.resolve("vm-120").unwrap().address, "10.0.0.120");

    // An explicit upsert of a source host keeps overriding the source.
    reopened
        .upsert(Host::new("node-1", ConnectionKind::Ssh, "10.0.0.3"))
        .await
        .unwrap();
    let again = InventoryStore::open(&[source], persisted).await.unwrap();
    assert_eq!(again.resolve("node-1").unwrap().address, "10.0.0.3");

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_upserts_of_different_hosts() {
    let dir = Dir::create_temp_dir("inventory-concurrent").await.unwrap();
    let store = Arc::new(InventoryStore::new(Some(dir.file("inventory.json"))));

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .upsert(Host::new(format!("vm-{}", i), ConnectionKind::Ssh, format!("10.0.1.{}", i)))
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let document: InventoryDocument = dir.file("inventory.json").read_json().await.unwrap();
    assert_eq!(store.len(), 16);
    assert_eq!(document.hosts.len(), 16);

    dir.delete().await.unwrap();
}

#[test]
fn test_select_by_tag_and_export() {
    let store = InventoryStore::load(
        &[doc(
            r#"{"hosts": [
                {"name": "a", "connection": "ssh", "address": "10.0.0.1", "tags": ["sepolia"]},
                {"name": "b", "connection": "ssh", "address": "10.0.0.2", "tags": ["gnosis"]}
            ]}"#,
        )],
        None,
    )
    .unwrap();

    let selected = store.select_by_tag("sepolia");
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].name, "a");

    let ini = render_ansible_ini(&store.hosts());
    assert!(ini.contains("[sepolia]"));
    assert!(ini.contains("[gnosis]"));
}
