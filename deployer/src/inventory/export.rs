//! Render the inventory as an Ansible INI inventory

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::models::host::{ConnectionKind, Host};

/// Render hosts grouped by tag
///
/// Every host appears once under `[all]` with its connection variables, and
/// once more (name only) under a group per tag. Tag characters Ansible does
/// not accept in group names are replaced by `_`.
pub fn render_ansible_ini(hosts: &[Host]) -> String {
    let mut out = String::new();
    let mut groups: BTreeMap<String, Vec<&str>> = BTreeMap::new();

    out.push_str("[all]\n");
    for host in hosts {
        let _ = writeln!(out, "{}", host_line(host));
        for tag in &host.tags {
            groups.entry(group_name(tag)).or_default().push(&host.name);
        }
    }

    for (group, members) in groups {
        let _ = write!(out, "\n[{}]\n", group);
        for member in members {
            let _ = writeln!(out, "{}", member);
        }
    }
    out
}

fn host_line(host: &Host) -> String {
    let mut line = host.name.clone();
    match host.connection {
        ConnectionKind::Local => line.push_str(" ansible_connection=local"),
        ConnectionKind::Ssh => {
            let _ = write!(line, " ansible_host={}", host.address);
            if let Some(user) = host.var("ssh_user") {
                let _ = write!(line, " ansible_user={}", user);
            }
            if let Some(port) = host.var("ssh_port") {
                let _ = write!(line, " ansible_port={}", port);
            }
        }
        // API targets have no shell; Ansible reaches them from the controller.
        ConnectionKind::Api => {
            let _ = write!(line, " ansible_connection=local api_url={}", host.address);
        }
    }
    line
}

fn group_name(tag: &str) -> String {
    tag.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}
