//! nftables ruleset rendering and application.
//!
//! The ruleset is a pure function of the current instance set: every
//! membership change re-renders all three tables from scratch and swaps the
//! result in with `nft -f`. Each table is declared, deleted, then redefined,
//! so the delete can never fail and a rejected file never leaves the host
//! more permissive than it was.
//!
//! Tables:
//!
//! - `ip fleetingdforwarding` — forward hook, default drop, explicit accept
//!   pairs between the egress interface and each TAP.
//! - `netdev fleetingdfilter` — one ingress chain per TAP: drop spoofed
//!   source MACs and IPs, accept traffic to the gateway, drop the rest of
//!   the VM `/24` so instances cannot reach each other.
//! - `ip fleetingdsnat` — masquerade each TAP out of the egress interface
//!   with fully-random source ports.

use std::net::Ipv4Addr;
use std::path::Path;

use askama::Template;
use tokio::process::Command;

use crate::error::{NetError, Result};

/// Packet-filter binary applied with `-f <ruleset>`.
pub const NFT_BIN: &str = "nft";

/// One VM as seen by the packet filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterInstance {
    /// TAP device name (equals the instance name).
    pub name: String,
    /// Guest-side TAP address.
    pub guest_ip: Ipv4Addr,
    /// Host-side TAP address, the guest's default gateway.
    pub gateway: Ipv4Addr,
    /// Guest MAC address.
    pub mac: String,
}

#[derive(Template)]
#[template(path = "ruleset.nft", escape = "none")]
struct RulesetTemplate<'a> {
    egress_interface: &'a str,
    subnet_prefix: &'a str,
    instances: &'a [FilterInstance],
}

/// Renders the complete ruleset for the given instance set.
///
/// Instances are sorted by name before rendering so equal inventories yield
/// byte-identical output regardless of iteration order.
///
/// # Errors
///
/// Returns an error if template rendering fails.
pub fn render(
    egress_interface: &str,
    subnet_prefix: &str,
    instances: &[FilterInstance],
) -> Result<String> {
    let mut sorted = instances.to_vec();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    RulesetTemplate {
        egress_interface,
        subnet_prefix,
        instances: &sorted,
    }
    .render()
    .map_err(|e| NetError::Render(e.to_string()))
}

/// Renders the ruleset, writes it to `path`, and applies it with the
/// packet-filter tool.
///
/// # Errors
///
/// Returns an error if rendering fails, the file cannot be written, or the
/// tool exits non-zero.
pub async fn apply(
    nft_bin: &str,
    path: &Path,
    egress_interface: &str,
    subnet_prefix: &str,
    instances: &[FilterInstance],
) -> Result<()> {
    let ruleset = render(egress_interface, subnet_prefix, instances)?;
    tokio::fs::write(path, &ruleset).await?;

    let status = Command::new(nft_bin).arg("-f").arg(path).status().await?;
    if !status.success() {
        return Err(NetError::Apply(format!(
            "{} -f {} exited with {}",
            nft_bin,
            path.display(),
            status
        )));
    }

    tracing::debug!(
        instances = instances.len(),
        path = %path.display(),
        "applied packet-filter ruleset"
    );
    Ok(())
}

/// Returns true when the packet-filter tool can be invoked.
#[must_use]
pub fn nft_available(nft_bin: &str) -> bool {
    std::process::Command::new(nft_bin)
        .arg("--version")
        .output()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(name: &str, base: u8) -> FilterInstance {
        FilterInstance {
            name: name.to_string(),
            guest_ip: Ipv4Addr::new(10, 0, 0, base + 2),
            gateway: Ipv4Addr::new(10, 0, 0, base + 1),
            mac: "de:51:00:11:22:33".to_string(),
        }
    }

    #[test]
    fn empty_inventory_renders_empty_chains() {
        let out = render("eth0", "10.0.0.", &[]).unwrap();

        assert!(out.contains("delete table ip fleetingdforwarding"));
        assert!(out.contains("delete table netdev fleetingdfilter"));
        assert!(out.contains("delete table ip fleetingdsnat"));
        assert!(!out.contains("iifname"));
        assert_eq!(out.matches("chain ").count(), 2); // forward + postrouting
    }

    #[test]
    fn one_instance_gets_one_ingress_chain() {
        let out = render("eth0", "10.0.0.", &[instance("pool0", 0)]).unwrap();

        assert_eq!(out.matches("chain pool0 ").count(), 1);
        assert!(out.contains(r#"iifname "eth0" oifname "pool0" accept"#));
        assert!(out.contains(r#"iifname "pool0" oifname "eth0" accept"#));
        assert!(out.contains("ether saddr != de:51:00:11:22:33 drop"));
        assert!(out.contains("ip saddr != 10.0.0.2 drop"));
        assert!(out.contains("ip daddr 10.0.0.1 accept"));
        assert!(out.contains("ip daddr 10.0.0.0/24 drop"));
        assert!(out.contains(r#"iifname "pool0" oifname "eth0" masquerade fully-random"#));
    }

    #[test]
    fn every_table_has_delete_prelude() {
        let out = render("eth0", "10.0.0.", &[instance("pool0", 0)]).unwrap();

        for table in [
            "ip fleetingdforwarding",
            "netdev fleetingdfilter",
            "ip fleetingdsnat",
        ] {
            // declare, delete, redefine
            assert!(out.contains(&format!("table {table}\ndelete table {table}\ntable {table} {{")));
        }
    }

    #[test]
    fn rendering_is_deterministic() {
        let instances = vec![instance("pool0", 0), instance("pool1", 4)];
        let a = render("eth0", "10.0.0.", &instances).unwrap();
        let b = render("eth0", "10.0.0.", &instances).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rendering_ignores_input_order() {
        let forward = vec![instance("pool0", 0), instance("pool2", 8)];
        let reverse = vec![instance("pool2", 8), instance("pool0", 0)];
        assert_eq!(
            render("eth0", "10.0.0.", &forward).unwrap(),
            render("eth0", "10.0.0.", &reverse).unwrap()
        );
    }

    #[tokio::test]
    async fn apply_writes_ruleset_and_surfaces_tool_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ruleset.nft");

        let err = apply("false", &path, "eth0", "10.0.0.", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Apply(_)));

        // The file is still written before the tool runs.
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("fleetingdforwarding"));
    }

    #[tokio::test]
    async fn apply_succeeds_when_tool_accepts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ruleset.nft");

        apply("true", &path, "eth0", "10.0.0.", &[instance("pool0", 0)])
            .await
            .unwrap();
    }
}
