//! `wg(8)` command driver

use std::net::Ipv4Addr;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{TunnelControl, TunnelPeer};
use crate::crypto::TunnelKey;
use crate::error::{DvpnError, Result};

/// Drives a WireGuard interface through the `wg` binary
#[derive(Debug, Clone)]
pub struct WgTunnel {
    interface: String,
    use_sudo: bool,
    timeout: Duration,
}

impl WgTunnel {
    pub fn new(interface: impl Into<String>, use_sudo: bool, timeout: Duration) -> Self {
        Self {
            interface: interface.into(),
            use_sudo,
            timeout,
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    async fn wg(&self, args: &[&str]) -> Result<String> {
        let mut cmd = if self.use_sudo {
            let mut c = Command::new("sudo");
            c.arg("wg");
            c
        } else {
            Command::new("wg")
        };
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(interface = %self.interface, ?args, "running wg");
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| DvpnError::DaemonUnavailable(format!("wg {} timed out", args.join(" "))))?
            .map_err(|e| DvpnError::DaemonUnavailable(format!("failed to run wg: {}", e)))?;

        if !output.status.success() {
            return Err(DvpnError::DaemonUnavailable(format!(
                "wg {} exited with {}: {}",
                args.first().copied().unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Parse `wg show <if> dump`. The first line describes the interface itself;
/// every following line is one peer, tab separated, with allowed-ips in the
/// fourth column.
pub fn parse_dump(dump: &str) -> Vec<TunnelPeer> {
    dump.lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split('\t').collect();
            if cols.len() < 4 {
                return None;
            }
            let key: TunnelKey = cols[0].parse().ok()?;
            let allowed_ips = cols[3]
                .split(',')
                .filter_map(|cidr| {
                    let (ip, prefix) = cidr.trim().split_once('/')?;
                    if prefix != "32" {
                        return None;
                    }
                    ip.parse().ok()
                })
                .collect();
            Some(TunnelPeer { key, allowed_ips })
        })
        .collect()
}

#[async_trait]
impl TunnelControl for WgTunnel {
    async fn list_peers(&self) -> Result<Vec<TunnelPeer>> {
        let dump = self.wg(&["show", &self.interface, "dump"]).await?;
        Ok(parse_dump(&dump))
    }

    async fn add_or_replace_peer(&self, key: &TunnelKey, address: Ipv4Addr, keepalive_secs: u16) -> Result<()> {
        let key = key.to_base64();
        let allowed = format!("{}/32", address);
        let keepalive = keepalive_secs.to_string();
        self.wg(&[
            "set",
            &self.interface,
            "peer",
            &key,
            "allowed-ips",
            &allowed,
            "persistent-keepalive",
            &keepalive,
        ])
        .await
        .map(|_| ())
    }

    async fn remove_peer(&self, key: &TunnelKey) -> Result<()> {
        // `wg set ... remove` is a no-op for unknown peers
        let key = key.to_base64();
        self.wg(&["set", &self.interface, "peer", &key, "remove"]).await.map(|_| ())
    }
}
