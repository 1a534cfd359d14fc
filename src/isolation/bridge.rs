//! Host-side bridge attachment: a veth pair with one end enslaved to a
//! configured bridge and the other end moved into the child's network
//! namespace.

use crate::config::BridgeConfig;
use std::io;
use std::process::Command;
use tracing::{debug, warn};

/// Interface names are capped at IFNAMSIZ - 1 on Linux
const IFNAME_MAX: usize = 15;

/// A created veth pair whose host end is enslaved to a bridge
///
/// Host-side state, owned by the per-process isolation context. Dropping
/// or releasing the attachment deletes the host link (the peer end dies
/// with it).
#[derive(Debug)]
pub struct BridgeAttachment {
    bridge: String,
    host_if: String,
    peer_if: String,
    released: bool,
}

impl BridgeAttachment {
    /// Create the veth pair and enslave the host end to the bridge
    pub fn create(process_name: &str, config: &BridgeConfig) -> io::Result<BridgeAttachment> {
        let host_if = ifname(process_name, 'h');
        let peer_if = ifname(process_name, 'c');

        run_ip(&[
            "link", "add", &host_if, "type", "veth", "peer", "name", &peer_if,
        ])?;

        let attachment = BridgeAttachment {
            bridge: config.bridge.clone(),
            host_if: host_if.clone(),
            peer_if,
            released: false,
        };

        // Enslave and bring up the host end; undo the pair on failure
        if let Err(e) = run_ip(&["link", "set", &host_if, "master", &config.bridge])
            .and_then(|_| run_ip(&["link", "set", &host_if, "up"]))
        {
            let _ = run_ip(&["link", "del", &host_if]);
            return Err(e);
        }

        debug!(
            host_if = %attachment.host_if,
            peer_if = %attachment.peer_if,
            bridge = %attachment.bridge,
            "Bridge attachment created"
        );

        Ok(attachment)
    }

    /// Move the peer end into the network namespace of `pid` and assign
    /// the configured address inside it
    ///
    /// The namespace is unnamed (entered via the child's pid, not
    /// `/var/run/netns`), so in-namespace commands go through
    /// `nsenter -t <pid> -n`.
    pub fn attach_to_pid(&self, pid: u32, address: Option<&str>) -> io::Result<()> {
        let pid_str = pid.to_string();
        run_ip(&["link", "set", &self.peer_if, "netns", &pid_str])?;

        if let Some(addr) = address {
            run_in_netns(pid, &["addr", "add", addr, "dev", &self.peer_if])?;
            run_in_netns(pid, &["link", "set", &self.peer_if, "up"])?;
        }

        Ok(())
    }

    pub fn host_interface(&self) -> &str {
        &self.host_if
    }

    pub fn peer_interface(&self) -> &str {
        &self.peer_if
    }

    /// Delete the host link
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = run_ip(&["link", "del", &self.host_if]) {
            warn!(host_if = %self.host_if, error = %e, "Failed to delete veth link");
        }
    }
}

impl Drop for BridgeAttachment {
    fn drop(&mut self) {
        self.release();
    }
}

/// Derive a deterministic interface name that fits IFNAMSIZ
fn ifname(process_name: &str, side: char) -> String {
    let mut base: String = process_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    // "wv" prefix + side suffix leave 12 chars for the name
    base.truncate(IFNAME_MAX - 3);
    format!("wv{}{}", base, side)
}

fn run_ip(args: &[&str]) -> io::Result<()> {
    run("ip", &args.iter().map(|s| s.to_string()).collect::<Vec<_>>())
}

/// Run an `ip` command inside the network namespace of `pid`
fn run_in_netns(pid: u32, ip_args: &[&str]) -> io::Result<()> {
    run("nsenter", &netns_args(pid, ip_args))
}

/// nsenter argv entering only the network namespace of `pid`
fn netns_args(pid: u32, ip_args: &[&str]) -> Vec<String> {
    let mut args = vec![
        "-t".to_string(),
        pid.to_string(),
        "-n".to_string(),
        "ip".to_string(),
    ];
    args.extend(ip_args.iter().map(|s| s.to_string()));
    args
}

fn run(program: &str, args: &[String]) -> io::Result<()> {
    let output = Command::new(program).args(args).output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Other,
            format!(
                "{} {} failed: {}",
                program,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ))
    }
}
