// # Host Environment Preparation
//
// One-shot setup performed before the driver starts: IP forwarding
// sysctls, optional hardening, best-effort kernel module loads, and
// the persisted pod MTU that same-host collaborators read.

use std::fs;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::common::AgentConfig;
use crate::error::{DpError, Result};

const IPV4_FORWARD: &str = "/proc/sys/net/ipv4/ip_forward";
const IPV6_FORWARD: &str = "/proc/sys/net/ipv6/conf/all/forwarding";
const UNPRIVILEGED_BPF: &str = "/proc/sys/kernel/unprivileged_bpf_disabled";

/// Modules we want present; failures are ignored (the functionality
/// may be built in, or simply unused on this node).
const OPTIONAL_MODULES: &[&str] = &["nf_conntrack_proto_sctp", "wireguard"];

pub fn prepare_host(config: &AgentConfig) -> Result<()> {
    write_sysctl(IPV4_FORWARD, "1")?;
    if config.ipv6_enabled {
        write_sysctl(IPV6_FORWARD, "1")?;
    }
    if config.disable_unprivileged_bpf {
        if let Err(e) = write_sysctl_raw(UNPRIVILEGED_BPF, "1") {
            warn!("could not disable unprivileged bpf: {}", e);
        }
    }

    for module in OPTIONAL_MODULES {
        match std::process::Command::new("modprobe").arg(module).status() {
            Ok(status) if status.success() => debug!(module, "kernel module loaded"),
            Ok(_) | Err(_) => debug!(module, "kernel module unavailable, continuing"),
        }
    }

    persist_pod_mtu(&config.state_dir, config.vxlan_mtu)?;
    Ok(())
}

fn write_sysctl(path: &str, value: &str) -> Result<()> {
    write_sysctl_raw(path, value)
        .map_err(|e| DpError::Environment(format!("sysctl {}: {}", path, e)))
}

fn write_sysctl_raw(path: &str, value: &str) -> std::io::Result<()> {
    fs::write(path, value)
}

/// Record the selected pod MTU for collaborators on the same host.
pub fn persist_pod_mtu(state_dir: &str, mtu: u16) -> Result<()> {
    let dir = Path::new(state_dir);
    fs::create_dir_all(dir)?;
    let path = dir.join("mtu");
    fs::write(&path, format!("{}\n", mtu))?;
    info!(mtu, path = %path.display(), "pod MTU persisted");
    Ok(())
}

pub fn read_pod_mtu(state_dir: &str) -> Result<u16> {
    let path = Path::new(state_dir).join("mtu");
    let text = fs::read_to_string(&path)?;
    text.trim()
        .parse()
        .map_err(|e| DpError::Environment(format!("malformed mtu file {}: {}", path.display(), e)))
}
