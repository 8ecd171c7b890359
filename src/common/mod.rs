// # Shared Agent Types and Configuration
//
// Global configuration for the dataplane agent. The configuration
// loader lives outside this crate; everything here is the typed form
// the reconciliation engine consumes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::proto::{IpNet, Protocol};

// ============================================================================
// Configuration
// ============================================================================

/// How rules are installed into the kernel's built-in chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleInsertMode {
    /// Insert our jump rules at the top of the built-in chain.
    Insert,
    /// Append our jump rules at the end of the built-in chain.
    Append,
}

/// Global agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // Identity
    pub node_name: String,

    // Dataplane loop
    pub max_batch_size: usize,
    pub apply_throttle_capacity: u32,
    pub apply_throttle_refill_interval: Duration,
    pub apply_retry_interval: Duration,
    pub health_report_interval: Duration,
    pub status_report_interval: Duration,
    pub debug_simulate_dataplane_hang: bool,

    // Table writers
    pub rule_insert_mode: RuleInsertMode,
    pub table_refresh_interval: Duration,
    pub table_refresh_jitter: f64,
    pub table_lock_timeout: Duration,
    pub table_lock_probe_interval: Duration,

    // IP sets
    pub ipset_refresh_interval: Duration,
    pub max_ipset_size: usize,

    // Routes
    pub route_table_index: u32,
    pub route_refresh_interval: Duration,
    pub netlink_timeout: Duration,

    // Fast path
    pub fastpath_enabled: bool,
    pub fastpath_log_level: u8,
    pub fastpath_dsr_enabled: bool,
    pub fastpath_connect_time_lb: bool,
    pub fastpath_refresh_interval: Duration,
    pub workload_iface_prefix: String,

    // Overlay
    pub vxlan_port: u16,
    pub vxlan_vni: u32,
    pub vxlan_mtu: u16,
    pub tunnel_iface_name: String,

    // Marks
    pub allowed_mark_mask: u32,

    // Failsafe ports
    pub failsafe_inbound_ports: Vec<(Protocol, u16)>,
    pub failsafe_outbound_ports: Vec<(Protocol, u16)>,

    // Service loop prevention
    pub service_loop_prevention_cidrs: Vec<IpNet>,

    // Encryption
    pub wireguard_enabled: bool,

    // Environment
    pub ipv6_enabled: bool,
    pub disable_unprivileged_bpf: bool,
    pub state_dir: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            // Identity
            node_name: "node1".to_string(),

            // Dataplane loop
            max_batch_size: 100,
            apply_throttle_capacity: 10,
            apply_throttle_refill_interval: Duration::from_millis(100),
            apply_retry_interval: Duration::from_secs(10),
            health_report_interval: Duration::from_secs(10),
            status_report_interval: Duration::from_secs(30),
            debug_simulate_dataplane_hang: false,

            // Table writers
            rule_insert_mode: RuleInsertMode::Insert,
            table_refresh_interval: Duration::from_secs(90),
            table_refresh_jitter: 0.1,
            table_lock_timeout: Duration::from_secs(10),
            table_lock_probe_interval: Duration::from_millis(50),

            // IP sets
            ipset_refresh_interval: Duration::from_secs(90),
            max_ipset_size: 1_048_576,

            // Routes
            route_table_index: 254,
            route_refresh_interval: Duration::from_secs(90),
            netlink_timeout: Duration::from_secs(10),

            // Fast path
            fastpath_enabled: true,
            fastpath_log_level: 0,
            fastpath_dsr_enabled: false,
            fastpath_connect_time_lb: false,
            fastpath_refresh_interval: Duration::from_secs(90),
            workload_iface_prefix: "rpl".to_string(),

            // Overlay
            vxlan_port: 4789,
            vxlan_vni: 4096,
            vxlan_mtu: 1450,
            tunnel_iface_name: "vxlan.rpl".to_string(),

            // Marks
            allowed_mark_mask: 0xffff_0000,

            // Failsafe ports: ssh, etcd, api server, BGP
            failsafe_inbound_ports: vec![
                (Protocol::Tcp, 22),
                (Protocol::Tcp, 179),
                (Protocol::Tcp, 2379),
                (Protocol::Tcp, 2380),
                (Protocol::Tcp, 6443),
            ],
            failsafe_outbound_ports: vec![
                (Protocol::Tcp, 179),
                (Protocol::Tcp, 2379),
                (Protocol::Tcp, 2380),
                (Protocol::Tcp, 6443),
                (Protocol::Udp, 53),
            ],

            // Service loop prevention
            service_loop_prevention_cidrs: Vec::new(),

            // Encryption
            wireguard_enabled: false,

            // Environment
            ipv6_enabled: false,
            disable_unprivileged_bpf: false,
            state_dir: "/var/lib/rusty-dataplane".to_string(),
        }
    }
}

pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_consistent() {
        let config = AgentConfig::default();
        assert_eq!(config.max_batch_size, 100);
        assert_eq!(config.apply_throttle_capacity, 10);
        assert_eq!(
            config.apply_throttle_refill_interval,
            Duration::from_millis(100)
        );
        assert!(config.allowed_mark_mask.count_ones() >= 8);
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = AgentConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: AgentConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.node_name, config.node_name);
        assert_eq!(back.rule_insert_mode, config.rule_insert_mode);
        assert_eq!(back.vxlan_port, config.vxlan_port);
    }
}
