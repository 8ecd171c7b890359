// # Desired-State and Status Messages
//
// Typed form of the message stream exchanged with the upstream
// calculation graph. Inbound messages describe endpoints, policies,
// IP sets, services and host metadata; outbound messages report
// endpoint and process status. The driver additionally injects
// interface events from the kernel monitor into the same stream so
// managers observe a single ordered sequence of updates.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

// ============================================================================
// Identifiers
// ============================================================================

/// Stable identifier of a workload or host endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(pub String);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a policy or profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyId(pub String);

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an IP set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IpSetId(pub String);

impl fmt::Display for IpSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Protocol
// ============================================================================

/// Transport protocol selector used by rules, sets and services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Sctp,
    Other(u8),
}

impl Protocol {
    pub fn number(self) -> u8 {
        match self {
            Protocol::Icmp => 1,
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
            Protocol::Sctp => 132,
            Protocol::Other(n) => n,
        }
    }

    pub fn from_number(n: u8) -> Self {
        match n {
            1 => Protocol::Icmp,
            6 => Protocol::Tcp,
            17 => Protocol::Udp,
            132 => Protocol::Sctp,
            other => Protocol::Other(other),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Icmp => write!(f, "icmp"),
            Protocol::Sctp => write!(f, "sctp"),
            Protocol::Other(n) => write!(f, "{}", n),
        }
    }
}

// ============================================================================
// Endpoints
// ============================================================================

/// Administrative state of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminState {
    Up,
    Down,
}

/// Reference to the policy tiers applying to one direction of an
/// endpoint, in evaluation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierInfo {
    pub name: String,
    pub ingress_policies: Vec<PolicyId>,
    pub egress_policies: Vec<PolicyId>,
}

/// A 1:1 NAT mapping from an external address onto a workload
/// address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloatingIp {
    pub external: Ipv4Addr,
    pub internal: Ipv4Addr,
}

/// An addressable workload (pod) interface on this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadEndpoint {
    pub id: EndpointId,
    pub iface_name: String,
    pub addresses: Vec<Ipv4Addr>,
    pub tiers: Vec<TierInfo>,
    pub profiles: Vec<PolicyId>,
    pub admin_state: AdminState,
    /// Whether traffic to this endpoint from remote nodes arrives
    /// through the overlay tunnel.
    pub expects_encap: bool,
    pub floating_ips: Vec<FloatingIp>,
}

/// A host-owned interface subject to host endpoint policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEndpoint {
    pub id: EndpointId,
    pub iface_name: String,
    pub expected_addresses: Vec<Ipv4Addr>,
    pub tiers: Vec<TierInfo>,
    pub profiles: Vec<PolicyId>,
}

// ============================================================================
// Policy
// ============================================================================

/// Terminal action of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleAction {
    Allow,
    Deny,
    /// Skip the remainder of the current tier.
    Pass,
    Log,
}

/// Match criteria of a single rule. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub protocol: Option<Protocol>,
    pub src_net: Option<IpNet>,
    pub dst_net: Option<IpNet>,
    pub src_sets: Vec<IpSetId>,
    pub dst_sets: Vec<IpSetId>,
    pub src_ports: Vec<PortRange>,
    pub dst_ports: Vec<PortRange>,
    pub icmp_type: Option<u8>,
    pub negated_src_sets: Vec<IpSetId>,
    pub negated_dst_sets: Vec<IpSetId>,
}

/// An IPv4 prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IpNet {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
}

impl IpNet {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Self {
        Self { addr, prefix_len }
    }

    pub fn host(addr: Ipv4Addr) -> Self {
        Self {
            addr,
            prefix_len: 32,
        }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        if self.prefix_len == 0 {
            return true;
        }
        let mask = u32::MAX << (32 - self.prefix_len as u32);
        (u32::from(self.addr) & mask) == (u32::from(addr) & mask)
    }
}

impl fmt::Display for IpNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

/// An inclusive port range; a single port is `lo == hi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub lo: u16,
    pub hi: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self { lo: port, hi: port }
    }
}

/// One rule: match criteria plus a terminal action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub criteria: RuleMatch,
    pub action: RuleAction,
}

/// An ordered list of rules. Policies are immutable once programmed;
/// an update replaces the rendered form atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    pub inbound_rules: Vec<Rule>,
    pub outbound_rules: Vec<Rule>,
    /// Order within the tier; lower evaluates first.
    pub order: i32,
}

// ============================================================================
// IP sets
// ============================================================================

/// The value kind stored in an IP set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpSetKind {
    Addrs,
    AddrPortProto,
    AddrProto,
}

/// One member of an IP set. The variant must agree with the set kind
/// (prefixes live in address sets).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IpSetMember {
    Addr(Ipv4Addr),
    Net(IpNet),
    AddrPortProto(Ipv4Addr, u16, Protocol),
    AddrProto(Ipv4Addr, Protocol),
}

impl IpSetMember {
    pub fn kind(&self) -> IpSetKind {
        match self {
            IpSetMember::Addr(_) | IpSetMember::Net(_) => IpSetKind::Addrs,
            IpSetMember::AddrPortProto(..) => IpSetKind::AddrPortProto,
            IpSetMember::AddrProto(..) => IpSetKind::AddrProto,
        }
    }
}

impl fmt::Display for IpSetMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpSetMember::Addr(a) => write!(f, "{}", a),
            IpSetMember::Net(n) => write!(f, "{}", n),
            IpSetMember::AddrPortProto(a, p, proto) => write!(f, "{},{}:{}", a, proto, p),
            IpSetMember::AddrProto(a, proto) => write!(f, "{},{}", a, proto),
        }
    }
}

// ============================================================================
// Services (NAT)
// ============================================================================

bitflags::bitflags! {
    /// Per-service NAT behavior flags. The numeric values are part of
    /// the kernel map schema.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ServiceFlags: u32 {
        const EXTERNAL_LOCAL = 0x01;
        const NODE_PORT = 0x02;
        const NAT_OUTGOING = 0x04;
    }
}

/// Frontend identity of a service: the virtual address clients dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub vip: Ipv4Addr,
    pub port: u16,
    pub protocol: Protocol,
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.vip, self.port, self.protocol)
    }
}

/// One real endpoint behind a service frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceBackend {
    pub addr: Ipv4Addr,
    pub port: u16,
    pub is_local: bool,
}

/// Desired NAT state of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub key: ServiceKey,
    pub backends: Vec<ServiceBackend>,
    pub flags: ServiceFlags,
    /// Session affinity window in seconds; zero disables affinity.
    pub affinity_secs: u32,
}

// ============================================================================
// Host metadata
// ============================================================================

/// Addresses and tunnel configuration of a (possibly remote) node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMetadata {
    pub hostname: String,
    pub addresses: Vec<Ipv4Addr>,
    pub tunnel_addr: Option<Ipv4Addr>,
    pub tunnel_mac: Option<[u8; 6]>,
    /// Pod CIDR blocks owned by this node.
    pub pod_cidrs: Vec<IpNet>,
}

// ============================================================================
// Interface events
// ============================================================================

/// Combined admin + operational interface state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IfaceState {
    Unknown,
    Down,
    Up,
}

// ============================================================================
// The inbound stream
// ============================================================================

/// A desired-state message. Managers absorb these in `on_update`
/// without touching the kernel; programming happens in the apply
/// phases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DesiredStateUpdate {
    WorkloadEndpointUpdate(WorkloadEndpoint),
    WorkloadEndpointRemove(EndpointId),
    HostEndpointUpdate(HostEndpoint),
    HostEndpointRemove(EndpointId),
    PolicyUpdate(Policy),
    PolicyRemove(PolicyId),
    ProfileUpdate(Policy),
    ProfileRemove(PolicyId),
    IpSetUpdate {
        id: IpSetId,
        kind: IpSetKind,
        members: Vec<IpSetMember>,
    },
    IpSetDeltaUpdate {
        id: IpSetId,
        added: Vec<IpSetMember>,
        removed: Vec<IpSetMember>,
    },
    IpSetRemove(IpSetId),
    ServiceUpdate(ServiceSpec),
    ServiceRemove(ServiceKey),
    HostMetadataUpdate(HostMetadata),
    HostMetadataRemove(String),
    WireguardPublicKeyUpdate {
        hostname: String,
        public_key: String,
    },
    /// The upstream graph has delivered its full initial snapshot;
    /// opens the apply gate.
    InSync,

    // Injected by the driver from the interface monitor.
    InterfaceStateUpdate {
        name: String,
        index: u32,
        state: IfaceState,
    },
    InterfaceAddrsUpdate {
        name: String,
        addrs: Vec<Ipv4Addr>,
    },

    // Published between managers through the driver.
    EndpointMarkAssigned {
        id: EndpointId,
        iface_name: String,
        mark: u32,
    },
    EndpointMarkReleased {
        id: EndpointId,
        iface_name: String,
    },
}

// ============================================================================
// The outbound stream
// ============================================================================

/// Programmed state of one endpoint as reported upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointState {
    Up,
    Down,
    Error,
}

/// A status message emitted by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusUpdate {
    EndpointStatus {
        id: EndpointId,
        state: EndpointState,
    },
    ProcessStatus {
        /// ISO-8601 timestamp of the report.
        timestamp: String,
        uptime_secs: u64,
    },
    WireguardPublicKey(String),
    Health {
        live: bool,
        ready: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_numbers_round_trip() {
        for proto in [
            Protocol::Tcp,
            Protocol::Udp,
            Protocol::Icmp,
            Protocol::Sctp,
            Protocol::Other(47),
        ] {
            assert_eq!(Protocol::from_number(proto.number()), proto);
        }
    }

    #[test]
    fn test_ipnet_contains() {
        let net = IpNet::new(Ipv4Addr::new(10, 65, 0, 0), 16);
        assert!(net.contains(Ipv4Addr::new(10, 65, 3, 4)));
        assert!(!net.contains(Ipv4Addr::new(10, 66, 3, 4)));
        assert!(IpNet::new(Ipv4Addr::UNSPECIFIED, 0).contains(Ipv4Addr::new(8, 8, 8, 8)));

        let host = IpNet::host(Ipv4Addr::new(1, 1, 1, 1));
        assert!(host.contains(Ipv4Addr::new(1, 1, 1, 1)));
        assert!(!host.contains(Ipv4Addr::new(1, 1, 1, 2)));
    }

    #[test]
    fn test_set_member_kind_and_format() {
        let m = IpSetMember::AddrPortProto(Ipv4Addr::new(10, 0, 0, 1), 8080, Protocol::Tcp);
        assert_eq!(m.kind(), IpSetKind::AddrPortProto);
        assert_eq!(m.to_string(), "10.0.0.1,tcp:8080");
    }

    #[test]
    fn test_update_round_trips_through_json() {
        let update = DesiredStateUpdate::ServiceUpdate(ServiceSpec {
            key: ServiceKey {
                vip: Ipv4Addr::new(10, 0, 0, 1),
                port: 80,
                protocol: Protocol::Tcp,
            },
            backends: vec![ServiceBackend {
                addr: Ipv4Addr::new(8, 8, 8, 8),
                port: 666,
                is_local: false,
            }],
            flags: ServiceFlags::NAT_OUTGOING,
            affinity_secs: 30,
        });
        let json = serde_json::to_string(&update).unwrap();
        let back: DesiredStateUpdate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, update);
    }
}
