// # Fast-Path Packet Programs
//
// The per-packet state machine attached to interface ingress and
// egress. Each attachment is specialized at build time by a small
// set of booleans (direction, endpoint side, tunnel, DSR, log level,
// connect-time LB) and chains through the sub-programs (main,
// policy, allowed, icmp-reply) via a jump table, carrying its
// working state in the per-CPU scratch entry.

pub mod csum;
pub mod icmp;
pub mod parse;
pub mod program;
pub mod vxlan;

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::maps::ReadHandle;
use crate::proto::{IpSetId, IpSetMember, Protocol, Rule, RuleAction};

pub use program::{FastPathConfig, FastPathProgram, Packet, Verdict};

// ============================================================================
// Build-time specialization
// ============================================================================

/// Which way the attachment faces: packets entering the host from
/// the interface, or leaving the host through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramDirection {
    ToHost,
    FromHost,
}

/// Whether the attached interface belongs to a workload or is a
/// host-owned interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointSide {
    Workload,
    Host,
}

/// The compile-time parameterization of one attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramSpec {
    pub direction: ProgramDirection,
    pub side: EndpointSide,
    pub tunnel_enabled: bool,
    pub dsr: bool,
    pub log_level: u8,
    pub connect_time_lb: bool,
}

// ============================================================================
// Sub-program indices
// ============================================================================

/// Jump-table slots. The userland installs each sub-program by index
/// and the main program tail-calls through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgIndex {
    Main = 0,
    Policy = 1,
    Allowed = 2,
    IcmpReply = 3,
}

/// Per-attachment jump table. The policy slot is re-installed by the
/// policy manager every time policy changes; the other slots are
/// fixed at load time.
#[derive(Debug)]
pub struct JumpTable {
    policy: RwLock<Arc<PolicyProgram>>,
}

impl JumpTable {
    pub fn new(policy: PolicyProgram) -> Arc<Self> {
        Arc::new(Self {
            policy: RwLock::new(Arc::new(policy)),
        })
    }

    /// Swap in a freshly compiled policy sub-program.
    pub fn install_policy(&self, policy: PolicyProgram) {
        *self.policy.write() = Arc::new(policy);
    }

    pub fn policy(&self) -> Arc<PolicyProgram> {
        Arc::clone(&self.policy.read())
    }
}

// ============================================================================
// The policy sub-program
// ============================================================================

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyVerdict {
    Allow,
    Deny,
    /// No rule matched; deny for workloads, allow for host endpoints.
    NoMatch,
}

/// What the policy program evaluates against: the decomposed packet
/// with the pre-NAT destination, so policy always sees the address
/// the client dialed.
#[derive(Debug, Clone, Copy)]
pub struct PolicyPacket {
    pub protocol: Protocol,
    pub src: Ipv4Addr,
    pub src_port: u16,
    pub dst: Ipv4Addr,
    pub dst_port: u16,
    pub icmp_type: u8,
}

/// One tier: an ordered group of rules evaluated together. A Pass
/// action skips the remainder of the tier.
#[derive(Debug, Clone)]
pub struct CompiledTier {
    pub name: String,
    pub rules: Vec<Rule>,
}

/// The compiled policy sub-program for one attachment direction.
/// Rebuilt by the policy manager whenever the policies applying to
/// the endpoint change; `generation` lets the attachment manager
/// detect staleness.
#[derive(Debug, Clone, Default)]
pub struct PolicyProgram {
    pub tiers: Vec<CompiledTier>,
    pub generation: u64,
}

impl PolicyProgram {
    /// A program with a single allow-everything rule.
    pub fn allow_all(generation: u64) -> Self {
        Self {
            tiers: vec![CompiledTier {
                name: "default".to_string(),
                rules: vec![Rule {
                    criteria: Default::default(),
                    action: RuleAction::Allow,
                }],
            }],
            generation,
        }
    }

    pub fn eval(
        &self,
        pkt: &PolicyPacket,
        sets: &ReadHandle<IpSetId, HashSet<IpSetMember>>,
    ) -> PolicyVerdict {
        for tier in &self.tiers {
            for rule in &tier.rules {
                if !rule_matches(&rule.criteria, pkt, sets) {
                    continue;
                }
                match rule.action {
                    RuleAction::Allow => return PolicyVerdict::Allow,
                    RuleAction::Deny => return PolicyVerdict::Deny,
                    // Pass skips the rest of this tier.
                    RuleAction::Pass => break,
                    RuleAction::Log => {
                        tracing::debug!(
                            tier = %tier.name,
                            src = %pkt.src,
                            dst = %pkt.dst,
                            "policy log rule hit"
                        );
                    }
                }
            }
        }
        PolicyVerdict::NoMatch
    }
}

fn rule_matches(
    criteria: &crate::proto::RuleMatch,
    pkt: &PolicyPacket,
    sets: &ReadHandle<IpSetId, HashSet<IpSetMember>>,
) -> bool {
    if let Some(proto) = criteria.protocol {
        if proto != pkt.protocol {
            return false;
        }
    }
    if let Some(net) = criteria.src_net {
        if !net.contains(pkt.src) {
            return false;
        }
    }
    if let Some(net) = criteria.dst_net {
        if !net.contains(pkt.dst) {
            return false;
        }
    }
    if let Some(icmp_type) = criteria.icmp_type {
        if pkt.protocol != Protocol::Icmp || icmp_type != pkt.icmp_type {
            return false;
        }
    }
    if !criteria.src_ports.is_empty()
        && !criteria
            .src_ports
            .iter()
            .any(|r| (r.lo..=r.hi).contains(&pkt.src_port))
    {
        return false;
    }
    if !criteria.dst_ports.is_empty()
        && !criteria
            .dst_ports
            .iter()
            .any(|r| (r.lo..=r.hi).contains(&pkt.dst_port))
    {
        return false;
    }
    for set_id in &criteria.src_sets {
        if !set_contains(sets, set_id, pkt.src, pkt.src_port, pkt.protocol) {
            return false;
        }
    }
    for set_id in &criteria.dst_sets {
        if !set_contains(sets, set_id, pkt.dst, pkt.dst_port, pkt.protocol) {
            return false;
        }
    }
    for set_id in &criteria.negated_src_sets {
        if set_contains(sets, set_id, pkt.src, pkt.src_port, pkt.protocol) {
            return false;
        }
    }
    for set_id in &criteria.negated_dst_sets {
        if set_contains(sets, set_id, pkt.dst, pkt.dst_port, pkt.protocol) {
            return false;
        }
    }
    true
}

fn set_contains(
    sets: &ReadHandle<IpSetId, HashSet<IpSetMember>>,
    id: &IpSetId,
    addr: Ipv4Addr,
    port: u16,
    protocol: Protocol,
) -> bool {
    match sets.get(id) {
        Some(members) => {
            members.contains(&IpSetMember::Addr(addr))
                || members.contains(&IpSetMember::AddrProto(addr, protocol))
                || members.contains(&IpSetMember::AddrPortProto(addr, port, protocol))
                || members
                    .iter()
                    .any(|m| matches!(m, IpSetMember::Net(net) if net.contains(addr)))
        }
        // A rule referencing an unknown set matches nothing; the
        // renderer's ordering contract makes this unreachable in
        // steady state.
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maps::MapHandle;
    use crate::proto::{IpNet, PortRange, RuleMatch};

    fn pkt() -> PolicyPacket {
        PolicyPacket {
            protocol: Protocol::Tcp,
            src: Ipv4Addr::new(1, 1, 1, 1),
            src_port: 5000,
            dst: Ipv4Addr::new(10, 0, 0, 1),
            dst_port: 80,
            icmp_type: 0,
        }
    }

    fn empty_sets() -> MapHandle<IpSetId, HashSet<IpSetMember>> {
        MapHandle::new()
    }

    #[test]
    fn test_allow_all_allows() {
        let sets = empty_sets();
        let program = PolicyProgram::allow_all(1);
        assert_eq!(program.eval(&pkt(), &sets.reader()), PolicyVerdict::Allow);
    }

    #[test]
    fn test_no_rules_is_no_match() {
        let sets = empty_sets();
        let program = PolicyProgram::default();
        assert_eq!(program.eval(&pkt(), &sets.reader()), PolicyVerdict::NoMatch);
    }

    #[test]
    fn test_port_and_net_criteria() {
        let sets = empty_sets();
        let program = PolicyProgram {
            tiers: vec![CompiledTier {
                name: "t1".into(),
                rules: vec![
                    Rule {
                        criteria: RuleMatch {
                            protocol: Some(Protocol::Tcp),
                            dst_ports: vec![PortRange::single(443)],
                            ..Default::default()
                        },
                        action: RuleAction::Allow,
                    },
                    Rule {
                        criteria: RuleMatch {
                            src_net: Some(IpNet::new(Ipv4Addr::new(1, 1, 0, 0), 16)),
                            ..Default::default()
                        },
                        action: RuleAction::Deny,
                    },
                ],
            }],
            generation: 1,
        };
        // Port 80 doesn't match the allow; the deny net does.
        assert_eq!(program.eval(&pkt(), &sets.reader()), PolicyVerdict::Deny);
    }

    #[test]
    fn test_pass_skips_rest_of_tier() {
        let sets = empty_sets();
        let program = PolicyProgram {
            tiers: vec![
                CompiledTier {
                    name: "t1".into(),
                    rules: vec![
                        Rule {
                            criteria: Default::default(),
                            action: RuleAction::Pass,
                        },
                        Rule {
                            criteria: Default::default(),
                            action: RuleAction::Deny,
                        },
                    ],
                },
                CompiledTier {
                    name: "t2".into(),
                    rules: vec![Rule {
                        criteria: Default::default(),
                        action: RuleAction::Allow,
                    }],
                },
            ],
            generation: 1,
        };
        assert_eq!(program.eval(&pkt(), &sets.reader()), PolicyVerdict::Allow);
    }

    #[test]
    fn test_set_membership() {
        let sets = empty_sets();
        let mut members = HashSet::new();
        members.insert(IpSetMember::Addr(Ipv4Addr::new(1, 1, 1, 1)));
        sets.insert(IpSetId("allowed-clients".into()), members);

        let program = PolicyProgram {
            tiers: vec![CompiledTier {
                name: "t1".into(),
                rules: vec![Rule {
                    criteria: RuleMatch {
                        src_sets: vec![IpSetId("allowed-clients".into())],
                        ..Default::default()
                    },
                    action: RuleAction::Allow,
                }],
            }],
            generation: 1,
        };
        assert_eq!(program.eval(&pkt(), &sets.reader()), PolicyVerdict::Allow);

        // Unknown set reference matches nothing.
        let program2 = PolicyProgram {
            tiers: vec![CompiledTier {
                name: "t1".into(),
                rules: vec![Rule {
                    criteria: RuleMatch {
                        src_sets: vec![IpSetId("nonexistent".into())],
                        ..Default::default()
                    },
                    action: RuleAction::Allow,
                }],
            }],
            generation: 1,
        };
        assert_eq!(program2.eval(&pkt(), &sets.reader()), PolicyVerdict::NoMatch);
    }

    #[test]
    fn test_jump_table_swap() {
        let table = JumpTable::new(PolicyProgram::allow_all(1));
        assert_eq!(table.policy().generation, 1);
        table.install_policy(PolicyProgram::allow_all(2));
        assert_eq!(table.policy().generation, 2);
    }
}
