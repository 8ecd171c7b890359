// # Rule and Chain Rendering
//
// Pure construction of the filter/NAT/mangle/raw chains from desired
// state. Identical inputs produce byte-identical output, and every
// chain name embeds a short content hash of its logical identity so
// unrelated chains survive unrelated changes. Managers compose their
// own chains from these helpers; no manager touches another's.

use std::fmt::Write as _;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::proto::{IpNet, PortRange, Protocol, Rule as PolicyRule, RuleAction};

/// Chain-name prefix for everything this agent owns.
pub const CHAIN_PREFIX: &str = "rpl";

/// Length of the hash suffix embedded in generated chain names.
pub const NAME_HASH_LEN: usize = 11;

// ============================================================================
// Model
// ============================================================================

/// Kernel tables the renderer can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableKind {
    Filter,
    Nat,
    Mangle,
    Raw,
}

impl TableKind {
    pub fn name(self) -> &'static str {
        match self {
            TableKind::Filter => "filter",
            TableKind::Nat => "nat",
            TableKind::Mangle => "mangle",
            TableKind::Raw => "raw",
        }
    }
}

/// One match criterion of a rendered rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchCriterion {
    Protocol(Protocol),
    SrcNet(IpNet),
    DstNet(IpNet),
    SrcSet(String),
    DstSet(String),
    NotSrcSet(String),
    NotDstSet(String),
    SrcPorts(Vec<PortRange>),
    DstPorts(Vec<PortRange>),
    InIface(String),
    OutIface(String),
    Mark { mark: u32, mask: u32 },
    CtStateEstablished,
    IcmpType(u8),
}

/// Terminal verb of a rendered rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleVerb {
    Accept,
    Drop,
    Return,
    Jump(String),
    Goto(String),
    SetMark { mark: u32, mask: u32 },
    Masquerade,
    Dnat { addr: std::net::Ipv4Addr, port: u16 },
    DnatAddr(std::net::Ipv4Addr),
    SnatAddr(std::net::Ipv4Addr),
    LogPrefix(String),
}

/// A single rendered rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedRule {
    pub matches: Vec<MatchCriterion>,
    pub verb: RuleVerb,
    pub comment: Option<String>,
}

impl RenderedRule {
    pub fn new(matches: Vec<MatchCriterion>, verb: RuleVerb) -> Self {
        Self {
            matches,
            verb,
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// The save-format fragment for this rule, excluding the chain.
    pub fn fragment(&self) -> String {
        let mut out = String::new();
        for criterion in &self.matches {
            write_criterion(&mut out, criterion);
        }
        if let Some(comment) = &self.comment {
            let _ = write!(out, "-m comment --comment \"{}\" ", comment);
        }
        write_verb(&mut out, &self.verb);
        out.trim_end().to_string()
    }

    /// Every IP set this rule references.
    pub fn referenced_sets(&self) -> Vec<&str> {
        self.matches
            .iter()
            .filter_map(|m| match m {
                MatchCriterion::SrcSet(s)
                | MatchCriterion::DstSet(s)
                | MatchCriterion::NotSrcSet(s)
                | MatchCriterion::NotDstSet(s) => Some(s.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// A named chain plus its rules, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    pub name: String,
    pub rules: Vec<RenderedRule>,
}

impl Chain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: Vec::new(),
        }
    }

    pub fn rule(mut self, rule: RenderedRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn referenced_sets(&self) -> Vec<&str> {
        self.rules.iter().flat_map(|r| r.referenced_sets()).collect()
    }
}

fn write_criterion(out: &mut String, criterion: &MatchCriterion) {
    let _ = match criterion {
        MatchCriterion::Protocol(p) => write!(out, "-p {} ", p),
        MatchCriterion::SrcNet(net) => write!(out, "-s {} ", net),
        MatchCriterion::DstNet(net) => write!(out, "-d {} ", net),
        MatchCriterion::SrcSet(s) => write!(out, "-m set --match-set {} src ", s),
        MatchCriterion::DstSet(s) => write!(out, "-m set --match-set {} dst ", s),
        MatchCriterion::NotSrcSet(s) => write!(out, "-m set ! --match-set {} src ", s),
        MatchCriterion::NotDstSet(s) => write!(out, "-m set ! --match-set {} dst ", s),
        MatchCriterion::SrcPorts(ranges) => {
            write!(out, "-m multiport --source-ports {} ", port_list(ranges))
        }
        MatchCriterion::DstPorts(ranges) => {
            write!(out, "-m multiport --destination-ports {} ", port_list(ranges))
        }
        MatchCriterion::InIface(name) => write!(out, "-i {} ", name),
        MatchCriterion::OutIface(name) => write!(out, "-o {} ", name),
        MatchCriterion::Mark { mark, mask } => {
            write!(out, "-m mark --mark {:#x}/{:#x} ", mark, mask)
        }
        MatchCriterion::CtStateEstablished => {
            write!(out, "-m conntrack --ctstate RELATED,ESTABLISHED ")
        }
        MatchCriterion::IcmpType(t) => write!(out, "-p icmp --icmp-type {} ", t),
    };
}

fn write_verb(out: &mut String, verb: &RuleVerb) {
    let _ = match verb {
        RuleVerb::Accept => write!(out, "-j ACCEPT"),
        RuleVerb::Drop => write!(out, "-j DROP"),
        RuleVerb::Return => write!(out, "-j RETURN"),
        RuleVerb::Jump(chain) => write!(out, "-j {}", chain),
        RuleVerb::Goto(chain) => write!(out, "-g {}", chain),
        RuleVerb::SetMark { mark, mask } => {
            write!(out, "-j MARK --set-xmark {:#x}/{:#x}", mark, mask)
        }
        RuleVerb::Masquerade => write!(out, "-j MASQUERADE"),
        RuleVerb::Dnat { addr, port } => {
            write!(out, "-j DNAT --to-destination {}:{}", addr, port)
        }
        RuleVerb::DnatAddr(addr) => write!(out, "-j DNAT --to-destination {}", addr),
        RuleVerb::SnatAddr(addr) => write!(out, "-j SNAT --to-source {}", addr),
        RuleVerb::LogPrefix(prefix) => write!(out, "-j LOG --log-prefix \"{}\"", prefix),
    };
}

fn port_list(ranges: &[PortRange]) -> String {
    ranges
        .iter()
        .map(|r| {
            if r.lo == r.hi {
                r.lo.to_string()
            } else {
                format!("{}:{}", r.lo, r.hi)
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

// ============================================================================
// Naming
// ============================================================================

/// Stable chain name: prefix, functional infix, and a short content
/// hash of the seed.
pub fn chain_name(infix: &str, seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    let mut hash = URL_SAFE_NO_PAD.encode(digest);
    hash.truncate(NAME_HASH_LEN);
    format!("{}-{}-{}", CHAIN_PREFIX, infix, hash)
}

// ============================================================================
// Policy rendering
// ============================================================================

/// Translate one policy rule into its rendered form. The accept mark
/// is set on allow so the dispatch chain can return early.
pub fn render_policy_rule(rule: &PolicyRule, accept_mark: u32) -> Vec<RenderedRule> {
    let mut matches = Vec::new();
    if let Some(proto) = rule.criteria.protocol {
        matches.push(MatchCriterion::Protocol(proto));
    }
    if let Some(net) = rule.criteria.src_net {
        matches.push(MatchCriterion::SrcNet(net));
    }
    if let Some(net) = rule.criteria.dst_net {
        matches.push(MatchCriterion::DstNet(net));
    }
    for set in &rule.criteria.src_sets {
        matches.push(MatchCriterion::SrcSet(set.0.clone()));
    }
    for set in &rule.criteria.dst_sets {
        matches.push(MatchCriterion::DstSet(set.0.clone()));
    }
    for set in &rule.criteria.negated_src_sets {
        matches.push(MatchCriterion::NotSrcSet(set.0.clone()));
    }
    for set in &rule.criteria.negated_dst_sets {
        matches.push(MatchCriterion::NotDstSet(set.0.clone()));
    }
    if !rule.criteria.src_ports.is_empty() {
        matches.push(MatchCriterion::SrcPorts(rule.criteria.src_ports.clone()));
    }
    if !rule.criteria.dst_ports.is_empty() {
        matches.push(MatchCriterion::DstPorts(rule.criteria.dst_ports.clone()));
    }
    if let Some(icmp_type) = rule.criteria.icmp_type {
        matches.push(MatchCriterion::IcmpType(icmp_type));
    }

    match rule.action {
        RuleAction::Allow => vec![
            RenderedRule::new(
                matches.clone(),
                RuleVerb::SetMark {
                    mark: accept_mark,
                    mask: accept_mark,
                },
            ),
            RenderedRule::new(
                vec![MatchCriterion::Mark {
                    mark: accept_mark,
                    mask: accept_mark,
                }],
                RuleVerb::Return,
            ),
        ],
        RuleAction::Deny => vec![RenderedRule::new(matches, RuleVerb::Drop)],
        RuleAction::Pass => vec![RenderedRule::new(matches, RuleVerb::Return)],
        RuleAction::Log => vec![RenderedRule::new(
            matches,
            RuleVerb::LogPrefix(format!("{}-policy", CHAIN_PREFIX)),
        )],
    }
}
