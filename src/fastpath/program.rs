// # The Data-Path State Machine
//
// One `FastPathProgram` per attachment, specialized by `ProgramSpec`.
// For every packet the program walks S0..S10: entry marks, L2/L3 and
// L4 parsing (with overlay decap), conntrack lookup, NAT decision,
// special allows, workload RPF, the policy tail call, the accepted
// path (conntrack create, rewrite, checksums, encap) and the final
// verdict. Sub-programs are dispatched through the jump table with
// the per-CPU scratch entry as the carrier.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::fastpath::parse::{self, L2Class, ParsedPacket, ETH_HEADER_LEN, MIN_UDP_FRAME};
use crate::fastpath::{csum, icmp, vxlan};
use crate::fastpath::{
    EndpointSide, JumpTable, PolicyPacket, PolicyVerdict, ProgIndex, ProgramDirection, ProgramSpec,
};
use crate::maps::conntrack::{
    ConntrackEntry, ConntrackFlags, EntryType, NatAdmit, APPROVED_FORWARD, APPROVED_REVERSE,
};
use crate::maps::nat::{flow_hash, NatFrontendKey};
use crate::maps::state::{ScratchFlags, ScratchState};
use crate::maps::{
    ArpKey, ArpValue, DropReason, FailsafeDirection, FailsafeKey, MapRegistry, RouteFlags,
};
use crate::marks::{fixed, MarkAllocation};
use crate::proto::Protocol;

/// A packet in flight plus its kernel metadata.
#[derive(Debug, Clone)]
pub struct Packet {
    pub frame: Vec<u8>,
    /// The 32-bit packet mark.
    pub mark: u32,
    /// Set when an earlier program stage already approved the packet.
    pub prior_stage_ok: bool,
    pub ingress_ifindex: u32,
}

impl Packet {
    pub fn new(frame: Vec<u8>, ingress_ifindex: u32) -> Self {
        Self {
            frame,
            mark: 0,
            prior_stage_ok: false,
            ingress_ifindex,
        }
    }
}

/// Terminal outcome of a traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Hand the packet to the kernel stack.
    Pass,
    /// FIB-assisted redirect to a local interface.
    Redirect { ifindex: u32 },
    Drop(DropReason),
    /// Emit a synthesized reply out the ingress interface; the
    /// original packet is consumed.
    Reply(Vec<u8>),
}

/// Build-time parameterization of one attachment.
#[derive(Debug, Clone)]
pub struct FastPathConfig {
    pub spec: ProgramSpec,
    pub host_ip: Ipv4Addr,
    pub host_mac: [u8; 6],
    /// Index of the attached interface.
    pub ifindex: u32,
    pub vxlan_port: u16,
    pub vxlan_vni: u32,
    pub tunnel_mtu: u16,
}

/// Result of the conntrack stage.
enum CtOutcome {
    /// Entry found under the packet's own key.
    Hit(ConntrackEntry),
    /// Entry found under the reversed key: this packet is the reply
    /// leg of that flow.
    ReplyHit(ConntrackEntry),
    NewFlow,
}

pub struct FastPathProgram {
    config: FastPathConfig,
    maps: Arc<MapRegistry>,
    jump: Arc<JumpTable>,
    marks: MarkAllocation,
}

impl FastPathProgram {
    pub fn new(
        config: FastPathConfig,
        maps: Arc<MapRegistry>,
        jump: Arc<JumpTable>,
        marks: MarkAllocation,
    ) -> Self {
        Self {
            config,
            maps,
            jump,
            marks,
        }
    }

    pub fn spec(&self) -> &ProgramSpec {
        &self.config.spec
    }

    pub fn jump_table(&self) -> &Arc<JumpTable> {
        &self.jump
    }

    /// Run the state machine over one packet.
    pub fn process(&self, pkt: &mut Packet, cpu: usize, now_ns: u64) -> Verdict {
        let verdict = self.maps.scratch.with(cpu, |scratch| {
            scratch.reset();
            match self.run(pkt, scratch, now_ns) {
                Ok(verdict) | Err(verdict) => verdict,
            }
        });
        if let Verdict::Drop(reason) = verdict {
            self.maps.drops.bump(reason);
            if self.config.spec.log_level > 0 {
                debug!(ifindex = self.config.ifindex, ?reason, "fast path drop");
            }
        }
        verdict
    }

    fn run(
        &self,
        pkt: &mut Packet,
        scratch: &mut ScratchState,
        now_ns: u64,
    ) -> Result<Verdict, Verdict> {
        // S0: bypass mark or an earlier stage's approval short-circuits.
        if pkt.mark & fixed::BIT_BYPASS != 0 {
            return Ok(Verdict::Pass);
        }
        if pkt.prior_stage_ok {
            return Ok(Verdict::Pass);
        }

        // S1 + S2: decompose, possibly decapping the overlay.
        let parsed = self.parse_stage(pkt, scratch)?;

        // S3: conntrack.
        let outcome = self.conntrack_stage(pkt, scratch, &parsed)?;

        let mut next = match outcome {
            CtOutcome::Hit(_) | CtOutcome::ReplyHit(_) => ProgIndex::Allowed,
            CtOutcome::NewFlow => {
                // S4: NAT decision for the new flow.
                match self.nat_stage(scratch, &parsed, now_ns)? {
                    Some(jump) => jump,
                    // S5: allows that bypass policy.
                    None if self.special_allow_stage(pkt, scratch) => ProgIndex::Allowed,
                    None => {
                        // S6: workload source validation.
                        self.rpf_stage(pkt, scratch)?;
                        ProgIndex::Policy
                    }
                }
            }
        };

        // Tail-call dispatch between the sub-programs.
        loop {
            next = match next {
                ProgIndex::Policy => self.prog_policy(scratch)?,
                ProgIndex::Allowed => {
                    return self.prog_allowed(pkt, scratch, &parsed, &outcome, now_ns)
                }
                ProgIndex::IcmpReply => {
                    return Ok(self.prog_icmp_reply(&pkt.frame, &parsed, scratch))
                }
                ProgIndex::Main => unreachable!("main never re-enters itself"),
            };
        }
    }

    // ------------------------------------------------------------------
    // S1/S2: parsing
    // ------------------------------------------------------------------

    fn parse_stage(
        &self,
        pkt: &mut Packet,
        scratch: &mut ScratchState,
    ) -> Result<ParsedPacket, Verdict> {
        let spec = &self.config.spec;
        let ingress_host =
            spec.side == EndpointSide::Host && spec.direction == ProgramDirection::ToHost;

        // Ingress-direction mode bounds-checks to UDP size up front.
        if ingress_host && pkt.frame.len() < MIN_UDP_FRAME {
            return Err(Verdict::Drop(DropReason::Short));
        }

        let mut parsed = self.parse_l2l3(&pkt.frame)?;

        // Overlay handling: UDP to the VXLAN port.
        if parsed.protocol == Protocol::Udp && parsed.dst_port == self.config.vxlan_port {
            if !ingress_host {
                // Workload-originated traffic to the overlay port is
                // never legitimate.
                return Err(Verdict::Drop(DropReason::UnauthSource));
            }
            let known_host = self
                .maps
                .routes
                .lookup(parsed.src)
                .map(|r| r.flags.contains(RouteFlags::REMOTE_HOST))
                .unwrap_or(false);
            if !known_host {
                return Err(Verdict::Drop(DropReason::UnauthSource));
            }
            let decapped = vxlan::decap(&pkt.frame).map_err(Verdict::Drop)?;
            trace!(peer = %decapped.outer_src, vni = decapped.vni, "decapsulated");
            pkt.frame = decapped.inner;
            scratch.tunnel_peer = Some(decapped.outer_src);
            parsed = self.parse_l2l3(&pkt.frame)?;
        }

        // IP-in-IP: only from a known host.
        if parsed.protocol == Protocol::Other(parse::IPPROTO_IPIP) {
            let known = self
                .maps
                .routes
                .lookup(parsed.src)
                .map(|r| {
                    r.flags
                        .intersects(RouteFlags::REMOTE_HOST | RouteFlags::LOCAL_HOST)
                })
                .unwrap_or(false);
            if spec.side == EndpointSide::Host && known {
                return Err(Verdict::Pass);
            }
            return Err(Verdict::Drop(DropReason::UnauthSource));
        }

        scratch.protocol = parsed.protocol;
        scratch.src = parsed.src;
        scratch.src_port = parsed.src_port;
        scratch.dst = parsed.dst;
        scratch.dst_port = parsed.dst_port;
        scratch.pre_nat_dst = parsed.dst;
        scratch.pre_nat_dport = parsed.dst_port;
        scratch.post_nat_dst = parsed.dst;
        scratch.post_nat_dport = parsed.dst_port;
        scratch.icmp_type = parsed.icmp_type;
        scratch.icmp_code = parsed.icmp_code;

        Ok(parsed)
    }

    fn parse_l2l3(&self, frame: &[u8]) -> Result<ParsedPacket, Verdict> {
        let spec = &self.config.spec;
        match parse::classify_l2(frame).map_err(Verdict::Drop)? {
            L2Class::Ipv4 => {}
            // ARP flows without policy.
            L2Class::Arp => return Err(Verdict::Pass),
            L2Class::Ipv6 | L2Class::Unknown(_) => {
                return Err(match spec.side {
                    EndpointSide::Workload => Verdict::Drop(DropReason::Unknown),
                    EndpointSide::Host => Verdict::Pass,
                })
            }
        }

        let parsed = parse::parse_ipv4(frame).map_err(Verdict::Drop)?;

        if parsed.has_ip_options()
            && (spec.side == EndpointSide::Workload || parsed.dst != self.config.host_ip)
        {
            return Err(Verdict::Drop(DropReason::IpOptions));
        }

        Ok(parsed)
    }

    // ------------------------------------------------------------------
    // S3: conntrack
    // ------------------------------------------------------------------

    fn conntrack_stage(
        &self,
        pkt: &mut Packet,
        scratch: &mut ScratchState,
        parsed: &ParsedPacket,
    ) -> Result<CtOutcome, Verdict> {
        let spec = &self.config.spec;
        let key = scratch.flow_key();

        if let Some(entry) = self.maps.conntrack.lookup(&key) {
            if entry.entry_type == EntryType::NatReverse {
                if let (Some(expected), Some(actual)) = (entry.tunnel_peer, scratch.tunnel_peer) {
                    if expected != actual {
                        return Err(Verdict::Drop(DropReason::UnauthSource));
                    }
                }
            }
            self.propagate_entry_flags(pkt, scratch, &entry);
            scratch.flags |= ScratchFlags::CT_HIT;
            if entry.entry_type == EntryType::NatReverse {
                scratch.flags |= ScratchFlags::CT_NAT_REVERSE;
            }
            return Ok(CtOutcome::Hit(entry));
        }

        if let Some(entry) = self.maps.conntrack.lookup(&key.reversed()) {
            self.propagate_entry_flags(pkt, scratch, &entry);
            scratch.flags |= ScratchFlags::CT_HIT;
            return Ok(CtOutcome::ReplyHit(entry));
        }

        // Mid-flow miss on traffic headed for an endpoint.
        if parsed.protocol == Protocol::Tcp && !parsed.tcp_syn {
            match (spec.side, spec.direction) {
                (EndpointSide::Workload, ProgramDirection::FromHost) => {
                    pkt.mark |= fixed::FALLTHROUGH;
                    return Err(Verdict::Pass);
                }
                (EndpointSide::Host, ProgramDirection::ToHost) => {
                    // TODO-HEP: an active host endpoint should apply
                    // policy to mid-flow traffic; allowed for now.
                    return Err(Verdict::Pass);
                }
                _ => {}
            }
        }

        Ok(CtOutcome::NewFlow)
    }

    fn propagate_entry_flags(
        &self,
        pkt: &mut Packet,
        scratch: &mut ScratchState,
        entry: &ConntrackEntry,
    ) {
        if entry.flags.contains(ConntrackFlags::NAT_OUTGOING) {
            pkt.mark |= fixed::NAT_OUT;
            scratch.flags |= ScratchFlags::NAT_OUTGOING;
        }
        if entry.flags.contains(ConntrackFlags::SKIP_FIB) {
            scratch.flags |= ScratchFlags::SKIP_FIB;
        }
    }

    // ------------------------------------------------------------------
    // S4: NAT decision
    // ------------------------------------------------------------------

    fn nat_stage(
        &self,
        scratch: &mut ScratchState,
        parsed: &ParsedPacket,
        now_ns: u64,
    ) -> Result<Option<ProgIndex>, Verdict> {
        let spec = &self.config.spec;

        // The kernel enforces RPF on flows we first saw inbound.
        if spec.side == EndpointSide::Host && spec.direction == ProgramDirection::ToHost {
            scratch.flags |= ScratchFlags::RPF_FAILED;
        }

        let fe_key = NatFrontendKey {
            addr: parsed.dst,
            port: parsed.dst_port,
            protocol: parsed.protocol,
        };
        if let Some(fe) = self.maps.nat.lookup_frontend(&fe_key) {
            if fe.backend_count == 0 {
                // Backendless service: answer the sender directly.
                scratch.flags |= ScratchFlags::SYNTH_ICMP;
                scratch.icmp_type = icmp::ICMP_DEST_UNREACHABLE;
                scratch.icmp_code = icmp::CODE_PORT_UNREACHABLE;
                return Ok(Some(ProgIndex::IcmpReply));
            }

            let key = scratch.flow_key();
            let affine = if fe.affinity_secs > 0 {
                self.maps
                    .nat
                    .lookup_affinity(parsed.src, fe_key, fe.affinity_secs, now_ns)
            } else {
                None
            };
            let backend = match affine {
                Some(backend) => backend,
                None => {
                    let index = flow_hash(&key) % fe.backend_count;
                    let chosen = self
                        .maps
                        .nat
                        .lookup_backend(fe.ordinal, index)
                        .ok_or(Verdict::Drop(DropReason::Unknown))?;
                    if fe.affinity_secs > 0 {
                        self.maps
                            .nat
                            .record_affinity(parsed.src, fe_key, chosen, now_ns);
                    }
                    chosen
                }
            };

            scratch.flags |= ScratchFlags::NAT_NEEDED;
            scratch.backend = Some(backend);
            scratch.post_nat_dst = backend.addr;
            scratch.post_nat_dport = backend.port;
        }

        // Undo a connect-time DNAT so policy sees the dialed address.
        if spec.connect_time_lb {
            if let Some(orig) = self.maps.ctlb.get(&scratch.flow_key()) {
                scratch.pre_nat_dst = orig.addr;
                scratch.pre_nat_dport = orig.port;
            }
        }

        Ok(None)
    }

    // ------------------------------------------------------------------
    // S5: allows that bypass policy
    // ------------------------------------------------------------------

    fn special_allow_stage(&self, pkt: &Packet, scratch: &ScratchState) -> bool {
        let spec = &self.config.spec;

        // Host to local workload, not yet seen by another program.
        if spec.side == EndpointSide::Workload
            && spec.direction == ProgramDirection::FromHost
            && pkt.mark & fixed::BIT_SEEN == 0
        {
            let from_host = self
                .maps
                .routes
                .lookup(scratch.src)
                .map(|r| r.flags.contains(RouteFlags::LOCAL_HOST))
                .unwrap_or(false);
            if from_host {
                return true;
            }
        }

        // Failsafe ports keep the control plane reachable.
        if spec.side == EndpointSide::Host {
            let direction = match spec.direction {
                ProgramDirection::ToHost => FailsafeDirection::Inbound,
                ProgramDirection::FromHost => FailsafeDirection::Outbound,
            };
            let key = FailsafeKey {
                port: scratch.pre_nat_dport,
                protocol: scratch.protocol,
                direction,
            };
            if self.maps.failsafe.get(&key).is_some() {
                return true;
            }
        }

        false
    }

    // ------------------------------------------------------------------
    // S6: workload RPF
    // ------------------------------------------------------------------

    fn rpf_stage(&self, pkt: &Packet, scratch: &ScratchState) -> Result<(), Verdict> {
        let spec = &self.config.spec;
        if spec.side != EndpointSide::Workload || spec.direction != ProgramDirection::ToHost {
            return Ok(());
        }
        match self.maps.routes.lookup(scratch.src) {
            Some(route)
                if route.flags.contains(RouteFlags::LOCAL_WORKLOAD)
                    && route.ifindex == pkt.ingress_ifindex =>
            {
                Ok(())
            }
            _ => Err(Verdict::Drop(DropReason::UnauthSource)),
        }
    }

    // ------------------------------------------------------------------
    // S7: the policy sub-program
    // ------------------------------------------------------------------

    fn prog_policy(&self, scratch: &ScratchState) -> Result<ProgIndex, Verdict> {
        let pkt = PolicyPacket {
            protocol: scratch.protocol,
            src: scratch.src,
            src_port: scratch.src_port,
            dst: scratch.pre_nat_dst,
            dst_port: scratch.pre_nat_dport,
            icmp_type: scratch.icmp_type,
        };
        match self.jump.policy().eval(&pkt, &self.maps.ip_sets.reader()) {
            PolicyVerdict::Allow => Ok(ProgIndex::Allowed),
            PolicyVerdict::Deny => Err(Verdict::Drop(DropReason::PolicyDenied)),
            PolicyVerdict::NoMatch => match self.config.spec.side {
                EndpointSide::Workload => Err(Verdict::Drop(DropReason::PolicyDenied)),
                EndpointSide::Host => Ok(ProgIndex::Allowed),
            },
        }
    }

    // ------------------------------------------------------------------
    // S8/S9/S10: the accepted path
    // ------------------------------------------------------------------

    fn prog_allowed(
        &self,
        pkt: &mut Packet,
        scratch: &mut ScratchState,
        parsed: &ParsedPacket,
        outcome: &CtOutcome,
        now_ns: u64,
    ) -> Result<Verdict, Verdict> {
        let key = scratch.flow_key();

        match outcome {
            CtOutcome::Hit(entry) => {
                self.maps.conntrack.note_seen(&key, APPROVED_FORWARD, now_ns);
                match entry.entry_type {
                    EntryType::NatForward => {
                        // Established DNAT flow: the pinned backend wins.
                        scratch.flags |= ScratchFlags::NAT_NEEDED;
                        scratch.post_nat_dst = entry.rev_addr;
                        scratch.post_nat_dport = entry.rev_port;
                        rewrite_dst(&mut pkt.frame, parsed, entry.rev_addr, entry.rev_port)?;
                    }
                    EntryType::NatReverse => {
                        if entry.flags.contains(ConntrackFlags::DSR) {
                            // DSR return traffic leaves directly.
                            pkt.mark |= fixed::SEEN | self.marks.accept;
                            return Ok(Verdict::Pass);
                        }
                        if entry.rev_addr != Ipv4Addr::UNSPECIFIED {
                            // Restore the frontend the client dialed.
                            rewrite_src(&mut pkt.frame, parsed, entry.rev_addr, entry.rev_port)?;
                        }
                    }
                    EntryType::Normal => {}
                }
            }
            CtOutcome::ReplyHit(entry) => {
                self.maps
                    .conntrack
                    .note_seen(&key.reversed(), APPROVED_REVERSE, now_ns);
                if entry.entry_type == EntryType::NatReverse {
                    if entry.flags.contains(ConntrackFlags::DSR) {
                        pkt.mark |= fixed::SEEN | self.marks.accept;
                        return Ok(Verdict::Pass);
                    }
                    // The reply of a flow that arrived over the tunnel
                    // goes back the way it came for un-NAT.
                    if let Some(peer) = entry.tunnel_peer {
                        return Ok(self.encap_and_finish(pkt, scratch, peer));
                    }
                }
            }
            CtOutcome::NewFlow => {
                if let Some(verdict) = self.admit_new_flow(pkt, scratch, parsed, now_ns)? {
                    return Ok(verdict);
                }
            }
        }

        pkt.mark |= fixed::SEEN | self.marks.accept;

        // Remote destinations leave through the overlay.
        let final_dst = scratch.post_nat_dst;
        if let Some(route) = self.maps.routes.lookup(final_dst) {
            if route.flags.contains(RouteFlags::REMOTE_WORKLOAD) {
                if let Some(next_hop) = route.next_hop {
                    return Ok(self.encap_and_finish(pkt, scratch, next_hop));
                }
            }
        }

        Ok(self.finish(scratch, final_dst))
    }

    /// Admit a brand-new flow: conntrack creation, oversize and TTL
    /// checks, then the in-place rewrite. Returns a verdict only when
    /// the packet is consumed by a synthesized reply.
    fn admit_new_flow(
        &self,
        pkt: &mut Packet,
        scratch: &mut ScratchState,
        parsed: &ParsedPacket,
        now_ns: u64,
    ) -> Result<Option<Verdict>, Verdict> {
        let spec = &self.config.spec;
        let key = scratch.flow_key();

        let mut flags = ConntrackFlags::empty();
        if spec.dsr {
            flags |= ConntrackFlags::DSR;
        }
        if scratch.flags.contains(ScratchFlags::RPF_FAILED) {
            flags |= ConntrackFlags::RPF_FAILED;
        }

        let dst_route = self.maps.routes.lookup(scratch.post_nat_dst);
        if let Some(route) = dst_route {
            if route.flags.contains(RouteFlags::NAT_OUTGOING) {
                flags |= ConntrackFlags::NAT_OUTGOING;
                pkt.mark |= fixed::NAT_OUT;
            }
        }

        let encap_needed = dst_route
            .map(|r| r.flags.contains(RouteFlags::REMOTE_WORKLOAD) && r.next_hop.is_some())
            .unwrap_or(false);
        let forwarded = scratch.flags.contains(ScratchFlags::NAT_NEEDED)
            || encap_needed
            || dst_route
                .map(|r| r.flags.contains(RouteFlags::LOCAL_WORKLOAD))
                .unwrap_or(false);

        // S9: expiring TTL on a flow we would forward.
        if forwarded && parsed.ttl <= 1 {
            scratch.icmp_type = icmp::ICMP_TIME_EXCEEDED;
            scratch.icmp_code = icmp::CODE_TTL_EXCEEDED;
            return Ok(Some(self.prog_icmp_reply(&pkt.frame, parsed, scratch)));
        }

        // Oversize + DF on an encapped path.
        if encap_needed
            && parsed.dont_fragment
            && parsed.total_len as usize + vxlan::OUTER_OVERHEAD > self.config.tunnel_mtu as usize
        {
            if spec.dsr {
                // The reply would have to leave through the decap
                // interface, which may not be the canonical one; the
                // ICMP reply is elided in DSR mode.
            } else {
                scratch.icmp_type = icmp::ICMP_DEST_UNREACHABLE;
                scratch.icmp_code = icmp::CODE_FRAG_NEEDED;
                scratch.icmp_mtu = self.config.tunnel_mtu;
                return Ok(Some(self.prog_icmp_reply(&pkt.frame, parsed, scratch)));
            }
        }

        if scratch.flags.contains(ScratchFlags::NAT_NEEDED) {
            let backend = scratch
                .backend
                .expect("NAT_NEEDED implies a chosen backend");
            let tunnel_peer = dst_route.and_then(|r| r.next_hop);
            let admit = self.maps.conntrack.admit_nat_flow(
                key,
                backend.addr,
                backend.port,
                flags,
                tunnel_peer,
                now_ns,
            );
            // A SYN retry keeps the backend fixed by the first admit.
            let (addr, port) = admit.backend();
            scratch.post_nat_dst = addr;
            scratch.post_nat_dport = port;
            if let NatAdmit::Existing { .. } = admit {
                trace!(src = %key.src, "SYN retry, reusing pinned backend");
            }
            self.maps.conntrack.note_seen(&key, APPROVED_FORWARD, now_ns);
            rewrite_dst(&mut pkt.frame, parsed, addr, port)?;
        } else if scratch.tunnel_peer.is_some()
            && spec.side == EndpointSide::Host
            && spec.direction == ProgramDirection::ToHost
        {
            // A flow arriving over the tunnel already carries any NAT
            // applied upstream; record the reverse end so replies are
            // encapped back for un-NAT.
            let mut entry = ConntrackEntry::new(EntryType::NatReverse, flags, now_ns);
            entry.tunnel_peer = scratch.tunnel_peer;
            entry.approved = APPROVED_FORWARD;
            self.maps.conntrack.insert_if_absent(key, entry);
        } else {
            self.maps
                .conntrack
                .create_normal(key, flags, scratch.tunnel_peer, now_ns);
            self.maps.conntrack.note_seen(&key, APPROVED_FORWARD, now_ns);
        }

        Ok(None)
    }

    fn encap_and_finish(
        &self,
        pkt: &mut Packet,
        scratch: &ScratchState,
        peer: Ipv4Addr,
    ) -> Verdict {
        if scratch.flags.contains(ScratchFlags::SKIP_FIB) {
            return Verdict::Pass;
        }
        let src_port = 49152 + (flow_hash(&scratch.flow_key()) % 16384) as u16;
        let dst_mac = vtep_mac(peer);
        let params = vxlan::EncapParams {
            src_mac: self.config.host_mac,
            dst_mac,
            src_ip: self.config.host_ip,
            dst_ip: peer,
            src_port,
            dst_port: self.config.vxlan_port,
            vni: self.config.vxlan_vni,
            ttl: 64,
        };
        pkt.frame = vxlan::encap(&pkt.frame, &params);
        self.maps.arp.insert(
            ArpKey {
                addr: peer,
                ifindex: self.config.ifindex,
            },
            ArpValue {
                dst_mac,
                src_mac: self.config.host_mac,
            },
        );
        pkt.mark |= fixed::SEEN | self.marks.accept;
        // The outer destination is a remote host; the kernel routes it.
        Verdict::Pass
    }

    fn finish(&self, scratch: &ScratchState, final_dst: Ipv4Addr) -> Verdict {
        if scratch.flags.contains(ScratchFlags::SKIP_FIB) {
            return Verdict::Pass;
        }
        if self.config.spec.direction == ProgramDirection::ToHost {
            if let Some(route) = self.maps.routes.lookup(final_dst) {
                if route.flags.contains(RouteFlags::LOCAL_WORKLOAD) && route.ifindex != 0 {
                    return Verdict::Redirect {
                        ifindex: route.ifindex,
                    };
                }
            }
        }
        Verdict::Pass
    }

    /// The icmp-reply sub-program: quote the offending frame back at
    /// its sender with the type/code/MTU recorded in the scratch.
    fn prog_icmp_reply(
        &self,
        frame: &[u8],
        parsed: &ParsedPacket,
        scratch: &ScratchState,
    ) -> Verdict {
        Verdict::Reply(icmp::synth_reply(
            frame,
            parsed,
            self.config.host_ip,
            scratch.icmp_type,
            scratch.icmp_code,
            scratch.icmp_mtu,
        ))
    }
}

/// Deterministic VTEP MAC for a peer address.
fn vtep_mac(peer: Ipv4Addr) -> [u8; 6] {
    let o = peer.octets();
    [0x02, 0x55, o[0], o[1], o[2], o[3]]
}

// ------------------------------------------------------------------
// In-place rewrite with incremental checksums
// ------------------------------------------------------------------

fn rewrite_dst(
    frame: &mut [u8],
    parsed: &ParsedPacket,
    new_addr: Ipv4Addr,
    new_port: u16,
) -> Result<(), Verdict> {
    rewrite(frame, parsed, false, new_addr, new_port)
}

fn rewrite_src(
    frame: &mut [u8],
    parsed: &ParsedPacket,
    new_addr: Ipv4Addr,
    new_port: u16,
) -> Result<(), Verdict> {
    rewrite(frame, parsed, true, new_addr, new_port)
}

fn rewrite(
    frame: &mut [u8],
    parsed: &ParsedPacket,
    source_side: bool,
    new_addr: Ipv4Addr,
    new_port: u16,
) -> Result<(), Verdict> {
    let ip_off = ETH_HEADER_LEN;
    let addr_off = if source_side { ip_off + 12 } else { ip_off + 16 };
    if frame.len() < addr_off + 4 {
        return Err(Verdict::Drop(DropReason::Short));
    }
    let old_addr = u32::from_be_bytes(frame[addr_off..addr_off + 4].try_into().unwrap());
    let new_addr_u32 = u32::from(new_addr);

    // IP header checksum.
    let csum_off = ip_off + 10;
    let old_ip_csum = u16::from_be_bytes([frame[csum_off], frame[csum_off + 1]]);
    let new_ip_csum = csum::update_u32(old_ip_csum, old_addr, new_addr_u32);
    frame[csum_off..csum_off + 2].copy_from_slice(&new_ip_csum.to_be_bytes());
    frame[addr_off..addr_off + 4].copy_from_slice(&new_addr_u32.to_be_bytes());

    // L4 checksum covers the pseudo-header and the port.
    let l4_off = parsed.l4_offset;
    let (port_off, l4_csum_off) = match parsed.protocol {
        Protocol::Tcp => (
            if source_side { l4_off } else { l4_off + 2 },
            Some(l4_off + 16),
        ),
        Protocol::Udp => (
            if source_side { l4_off } else { l4_off + 2 },
            Some(l4_off + 6),
        ),
        _ => (0, None),
    };

    if let Some(csum_off) = l4_csum_off {
        if frame.len() < csum_off + 2 {
            return Err(Verdict::Drop(DropReason::Short));
        }
        let old_port = u16::from_be_bytes([frame[port_off], frame[port_off + 1]]);
        let mut l4_csum = u16::from_be_bytes([frame[csum_off], frame[csum_off + 1]]);
        // A zero UDP checksum means "not computed"; leave it that way.
        let udp_uncomputed = parsed.protocol == Protocol::Udp && l4_csum == 0;
        if !udp_uncomputed {
            l4_csum = csum::update_u32(l4_csum, old_addr, new_addr_u32);
            l4_csum = csum::update_u16(l4_csum, old_port, new_port);
            frame[csum_off..csum_off + 2].copy_from_slice(&l4_csum.to_be_bytes());
        }
        frame[port_off..port_off + 2].copy_from_slice(&new_port.to_be_bytes());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fastpath::parse::testutil::{build_frame, FrameSpec};
    use crate::fastpath::parse::parse_ipv4;
    use crate::fastpath::PolicyProgram;
    use crate::maps::RouteMap;
    use crate::proto::IpNet;

    fn registry() -> Arc<MapRegistry> {
        Arc::new(MapRegistry::new())
    }

    fn marks() -> MarkAllocation {
        MarkAllocation::allocate(0x000f_fff0, false).unwrap()
    }

    fn program(
        maps: &Arc<MapRegistry>,
        side: EndpointSide,
        direction: ProgramDirection,
        ifindex: u32,
    ) -> FastPathProgram {
        FastPathProgram::new(
            FastPathConfig {
                spec: ProgramSpec {
                    direction,
                    side,
                    tunnel_enabled: true,
                    dsr: false,
                    log_level: 0,
                    connect_time_lb: false,
                },
                host_ip: Ipv4Addr::new(172, 16, 0, 1),
                host_mac: [2, 0, 0, 0, 0, 1],
                ifindex,
                vxlan_port: 4789,
                vxlan_vni: 4096,
                tunnel_mtu: 1450,
            },
            Arc::clone(maps),
            JumpTable::new(PolicyProgram::allow_all(1)),
            marks(),
        )
    }

    fn add_local_workload(routes: &RouteMap, addr: Ipv4Addr, ifindex: u32) {
        routes.insert(
            IpNet::host(addr),
            crate::maps::RouteValue::local_workload(ifindex),
        );
    }

    #[test]
    fn test_bypass_mark_short_circuits() {
        let maps = registry();
        let prog = program(&maps, EndpointSide::Workload, ProgramDirection::ToHost, 1);
        let mut pkt = Packet::new(vec![], 1);
        pkt.mark = fixed::BYPASS;
        assert_eq!(prog.process(&mut pkt, 0, 0), Verdict::Pass);
    }

    #[test]
    fn test_rpf_drops_spoofed_workload_source() {
        let maps = registry();
        add_local_workload(&maps.routes, Ipv4Addr::new(1, 1, 1, 1), 1);
        let prog = program(&maps, EndpointSide::Workload, ProgramDirection::ToHost, 1);

        // Correct source passes.
        let mut pkt = Packet::new(build_frame(&FrameSpec::default()), 1);
        assert_ne!(
            prog.process(&mut pkt, 0, 0),
            Verdict::Drop(DropReason::UnauthSource)
        );

        // Spoofed source (not in the route map) drops.
        let mut spoofed = Packet::new(
            build_frame(&FrameSpec {
                src: Ipv4Addr::new(66, 66, 66, 66),
                ..Default::default()
            }),
            1,
        );
        assert_eq!(
            prog.process(&mut spoofed, 0, 0),
            Verdict::Drop(DropReason::UnauthSource)
        );

        // Right workload, wrong interface: also a drop. A fresh
        // source port keeps this off the conntrack fast path.
        let mut wrong_if = Packet::new(
            build_frame(&FrameSpec {
                src_port: 5001,
                ..Default::default()
            }),
            7,
        );
        assert_eq!(
            prog.process(&mut wrong_if, 0, 0),
            Verdict::Drop(DropReason::UnauthSource)
        );
    }

    #[test]
    fn test_marks_stay_within_writable_mask() {
        let maps = registry();
        add_local_workload(&maps.routes, Ipv4Addr::new(1, 1, 1, 1), 1);
        let prog = program(&maps, EndpointSide::Workload, ProgramDirection::ToHost, 1);
        let allocation = marks();

        let mut pkt = Packet::new(build_frame(&FrameSpec::default()), 1);
        prog.process(&mut pkt, 0, 0);
        assert_eq!(pkt.mark & !allocation.writable_mask(), 0);
    }

    #[test]
    fn test_ipv6_policy_by_side() {
        let maps = registry();
        let mut v6 = build_frame(&FrameSpec::default());
        v6[12..14].copy_from_slice(&parse::ETHERTYPE_IPV6.to_be_bytes());
        // Pad to satisfy the host-ingress UDP-size bound.
        v6.resize(v6.len().max(MIN_UDP_FRAME), 0);

        let workload = program(&maps, EndpointSide::Workload, ProgramDirection::ToHost, 1);
        let mut pkt = Packet::new(v6.clone(), 1);
        assert_eq!(
            workload.process(&mut pkt, 0, 0),
            Verdict::Drop(DropReason::Unknown)
        );

        let host = program(&maps, EndpointSide::Host, ProgramDirection::ToHost, 2);
        let mut pkt = Packet::new(v6, 2);
        assert_eq!(host.process(&mut pkt, 0, 0), Verdict::Pass);
    }

    #[test]
    fn test_mid_flow_miss_sets_fallthrough() {
        let maps = registry();
        let prog = program(&maps, EndpointSide::Workload, ProgramDirection::FromHost, 1);
        let mut pkt = Packet::new(
            build_frame(&FrameSpec {
                tcp_flags: 0x10, // ACK only
                ..Default::default()
            }),
            1,
        );
        assert_eq!(prog.process(&mut pkt, 0, 0), Verdict::Pass);
        assert_eq!(pkt.mark & fixed::FALLTHROUGH, fixed::FALLTHROUGH);
    }

    #[test]
    fn test_rewrite_updates_checksums() {
        let mut frame = build_frame(&FrameSpec::default());
        let parsed = parse_ipv4(&frame).unwrap();

        rewrite_dst(&mut frame, &parsed, Ipv4Addr::new(8, 8, 8, 8), 666).unwrap();

        let reparsed = parse_ipv4(&frame).unwrap();
        assert_eq!(reparsed.dst, Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(reparsed.dst_port, 666);
        assert!(csum::verify(
            &frame[ETH_HEADER_LEN..ETH_HEADER_LEN + 20]
        ));
    }
}
