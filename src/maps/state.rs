// # Program-State Scratch
//
// Per-CPU scratch entry carrying the decomposed packet across tail
// calls between the fast-path sub-programs. The layout is shared
// with the programs and sized at 64 bytes.

use std::net::Ipv4Addr;

use parking_lot::Mutex;

use crate::maps::conntrack::ConntrackKey;
use crate::maps::nat::NatBackendValue;
use crate::proto::Protocol;

bitflags::bitflags! {
    /// Per-packet working flags accumulated during traversal.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ScratchFlags: u16 {
        const NAT_NEEDED = 0x0001;
        const ENCAP_NEEDED = 0x0002;
        const NAT_OUTGOING = 0x0004;
        const SKIP_FIB = 0x0008;
        const RPF_FAILED = 0x0010;
        const DSR_RETURN = 0x0020;
        const CT_HIT = 0x0040;
        const CT_NAT_REVERSE = 0x0080;
        const SYNTH_ICMP = 0x0100;
    }
}

/// The scratch entry. One per CPU; reset at S0 for every packet.
///
/// Wire layout (64B):
///   proto 1 | pad 1 | flags 2 | src 4 | sport 2 | dport 2 | dst 4 |
///   pre_nat_dst 4 | pre_nat_dport 2 | post_nat_dport 2 |
///   post_nat_dst 4 | backend_addr 4 | backend_port 2 |
///   icmp_type 1 | icmp_code 1 | tunnel_peer 4 | icmp_mtu 2 |
///   reserved 22
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchState {
    pub protocol: Protocol,
    pub flags: ScratchFlags,
    pub src: Ipv4Addr,
    pub src_port: u16,
    pub dst: Ipv4Addr,
    pub dst_port: u16,
    /// Destination as the client dialed it; what policy sees.
    pub pre_nat_dst: Ipv4Addr,
    pub pre_nat_dport: u16,
    /// Destination after NAT; what gets programmed into the packet.
    pub post_nat_dst: Ipv4Addr,
    pub post_nat_dport: u16,
    pub backend: Option<NatBackendValue>,
    pub icmp_type: u8,
    pub icmp_code: u8,
    /// Next-hop MTU quoted in a fragmentation-needed reply.
    pub icmp_mtu: u16,
    pub tunnel_peer: Option<Ipv4Addr>,
}

impl ScratchState {
    pub const WIRE_SIZE: usize = 64;

    pub fn empty() -> Self {
        Self {
            protocol: Protocol::Other(0),
            flags: ScratchFlags::empty(),
            src: Ipv4Addr::UNSPECIFIED,
            src_port: 0,
            dst: Ipv4Addr::UNSPECIFIED,
            dst_port: 0,
            pre_nat_dst: Ipv4Addr::UNSPECIFIED,
            pre_nat_dport: 0,
            post_nat_dst: Ipv4Addr::UNSPECIFIED,
            post_nat_dport: 0,
            backend: None,
            icmp_type: 0,
            icmp_code: 0,
            icmp_mtu: 0,
            tunnel_peer: None,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::empty();
    }

    /// The conntrack key of the flow as currently decomposed.
    pub fn flow_key(&self) -> ConntrackKey {
        ConntrackKey::new(
            self.protocol,
            self.src,
            self.src_port,
            self.dst,
            self.dst_port,
        )
    }

    pub fn to_wire(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0] = self.protocol.number();
        buf[2..4].copy_from_slice(&self.flags.bits().to_be_bytes());
        buf[4..8].copy_from_slice(&self.src.octets());
        buf[8..10].copy_from_slice(&self.src_port.to_be_bytes());
        buf[10..12].copy_from_slice(&self.dst_port.to_be_bytes());
        buf[12..16].copy_from_slice(&self.dst.octets());
        buf[16..20].copy_from_slice(&self.pre_nat_dst.octets());
        buf[20..22].copy_from_slice(&self.pre_nat_dport.to_be_bytes());
        buf[22..24].copy_from_slice(&self.post_nat_dport.to_be_bytes());
        buf[24..28].copy_from_slice(&self.post_nat_dst.octets());
        if let Some(backend) = self.backend {
            buf[28..32].copy_from_slice(&backend.addr.octets());
            buf[32..34].copy_from_slice(&backend.port.to_be_bytes());
        }
        buf[34] = self.icmp_type;
        buf[35] = self.icmp_code;
        let peer = self.tunnel_peer.unwrap_or(Ipv4Addr::UNSPECIFIED);
        buf[36..40].copy_from_slice(&peer.octets());
        buf[40..42].copy_from_slice(&self.icmp_mtu.to_be_bytes());
        buf
    }
}

impl Default for ScratchState {
    fn default() -> Self {
        Self::empty()
    }
}

/// The per-CPU scratch map. In-kernel this is a per-CPU array map;
/// here one slot per CPU behind a short-lived lock.
#[derive(Debug)]
pub struct PerCpuScratch {
    slots: Vec<Mutex<ScratchState>>,
}

impl PerCpuScratch {
    pub fn new(cpus: usize) -> Self {
        Self {
            slots: (0..cpus.max(1))
                .map(|_| Mutex::new(ScratchState::empty()))
                .collect(),
        }
    }

    pub fn cpus(&self) -> usize {
        self.slots.len()
    }

    /// Run `f` with exclusive access to one CPU's scratch entry.
    pub fn with<R>(&self, cpu: usize, f: impl FnOnce(&mut ScratchState) -> R) -> R {
        let mut slot = self.slots[cpu % self.slots.len()].lock();
        f(&mut slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_wire_size_fixed() {
        let state = ScratchState::empty();
        assert_eq!(state.to_wire().len(), ScratchState::WIRE_SIZE);
    }

    #[test]
    fn test_flow_key_matches_decomposition() {
        let mut state = ScratchState::empty();
        state.protocol = Protocol::Udp;
        state.src = Ipv4Addr::new(1, 2, 3, 4);
        state.src_port = 1000;
        state.dst = Ipv4Addr::new(5, 6, 7, 8);
        state.dst_port = 53;

        let key = state.flow_key();
        assert_eq!(key.protocol, Protocol::Udp);
        assert_eq!(key.src_port, 1000);
        assert_eq!(key.dst, Ipv4Addr::new(5, 6, 7, 8));
    }

    #[test]
    fn test_per_cpu_slots_independent() {
        let scratch = PerCpuScratch::new(2);
        scratch.with(0, |s| s.src_port = 11);
        scratch.with(1, |s| s.src_port = 22);
        assert_eq!(scratch.with(0, |s| s.src_port), 11);
        assert_eq!(scratch.with(1, |s| s.src_port), 22);
    }
}
