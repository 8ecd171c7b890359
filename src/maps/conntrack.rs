// # Conntrack Map
//
// Connection tracking shared between the fast-path programs and the
// userland sweepers. Keyed by 5-tuple; values carry the entry type,
// NAT reversal data, tunnel peer and per-direction approval bits.
//
// Wire layout (shared with peer programs, do not change):
//   key   (16B): proto 1 | pad 1 | src 4 | sport 2 | dst 4 | dport 2 | pad 2
//   value (32B): type 1 | flags 1 | approved 1 | pad 1 | rev_addr 4 |
//                rev_port 2 | pad 2 | tun_peer 4 | created 8 | last_seen 8
// Ports are held in host order in userland and written in network
// order at the wire boundary.

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::error::{DpError, Result};
use crate::maps::{MapHandle, ReadHandle};
use crate::proto::Protocol;

// ============================================================================
// Key
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConntrackKey {
    pub protocol: Protocol,
    pub src: Ipv4Addr,
    pub src_port: u16,
    pub dst: Ipv4Addr,
    pub dst_port: u16,
}

impl ConntrackKey {
    pub const WIRE_SIZE: usize = 16;

    pub fn new(protocol: Protocol, src: Ipv4Addr, src_port: u16, dst: Ipv4Addr, dst_port: u16) -> Self {
        Self {
            protocol,
            src,
            src_port,
            dst,
            dst_port,
        }
    }

    /// The same flow seen from the opposite direction.
    pub fn reversed(&self) -> Self {
        Self {
            protocol: self.protocol,
            src: self.dst,
            src_port: self.dst_port,
            dst: self.src,
            dst_port: self.src_port,
        }
    }

    pub fn to_wire(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0] = self.protocol.number();
        buf[2..6].copy_from_slice(&self.src.octets());
        buf[6..8].copy_from_slice(&self.src_port.to_be_bytes());
        buf[8..12].copy_from_slice(&self.dst.octets());
        buf[12..14].copy_from_slice(&self.dst_port.to_be_bytes());
        buf
    }

    pub fn from_wire(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::WIRE_SIZE {
            return Err(DpError::MapLayout(format!(
                "conntrack key must be {} bytes, got {}",
                Self::WIRE_SIZE,
                buf.len()
            )));
        }
        Ok(Self {
            protocol: Protocol::from_number(buf[0]),
            src: Ipv4Addr::new(buf[2], buf[3], buf[4], buf[5]),
            src_port: u16::from_be_bytes([buf[6], buf[7]]),
            dst: Ipv4Addr::new(buf[8], buf[9], buf[10], buf[11]),
            dst_port: u16::from_be_bytes([buf[12], buf[13]]),
        })
    }
}

// ============================================================================
// Value
// ============================================================================

/// Entry type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Normal,
    NatForward,
    NatReverse,
}

impl EntryType {
    fn to_wire(self) -> u8 {
        match self {
            EntryType::Normal => 0,
            EntryType::NatForward => 1,
            EntryType::NatReverse => 2,
        }
    }

    fn from_wire(b: u8) -> Result<Self> {
        match b {
            0 => Ok(EntryType::Normal),
            1 => Ok(EntryType::NatForward),
            2 => Ok(EntryType::NatReverse),
            other => Err(DpError::MapLayout(format!(
                "unknown conntrack entry type {}",
                other
            ))),
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConntrackFlags: u8 {
        const DSR = 0x01;
        const NAT_OUTGOING = 0x02;
        const EXT_LOCAL = 0x04;
        const NODEPORT_FWD = 0x08;
        const SKIP_FIB = 0x10;
        const RPF_FAILED = 0x20;
    }
}

/// Which leg of the connection has been approved by policy.
pub const APPROVED_FORWARD: u8 = 0x01;
pub const APPROVED_REVERSE: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConntrackEntry {
    pub entry_type: EntryType,
    pub flags: ConntrackFlags,
    pub approved: u8,
    /// NAT reversal data: the backend on a forward entry, the
    /// original frontend on a reverse entry. Zero when unused.
    pub rev_addr: Ipv4Addr,
    pub rev_port: u16,
    /// Tunnel peer the flow arrived from, when encapped.
    pub tunnel_peer: Option<Ipv4Addr>,
    /// Nanoseconds on the shared monotonic clock.
    pub created_ns: u64,
    pub last_seen_ns: u64,
}

impl ConntrackEntry {
    pub const WIRE_SIZE: usize = 32;

    pub fn new(entry_type: EntryType, flags: ConntrackFlags, now_ns: u64) -> Self {
        Self {
            entry_type,
            flags,
            approved: 0,
            rev_addr: Ipv4Addr::UNSPECIFIED,
            rev_port: 0,
            tunnel_peer: None,
            created_ns: now_ns,
            last_seen_ns: now_ns,
        }
    }

    pub fn is_established(&self) -> bool {
        self.approved & APPROVED_FORWARD != 0 && self.approved & APPROVED_REVERSE != 0
    }

    pub fn to_wire(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0] = self.entry_type.to_wire();
        buf[1] = self.flags.bits();
        buf[2] = self.approved;
        buf[4..8].copy_from_slice(&self.rev_addr.octets());
        buf[8..10].copy_from_slice(&self.rev_port.to_be_bytes());
        let peer = self.tunnel_peer.unwrap_or(Ipv4Addr::UNSPECIFIED);
        buf[12..16].copy_from_slice(&peer.octets());
        buf[16..24].copy_from_slice(&self.created_ns.to_be_bytes());
        buf[24..32].copy_from_slice(&self.last_seen_ns.to_be_bytes());
        buf
    }

    pub fn from_wire(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::WIRE_SIZE {
            return Err(DpError::MapLayout(format!(
                "conntrack value must be {} bytes, got {}",
                Self::WIRE_SIZE,
                buf.len()
            )));
        }
        let peer = Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]);
        Ok(Self {
            entry_type: EntryType::from_wire(buf[0])?,
            flags: ConntrackFlags::from_bits_truncate(buf[1]),
            approved: buf[2],
            rev_addr: Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]),
            rev_port: u16::from_be_bytes([buf[8], buf[9]]),
            tunnel_peer: (peer != Ipv4Addr::UNSPECIFIED).then_some(peer),
            created_ns: u64::from_be_bytes(buf[16..24].try_into().unwrap()),
            last_seen_ns: u64::from_be_bytes(buf[24..32].try_into().unwrap()),
        })
    }
}

// ============================================================================
// Table
// ============================================================================

/// Outcome of admitting a new NAT flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatAdmit {
    /// This call installed the pair; the chosen backend stands.
    Created { backend: Ipv4Addr, backend_port: u16 },
    /// A previous admit already fixed the backend (e.g. a SYN retry);
    /// use it instead of the freshly hashed choice.
    Existing { backend: Ipv4Addr, backend_port: u16 },
}

impl NatAdmit {
    pub fn backend(&self) -> (Ipv4Addr, u16) {
        match *self {
            NatAdmit::Created { backend, backend_port }
            | NatAdmit::Existing { backend, backend_port } => (backend, backend_port),
        }
    }
}

/// The conntrack table. Owned by the driver (which runs the sweeps);
/// the fast path holds a second handle through the registry.
#[derive(Debug)]
pub struct ConntrackTable {
    map: MapHandle<ConntrackKey, ConntrackEntry>,
}

impl ConntrackTable {
    pub fn new() -> Self {
        Self {
            map: MapHandle::new(),
        }
    }

    pub fn reader(&self) -> ReadHandle<ConntrackKey, ConntrackEntry> {
        self.map.reader()
    }

    pub fn lookup(&self, key: &ConntrackKey) -> Option<ConntrackEntry> {
        self.map.get(key)
    }

    /// Race-safe create for a fully formed entry.
    pub fn insert_if_absent(&self, key: ConntrackKey, entry: ConntrackEntry) -> bool {
        self.map.insert_if_absent(key, entry)
    }

    pub fn create_normal(
        &self,
        key: ConntrackKey,
        flags: ConntrackFlags,
        tunnel_peer: Option<Ipv4Addr>,
        now_ns: u64,
    ) -> bool {
        let mut entry = ConntrackEntry::new(EntryType::Normal, flags, now_ns);
        entry.tunnel_peer = tunnel_peer;
        self.map.insert_if_absent(key, entry)
    }

    /// Install the NAT-forward/NAT-reverse pair for a freshly admitted
    /// flow. Both entries exist or neither. When a forward entry is
    /// already present (SYN retry) the previously chosen backend wins
    /// and no reverse entry is touched.
    pub fn admit_nat_flow(
        &self,
        fwd_key: ConntrackKey,
        backend: Ipv4Addr,
        backend_port: u16,
        flags: ConntrackFlags,
        tunnel_peer: Option<Ipv4Addr>,
        now_ns: u64,
    ) -> NatAdmit {
        let mut fwd = ConntrackEntry::new(EntryType::NatForward, flags, now_ns);
        fwd.rev_addr = backend;
        fwd.rev_port = backend_port;
        fwd.tunnel_peer = tunnel_peer;

        if !self.map.insert_if_absent(fwd_key, fwd) {
            // Lost the race or retried SYN: the fixed backend stands.
            let existing = self
                .map
                .get(&fwd_key)
                .expect("forward entry cannot vanish between insert and get");
            return NatAdmit::Existing {
                backend: existing.rev_addr,
                backend_port: existing.rev_port,
            };
        }

        let mut rev = ConntrackEntry::new(EntryType::NatReverse, flags, now_ns);
        rev.rev_addr = fwd_key.dst;
        rev.rev_port = fwd_key.dst_port;
        rev.tunnel_peer = tunnel_peer;
        let rev_key = ConntrackKey::new(
            fwd_key.protocol,
            backend,
            backend_port,
            fwd_key.src,
            fwd_key.src_port,
        );
        self.map.insert(rev_key, rev);

        NatAdmit::Created {
            backend,
            backend_port,
        }
    }

    /// Refresh the timestamp and approve one leg.
    pub fn note_seen(&self, key: &ConntrackKey, approved_leg: u8, now_ns: u64) {
        self.map.update(key, |entry| {
            entry.last_seen_ns = now_ns;
            entry.approved |= approved_leg;
        });
    }

    /// Age out stale entries. Timeout depends on protocol and on
    /// whether both legs were approved.
    pub fn sweep(&self, now_ns: u64) -> usize {
        let before = self.map.len();
        self.map.retain(|key, entry| {
            let timeout = Self::timeout_for(key.protocol, entry.is_established());
            now_ns.saturating_sub(entry.last_seen_ns) < timeout.as_nanos() as u64
        });
        before - self.map.len()
    }

    /// Drop all flows touching the given addresses (endpoint removal).
    pub fn flush_for_addrs(&self, addrs: &[Ipv4Addr]) -> usize {
        let before = self.map.len();
        self.map.retain(|key, entry| {
            !(addrs.contains(&key.src)
                || addrs.contains(&key.dst)
                || addrs.contains(&entry.rev_addr))
        });
        before - self.map.len()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn timeout_for(protocol: Protocol, established: bool) -> Duration {
        match (protocol, established) {
            (Protocol::Tcp, true) => Duration::from_secs(3600),
            (Protocol::Tcp, false) => Duration::from_secs(30),
            (Protocol::Udp, _) => Duration::from_secs(60),
            (Protocol::Icmp, _) => Duration::from_secs(5),
            _ => Duration::from_secs(600),
        }
    }
}

impl Default for ConntrackTable {
    fn default() -> Self {
        Self::new()
    }
}
