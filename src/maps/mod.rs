// # Shared Kernel Maps
//
// Long-lived keyed tables shared between the userland managers and
// the fast-path packet programs. Each map has exactly one owner (a
// manager or the program loader) holding a `MapHandle`; components
// that only read are given `ReadHandle` clones. The byte layouts
// produced by the `to_wire`/`from_wire` functions are the external
// schema shared with peer nodes and must not change.

pub mod arp;
pub mod conntrack;
pub mod nat;
pub mod route;
pub mod state;

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::proto::{IpSetId, IpSetMember, Protocol};

pub use arp::{ArpKey, ArpMap, ArpValue};
pub use conntrack::{
    ConntrackEntry, ConntrackFlags, ConntrackKey, ConntrackTable, EntryType,
};
pub use nat::{
    AffinityKey, AffinityValue, NatBackendKey, NatBackendValue, NatFrontendKey, NatFrontendValue,
    NatMaps,
};
pub use route::{RouteFlags, RouteKey, RouteMap, RouteValue};
pub use state::{PerCpuScratch, ScratchState};

// ============================================================================
// Handles
// ============================================================================

/// Owned handle to one shared map. Created once by the registry and
/// held by exactly one component; everything else gets `ReadHandle`s.
#[derive(Debug)]
pub struct MapHandle<K: Eq + Hash, V> {
    inner: Arc<DashMap<K, V>>,
}

/// Read-only view of a shared map.
#[derive(Debug, Clone)]
pub struct ReadHandle<K: Eq + Hash, V> {
    inner: Arc<DashMap<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> MapHandle<K, V> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    pub fn reader(&self) -> ReadHandle<K, V> {
        ReadHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Second owned handle, for handing the map to the single writer
    /// component that maintains it while the registry keeps one for
    /// the packet path.
    pub fn clone_owned(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.inner.insert(key, value)
    }

    /// Insert only when the key is absent. Returns true when this
    /// call created the entry. Race-safe: concurrent callers agree
    /// on a single winner.
    pub fn insert_if_absent(&self, key: K, value: V) -> bool {
        let mut created = false;
        self.inner.entry(key).or_insert_with(|| {
            created = true;
            value
        });
        created
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.remove(key).map(|(_, v)| v)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key).map(|r| r.value().clone())
    }

    pub fn update<F: FnOnce(&mut V)>(&self, key: &K, f: F) -> bool {
        match self.inner.get_mut(key) {
            Some(mut entry) => {
                f(entry.value_mut());
                true
            }
            None => false,
        }
    }

    pub fn retain<F: FnMut(&K, &mut V) -> bool>(&self, f: F) {
        self.inner.retain(f)
    }

    pub fn clear(&self) {
        self.inner.clear()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter_snapshot(&self) -> Vec<(K, V)> {
        self.inner
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect()
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Default for MapHandle<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone, V: Clone> ReadHandle<K, V> {
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key).map(|r| r.value().clone())
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter_snapshot(&self) -> Vec<(K, V)> {
        self.inner
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect()
    }
}

// ============================================================================
// Failsafe ports
// ============================================================================

/// Direction a failsafe entry covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailsafeDirection {
    Inbound,
    Outbound,
}

/// Key of the failsafe-ports map: (port, protocol, direction).
/// Wire layout: port (2, BE), protocol (1), direction (1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FailsafeKey {
    pub port: u16,
    pub protocol: Protocol,
    pub direction: FailsafeDirection,
}

impl FailsafeKey {
    pub const WIRE_SIZE: usize = 4;

    pub fn to_wire(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..2].copy_from_slice(&self.port.to_be_bytes());
        buf[2] = self.protocol.number();
        buf[3] = match self.direction {
            FailsafeDirection::Inbound => 0,
            FailsafeDirection::Outbound => 1,
        };
        buf
    }
}

/// The failsafe-ports map consumed by the fast path to bypass policy
/// for control-plane protocols.
pub type FailsafeMap = MapHandle<FailsafeKey, ()>;

// ============================================================================
// Drop counters
// ============================================================================

/// Reason codes for fast-path drops. Counted, never propagated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    Short,
    Malformed,
    IpOptions,
    UnauthSource,
    ChecksumFailed,
    EncapFailed,
    PolicyDenied,
    Unknown,
}

impl DropReason {
    pub const COUNT: usize = 8;

    pub fn index(self) -> usize {
        match self {
            DropReason::Short => 0,
            DropReason::Malformed => 1,
            DropReason::IpOptions => 2,
            DropReason::UnauthSource => 3,
            DropReason::ChecksumFailed => 4,
            DropReason::EncapFailed => 5,
            DropReason::PolicyDenied => 6,
            DropReason::Unknown => 7,
        }
    }
}

/// Per-reason drop counters, shared with debug tooling.
#[derive(Debug, Default)]
pub struct DropCounters {
    counts: [AtomicU64; DropReason::COUNT],
}

impl DropCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn bump(&self, reason: DropReason) {
        self.counts[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, reason: DropReason) -> u64 {
        self.counts[reason.index()].load(Ordering::Relaxed)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// The fast-path view of programmed IP sets, keyed by set id.
pub type IpSetsMap = MapHandle<IpSetId, HashSet<IpSetMember>>;

/// Connect-time load-balancing reversal table: 5-tuple of a flow
/// whose destination was rewritten at connect() time, mapped back to
/// the original frontend so policy sees what the client dialed.
pub type CtLbMap = MapHandle<ConntrackKey, nat::NatBackendValue>;

/// Creates every shared map exactly once and hands the owned halves
/// to their owners during driver construction.
#[derive(Debug)]
pub struct MapRegistry {
    pub conntrack: ConntrackTable,
    pub nat: NatMaps,
    pub routes: RouteMap,
    pub arp: ArpMap,
    pub failsafe: FailsafeMap,
    pub ip_sets: IpSetsMap,
    pub ctlb: CtLbMap,
    pub scratch: PerCpuScratch,
    pub drops: Arc<DropCounters>,
}

impl MapRegistry {
    pub fn new() -> Self {
        Self {
            conntrack: ConntrackTable::new(),
            nat: NatMaps::new(),
            routes: RouteMap::new(),
            arp: ArpMap::new(),
            failsafe: FailsafeMap::new(),
            ip_sets: IpSetsMap::new(),
            ctlb: CtLbMap::new(),
            scratch: PerCpuScratch::new(crate::common::num_cpus()),
            drops: DropCounters::new(),
        }
    }
}

impl Default for MapRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_if_absent_single_winner() {
        let map: MapHandle<u32, u32> = MapHandle::new();
        assert!(map.insert_if_absent(1, 10));
        assert!(!map.insert_if_absent(1, 20));
        assert_eq!(map.get(&1), Some(10));
    }

    #[test]
    fn test_read_handle_sees_owner_writes() {
        let map: MapHandle<u32, &'static str> = MapHandle::new();
        let reader = map.reader();
        map.insert(7, "seven");
        assert_eq!(reader.get(&7), Some("seven"));
        map.remove(&7);
        assert!(!reader.contains_key(&7));
    }

    #[test]
    fn test_failsafe_key_wire_layout() {
        let key = FailsafeKey {
            port: 179,
            protocol: Protocol::Tcp,
            direction: FailsafeDirection::Inbound,
        };
        assert_eq!(key.to_wire(), [0x00, 0xb3, 6, 0]);
    }

    #[test]
    fn test_drop_counters_accumulate() {
        let drops = DropCounters::new();
        drops.bump(DropReason::Short);
        drops.bump(DropReason::Short);
        drops.bump(DropReason::EncapFailed);
        assert_eq!(drops.get(DropReason::Short), 2);
        assert_eq!(drops.get(DropReason::EncapFailed), 1);
        assert_eq!(drops.get(DropReason::Unknown), 0);
    }
}
