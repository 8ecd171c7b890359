// # Route Map
//
// Longest-prefix-match routing state consulted by the fast path for
// RPF, NAT-outgoing eligibility and tunnel next-hop resolution.
//
// Wire layout:
//   key   (8B): prefix_len 4 | addr 4
//   value (12B): flags 4 | ifindex 4 | next_hop 4

use std::net::Ipv4Addr;

use parking_lot::RwLock;

use crate::error::{DpError, Result};
use crate::maps::{MapHandle, ReadHandle};
use crate::proto::IpNet;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RouteFlags: u32 {
        const LOCAL_HOST = 0x01;
        const REMOTE_HOST = 0x02;
        const LOCAL_WORKLOAD = 0x04;
        const REMOTE_WORKLOAD = 0x08;
        const IN_POOL = 0x10;
        const NAT_OUTGOING = 0x20;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub prefix_len: u8,
    /// Address with host bits already masked off.
    pub addr: Ipv4Addr,
}

impl RouteKey {
    pub const WIRE_SIZE: usize = 8;

    pub fn new(net: IpNet) -> Self {
        let masked = if net.prefix_len == 0 {
            Ipv4Addr::UNSPECIFIED
        } else {
            let mask = u32::MAX << (32 - net.prefix_len as u32);
            Ipv4Addr::from(u32::from(net.addr) & mask)
        };
        Self {
            prefix_len: net.prefix_len,
            addr: masked,
        }
    }

    pub fn host(addr: Ipv4Addr) -> Self {
        Self {
            prefix_len: 32,
            addr,
        }
    }

    pub fn to_wire(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&(self.prefix_len as u32).to_be_bytes());
        buf[4..8].copy_from_slice(&self.addr.octets());
        buf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteValue {
    pub flags: RouteFlags,
    /// Local interface index for local destinations; zero otherwise.
    pub ifindex: u32,
    /// Next-hop node address for remote destinations; zero otherwise.
    pub next_hop: Option<Ipv4Addr>,
}

impl RouteValue {
    pub const WIRE_SIZE: usize = 12;

    pub fn local_workload(ifindex: u32) -> Self {
        Self {
            flags: RouteFlags::LOCAL_WORKLOAD | RouteFlags::IN_POOL,
            ifindex,
            next_hop: None,
        }
    }

    pub fn remote_workload(next_hop: Ipv4Addr) -> Self {
        Self {
            flags: RouteFlags::REMOTE_WORKLOAD | RouteFlags::IN_POOL,
            ifindex: 0,
            next_hop: Some(next_hop),
        }
    }

    pub fn to_wire(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.flags.bits().to_be_bytes());
        buf[4..8].copy_from_slice(&self.ifindex.to_be_bytes());
        let nh = self.next_hop.unwrap_or(Ipv4Addr::UNSPECIFIED);
        buf[8..12].copy_from_slice(&nh.octets());
        buf
    }

    pub fn from_wire(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::WIRE_SIZE {
            return Err(DpError::MapLayout(format!(
                "route value must be {} bytes, got {}",
                Self::WIRE_SIZE,
                buf.len()
            )));
        }
        let nh = Ipv4Addr::new(buf[8], buf[9], buf[10], buf[11]);
        Ok(Self {
            flags: RouteFlags::from_bits_truncate(u32::from_be_bytes(buf[0..4].try_into().unwrap())),
            ifindex: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            next_hop: (nh != Ipv4Addr::UNSPECIFIED).then_some(nh),
        })
    }
}

/// The LPM route map. One prefix-length occupancy table makes the
/// longest-match walk skip absent lengths.
#[derive(Debug)]
pub struct RouteMap {
    map: MapHandle<RouteKey, RouteValue>,
    len_counts: RwLock<[u32; 33]>,
}

impl RouteMap {
    pub fn new() -> Self {
        Self {
            map: MapHandle::new(),
            len_counts: RwLock::new([0; 33]),
        }
    }

    pub fn reader(&self) -> ReadHandle<RouteKey, RouteValue> {
        self.map.reader()
    }

    pub fn insert(&self, net: IpNet, value: RouteValue) {
        let key = RouteKey::new(net);
        if self.map.insert(key, value).is_none() {
            self.len_counts.write()[key.prefix_len as usize] += 1;
        }
    }

    pub fn remove(&self, net: IpNet) -> Option<RouteValue> {
        let key = RouteKey::new(net);
        let removed = self.map.remove(&key);
        if removed.is_some() {
            self.len_counts.write()[key.prefix_len as usize] -= 1;
        }
        removed
    }

    /// Longest-prefix lookup.
    pub fn lookup(&self, addr: Ipv4Addr) -> Option<RouteValue> {
        let counts = self.len_counts.read();
        for len in (0..=32u8).rev() {
            if counts[len as usize] == 0 {
                continue;
            }
            let key = RouteKey::new(IpNet::new(addr, len));
            if let Some(value) = self.map.get(&key) {
                return Some(value);
            }
        }
        None
    }

    pub fn get_exact(&self, net: IpNet) -> Option<RouteValue> {
        self.map.get(&RouteKey::new(net))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter_snapshot(&self) -> Vec<(RouteKey, RouteValue)> {
        self.map.iter_snapshot()
    }
}

impl Default for RouteMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_masks_host_bits() {
        let key = RouteKey::new(IpNet::new(Ipv4Addr::new(10, 65, 3, 99), 16));
        assert_eq!(key.addr, Ipv4Addr::new(10, 65, 0, 0));
        assert_eq!(key.to_wire(), [0, 0, 0, 16, 10, 65, 0, 0]);
    }

    #[test]
    fn test_value_wire_round_trip() {
        let value = RouteValue::remote_workload(Ipv4Addr::new(172, 16, 0, 2));
        assert_eq!(RouteValue::from_wire(&value.to_wire()).unwrap(), value);

        let local = RouteValue::local_workload(7);
        let wire = local.to_wire();
        assert_eq!(&wire[4..8], &7u32.to_be_bytes());
        assert_eq!(RouteValue::from_wire(&wire).unwrap(), local);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let map = RouteMap::new();
        map.insert(
            IpNet::new(Ipv4Addr::new(10, 65, 0, 0), 16),
            RouteValue {
                flags: RouteFlags::IN_POOL,
                ifindex: 0,
                next_hop: None,
            },
        );
        map.insert(
            IpNet::host(Ipv4Addr::new(10, 65, 0, 5)),
            RouteValue::local_workload(3),
        );

        let exact = map.lookup(Ipv4Addr::new(10, 65, 0, 5)).unwrap();
        assert!(exact.flags.contains(RouteFlags::LOCAL_WORKLOAD));
        assert_eq!(exact.ifindex, 3);

        let pool = map.lookup(Ipv4Addr::new(10, 65, 9, 9)).unwrap();
        assert_eq!(pool.flags, RouteFlags::IN_POOL);

        assert!(map.lookup(Ipv4Addr::new(192, 168, 1, 1)).is_none());
    }

    #[test]
    fn test_remove_clears_length_occupancy() {
        let map = RouteMap::new();
        let net = IpNet::host(Ipv4Addr::new(1, 1, 1, 1));
        map.insert(net, RouteValue::local_workload(1));
        assert!(map.lookup(Ipv4Addr::new(1, 1, 1, 1)).is_some());

        map.remove(net);
        assert!(map.lookup(Ipv4Addr::new(1, 1, 1, 1)).is_none());
        assert!(map.is_empty());
    }
}
