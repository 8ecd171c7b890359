// # Service NAT Maps
//
// Frontend, backend and session-affinity maps for service load
// balancing. The frontend entry for a virtual (address, port,
// protocol) names how many backends exist and which ordinal block of
// the backend map holds them; backend selection is a deterministic
// flow hash modulo the count, pinned by conntrack on first admit.
//
// Wire layouts (shared with peer programs):
//   frontend key   (8B): addr 4 | port 2 | proto 1 | pad 1
//   frontend value (20B): count 4 | local_count 4 | flags 4 |
//                         affinity_secs 4 | ordinal 4
//   backend key    (8B): ordinal 4 | index 4
//   backend value  (8B): addr 4 | port 2 | pad 2
//   affinity key  (12B): client 4 | frontend key 8
//   affinity value(16B): backend value 8 | last_seen 8
//
// The first four frontend-value fields match the historical layout;
// the backend-block ordinal is appended at offset 16 (the programs
// cannot index the backend map without it).

use std::net::Ipv4Addr;

use crate::error::{DpError, Result};
use crate::maps::conntrack::ConntrackKey;
use crate::maps::{MapHandle, ReadHandle};
use crate::proto::{Protocol, ServiceFlags, ServiceSpec};

// ============================================================================
// Keys and values
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NatFrontendKey {
    pub addr: Ipv4Addr,
    pub port: u16,
    pub protocol: Protocol,
}

impl NatFrontendKey {
    pub const WIRE_SIZE: usize = 8;

    pub fn to_wire(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.addr.octets());
        buf[4..6].copy_from_slice(&self.port.to_be_bytes());
        buf[6] = self.protocol.number();
        buf
    }

    pub fn from_wire(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::WIRE_SIZE {
            return Err(DpError::MapLayout(format!(
                "NAT frontend key must be {} bytes, got {}",
                Self::WIRE_SIZE,
                buf.len()
            )));
        }
        Ok(Self {
            addr: Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]),
            port: u16::from_be_bytes([buf[4], buf[5]]),
            protocol: Protocol::from_number(buf[6]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatFrontendValue {
    pub backend_count: u32,
    pub local_backend_count: u32,
    pub flags: ServiceFlags,
    pub affinity_secs: u32,
    /// Backend-map ordinal of this service's backend block.
    pub ordinal: u32,
}

impl NatFrontendValue {
    pub const WIRE_SIZE: usize = 20;

    pub fn to_wire(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.backend_count.to_be_bytes());
        buf[4..8].copy_from_slice(&self.local_backend_count.to_be_bytes());
        buf[8..12].copy_from_slice(&self.flags.bits().to_be_bytes());
        buf[12..16].copy_from_slice(&self.affinity_secs.to_be_bytes());
        buf[16..20].copy_from_slice(&self.ordinal.to_be_bytes());
        buf
    }

    pub fn from_wire(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::WIRE_SIZE {
            return Err(DpError::MapLayout(format!(
                "NAT frontend value must be {} bytes, got {}",
                Self::WIRE_SIZE,
                buf.len()
            )));
        }
        Ok(Self {
            backend_count: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            local_backend_count: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            flags: ServiceFlags::from_bits_truncate(u32::from_be_bytes(
                buf[8..12].try_into().unwrap(),
            )),
            affinity_secs: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
            ordinal: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NatBackendKey {
    pub ordinal: u32,
    pub index: u32,
}

impl NatBackendKey {
    pub const WIRE_SIZE: usize = 8;

    pub fn to_wire(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.ordinal.to_be_bytes());
        buf[4..8].copy_from_slice(&self.index.to_be_bytes());
        buf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatBackendValue {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl NatBackendValue {
    pub const WIRE_SIZE: usize = 8;

    pub fn to_wire(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.addr.octets());
        buf[4..6].copy_from_slice(&self.port.to_be_bytes());
        buf
    }

    pub fn from_wire(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::WIRE_SIZE {
            return Err(DpError::MapLayout(format!(
                "NAT backend value must be {} bytes, got {}",
                Self::WIRE_SIZE,
                buf.len()
            )));
        }
        Ok(Self {
            addr: Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]),
            port: u16::from_be_bytes([buf[4], buf[5]]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AffinityKey {
    pub client: Ipv4Addr,
    pub frontend: NatFrontendKey,
}

impl AffinityKey {
    pub const WIRE_SIZE: usize = 12;

    pub fn to_wire(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.client.octets());
        buf[4..12].copy_from_slice(&self.frontend.to_wire());
        buf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AffinityValue {
    pub backend: NatBackendValue,
    pub last_seen_ns: u64,
}

impl AffinityValue {
    pub const WIRE_SIZE: usize = 16;

    pub fn to_wire(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..8].copy_from_slice(&self.backend.to_wire());
        buf[8..16].copy_from_slice(&self.last_seen_ns.to_be_bytes());
        buf
    }
}

// ============================================================================
// Flow hash
// ============================================================================

/// Deterministic FNV-1a over the 5-tuple. Stable across restarts so
/// retried SYNs hash identically before conntrack pins the choice.
pub fn flow_hash(key: &ConntrackKey) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET;
    for byte in key.to_wire() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

// ============================================================================
// Map bundle
// ============================================================================

/// The three service NAT maps plus the ordinal allocator. Owned by
/// the NAT manager; the fast path reads through the registry.
#[derive(Debug)]
pub struct NatMaps {
    frontend: MapHandle<NatFrontendKey, NatFrontendValue>,
    backend: MapHandle<NatBackendKey, NatBackendValue>,
    affinity: MapHandle<AffinityKey, AffinityValue>,
    next_ordinal: std::sync::atomic::AtomicU32,
}

impl NatMaps {
    pub fn new() -> Self {
        Self {
            frontend: MapHandle::new(),
            backend: MapHandle::new(),
            affinity: MapHandle::new(),
            next_ordinal: std::sync::atomic::AtomicU32::new(1),
        }
    }

    pub fn frontend_reader(&self) -> ReadHandle<NatFrontendKey, NatFrontendValue> {
        self.frontend.reader()
    }

    pub fn backend_reader(&self) -> ReadHandle<NatBackendKey, NatBackendValue> {
        self.backend.reader()
    }

    /// Program one service: write its backend block, then the
    /// frontend entry pointing at it. The frontend write is last so a
    /// concurrent fast-path lookup never sees dangling backends.
    pub fn program_service(&self, spec: &ServiceSpec) {
        let frontend_key = NatFrontendKey {
            addr: spec.key.vip,
            port: spec.key.port,
            protocol: spec.key.protocol,
        };

        let ordinal = match self.frontend.get(&frontend_key) {
            Some(existing) => existing.ordinal,
            None => self
                .next_ordinal
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        };

        for (index, backend) in spec.backends.iter().enumerate() {
            self.backend.insert(
                NatBackendKey {
                    ordinal,
                    index: index as u32,
                },
                NatBackendValue {
                    addr: backend.addr,
                    port: backend.port,
                },
            );
        }
        // Remove backends past the new count.
        let new_count = spec.backends.len() as u32;
        if let Some(old) = self.frontend.get(&frontend_key) {
            for index in new_count..old.backend_count {
                self.backend.remove(&NatBackendKey { ordinal, index });
            }
        }

        self.frontend.insert(
            frontend_key,
            NatFrontendValue {
                backend_count: new_count,
                local_backend_count: spec.backends.iter().filter(|b| b.is_local).count() as u32,
                flags: spec.flags,
                affinity_secs: spec.affinity_secs,
                ordinal,
            },
        );
    }

    /// Remove a service frontend and its backend block.
    pub fn remove_service(&self, key: &NatFrontendKey) {
        if let Some(value) = self.frontend.remove(key) {
            for index in 0..value.backend_count {
                self.backend.remove(&NatBackendKey {
                    ordinal: value.ordinal,
                    index,
                });
            }
            self.affinity.retain(|k, _| k.frontend != *key);
        }
    }

    pub fn lookup_frontend(&self, key: &NatFrontendKey) -> Option<NatFrontendValue> {
        self.frontend.get(key)
    }

    pub fn lookup_backend(&self, ordinal: u32, index: u32) -> Option<NatBackendValue> {
        self.backend.get(&NatBackendKey { ordinal, index })
    }

    /// Fetch a still-fresh affinity entry for (client, frontend).
    pub fn lookup_affinity(
        &self,
        client: Ipv4Addr,
        frontend: NatFrontendKey,
        affinity_secs: u32,
        now_ns: u64,
    ) -> Option<NatBackendValue> {
        let key = AffinityKey { client, frontend };
        let value = self.affinity.get(&key)?;
        let age_ns = now_ns.saturating_sub(value.last_seen_ns);
        if age_ns <= affinity_secs as u64 * 1_000_000_000 {
            Some(value.backend)
        } else {
            None
        }
    }

    pub fn record_affinity(
        &self,
        client: Ipv4Addr,
        frontend: NatFrontendKey,
        backend: NatBackendValue,
        now_ns: u64,
    ) {
        self.affinity.insert(
            AffinityKey { client, frontend },
            AffinityValue {
                backend,
                last_seen_ns: now_ns,
            },
        );
    }

    pub fn frontend_len(&self) -> usize {
        self.frontend.len()
    }

    pub fn backend_len(&self) -> usize {
        self.backend.len()
    }
}

impl Default for NatMaps {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{ServiceBackend, ServiceKey};

    fn spec(backends: usize) -> ServiceSpec {
        ServiceSpec {
            key: ServiceKey {
                vip: Ipv4Addr::new(10, 0, 0, 1),
                port: 80,
                protocol: Protocol::Tcp,
            },
            backends: (0..backends)
                .map(|i| ServiceBackend {
                    addr: Ipv4Addr::new(8, 8, 8, 8 + i as u8),
                    port: 666,
                    is_local: i == 0,
                })
                .collect(),
            flags: ServiceFlags::empty(),
            affinity_secs: 0,
        }
    }

    #[test]
    fn test_frontend_wire_layout() {
        let key = NatFrontendKey {
            addr: Ipv4Addr::new(10, 0, 0, 1),
            port: 80,
            protocol: Protocol::Tcp,
        };
        assert_eq!(key.to_wire(), [10, 0, 0, 1, 0, 80, 6, 0]);
        assert_eq!(NatFrontendKey::from_wire(&key.to_wire()).unwrap(), key);

        let value = NatFrontendValue {
            backend_count: 2,
            local_backend_count: 1,
            flags: ServiceFlags::NODE_PORT,
            affinity_secs: 30,
            ordinal: 7,
        };
        let wire = value.to_wire();
        assert_eq!(&wire[0..4], &2u32.to_be_bytes());
        assert_eq!(&wire[12..16], &30u32.to_be_bytes());
        assert_eq!(NatFrontendValue::from_wire(&wire).unwrap(), value);
    }

    #[test]
    fn test_program_service_writes_backends_then_frontend() {
        let maps = NatMaps::new();
        maps.program_service(&spec(2));

        let fe_key = NatFrontendKey {
            addr: Ipv4Addr::new(10, 0, 0, 1),
            port: 80,
            protocol: Protocol::Tcp,
        };
        let fe = maps.lookup_frontend(&fe_key).unwrap();
        assert_eq!(fe.backend_count, 2);
        assert_eq!(fe.local_backend_count, 1);
        for index in 0..2 {
            assert!(maps.lookup_backend(fe.ordinal, index).is_some());
        }
    }

    #[test]
    fn test_reprogram_shrinks_backend_block() {
        let maps = NatMaps::new();
        maps.program_service(&spec(3));
        maps.program_service(&spec(1));

        let fe_key = NatFrontendKey {
            addr: Ipv4Addr::new(10, 0, 0, 1),
            port: 80,
            protocol: Protocol::Tcp,
        };
        let fe = maps.lookup_frontend(&fe_key).unwrap();
        assert_eq!(fe.backend_count, 1);
        assert!(maps.lookup_backend(fe.ordinal, 0).is_some());
        assert!(maps.lookup_backend(fe.ordinal, 1).is_none());
        assert!(maps.lookup_backend(fe.ordinal, 2).is_none());
    }

    #[test]
    fn test_remove_service_clears_block_and_affinity() {
        let maps = NatMaps::new();
        maps.program_service(&spec(2));
        let fe_key = NatFrontendKey {
            addr: Ipv4Addr::new(10, 0, 0, 1),
            port: 80,
            protocol: Protocol::Tcp,
        };
        let ordinal = maps.lookup_frontend(&fe_key).unwrap().ordinal;
        maps.record_affinity(
            Ipv4Addr::new(1, 1, 1, 1),
            fe_key,
            NatBackendValue {
                addr: Ipv4Addr::new(8, 8, 8, 8),
                port: 666,
            },
            0,
        );

        maps.remove_service(&fe_key);
        assert!(maps.lookup_frontend(&fe_key).is_none());
        assert!(maps.lookup_backend(ordinal, 0).is_none());
        assert_eq!(maps.backend_len(), 0);
    }

    #[test]
    fn test_affinity_expires() {
        let maps = NatMaps::new();
        let fe_key = NatFrontendKey {
            addr: Ipv4Addr::new(10, 0, 0, 1),
            port: 80,
            protocol: Protocol::Tcp,
        };
        let backend = NatBackendValue {
            addr: Ipv4Addr::new(8, 8, 8, 8),
            port: 666,
        };
        maps.record_affinity(Ipv4Addr::new(1, 1, 1, 1), fe_key, backend, 0);

        let within = 20_000_000_000; // 20s
        let beyond = 40_000_000_000; // 40s
        assert_eq!(
            maps.lookup_affinity(Ipv4Addr::new(1, 1, 1, 1), fe_key, 30, within),
            Some(backend)
        );
        assert_eq!(
            maps.lookup_affinity(Ipv4Addr::new(1, 1, 1, 1), fe_key, 30, beyond),
            None
        );
    }

    #[test]
    fn test_flow_hash_deterministic_and_spread() {
        let base = ConntrackKey::new(
            Protocol::Tcp,
            Ipv4Addr::new(1, 1, 1, 1),
            54321,
            Ipv4Addr::new(10, 0, 0, 1),
            7890,
        );
        assert_eq!(flow_hash(&base), flow_hash(&base));

        // Varying the source port must reach both of two buckets.
        let mut seen = [false; 2];
        for port in 0..100u16 {
            let key = ConntrackKey::new(
                Protocol::Tcp,
                Ipv4Addr::new(1, 1, 1, 1),
                40000 + port,
                Ipv4Addr::new(10, 0, 0, 1),
                7890,
            );
            seen[(flow_hash(&key) % 2) as usize] = true;
        }
        assert!(seen[0] && seen[1]);
    }
}
