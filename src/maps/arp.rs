// # ARP Map
//
// MAC addresses for encap next-hops, populated on encap and consumed
// when forwarding replies.
//
// Wire layout:
//   key   (8B): addr 4 | ifindex 4
//   value (12B): dst MAC 6 | src MAC 6

use std::net::Ipv4Addr;

use crate::error::{DpError, Result};
use crate::maps::{MapHandle, ReadHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArpKey {
    pub addr: Ipv4Addr,
    pub ifindex: u32,
}

impl ArpKey {
    pub const WIRE_SIZE: usize = 8;

    pub fn to_wire(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.addr.octets());
        buf[4..8].copy_from_slice(&self.ifindex.to_be_bytes());
        buf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpValue {
    pub dst_mac: [u8; 6],
    pub src_mac: [u8; 6],
}

impl ArpValue {
    pub const WIRE_SIZE: usize = 12;

    pub fn to_wire(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..6].copy_from_slice(&self.dst_mac);
        buf[6..12].copy_from_slice(&self.src_mac);
        buf
    }

    pub fn from_wire(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::WIRE_SIZE {
            return Err(DpError::MapLayout(format!(
                "ARP value must be {} bytes, got {}",
                Self::WIRE_SIZE,
                buf.len()
            )));
        }
        Ok(Self {
            dst_mac: buf[0..6].try_into().unwrap(),
            src_mac: buf[6..12].try_into().unwrap(),
        })
    }
}

pub type ArpMap = MapHandle<ArpKey, ArpValue>;

/// Read-only ARP view given to reply forwarding.
pub type ArpReader = ReadHandle<ArpKey, ArpValue>;
