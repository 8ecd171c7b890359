// # VXLAN Encap / Decap
//
// UDP encapsulation compatible with peer nodes: outer Ethernet +
// IPv4 + UDP + 8-byte VXLAN header carrying the VNI, then the inner
// frame unchanged. The outer UDP checksum is zero (legal for IPv4
// VXLAN) so decap never recomputes it.

use std::net::Ipv4Addr;

use crate::fastpath::csum;
use crate::fastpath::parse::{ETHERTYPE_IPV4, ETH_HEADER_LEN, IPPROTO_UDP};
use crate::maps::DropReason;

pub const VXLAN_HEADER_LEN: usize = 8;
pub const OUTER_OVERHEAD: usize = ETH_HEADER_LEN + 20 + 8 + VXLAN_HEADER_LEN;

/// VXLAN "valid VNI" flag.
const VXLAN_FLAGS: u8 = 0x08;

pub struct EncapParams {
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub vni: u32,
    pub ttl: u8,
}

/// Wrap `inner` (a complete Ethernet frame) in a VXLAN envelope.
pub fn encap(inner: &[u8], params: &EncapParams) -> Vec<u8> {
    let udp_len = 8 + VXLAN_HEADER_LEN + inner.len();
    let ip_total = 20 + udp_len;
    let mut frame = Vec::with_capacity(ETH_HEADER_LEN + ip_total);

    frame.extend_from_slice(&params.dst_mac);
    frame.extend_from_slice(&params.src_mac);
    frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

    let mut ip = [0u8; 20];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&(ip_total as u16).to_be_bytes());
    ip[6] = 0x40; // DF: we handle MTU with ICMP, never fragment
    ip[8] = params.ttl;
    ip[9] = IPPROTO_UDP;
    ip[12..16].copy_from_slice(&params.src_ip.octets());
    ip[16..20].copy_from_slice(&params.dst_ip.octets());
    let ip_csum = csum::checksum(&ip);
    ip[10..12].copy_from_slice(&ip_csum.to_be_bytes());
    frame.extend_from_slice(&ip);

    let mut udp = [0u8; 8];
    udp[0..2].copy_from_slice(&params.src_port.to_be_bytes());
    udp[2..4].copy_from_slice(&params.dst_port.to_be_bytes());
    udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    frame.extend_from_slice(&udp);

    let mut vxlan = [0u8; VXLAN_HEADER_LEN];
    vxlan[0] = VXLAN_FLAGS;
    vxlan[4..8].copy_from_slice(&(params.vni << 8).to_be_bytes());
    frame.extend_from_slice(&vxlan);

    frame.extend_from_slice(inner);
    frame
}

/// The decapsulated inner frame plus outer addressing.
#[derive(Debug)]
pub struct Decapped {
    pub inner: Vec<u8>,
    pub outer_src: Ipv4Addr,
    pub vni: u32,
}

/// Unwrap a VXLAN envelope. The caller has already matched the UDP
/// destination port.
pub fn decap(frame: &[u8]) -> Result<Decapped, DropReason> {
    if frame.len() < OUTER_OVERHEAD + ETH_HEADER_LEN {
        return Err(DropReason::Short);
    }
    let ip = &frame[ETH_HEADER_LEN..];
    if ip[0] != 0x45 || ip[9] != IPPROTO_UDP {
        return Err(DropReason::Malformed);
    }
    let vxlan_off = ETH_HEADER_LEN + 20 + 8;
    let vxlan = &frame[vxlan_off..vxlan_off + VXLAN_HEADER_LEN];
    if vxlan[0] & VXLAN_FLAGS == 0 {
        return Err(DropReason::Malformed);
    }
    let vni = u32::from_be_bytes(vxlan[4..8].try_into().unwrap()) >> 8;

    Ok(Decapped {
        inner: frame[OUTER_OVERHEAD..].to_vec(),
        outer_src: Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]),
        vni,
    })
}
