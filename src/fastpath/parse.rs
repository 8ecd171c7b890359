// # Packet Parsing
//
// Bounds-checked decomposition of an Ethernet frame into the fields
// the state machine needs. Offsets are fixed; every read is guarded
// by an explicit length check so a truncated frame surfaces as a
// typed outcome rather than a panic.

use std::net::Ipv4Addr;

use crate::maps::DropReason;
use crate::proto::Protocol;

pub const ETH_HEADER_LEN: usize = 14;
pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_IPIP: u8 = 4;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// Minimum frame that can carry an encapsulated packet: outer
/// Ethernet + IPv4 + UDP.
pub const MIN_UDP_FRAME: usize = ETH_HEADER_LEN + 20 + 8;

/// Early classification of a frame before the IPv4 walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2Class {
    Ipv4,
    Arp,
    Ipv6,
    Unknown(u16),
}

/// A fully decomposed IPv4 packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedPacket {
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub ihl: u8,
    pub total_len: u16,
    pub ttl: u8,
    pub protocol: Protocol,
    pub dont_fragment: bool,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    /// Offset of the L4 header within the frame.
    pub l4_offset: usize,
    pub src_port: u16,
    pub dst_port: u16,
    pub tcp_syn: bool,
    pub tcp_ack: bool,
    pub icmp_type: u8,
    pub icmp_code: u8,
}

impl ParsedPacket {
    pub fn has_ip_options(&self) -> bool {
        self.ihl > 5
    }

    pub fn ip_header_len(&self) -> usize {
        self.ihl as usize * 4
    }
}

pub fn classify_l2(frame: &[u8]) -> Result<L2Class, DropReason> {
    if frame.len() < ETH_HEADER_LEN {
        return Err(DropReason::Short);
    }
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    Ok(match ethertype {
        ETHERTYPE_IPV4 => L2Class::Ipv4,
        ETHERTYPE_ARP => L2Class::Arp,
        ETHERTYPE_IPV6 => L2Class::Ipv6,
        other => L2Class::Unknown(other),
    })
}

/// Parse the IPv4 and L4 headers. The caller has already classified
/// the frame as IPv4.
pub fn parse_ipv4(frame: &[u8]) -> Result<ParsedPacket, DropReason> {
    if frame.len() < ETH_HEADER_LEN + 20 {
        return Err(DropReason::Short);
    }
    let ip = &frame[ETH_HEADER_LEN..];

    let version = ip[0] >> 4;
    let ihl = ip[0] & 0x0f;
    if version != 4 || ihl < 5 {
        return Err(DropReason::Malformed);
    }
    let header_len = ihl as usize * 4;
    if ip.len() < header_len {
        return Err(DropReason::Short);
    }

    let total_len = u16::from_be_bytes([ip[2], ip[3]]);
    if (total_len as usize) < header_len || frame.len() < ETH_HEADER_LEN + total_len as usize {
        return Err(DropReason::Malformed);
    }

    let dont_fragment = ip[6] & 0x40 != 0;
    let ttl = ip[8];
    let protocol = Protocol::from_number(ip[9]);
    let src = Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]);
    let dst = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);

    let l4_offset = ETH_HEADER_LEN + header_len;
    let l4 = &frame[l4_offset..];

    let mut parsed = ParsedPacket {
        src_mac: frame[6..12].try_into().unwrap(),
        dst_mac: frame[0..6].try_into().unwrap(),
        ihl,
        total_len,
        ttl,
        protocol,
        dont_fragment,
        src,
        dst,
        l4_offset,
        src_port: 0,
        dst_port: 0,
        tcp_syn: false,
        tcp_ack: false,
        icmp_type: 0,
        icmp_code: 0,
    };

    match protocol {
        Protocol::Tcp => {
            if l4.len() < 20 {
                return Err(DropReason::Short);
            }
            parsed.src_port = u16::from_be_bytes([l4[0], l4[1]]);
            parsed.dst_port = u16::from_be_bytes([l4[2], l4[3]]);
            parsed.tcp_syn = l4[13] & 0x02 != 0;
            parsed.tcp_ack = l4[13] & 0x10 != 0;
        }
        Protocol::Udp => {
            if l4.len() < 8 {
                return Err(DropReason::Short);
            }
            parsed.src_port = u16::from_be_bytes([l4[0], l4[1]]);
            parsed.dst_port = u16::from_be_bytes([l4[2], l4[3]]);
        }
        Protocol::Icmp => {
            if l4.len() < 8 {
                return Err(DropReason::Short);
            }
            parsed.icmp_type = l4[0];
            parsed.icmp_code = l4[1];
        }
        _ => {}
    }

    Ok(parsed)
}

#[cfg(test)]
pub mod testutil {
    //! Frame builders shared by the fast-path tests.

    use super::*;

    pub struct FrameSpec {
        pub src_mac: [u8; 6],
        pub dst_mac: [u8; 6],
        pub src: Ipv4Addr,
        pub dst: Ipv4Addr,
        pub protocol: u8,
        pub src_port: u16,
        pub dst_port: u16,
        pub ttl: u8,
        pub dont_fragment: bool,
        pub tcp_flags: u8,
        pub payload_len: usize,
    }

    impl Default for FrameSpec {
        fn default() -> Self {
            Self {
                src_mac: [0x02, 0, 0, 0, 0, 0x01],
                dst_mac: [0x02, 0, 0, 0, 0, 0x02],
                src: Ipv4Addr::new(1, 1, 1, 1),
                dst: Ipv4Addr::new(2, 2, 2, 2),
                protocol: IPPROTO_TCP,
                src_port: 5000,
                dst_port: 80,
                ttl: 64,
                dont_fragment: false,
                tcp_flags: 0x02, // SYN
                payload_len: 0,
            }
        }
    }

    pub fn build_frame(spec: &FrameSpec) -> Vec<u8> {
        let l4_len = match spec.protocol {
            IPPROTO_TCP => 20,
            IPPROTO_UDP => 8,
            IPPROTO_ICMP => 8,
            _ => 0,
        };
        let total_len = 20 + l4_len + spec.payload_len;
        let mut frame = Vec::with_capacity(ETH_HEADER_LEN + total_len);

        frame.extend_from_slice(&spec.dst_mac);
        frame.extend_from_slice(&spec.src_mac);
        frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

        let mut ip = [0u8; 20];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        if spec.dont_fragment {
            ip[6] = 0x40;
        }
        ip[8] = spec.ttl;
        ip[9] = spec.protocol;
        ip[12..16].copy_from_slice(&spec.src.octets());
        ip[16..20].copy_from_slice(&spec.dst.octets());
        let csum = crate::fastpath::csum::checksum(&ip);
        ip[10..12].copy_from_slice(&csum.to_be_bytes());
        frame.extend_from_slice(&ip);

        match spec.protocol {
            IPPROTO_TCP => {
                let mut tcp = [0u8; 20];
                tcp[0..2].copy_from_slice(&spec.src_port.to_be_bytes());
                tcp[2..4].copy_from_slice(&spec.dst_port.to_be_bytes());
                tcp[12] = 5 << 4;
                tcp[13] = spec.tcp_flags;
                frame.extend_from_slice(&tcp);
            }
            IPPROTO_UDP => {
                let mut udp = [0u8; 8];
                udp[0..2].copy_from_slice(&spec.src_port.to_be_bytes());
                udp[2..4].copy_from_slice(&spec.dst_port.to_be_bytes());
                udp[4..6].copy_from_slice(&((8 + spec.payload_len) as u16).to_be_bytes());
                frame.extend_from_slice(&udp);
            }
            IPPROTO_ICMP => {
                frame.extend_from_slice(&[8, 0, 0, 0, 0, 0, 0, 0]);
            }
            _ => {}
        }
        frame.extend(std::iter::repeat(0xaa).take(spec.payload_len));
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{build_frame, FrameSpec};
    use super::*;

    #[test]
    fn test_classify_ethertypes() {
        let frame = build_frame(&FrameSpec::default());
        assert_eq!(classify_l2(&frame).unwrap(), L2Class::Ipv4);

        let mut arp = frame.clone();
        arp[12..14].copy_from_slice(&ETHERTYPE_ARP.to_be_bytes());
        assert_eq!(classify_l2(&arp).unwrap(), L2Class::Arp);

        let mut v6 = frame.clone();
        v6[12..14].copy_from_slice(&ETHERTYPE_IPV6.to_be_bytes());
        assert_eq!(classify_l2(&v6).unwrap(), L2Class::Ipv6);

        assert_eq!(classify_l2(&frame[..10]), Err(DropReason::Short));
    }

    #[test]
    fn test_parse_tcp_syn() {
        let frame = build_frame(&FrameSpec::default());
        let parsed = parse_ipv4(&frame).unwrap();
        assert_eq!(parsed.protocol, Protocol::Tcp);
        assert_eq!(parsed.src_port, 5000);
        assert_eq!(parsed.dst_port, 80);
        assert!(parsed.tcp_syn);
        assert!(!parsed.has_ip_options());
        assert_eq!(parsed.src, Ipv4Addr::new(1, 1, 1, 1));
    }

    #[test]
    fn test_parse_rejects_bad_ihl() {
        let mut frame = build_frame(&FrameSpec::default());
        frame[ETH_HEADER_LEN] = 0x44; // IHL = 4
        assert_eq!(parse_ipv4(&frame), Err(DropReason::Malformed));
    }

    #[test]
    fn test_parse_rejects_truncated_l4() {
        let frame = build_frame(&FrameSpec::default());
        let cut = &frame[..ETH_HEADER_LEN + 20 + 4];
        // Total length field now exceeds the buffer.
        assert_eq!(parse_ipv4(cut), Err(DropReason::Malformed));
    }

    #[test]
    fn test_parse_udp_and_icmp() {
        let udp = build_frame(&FrameSpec {
            protocol: IPPROTO_UDP,
            src_port: 4789,
            dst_port: 53,
            ..Default::default()
        });
        let parsed = parse_ipv4(&udp).unwrap();
        assert_eq!(parsed.protocol, Protocol::Udp);
        assert_eq!(parsed.src_port, 4789);

        let icmp = build_frame(&FrameSpec {
            protocol: IPPROTO_ICMP,
            ..Default::default()
        });
        let parsed = parse_ipv4(&icmp).unwrap();
        assert_eq!(parsed.protocol, Protocol::Icmp);
        assert_eq!(parsed.icmp_type, 8);
    }
}
