// # Synthesized ICMP Replies
//
// The fast path never signals errors upward; when a flow cannot
// proceed it answers the sender directly: port-unreachable for a
// backendless service, fragmentation-needed for oversize DF packets
// on an encapped path, time-exceeded for expiring TTLs. Replies
// carry the original IP header plus eight payload bytes, per
// convention.

use std::net::Ipv4Addr;

use crate::fastpath::csum;
use crate::fastpath::parse::{ParsedPacket, ETHERTYPE_IPV4, ETH_HEADER_LEN, IPPROTO_ICMP};

pub const ICMP_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_TIME_EXCEEDED: u8 = 11;

pub const CODE_PORT_UNREACHABLE: u8 = 3;
pub const CODE_FRAG_NEEDED: u8 = 4;
pub const CODE_TTL_EXCEEDED: u8 = 0;

/// Build an ICMP error frame answering `orig`. `reply_src` is the
/// address this node answers from. For fragmentation-needed, `mtu`
/// carries the tunnel MTU in the unused field.
pub fn synth_reply(
    orig_frame: &[u8],
    orig: &ParsedPacket,
    reply_src: Ipv4Addr,
    icmp_type: u8,
    icmp_code: u8,
    mtu: u16,
) -> Vec<u8> {
    // Quoted data: original IP header + 8 bytes of L4.
    let quote_start = ETH_HEADER_LEN;
    let quote_len = (orig.ip_header_len() + 8).min(orig_frame.len() - ETH_HEADER_LEN);
    let quote = &orig_frame[quote_start..quote_start + quote_len];

    let icmp_len = 8 + quote.len();
    let ip_total = 20 + icmp_len;
    let mut frame = Vec::with_capacity(ETH_HEADER_LEN + ip_total);

    // Ethernet: swap the original MACs.
    frame.extend_from_slice(&orig.src_mac);
    frame.extend_from_slice(&orig.dst_mac);
    frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

    let mut ip = [0u8; 20];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&(ip_total as u16).to_be_bytes());
    ip[8] = 64;
    ip[9] = IPPROTO_ICMP;
    ip[12..16].copy_from_slice(&reply_src.octets());
    ip[16..20].copy_from_slice(&orig.src.octets());
    let ip_csum = csum::checksum(&ip);
    ip[10..12].copy_from_slice(&ip_csum.to_be_bytes());
    frame.extend_from_slice(&ip);

    let mut icmp = vec![0u8; 8];
    icmp[0] = icmp_type;
    icmp[1] = icmp_code;
    // Frag-needed carries the next-hop MTU in the second word.
    icmp[6..8].copy_from_slice(&mtu.to_be_bytes());
    icmp.extend_from_slice(quote);
    let icmp_csum = csum::checksum(&icmp);
    icmp[2..4].copy_from_slice(&icmp_csum.to_be_bytes());
    frame.extend_from_slice(&icmp);

    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fastpath::parse::testutil::{build_frame, FrameSpec};
    use crate::fastpath::parse::parse_ipv4;

    #[test]
    fn test_port_unreachable_addressing() {
        let orig_frame = build_frame(&FrameSpec::default());
        let orig = parse_ipv4(&orig_frame).unwrap();
        let reply = synth_reply(
            &orig_frame,
            &orig,
            Ipv4Addr::new(10, 0, 0, 1),
            ICMP_DEST_UNREACHABLE,
            CODE_PORT_UNREACHABLE,
            0,
        );

        let parsed = parse_ipv4(&reply).unwrap();
        assert_eq!(parsed.protocol, crate::proto::Protocol::Icmp);
        assert_eq!(parsed.icmp_type, ICMP_DEST_UNREACHABLE);
        assert_eq!(parsed.icmp_code, CODE_PORT_UNREACHABLE);
        assert_eq!(parsed.src, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(parsed.dst, Ipv4Addr::new(1, 1, 1, 1));
        // MACs swapped relative to the original frame.
        assert_eq!(parsed.dst_mac, orig.src_mac);
    }

    #[test]
    fn test_frag_needed_carries_mtu() {
        let orig_frame = build_frame(&FrameSpec {
            dont_fragment: true,
            payload_len: 1400,
            ..Default::default()
        });
        let orig = parse_ipv4(&orig_frame).unwrap();
        let reply = synth_reply(
            &orig_frame,
            &orig,
            Ipv4Addr::new(10, 0, 0, 1),
            ICMP_DEST_UNREACHABLE,
            CODE_FRAG_NEEDED,
            1450,
        );

        let icmp = &reply[ETH_HEADER_LEN + 20..];
        assert_eq!(u16::from_be_bytes([icmp[6], icmp[7]]), 1450);
        // Quoted data starts with the original IP header.
        assert_eq!(&icmp[8..10], &orig_frame[ETH_HEADER_LEN..ETH_HEADER_LEN + 2]);
        assert!(csum::verify(icmp));
    }

    #[test]
    fn test_time_exceeded_checksum() {
        let orig_frame = build_frame(&FrameSpec {
            ttl: 1,
            ..Default::default()
        });
        let orig = parse_ipv4(&orig_frame).unwrap();
        let reply = synth_reply(
            &orig_frame,
            &orig,
            Ipv4Addr::new(10, 0, 0, 1),
            ICMP_TIME_EXCEEDED,
            CODE_TTL_EXCEEDED,
            0,
        );
        assert!(csum::verify(&reply[ETH_HEADER_LEN + 20..]));
    }
}
