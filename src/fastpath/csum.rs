// # Checksum Arithmetic
//
// Internet checksum plus the incremental updates (RFC 1624) used
// when rewriting addresses and ports in place. L4 checksums cover a
// pseudo-header, so an address rewrite fixes both the IP and the
// TCP/UDP checksum with the same delta.

/// One's-complement sum folded to 16 bits, complemented.
pub fn checksum(data: &[u8]) -> u16 {
    !fold(sum(data))
}

fn sum(data: &[u8]) -> u32 {
    let mut acc = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        acc = acc.wrapping_add(u16::from_be_bytes([chunk[0], chunk[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        acc = acc.wrapping_add((*last as u32) << 8);
    }
    acc
}

fn fold(mut acc: u32) -> u16 {
    while acc > 0xffff {
        acc = (acc & 0xffff) + (acc >> 16);
    }
    acc as u16
}

/// HC' = ~(~HC + ~m + m') for a 16-bit field change.
pub fn update_u16(old_csum: u16, old: u16, new: u16) -> u16 {
    let acc = (!old_csum as u32)
        .wrapping_add(!old as u16 as u32)
        .wrapping_add(new as u32);
    !fold(acc)
}

/// Incremental update for a 32-bit field change (e.g. an address).
pub fn update_u32(old_csum: u16, old: u32, new: u32) -> u16 {
    let csum = update_u16(old_csum, (old >> 16) as u16, (new >> 16) as u16);
    update_u16(csum, old as u16, new as u16)
}

/// Verify a buffer whose checksum field is already in place.
pub fn verify(data: &[u8]) -> bool {
    fold(sum(data)) == 0xffff
}
