//! Internet checksum (RFC 1071) and the TCP pseudo-header variant.

use byteorder::{ByteOrder, NetworkEndian};
use std::net::Ipv4Addr;

use crate::net::IPPROTO_TCP;

/// Sums the 16-bit words of `data` read in byte order `B`.
///
/// A trailing odd byte is added as its own term, read as the word
/// `[byte, 0]` in the same order.
pub fn word_sum<B: ByteOrder>(data: &[u8]) -> u32 {
    let mut sum = 0u32;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            B::read_u16(chunk)
        } else {
            B::read_u16(&[chunk[0], 0])
        };
        sum += word as u32;
    }
    sum
}

/// Folds carries back into the low 16 bits and returns the one's
/// complement.
pub fn fold_and_complement(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Word sum of the IPv4 pseudo-header for a TCP segment of `segment_len`
/// bytes.
fn pseudo_header_sum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, segment_len: usize) -> u32 {
    let mut sum = word_sum::<NetworkEndian>(&src_ip.octets());
    sum += word_sum::<NetworkEndian>(&dst_ip.octets());
    // zero byte followed by the protocol number
    sum += IPPROTO_TCP as u32;
    sum += segment_len as u32;
    sum
}

/// Computes the TCP checksum of `header` (checksum field zeroed) and
/// `payload` between `src_ip` and `dst_ip`.
pub fn tcp_checksum(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    header: &[u8],
    payload: &[u8],
) -> u16 {
    let mut segment = Vec::with_capacity(header.len() + payload.len());
    segment.extend_from_slice(header);
    segment.extend_from_slice(payload);

    let sum = pseudo_header_sum(src_ip, dst_ip, segment.len())
        + word_sum::<NetworkEndian>(&segment);
    fold_and_complement(sum)
}

/// True when `segment` (header with its checksum, plus payload) carries a
/// valid TCP checksum.
pub fn verify_tcp_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, segment: &[u8]) -> bool {
    let sum = pseudo_header_sum(src_ip, dst_ip, segment.len())
        + word_sum::<NetworkEndian>(segment);
    fold_and_complement(sum) == 0
}
