//! TCP header codec.
//!
//! A [`TcpHeader`] is what came off the wire and is never modified. To send a
//! segment, clone it into a [`TcpHeaderBuilder`], change the ports the NAT
//! decision allows, and serialize. Serialization always recomputes the
//! checksum from scratch.

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use std::fmt;
use std::io::Cursor;
use std::net::Ipv4Addr;

use crate::error::{NatError, Result};
use crate::net::checksum::tcp_checksum;

/// Size of a TCP header with no options.
pub const TCP_MIN_HEADER_LEN: usize = 20;

const CHECKSUM_OFFSET: usize = 16;
const RESERVED_MASK: u16 = 0x0FC0;

/// The six classic TCP control bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);
    pub const URG: TcpFlags = TcpFlags(0x20);

    const NAMED: [(TcpFlags, &'static str); 6] = [
        (TcpFlags::FIN, "FIN"),
        (TcpFlags::SYN, "SYN"),
        (TcpFlags::RST, "RST"),
        (TcpFlags::PSH, "PSH"),
        (TcpFlags::ACK, "ACK"),
        (TcpFlags::URG, "URG"),
    ];

    pub fn from_bits(bits: u8) -> Self {
        TcpFlags(bits & 0x3F)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMED
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", names.join("|"))
    }
}

/// A TCP header as received.
#[derive(Debug, Clone, PartialEq)]
pub struct TcpHeader {
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    data_offset: usize,
    flags: TcpFlags,
    // Reserved, NS, CWR and ECE bits; carried through untouched
    reserved: u16,
    window: u16,
    checksum: u16,
    urgent_ptr: u16,
    options: Option<Vec<u8>>,
}

impl TcpHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < TCP_MIN_HEADER_LEN {
            return Err(NatError::TruncatedBuffer {
                needed: TCP_MIN_HEADER_LEN,
                available: bytes.len(),
            });
        }

        let mut rdr = Cursor::new(bytes);
        let src_port = rdr.read_u16::<BigEndian>()?;
        let dst_port = rdr.read_u16::<BigEndian>()?;
        let seq = rdr.read_u32::<BigEndian>()?;
        let ack = rdr.read_u32::<BigEndian>()?;
        let offset_flags = rdr.read_u16::<BigEndian>()?;
        let window = rdr.read_u16::<BigEndian>()?;
        let checksum = rdr.read_u16::<BigEndian>()?;
        let urgent_ptr = rdr.read_u16::<BigEndian>()?;

        // Offset is in 32-bit words
        let data_offset = ((offset_flags >> 12) as usize) * 4;
        if data_offset < TCP_MIN_HEADER_LEN {
            return Err(NatError::InvalidHeaderLength(data_offset));
        }
        if data_offset > bytes.len() {
            return Err(NatError::TruncatedBuffer {
                needed: data_offset,
                available: bytes.len(),
            });
        }

        let options = (data_offset > TCP_MIN_HEADER_LEN)
            .then(|| bytes[TCP_MIN_HEADER_LEN..data_offset].to_vec());

        Ok(Self {
            src_port,
            dst_port,
            seq,
            ack,
            data_offset,
            flags: TcpFlags::from_bits(offset_flags as u8),
            reserved: offset_flags & RESERVED_MASK,
            window,
            checksum,
            urgent_ptr,
            options,
        })
    }

    pub fn src_port(&self) -> u16 {
        self.src_port
    }

    pub fn dst_port(&self) -> u16 {
        self.dst_port
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn ack(&self) -> u32 {
        self.ack
    }

    /// Header length in bytes, options included.
    pub fn data_offset(&self) -> usize {
        self.data_offset
    }

    pub fn flags(&self) -> TcpFlags {
        self.flags
    }

    pub fn window(&self) -> u16 {
        self.window
    }

    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    pub fn urgent_ptr(&self) -> u16 {
        self.urgent_ptr
    }

    pub fn options(&self) -> Option<&[u8]> {
        self.options.as_deref()
    }

    /// Starts a to-be-sent copy of this header.
    pub fn to_builder(&self) -> TcpHeaderBuilder {
        TcpHeaderBuilder {
            header: self.clone(),
        }
    }
}

impl fmt::Display for TcpHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "TCP header:")?;
        writeln!(f, "\tsource port: {}", self.src_port)?;
        writeln!(f, "\tdestination port: {}", self.dst_port)?;
        writeln!(f, "\tsequence number: {}", self.seq)?;
        writeln!(f, "\tack number: {}", self.ack)?;
        writeln!(f, "\tflags: {}", self.flags)?;
        writeln!(f, "\tdata offset: {}", self.data_offset)?;
        writeln!(f, "\twindow size: {}", self.window)?;
        writeln!(f, "\tchecksum: {:#06x}", self.checksum)?;
        if self.flags.contains(TcpFlags::URG) {
            writeln!(f, "\turgent pointer: {}", self.urgent_ptr)?;
        } else {
            writeln!(f, "\turgent pointer: URG flag not set")?;
        }
        write!(f, "\toptions: {}", if self.options.is_some() { "yes" } else { "no" })
    }
}

/// A TCP header on its way out. Only the ports can change.
#[derive(Debug, Clone, PartialEq)]
pub struct TcpHeaderBuilder {
    header: TcpHeader,
}

impl TcpHeaderBuilder {
    pub fn src_port(mut self, port: u16) -> Self {
        self.header.src_port = port;
        self
    }

    pub fn dst_port(mut self, port: u16) -> Self {
        self.header.dst_port = port;
        self
    }

    /// Writes the header in network byte order with a freshly computed
    /// checksum. The output is exactly `data_offset` bytes long.
    pub fn serialize(&self, src_ip: Ipv4Addr, dst_ip: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
        let h = &self.header;
        let offset_flags =
            ((h.data_offset as u16 / 4) << 12) | h.reserved | h.flags.bits() as u16;

        let mut fixed = [0u8; TCP_MIN_HEADER_LEN];
        BigEndian::write_u16(&mut fixed[0..2], h.src_port);
        BigEndian::write_u16(&mut fixed[2..4], h.dst_port);
        BigEndian::write_u32(&mut fixed[4..8], h.seq);
        BigEndian::write_u32(&mut fixed[8..12], h.ack);
        BigEndian::write_u16(&mut fixed[12..14], offset_flags);
        BigEndian::write_u16(&mut fixed[14..16], h.window);
        // checksum stays zero until computed below
        BigEndian::write_u16(&mut fixed[18..20], h.urgent_ptr);

        let mut wtr = Vec::with_capacity(h.data_offset);
        wtr.extend_from_slice(&fixed);
        if let Some(options) = &h.options {
            wtr.extend_from_slice(options);
        }

        let checksum = tcp_checksum(src_ip, dst_ip, &wtr, payload);
        wtr[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&checksum.to_be_bytes());
        wtr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::checksum::verify_tcp_checksum;
    use crate::net::ip::IpHeader;

    /// TLS record captured from 151.101.193.69:443 to 192.168.1.65:54008.
    const CAPTURED: &str = "450000e9fb3f40003c06283b9765c145c0a8014101bbd2f888309116a7a952c0\
        80180041168700000101080a2f5a73b5000d86e817030300b00db40f8e010c1d9c5ee8\
        cacdc71c52c02be70f5d8ee49206c2da02f882e4eecde8d0409ffe8e22be80685cb984\
        86d84efbfc04f8ea997b7a0f1b59e4e638bbdf6d36ef117362acfd3c383887e3da5184\
        ddd0853f16187763aa46c76a9da92542adddd6a4bfbd7b06689a2ed2aa564defa810a7\
        86eeda3ce20979d3197b6a3152cba1ef1f4477dde5cea5fae0fe541c35781340a4fcad\
        f9ae4ad4b4764810ece162b10a8e8927fdaca216d9e587fbf044";

    fn captured_packet() -> Vec<u8> {
        let hex: String = CAPTURED.split_whitespace().collect();
        (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn test_parse_captured_segment() {
        let packet = captured_packet();
        assert_eq!(packet.len(), 233);
        let ip = IpHeader::parse(&packet).unwrap();
        let tcp = TcpHeader::parse(&packet[ip.header_len..]).unwrap();

        assert_eq!(tcp.src_port(), 443);
        assert_eq!(tcp.dst_port(), 54008);
        assert_eq!(tcp.seq(), 0x88309116);
        assert_eq!(tcp.ack(), 0xa7a952c0);
        assert_eq!(tcp.data_offset(), 32);
        assert_eq!(tcp.flags(), TcpFlags::PSH | TcpFlags::ACK);
        assert_eq!(tcp.window(), 0x41);
        assert_eq!(tcp.checksum(), 0x1687);
        assert_eq!(tcp.urgent_ptr(), 0);
        assert_eq!(
            tcp.options(),
            Some(&[0x01, 0x01, 0x08, 0x0a, 0x2f, 0x5a, 0x73, 0xb5, 0x00, 0x0d, 0x86, 0xe8][..])
        );
    }

    #[test]
    fn test_serialize_reproduces_captured_checksum() {
        let packet = captured_packet();
        let ip = IpHeader::parse(&packet).unwrap();
        let segment = &packet[ip.payload_range(packet.len()).unwrap()];
        let tcp = TcpHeader::parse(segment).unwrap();
        let payload = &segment[tcp.data_offset()..];
        assert_eq!(payload.len(), 181);

        let bytes = tcp.to_builder().serialize(ip.src, ip.dst, payload);
        assert_eq!(bytes, &segment[..tcp.data_offset()]);
        assert!(verify_tcp_checksum(ip.src, ip.dst, segment));
    }

    #[test]
    fn test_rewritten_ports_keep_checksum_valid() {
        let packet = captured_packet();
        let ip = IpHeader::parse(&packet).unwrap();
        let segment = &packet[ip.header_len..];
        let tcp = TcpHeader::parse(segment).unwrap();
        let payload = &segment[tcp.data_offset()..];

        let src = Ipv4Addr::new(10, 1, 1, 1);
        let dst = Ipv4Addr::new(10, 2, 2, 2);
        let header = tcp
            .to_builder()
            .src_port(61000)
            .dst_port(8443)
            .serialize(src, dst, payload);

        assert_eq!(header.len(), 32);
        let reparsed = TcpHeader::parse(&header).unwrap();
        assert_eq!(reparsed.src_port(), 61000);
        assert_eq!(reparsed.dst_port(), 8443);
        assert_eq!(reparsed.seq(), tcp.seq());
        assert_eq!(reparsed.options(), tcp.options());

        let mut rebuilt = header.clone();
        rebuilt.extend_from_slice(payload);
        assert!(verify_tcp_checksum(src, dst, &rebuilt));
        // the received header is untouched
        assert_eq!(tcp.src_port(), 443);
    }

    #[test]
    fn test_serialize_matches_etherparse() {
        let src = Ipv4Addr::new(172, 16, 0, 1);
        let dst = Ipv4Addr::new(172, 16, 0, 2);
        let payload = [0xde, 0xad, 0xbe];

        let mut expected = etherparse::TcpHeader::new(1234, 4321, 99, 1024);
        expected.syn = true;
        expected.checksum = expected
            .calc_checksum_ipv4_raw(src.octets(), dst.octets(), &payload)
            .unwrap();
        let wire = expected.to_bytes();

        let tcp = TcpHeader::parse(&wire).unwrap();
        assert_eq!(tcp.to_builder().serialize(src, dst, &payload), &wire[..]);
    }

    #[test]
    fn test_truncated_and_bad_offsets() {
        let packet = captured_packet();
        let segment = &packet[20..];
        assert!(matches!(
            TcpHeader::parse(&segment[..10]),
            Err(NatError::TruncatedBuffer {
                needed: 20,
                available: 10
            })
        ));
        // declares 32 bytes of header
        assert!(matches!(
            TcpHeader::parse(&segment[..24]),
            Err(NatError::TruncatedBuffer { needed: 32, .. })
        ));

        let mut bad = segment[..20].to_vec();
        bad[12] = 0x40;
        assert!(matches!(
            TcpHeader::parse(&bad),
            Err(NatError::InvalidHeaderLength(16))
        ));
    }

    #[test]
    fn test_ecn_bits_survive_serialize() {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let mut wire = vec![
            0x04, 0xd2, 0x10, 0xe1, 0, 0, 0, 1, 0, 0, 0, 0, 0x51, 0xc2, 0x04, 0x00, 0, 0,
            0, 0,
        ];
        let sum = tcp_checksum(src, dst, &wire, &[]);
        wire[16..18].copy_from_slice(&sum.to_be_bytes());

        let tcp = TcpHeader::parse(&wire).unwrap();
        assert_eq!(tcp.flags(), TcpFlags::SYN);
        assert_eq!(tcp.to_builder().serialize(src, dst, &[]), wire);
    }

    #[test]
    fn test_flags_display() {
        assert_eq!((TcpFlags::SYN | TcpFlags::ACK).to_string(), "SYN|ACK");
        assert_eq!(TcpFlags::from_bits(0xFF).to_string(), "FIN|SYN|RST|PSH|ACK|URG");
        assert!(TcpFlags::from_bits(0x12).contains(TcpFlags::SYN));
        assert!(!TcpFlags::from_bits(0x12).contains(TcpFlags::FIN));
    }
}
