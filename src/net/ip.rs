use byteorder::{BigEndian, ReadBytesExt};
use std::fmt;
use std::io::{Cursor, Read};
use std::net::Ipv4Addr;
use std::ops::Range;

use crate::error::{NatError, Result};

/// Size of an IPv4 header with no options.
pub const IPV4_MIN_HEADER_LEN: usize = 20;

/// The 3-bit flags field of an IPv4 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IpFlags(u8);

impl IpFlags {
    /// More fragments
    pub const MF: IpFlags = IpFlags(0b001);
    /// Don't fragment
    pub const DF: IpFlags = IpFlags(0b010);
    pub const RESERVED: IpFlags = IpFlags(0b100);

    const NAMED: [(IpFlags, &'static str); 3] = [
        (IpFlags::MF, "MF"),
        (IpFlags::DF, "DF"),
        (IpFlags::RESERVED, "RESERVED"),
    ];

    pub fn from_bits(bits: u8) -> Self {
        IpFlags(bits & 0b111)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: IpFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl fmt::Display for IpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMED
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", names.join("|"))
    }
}

/// A parsed IPv4 header. The forwarder only reads it.
#[derive(Debug, Clone, PartialEq)]
pub struct IpHeader {
    pub version: u8,
    /// Header length in bytes (IHL * 4)
    pub header_len: usize,
    pub service_type: u8,
    pub total_len: u16,
    pub identification: u16,
    pub flags: IpFlags,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    // As received; never verified
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub options: Option<Vec<u8>>,
}

impl IpHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < IPV4_MIN_HEADER_LEN {
            return Err(NatError::TruncatedBuffer {
                needed: IPV4_MIN_HEADER_LEN,
                available: bytes.len(),
            });
        }

        let mut rdr = Cursor::new(bytes);
        let version_ihl = rdr.read_u8()?;
        let service_type = rdr.read_u8()?;
        let total_len = rdr.read_u16::<BigEndian>()?;
        let identification = rdr.read_u16::<BigEndian>()?;
        let flags_fragment_offset = rdr.read_u16::<BigEndian>()?;
        let ttl = rdr.read_u8()?;
        let protocol = rdr.read_u8()?;
        let checksum = rdr.read_u16::<BigEndian>()?;
        let mut src = [0u8; 4];
        rdr.read_exact(&mut src)?;
        let mut dst = [0u8; 4];
        rdr.read_exact(&mut dst)?;

        let version = version_ihl >> 4;
        let header_len = (version_ihl & 0x0F) as usize * 4;
        if header_len < IPV4_MIN_HEADER_LEN {
            return Err(NatError::InvalidHeaderLength(header_len));
        }
        if header_len > bytes.len() {
            return Err(NatError::TruncatedBuffer {
                needed: header_len,
                available: bytes.len(),
            });
        }

        let options = (header_len > IPV4_MIN_HEADER_LEN)
            .then(|| bytes[IPV4_MIN_HEADER_LEN..header_len].to_vec());

        Ok(Self {
            version,
            header_len,
            service_type,
            total_len,
            identification,
            flags: IpFlags::from_bits((flags_fragment_offset >> 13) as u8),
            fragment_offset: flags_fragment_offset & 0x1FFF,
            ttl,
            protocol,
            checksum,
            src: Ipv4Addr::from(src),
            dst: Ipv4Addr::from(dst),
            options,
        })
    }

    /// Byte range of the IP payload inside a buffer of `buf_len` bytes.
    ///
    /// Bytes past `total_len` (link-layer padding) are not part of the
    /// payload.
    pub fn payload_range(&self, buf_len: usize) -> Result<Range<usize>> {
        let total_len = self.total_len as usize;
        if total_len < self.header_len {
            return Err(NatError::InvalidHeaderLength(total_len));
        }
        if total_len > buf_len {
            return Err(NatError::TruncatedBuffer {
                needed: total_len,
                available: buf_len,
            });
        }
        Ok(self.header_len..total_len)
    }
}

impl fmt::Display for IpHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "IP header:")?;
        writeln!(f, "\tversion: {}", self.version)?;
        writeln!(f, "\theader length: {}", self.header_len)?;
        writeln!(f, "\tservice type: {}", self.service_type)?;
        writeln!(f, "\ttotal length: {}", self.total_len)?;
        writeln!(f, "\tidentification: {}", self.identification)?;
        writeln!(f, "\tflags: {}", self.flags)?;
        if self.flags.contains(IpFlags::MF) {
            writeln!(f, "\tfragment offset: {}", self.fragment_offset)?;
        } else {
            writeln!(f, "\tfragment offset: MF flag not set")?;
        }
        writeln!(f, "\tTTL: {}", self.ttl)?;
        writeln!(f, "\tprotocol: {}", self.protocol)?;
        writeln!(f, "\theader checksum: {:#06x}", self.checksum)?;
        writeln!(f, "\tsource: {}", self.src)?;
        writeln!(f, "\tdestination: {}", self.dst)?;
        write!(
            f,
            "\toptions: {}",
            if self.options.is_some() { "yes" } else { "no" }
        )
    }
}
