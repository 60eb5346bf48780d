pub mod checksum;
pub mod forwarder;
pub mod ip;
pub mod nat;
pub mod pcap_utils;
pub mod rules;
pub mod tcp;
pub mod transport;

/// IP protocol number of TCP.
pub const IPPROTO_TCP: u8 = 6;

/// Transport protocol of an IP datagram, as far as the forwarder cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Other(u8),
}

impl From<u8> for Protocol {
    fn from(value: u8) -> Self {
        match value {
            IPPROTO_TCP => Protocol::Tcp,
            other => Protocol::Other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_from_number() {
        assert_eq!(Protocol::from(6), Protocol::Tcp);
        assert_eq!(Protocol::from(17), Protocol::Other(17));
    }
}
