//! Offline capture reading, used to replay recorded traffic through the
//! forwarder without touching the network.

use etherparse::{EtherType, Ethernet2Header};
use pcap::{Capture, Linktype, Offline};
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::{debug, info, trace};

use crate::error::{NatError, Result};
use crate::net::transport::{Datagram, Transport, route_source};

/// Opens a capture file.
pub fn open_offline<P: AsRef<Path>>(path: P) -> Result<Capture<Offline>> {
    let cap = Capture::from_file(path.as_ref())?;
    info!(
        "Capture {} opened (link type {:?})",
        path.as_ref().display(),
        cap.get_datalink()
    );
    Ok(cap)
}

/// Returns the IPv4 packet carried by a captured frame, if any.
pub fn strip_link_layer(linktype: Linktype, frame: &[u8]) -> Option<&[u8]> {
    if linktype == Linktype::ETHERNET {
        let (eth, rest) = Ethernet2Header::from_slice(frame).ok()?;
        (eth.ether_type == EtherType::IPV4).then_some(rest)
    } else if linktype == Linktype::RAW || linktype == Linktype::IPV4 {
        // Raw IP may also carry IPv6
        (frame.first()? >> 4 == 4).then_some(frame)
    } else {
        None
    }
}

/// Transport that reads datagrams from a capture file and records what
/// the forwarder sends instead of emitting it.
pub struct PcapReplayTransport {
    capture: Capture<Offline>,
    linktype: Linktype,
    sent: Vec<(Vec<u8>, Ipv4Addr)>,
}

impl PcapReplayTransport {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let capture = open_offline(path)?;
        let linktype = capture.get_datalink();
        Ok(Self {
            capture,
            linktype,
            sent: Vec::new(),
        })
    }

    /// Segments handed to `send`, with their destinations.
    pub fn sent(&self) -> &[(Vec<u8>, Ipv4Addr)] {
        &self.sent
    }
}

impl Transport for PcapReplayTransport {
    fn receive(&mut self) -> Result<Option<Datagram>> {
        loop {
            match self.capture.next_packet() {
                Ok(packet) => match strip_link_layer(self.linktype, packet.data) {
                    Some(ip) => return Ok(Some(Datagram::from_ip_packet(ip.to_vec()))),
                    None => trace!("Skipping non-IPv4 frame ({} bytes)", packet.data.len()),
                },
                Err(pcap::Error::NoMorePackets) => return Err(NatError::TransportClosed),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn send(&mut self, segment: &[u8], destination: Ipv4Addr) -> Result<()> {
        debug!("Replay: {} byte segment to {}", segment.len(), destination);
        self.sent.push((segment.to_vec(), destination));
        Ok(())
    }

    /// Replayed segments are checksummed as if this host sent them live.
    fn source_for(&mut self, destination: Ipv4Addr) -> Result<Ipv4Addr> {
        route_source(destination)
    }
}
