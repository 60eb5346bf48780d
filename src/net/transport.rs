//! Packet transports the forwarder reads from and writes to.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashMap;
use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::Result;
use crate::utils::consts::{RECV_BUFFER_SIZE, RECV_POLL_INTERVAL_MS, ROUTE_PROBE_PORT};

/// One IP datagram, IP header included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub bytes: Vec<u8>,
    pub source: Ipv4Addr,
}

impl Datagram {
    /// Wraps a raw IPv4 packet, taking the source from its header.
    pub fn from_ip_packet(bytes: Vec<u8>) -> Self {
        let source = match bytes.get(12..16) {
            Some(octets) => Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]),
            None => Ipv4Addr::UNSPECIFIED,
        };
        Self { bytes, source }
    }
}

/// Receive/send capability used by the forwarding loop.
pub trait Transport {
    /// Blocks for the next datagram. `Ok(None)` means nothing arrived within
    /// the poll interval.
    fn receive(&mut self) -> Result<Option<Datagram>>;

    /// Sends a TCP segment (header and payload, no IP header) to
    /// `destination`.
    fn send(&mut self, segment: &[u8], destination: Ipv4Addr) -> Result<()>;

    /// Address the IP layer will put in the source field of segments sent to
    /// `destination`. Checksums must be computed against it.
    fn source_for(&mut self, destination: Ipv4Addr) -> Result<Ipv4Addr>;
}

/// Asks the routing table which local address reaches `destination`.
///
/// Connecting a UDP socket selects a route without sending anything.
pub fn route_source(destination: Ipv4Addr) -> Result<Ipv4Addr> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    socket.connect(&SockAddr::from(SocketAddrV4::new(destination, ROUTE_PROBE_PORT)))?;
    match socket.local_addr()?.as_socket_ipv4() {
        Some(local) => Ok(*local.ip()),
        None => Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no IPv4 route to {}", destination),
        )
        .into()),
    }
}

/// `AF_INET`/`SOCK_RAW`/`IPPROTO_TCP` socket.
///
/// Received datagrams include the IP header. Sent segments do not; the
/// kernel builds the IP header.
pub struct RawSocketTransport {
    socket: Socket,
    buf: Vec<u8>,
    /// destination -> local source address
    sources: HashMap<Ipv4Addr, Ipv4Addr>,
}

impl RawSocketTransport {
    pub fn open() -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::TCP))?;
        socket.set_read_timeout(Some(Duration::from_millis(RECV_POLL_INTERVAL_MS)))?;
        info!("Raw TCP socket opened");
        Ok(Self {
            socket,
            buf: vec![0u8; RECV_BUFFER_SIZE],
            sources: HashMap::new(),
        })
    }
}

impl Transport for RawSocketTransport {
    fn receive(&mut self) -> Result<Option<Datagram>> {
        match self.socket.read(&mut self.buf) {
            Ok(0) => Ok(None),
            Ok(len) => Ok(Some(Datagram::from_ip_packet(self.buf[..len].to_vec()))),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn send(&mut self, segment: &[u8], destination: Ipv4Addr) -> Result<()> {
        let addr = SockAddr::from(SocketAddrV4::new(destination, 0));
        let sent = self.socket.send_to(segment, &addr)?;
        if sent != segment.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short send: {} of {} bytes", sent, segment.len()),
            )
            .into());
        }
        Ok(())
    }

    fn source_for(&mut self, destination: Ipv4Addr) -> Result<Ipv4Addr> {
        if let Some(source) = self.sources.get(&destination) {
            return Ok(*source);
        }
        let source = route_source(destination)?;
        debug!("Segments to {} leave from {}", destination, source);
        self.sources.insert(destination, source);
        Ok(source)
    }
}
