//! Error types for the forwarder.

use std::io;
use std::net::Ipv4Addr;

use thiserror::Error;

/// Result type alias for forwarder operations.
pub type Result<T> = std::result::Result<T, NatError>;

/// Errors that can occur while parsing, translating or moving packets.
#[derive(Debug, Error)]
pub enum NatError {
    /// A header claims more bytes than the buffer holds.
    #[error("truncated buffer: need {needed} bytes, have {available}")]
    TruncatedBuffer { needed: usize, available: usize },

    /// Header length field below the 20-byte minimum, or an IP total
    /// length shorter than its own header.
    #[error("invalid header length: {0} bytes")]
    InvalidHeaderLength(usize),

    /// Forwarding rule file could not be accepted.
    #[error("malformed forwarding rule: {0}")]
    MalformedRule(String),

    /// No free external port was found against a destination.
    #[error("no free external port towards {destination} after {attempts} attempts")]
    PortExhaustion {
        destination: Ipv4Addr,
        attempts: usize,
    },

    /// I/O error from the transport.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The transport has no more packets to deliver.
    #[error("transport closed")]
    TransportClosed,

    /// Capture file error.
    #[error("capture error: {0}")]
    Capture(#[from] pcap::Error),
}

impl NatError {
    /// Whether the error means the transport itself is unusable and the
    /// receive loop must stop.
    pub fn is_fatal(&self) -> bool {
        match self {
            NatError::TransportClosed | NatError::Capture(_) => true,
            NatError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::PermissionDenied
            ),
            _ => false,
        }
    }
}
