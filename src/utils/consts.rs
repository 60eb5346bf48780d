use std::ops::RangeInclusive;

/// Log level (can be overridden by RUST_LOG)
pub const LOG_LEVEL: &str = "info";

/// Forwarding rule file used when none is given
pub const DEFAULT_RULES_FILE: &str = "forward.json";

// ============================================================================
// NAT
// ============================================================================

/// Dynamic/private ports used when a source port collides
pub const DYNAMIC_PORT_RANGE: RangeInclusive<u16> = 49152..=65535;

/// Random draws before a packet is dropped for port exhaustion
pub const MAX_PORT_ATTEMPTS: usize = 4096;

// ============================================================================
// Transport
// ============================================================================

/// Largest IPv4 datagram
pub const RECV_BUFFER_SIZE: usize = 65535;

/// How long a receive blocks before the running flag is checked again
pub const RECV_POLL_INTERVAL_MS: u64 = 500;

/// Port a UDP socket is connected to when looking up a route (discard)
pub const ROUTE_PROBE_PORT: u16 = 9;
