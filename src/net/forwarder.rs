//! The receive, translate, rewrite and send loop.

use rand::Rng;
use rand::rngs::StdRng;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, trace, warn};

use crate::error::{NatError, Result};
use crate::net::Protocol;
use crate::net::ip::IpHeader;
use crate::net::nat::{NatKey, NatTable, Translation};
use crate::net::rules::{ForwardTarget, ForwardingRules};
use crate::net::tcp::TcpHeader;
use crate::net::transport::Transport;

/// What happened to one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Forwarded to a rule target with a translated source port.
    Outbound {
        internal: NatKey,
        external_port: u16,
        target: ForwardTarget,
    },
    /// Reply delivered back to an internal endpoint.
    Inbound { internal: NatKey },
    /// TCP traffic of no tracked flow; dropped.
    Untracked,
    /// Not IPv4/TCP; dropped.
    Ignored,
}

/// Packet counters for one forwarder run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwarderStats {
    pub received: u64,
    pub outbound: u64,
    pub inbound: u64,
    pub untracked: u64,
    pub ignored: u64,
    pub malformed: u64,
    pub exhausted: u64,
    pub send_failures: u64,
}

/// Owns the NAT state and drives packets through it one at a time.
pub struct Forwarder<T: Transport, R: Rng = StdRng> {
    transport: T,
    rules: ForwardingRules,
    nat: NatTable<R>,
    /// Pseudo-header source for rewritten segments; when unset the
    /// transport reports the address it sends from
    source_ip: Option<Ipv4Addr>,
    stats: ForwarderStats,
}

impl<T: Transport> Forwarder<T> {
    pub fn new(transport: T, rules: ForwardingRules) -> Self {
        Self::with_nat_table(transport, rules, NatTable::new())
    }
}

impl<T: Transport, R: Rng> Forwarder<T, R> {
    pub fn with_nat_table(transport: T, rules: ForwardingRules, nat: NatTable<R>) -> Self {
        Self {
            transport,
            rules,
            nat,
            source_ip: None,
            stats: ForwarderStats::default(),
        }
    }

    pub fn with_source_ip(mut self, source_ip: Option<Ipv4Addr>) -> Self {
        self.source_ip = source_ip;
        self
    }

    pub fn nat_table(&self) -> &NatTable<R> {
        &self.nat
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn stats(&self) -> ForwarderStats {
        self.stats
    }

    /// Parses, translates and re-emits a single IP datagram.
    ///
    /// Parse errors are returned before the NAT table is consulted, so a
    /// malformed packet never creates a flow.
    pub fn handle_packet(&mut self, packet: &[u8]) -> Result<Disposition> {
        let ip = IpHeader::parse(packet)?;
        let protocol = Protocol::from(ip.protocol);
        if ip.version != 4 || protocol != Protocol::Tcp {
            trace!("Ignoring {:?} packet (IP version {})", protocol, ip.version);
            return Ok(Disposition::Ignored);
        }

        let segment = &packet[ip.payload_range(packet.len())?];
        let tcp = TcpHeader::parse(segment)?;
        let payload = &segment[tcp.data_offset()..];
        trace!("{}", ip);
        trace!("{}", tcp);

        let src = NatKey::new(ip.src, tcp.src_port());
        let dst = NatKey::new(ip.dst, tcp.dst_port());

        match self.nat.translate(&self.rules, src, dst)? {
            Translation::Outbound {
                external_port,
                target,
            } => {
                let local_ip = self.local_ip_for(target.ip)?;
                let header = tcp
                    .to_builder()
                    .src_port(external_port)
                    .dst_port(target.port)
                    .serialize(local_ip, target.ip, payload);
                self.emit(&header, payload, target.ip)?;
                debug!(
                    "{} -> {} forwarded as {}:{} -> {}:{} [{}]",
                    src,
                    dst,
                    local_ip,
                    external_port,
                    target.ip,
                    target.port,
                    tcp.flags()
                );
                Ok(Disposition::Outbound {
                    internal: src,
                    external_port,
                    target,
                })
            }
            Translation::Inbound {
                internal,
                service_port,
            } => {
                let local_ip = self.local_ip_for(internal.ip)?;
                // the internal host expects the reply from the port it dialled
                let header = tcp
                    .to_builder()
                    .src_port(service_port)
                    .dst_port(internal.port)
                    .serialize(local_ip, internal.ip, payload);
                self.emit(&header, payload, internal.ip)?;
                debug!(
                    "{} -> {} returned as {}:{} -> {} [{}]",
                    src,
                    dst,
                    local_ip,
                    service_port,
                    internal,
                    tcp.flags()
                );
                Ok(Disposition::Inbound { internal })
            }
            Translation::Untracked => {
                trace!("{} -> {} is not tracked, dropping", src, dst);
                Ok(Disposition::Untracked)
            }
        }
    }

    /// Source address segments to `destination` will carry on the wire.
    fn local_ip_for(&mut self, destination: Ipv4Addr) -> Result<Ipv4Addr> {
        match self.source_ip {
            Some(ip) => Ok(ip),
            None => self.transport.source_for(destination),
        }
    }

    fn emit(&mut self, header: &[u8], payload: &[u8], destination: Ipv4Addr) -> Result<()> {
        let mut segment = Vec::with_capacity(header.len() + payload.len());
        segment.extend_from_slice(header);
        segment.extend_from_slice(payload);
        self.transport.send(&segment, destination)
    }

    /// Runs until `running` is cleared or the transport fails for good.
    ///
    /// Per-packet failures are logged and counted; they never stop the loop.
    pub fn run(&mut self, running: &AtomicBool) -> Result<ForwarderStats> {
        info!("Forwarder running with {} rule(s)", self.rules.len());

        while running.load(Ordering::SeqCst) {
            let datagram = match self.transport.receive() {
                Ok(Some(datagram)) => datagram,
                Ok(None) => continue,
                Err(e) if e.is_fatal() => {
                    self.log_stats();
                    return Err(e);
                }
                Err(e) => {
                    warn!("Receive failed: {}", e);
                    continue;
                }
            };

            self.stats.received += 1;
            match self.handle_packet(&datagram.bytes) {
                Ok(disposition) => self.record(disposition),
                Err(e) if e.is_fatal() => {
                    error!("Transport unusable: {}", e);
                    self.log_stats();
                    return Err(e);
                }
                Err(e @ (NatError::TruncatedBuffer { .. } | NatError::InvalidHeaderLength(_))) => {
                    debug!("Dropping malformed packet from {}: {}", datagram.source, e);
                    self.stats.malformed += 1;
                }
                Err(e @ NatError::PortExhaustion { .. }) => {
                    warn!("Dropping packet from {}: {}", datagram.source, e);
                    self.stats.exhausted += 1;
                }
                Err(e) => {
                    warn!("Failed to forward packet from {}: {}", datagram.source, e);
                    self.stats.send_failures += 1;
                }
            }
        }

        info!("Forwarder stopped.");
        self.log_stats();
        Ok(self.stats)
    }

    fn record(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Outbound { .. } => self.stats.outbound += 1,
            Disposition::Inbound { .. } => self.stats.inbound += 1,
            Disposition::Untracked => self.stats.untracked += 1,
            Disposition::Ignored => self.stats.ignored += 1,
        }
    }

    fn log_stats(&self) {
        let s = &self.stats;
        info!(
            "Packets: {} received, {} outbound, {} inbound, {} untracked, {} ignored, {} malformed, {} exhausted, {} send failures; {} flow(s) tracked",
            s.received,
            s.outbound,
            s.inbound,
            s.untracked,
            s.ignored,
            s.malformed,
            s.exhausted,
            s.send_failures,
            self.nat.len()
        );
    }
}
