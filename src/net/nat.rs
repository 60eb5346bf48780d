use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::ops::RangeInclusive;
use tracing::{debug, info};

use crate::error::{NatError, Result};
use crate::net::rules::{ForwardTarget, ForwardingRules};
use crate::utils::consts::{DYNAMIC_PORT_RANGE, MAX_PORT_ATTEMPTS};

/// An `(ip, port)` pair used as a table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NatKey {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl NatKey {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl From<SocketAddrV4> for NatKey {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

impl fmt::Display for NatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// What the table decided for one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Translation {
    /// Inside to outside: rewrite the source port and send to `target`.
    Outbound {
        external_port: u16,
        target: ForwardTarget,
    },
    /// Reply for a tracked flow: deliver to the internal endpoint, coming
    /// from the port it originally dialled.
    Inbound { internal: NatKey, service_port: u16 },
    /// Not ours.
    Untracked,
}

/// Where replies arriving on one external port are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnPath {
    pub internal: NatKey,
    /// Destination port of the internal host's original packets
    pub service_port: u16,
}

/// External port allocation settings.
#[derive(Debug, Clone)]
pub struct NatConfig {
    /// Ports drawn from on collision
    pub port_range: RangeInclusive<u16>,
    /// Random draws before giving up on a packet
    pub max_port_attempts: usize,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            port_range: DYNAMIC_PORT_RANGE,
            max_port_attempts: MAX_PORT_ATTEMPTS,
        }
    }
}

/// Paired SNAT/DNAT tables for TCP flows.
///
/// Entries are added in pairs by [`NatTable::translate`] and live as long as
/// the table.
// TODO: flow expiry (idle timeout or FIN/RST teardown) once a timing policy is chosen
#[derive(Debug)]
pub struct NatTable<R: Rng = StdRng> {
    /// (forward destination ip, external port) -> internal endpoint
    dnat_table: HashMap<NatKey, ReturnPath>,
    /// internal endpoint -> external port
    snat_table: HashMap<NatKey, u16>,
    config: NatConfig,
    rng: R,
}

impl NatTable<StdRng> {
    pub fn new() -> Self {
        Self::with_config(NatConfig::default(), StdRng::from_os_rng())
    }
}

impl Default for NatTable<StdRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Rng> NatTable<R> {
    pub fn with_config(config: NatConfig, rng: R) -> Self {
        Self {
            dnat_table: HashMap::new(),
            snat_table: HashMap::new(),
            config,
            rng,
        }
    }

    /// Classifies a packet by its 4-tuple, creating the flow's entries on
    /// the first outbound packet.
    ///
    /// On [`NatError::PortExhaustion`] the tables are left unchanged.
    pub fn translate(
        &mut self,
        rules: &ForwardingRules,
        src: NatKey,
        dst: NatKey,
    ) -> Result<Translation> {
        let forward_key = NatKey::new(src.ip, dst.port);
        if let Some(target) = rules.get(&forward_key) {
            let external_port = self.assign_external_port(src, dst.port, target.ip)?;
            return Ok(Translation::Outbound {
                external_port,
                target: *target,
            });
        }

        if let Some(path) = self.dnat_table.get(&dst) {
            return Ok(Translation::Inbound {
                internal: path.internal,
                service_port: path.service_port,
            });
        }

        Ok(Translation::Untracked)
    }

    fn assign_external_port(
        &mut self,
        internal: NatKey,
        service_port: u16,
        destination: Ipv4Addr,
    ) -> Result<u16> {
        if let Some(port) = self.snat_table.get(&internal) {
            return Ok(*port);
        }

        if !self
            .dnat_table
            .contains_key(&NatKey::new(destination, internal.port))
        {
            self.commit(internal, service_port, destination, internal.port);
            return Ok(internal.port);
        }

        debug!(
            "NAT: port {} already taken towards {}, drawing a new one",
            internal.port, destination
        );
        for _ in 0..self.config.max_port_attempts {
            let candidate = self
                .rng
                .random_range(self.config.port_range.clone());
            if !self
                .dnat_table
                .contains_key(&NatKey::new(destination, candidate))
            {
                self.commit(internal, service_port, destination, candidate);
                return Ok(candidate);
            }
        }

        Err(NatError::PortExhaustion {
            destination,
            attempts: self.config.max_port_attempts,
        })
    }

    /// Inserts both halves of a flow record.
    fn commit(
        &mut self,
        internal: NatKey,
        service_port: u16,
        destination: Ipv4Addr,
        external_port: u16,
    ) {
        self.dnat_table.insert(
            NatKey::new(destination, external_port),
            ReturnPath {
                internal,
                service_port,
            },
        );
        self.snat_table.insert(internal, external_port);
        info!(
            "NAT: {} mapped to external port {} towards {}",
            internal, external_port, destination
        );
    }

    /// External port assigned to an internal endpoint, if any.
    pub fn snat_port(&self, internal: &NatKey) -> Option<u16> {
        self.snat_table.get(internal).copied()
    }

    /// Internal endpoint behind `(destination, external_port)`, if any.
    pub fn dnat_entry(&self, key: &NatKey) -> Option<NatKey> {
        self.dnat_table.get(key).map(|path| path.internal)
    }

    pub fn return_path(&self, key: &NatKey) -> Option<ReturnPath> {
        self.dnat_table.get(key).copied()
    }

    /// Number of tracked flows.
    pub fn len(&self) -> usize {
        self.snat_table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snat_table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(ip: [u8; 4], port: u16) -> NatKey {
        NatKey::new(Ipv4Addr::from(ip), port)
    }

    fn seeded(config: NatConfig) -> NatTable<StdRng> {
        NatTable::with_config(config, StdRng::seed_from_u64(7))
    }

    fn rules() -> ForwardingRules {
        let mut rules = ForwardingRules::new();
        for host in [2, 3, 4] {
            rules.insert(
                key([192, 168, 1, host], 5000),
                ForwardTarget {
                    ip: Ipv4Addr::new(203, 0, 113, 5),
                    port: 80,
                },
            );
        }
        rules
    }

    /// Every snat entry has its dnat partner and vice versa.
    fn assert_paired(table: &NatTable<StdRng>, destination: Ipv4Addr) {
        assert_eq!(table.snat_table.len(), table.dnat_table.len());
        for (internal, port) in &table.snat_table {
            assert_eq!(
                table
                    .dnat_table
                    .get(&NatKey::new(destination, *port))
                    .map(|path| &path.internal),
                Some(internal)
            );
        }
    }

    #[test]
    fn test_first_packet_reuses_source_port() {
        let mut table = seeded(NatConfig::default());
        let t = table
            .translate(&rules(), key([192, 168, 1, 2], 5000), key([192, 168, 1, 1], 5000))
            .unwrap();

        assert_eq!(
            t,
            Translation::Outbound {
                external_port: 5000,
                target: ForwardTarget {
                    ip: Ipv4Addr::new(203, 0, 113, 5),
                    port: 80
                }
            }
        );
        assert_eq!(
            table.dnat_entry(&key([203, 0, 113, 5], 5000)),
            Some(key([192, 168, 1, 2], 5000))
        );
        assert_eq!(table.snat_port(&key([192, 168, 1, 2], 5000)), Some(5000));
    }

    #[test]
    fn test_same_flow_keeps_its_port() {
        let mut table = seeded(NatConfig::default());
        let rules = rules();
        let src = key([192, 168, 1, 2], 40000);
        let dst = key([192, 168, 1, 1], 5000);

        let first = table.translate(&rules, src, dst).unwrap();
        let second = table.translate(&rules, src, dst).unwrap();
        assert_eq!(first, second);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_collision_draws_dynamic_port() {
        let mut table = seeded(NatConfig::default());
        let rules = rules();
        let dst = key([192, 168, 1, 1], 5000);

        table
            .translate(&rules, key([192, 168, 1, 2], 4000), dst)
            .unwrap();
        assert!(table.dnat_entry(&key([203, 0, 113, 5], 4000)).is_some());

        let t = table
            .translate(&rules, key([192, 168, 1, 3], 4000), dst)
            .unwrap();
        let Translation::Outbound { external_port, .. } = t else {
            panic!("expected outbound translation, got {:?}", t);
        };
        assert_ne!(external_port, 4000);
        assert!((49152..=65535).contains(&external_port));
        assert_eq!(
            table.dnat_entry(&key([203, 0, 113, 5], external_port)),
            Some(key([192, 168, 1, 3], 4000))
        );
        assert_eq!(table.snat_port(&key([192, 168, 1, 3], 4000)), Some(external_port));
        assert_paired(&table, Ipv4Addr::new(203, 0, 113, 5));
    }

    #[test]
    fn test_reply_maps_back_to_internal() {
        let mut table = seeded(NatConfig::default());
        let rules = rules();
        table
            .translate(&rules, key([192, 168, 1, 2], 5000), key([192, 168, 1, 1], 5000))
            .unwrap();

        let t = table
            .translate(&rules, key([203, 0, 113, 5], 80), key([203, 0, 113, 5], 5000))
            .unwrap();
        assert_eq!(
            t,
            Translation::Inbound {
                internal: key([192, 168, 1, 2], 5000),
                service_port: 5000
            }
        );
    }

    #[test]
    fn test_reply_remembers_dialled_port() {
        let mut table = seeded(NatConfig::default());
        let rules = rules();
        // 192.168.1.2 dials the forwarder's port 5000 from its port 41000
        table
            .translate(&rules, key([192, 168, 1, 2], 41000), key([192, 168, 1, 1], 5000))
            .unwrap();

        assert_eq!(
            table.return_path(&key([203, 0, 113, 5], 41000)),
            Some(ReturnPath {
                internal: key([192, 168, 1, 2], 41000),
                service_port: 5000
            })
        );
        let t = table
            .translate(&rules, key([203, 0, 113, 5], 80), key([203, 0, 113, 5], 41000))
            .unwrap();
        assert_eq!(
            t,
            Translation::Inbound {
                internal: key([192, 168, 1, 2], 41000),
                service_port: 5000
            }
        );
    }

    #[test]
    fn test_untracked_traffic() {
        let mut table = seeded(NatConfig::default());
        let t = table
            .translate(&rules(), key([10, 9, 9, 9], 1234), key([10, 0, 0, 1], 22))
            .unwrap();
        assert_eq!(t, Translation::Untracked);
        assert!(table.is_empty());
    }

    #[test]
    fn test_port_exhaustion_leaves_tables_untouched() {
        let mut table = seeded(NatConfig {
            port_range: 60000..=60001,
            max_port_attempts: 32,
        });
        let rules = rules();
        let dst = key([192, 168, 1, 1], 5000);

        // Three hosts on the same source port: the first keeps it, the
        // second gets one of the two dynamic ports.
        table
            .translate(&rules, key([192, 168, 1, 2], 60000), dst)
            .unwrap();
        table
            .translate(&rules, key([192, 168, 1, 3], 60000), dst)
            .unwrap();
        assert_eq!(table.len(), 2);

        let err = table
            .translate(&rules, key([192, 168, 1, 4], 60000), dst)
            .unwrap_err();
        assert!(matches!(
            err,
            NatError::PortExhaustion { attempts: 32, .. }
        ));
        assert_eq!(table.len(), 2);
        assert!(table.snat_port(&key([192, 168, 1, 4], 60000)).is_none());
        assert_paired(&table, Ipv4Addr::new(203, 0, 113, 5));
    }

    #[test]
    fn test_key_display() {
        assert_eq!(key([203, 0, 113, 5], 5000).to_string(), "203.0.113.5:5000");
    }
}
