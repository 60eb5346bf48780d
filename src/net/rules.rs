//! Forwarding rules loaded from the JSON rule file.
//!
//! The file maps `"<internal_ip>:<internal_port>"` to
//! `{"ip": "<dotted quad>", "port": <0-65535>}`.

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;
use tracing::{debug, info};

use crate::error::{NatError, Result};
use crate::net::nat::NatKey;

/// Where traffic matching a rule is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardTarget {
    pub ip: Ipv4Addr,
    pub port: u16,
}

#[derive(Deserialize)]
struct RawTarget {
    ip: String,
    // Wider than u16 so out-of-range ports get a clear message
    port: i64,
}

/// Immutable rule set, keyed by `(source ip, port the packet was sent to)`.
#[derive(Debug, Clone, Default)]
pub struct ForwardingRules {
    rules: HashMap<NatKey, ForwardTarget>,
}

impl ForwardingRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            NatError::MalformedRule(format!("cannot read {}: {}", path.display(), e))
        })?;
        let rules = Self::from_json(&text)?;
        info!("Loaded {} forwarding rule(s) from {}", rules.len(), path.display());
        Ok(rules)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let raw: HashMap<String, RawTarget> = serde_json::from_str(text)
            .map_err(|e| NatError::MalformedRule(e.to_string()))?;

        let mut rules = HashMap::with_capacity(raw.len());
        for (key, target) in raw {
            let internal: SocketAddrV4 = key.parse().map_err(|_| {
                NatError::MalformedRule(format!("bad rule key {:?}, expected ip:port", key))
            })?;
            let ip: Ipv4Addr = target.ip.parse().map_err(|_| {
                NatError::MalformedRule(format!("rule {}: bad ip {:?}", key, target.ip))
            })?;
            let port = u16::try_from(target.port).map_err(|_| {
                NatError::MalformedRule(format!("rule {}: port {} out of range", key, target.port))
            })?;

            debug!("Rule {} -> {}:{}", internal, ip, port);
            rules.insert(NatKey::from(internal), ForwardTarget { ip, port });
        }
        Ok(Self { rules })
    }

    pub fn insert(&mut self, internal: NatKey, target: ForwardTarget) {
        self.rules.insert(internal, target);
    }

    pub fn get(&self, key: &NatKey) -> Option<&ForwardTarget> {
        self.rules.get(key)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
