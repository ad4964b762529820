use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::config::TargetEntry;

/// Immutable identity of one monitored endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetDescriptor {
    pub protocol: String,
    pub address: String,
    pub port: u16,
    pub identity: String,
    pub label: String,
}

/// Why a descriptor was rejected at load time
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("empty address")]
    EmptyAddress,

    #[error("port must be non-zero")]
    InvalidPort,

    #[error("empty protocol")]
    EmptyProtocol,

    #[error("duplicate identity: {0}")]
    DuplicateIdentity(String),
}

impl TargetDescriptor {
    pub fn from_entry(entry: &TargetEntry) -> Result<Self, TargetError> {
        let protocol = entry.protocol.trim().to_lowercase();
        let address = entry.address.trim().to_string();
        if protocol.is_empty() {
            return Err(TargetError::EmptyProtocol);
        }
        if address.is_empty() {
            return Err(TargetError::EmptyAddress);
        }
        if entry.port == 0 {
            return Err(TargetError::InvalidPort);
        }

        let identity = entry
            .identity
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}://{}:{}", protocol, address, entry.port));
        let label = entry
            .label
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}:{}", address, entry.port));

        Ok(Self {
            protocol,
            address,
            port: entry.port,
            identity,
            label,
        })
    }

    /// host:port string for socket connects
    pub fn endpoint(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ({}:{})",
            self.protocol.to_uppercase(),
            self.label,
            self.address,
            self.port
        )
    }
}

/// Build descriptors from config entries, dropping (and reporting once) the malformed ones
pub fn load_targets(entries: &[TargetEntry]) -> (Vec<Arc<TargetDescriptor>>, Vec<(usize, TargetError)>) {
    let mut seen = HashSet::new();
    let mut accepted = Vec::with_capacity(entries.len());
    let mut rejected = Vec::new();

    for (idx, entry) in entries.iter().enumerate() {
        let result = TargetDescriptor::from_entry(entry).and_then(|d| {
            if seen.insert(d.identity.clone()) {
                Ok(d)
            } else {
                Err(TargetError::DuplicateIdentity(d.identity))
            }
        });

        match result {
            Ok(d) => accepted.push(Arc::new(d)),
            Err(e) => {
                warn!("Target #{} ({}:{}) rejected: {}", idx, entry.address, entry.port, e);
                rejected.push((idx, e));
            }
        }
    }

    (accepted, rejected)
}

/// Deterministic offset in `[0, spread_ms)` derived from a target identity.
///
/// FNV-1a over the bytes followed by a SplitMix64 finalizer, so the value is
/// stable across runs and platforms.
pub fn stable_offset(identity: &str, spread_ms: u64) -> u64 {
    if spread_ms == 0 {
        return 0;
    }
    let mut h: u64 = 14695981039346656037;
    for b in identity.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(1099511628211);
    }
    splitmix64(h) % spread_ms
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
pub(crate) fn test_descriptor(identity: &str) -> Arc<TargetDescriptor> {
    Arc::new(TargetDescriptor {
        protocol: "vless".to_string(),
        address: "127.0.0.1".to_string(),
        port: 443,
        identity: identity.to_string(),
        label: identity.to_string(),
    })
}
