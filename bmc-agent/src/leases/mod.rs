//! DHCP leases handed out to BMCs
//!
//! This module handles:
//! - The canonical `Lease` record and ordered `LeaseSet`
//! - Active / latest-by-MAC / allow-list filtering
//! - Reading the lease store from disk on every reconciliation tick

pub mod parser;

pub use parser::{parse, LeaseFormat, LeaseParseError, ParsedLeases, RowError};

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error};

/// A single DHCP binding observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub mac: String,
    pub ip: String,
    pub begin: Option<DateTime<Utc>>,
    pub end: DateTime<Utc>,
}

impl Lease {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.end > now
    }
}

/// Leases in lease store order, renewals are kept as separate records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseSet(Vec<Lease>);

impl LeaseSet {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Lease> {
        self.0.iter()
    }

    /// Leases whose end lies strictly after `now`
    pub fn filter_active(&self, now: DateTime<Utc>) -> LeaseSet {
        self.0.iter().filter(|l| l.is_active(now)).cloned().collect()
    }

    /// Latest lease per MAC. On equal end times the later record wins.
    pub fn latest_by_identifier(&self) -> BTreeMap<String, Lease> {
        let mut by_mac: BTreeMap<String, Lease> = BTreeMap::new();
        for lease in &self.0 {
            match by_mac.get(&lease.mac) {
                Some(current) if current.end > lease.end => {}
                _ => {
                    by_mac.insert(lease.mac.clone(), lease.clone());
                }
            }
        }
        by_mac
    }

    /// Leases inside one of `allowed` whose MAC is not in `ignored`
    ///
    /// `ignored` is expected to hold lowercase MACs, see [`normalize_macs`].
    pub fn filter_allowed(&self, allowed: &[IpNetwork], ignored: &HashSet<String>) -> LeaseSet {
        self.0
            .iter()
            .filter(|l| {
                if ignored.contains(&l.mac.to_lowercase()) {
                    debug!(mac = %l.mac, ip = %l.ip, "ignoring lease of ignored mac");
                    return false;
                }
                is_in_allowed_networks(&l.ip, allowed)
            })
            .cloned()
            .collect()
    }
}

impl From<Vec<Lease>> for LeaseSet {
    fn from(leases: Vec<Lease>) -> Self {
        Self(leases)
    }
}

impl FromIterator<Lease> for LeaseSet {
    fn from_iter<I: IntoIterator<Item = Lease>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for LeaseSet {
    type Item = Lease;
    type IntoIter = std::vec::IntoIter<Lease>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Lowercase set of MACs for [`LeaseSet::filter_allowed`]
pub fn normalize_macs<'a>(macs: impl IntoIterator<Item = &'a String>) -> HashSet<String> {
    macs.into_iter().map(|m| m.to_lowercase()).collect()
}

fn is_in_allowed_networks(ip: &str, allowed: &[IpNetwork]) -> bool {
    let addr: IpAddr = match ip.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(ip = %ip, "given ip is not parsable: {}", e);
            return false;
        }
    };
    allowed.iter().any(|net| net.contains(addr))
}

#[derive(Debug, Error)]
pub enum LeaseReadError {
    #[error("could not read lease file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse lease file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: LeaseParseError,
    },
}

/// Read and parse the whole lease store
pub async fn read_leases(path: &Path, format: LeaseFormat) -> Result<ParsedLeases, LeaseReadError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| LeaseReadError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    parse(format, &content).map_err(|source| LeaseReadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
