/*!
Lease file fixtures

Builds lease stores in ISC `dhcpd.leases` and Kea CSV format and writes
them to temporary files the reconciler can read.
*/

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

const ISC_TIME: &str = "%Y/%m/%d %H:%M:%S";

/// One `lease <ip> { ... }` stanza
#[derive(Debug, Clone)]
pub struct IscLeaseBuilder {
    ip: String,
    mac: String,
    starts: DateTime<Utc>,
    ends: DateTime<Utc>,
}

impl IscLeaseBuilder {
    /// Lease valid from one hour ago until one hour from now
    pub fn active(ip: &str, mac: &str) -> Self {
        let now = Utc::now();
        Self {
            ip: ip.to_string(),
            mac: mac.to_string(),
            starts: now - Duration::hours(1),
            ends: now + Duration::hours(1),
        }
    }

    /// Lease that ended one hour ago
    pub fn expired(ip: &str, mac: &str) -> Self {
        let now = Utc::now();
        Self {
            ip: ip.to_string(),
            mac: mac.to_string(),
            starts: now - Duration::hours(2),
            ends: now - Duration::hours(1),
        }
    }

    pub fn ends(mut self, ends: DateTime<Utc>) -> Self {
        self.ends = ends;
        self
    }

    pub fn render(&self) -> String {
        format!(
            "lease {} {{\n  starts 3 {};\n  ends 3 {};\n  cltt 3 {};\n  binding state active;\n  hardware ethernet {};\n  uid \"\\001{}\";\n}}\n",
            self.ip,
            self.starts.format(ISC_TIME),
            self.ends.format(ISC_TIME),
            self.starts.format(ISC_TIME),
            self.mac,
            self.mac,
        )
    }
}

/// Render a whole `dhcpd.leases` file
pub fn isc_leases(leases: &[IscLeaseBuilder]) -> String {
    let mut out = String::from("# The format of this file is documented in the dhcpd.leases(5) manual page.\n");
    out.push_str("authoring-byte-order little-endian;\n\n");
    for lease in leases {
        out.push_str(&lease.render());
    }
    out
}

/// Render a Kea memfile; rows are `(address, hwaddr, valid_lifetime, expire)`
pub fn kea_leases(rows: &[(&str, &str, i64, i64)]) -> String {
    let mut out = String::from(
        "address,hwaddr,client_id,valid_lifetime,expire,subnet_id,fqdn_fwd,fqdn_rev,hostname,state,user_context\n",
    );
    for (address, hwaddr, valid_lifetime, expire) in rows {
        out.push_str(&format!(
            "{address},{hwaddr},,{valid_lifetime},{expire},1,0,0,,0,\n"
        ));
    }
    out
}

/// Lease store on disk, rewritable between ticks
pub struct LeaseFile {
    file: NamedTempFile,
}

impl LeaseFile {
    pub fn new(content: &str) -> Result<Self> {
        let mut file = NamedTempFile::new()?;
        file.write_all(content.as_bytes())?;
        file.flush()?;
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn rewrite(&self, content: &str) -> Result<()> {
        std::fs::write(self.file.path(), content)?;
        Ok(())
    }
}
