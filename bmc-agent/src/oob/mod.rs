//! Out-of-band management sessions
//!
//! The agent talks to machine BMCs through two narrow traits:
//! - `OutOfBandConnector` opens one session per (address, credentials)
//! - `OutOfBandSession` exposes power, boot, identify, firmware and inventory operations
//!
//! Sessions are never shared between machines. The protocol itself lives in
//! the adapters (`redfish`, with `sol` for serial consoles).

pub mod redfish;
pub mod sol;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, Error)]
pub enum OutOfBandError {
    #[error("invalid bmc address {0:?}")]
    InvalidAddress(String),

    #[error("could not connect to bmc at {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("bmc request failed: {0}")]
    Request(String),

    #[error("unexpected bmc response: {0}")]
    InvalidResponse(String),

    #[error("{0} is not supported by this bmc")]
    Unsupported(&'static str),

    #[error("console failed: {0}")]
    Console(String),
}

impl From<reqwest::Error> for OutOfBandError {
    fn from(err: reqwest::Error) -> Self {
        OutOfBandError::Request(err.to_string())
    }
}

/// Host and port of a BMC
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BmcAddress {
    pub host: String,
    pub port: u16,
}

impl BmcAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host`, `host:port`, `ip` or `[v6]:port`
    pub fn parse(raw: &str, default_port: u16) -> Result<Self, OutOfBandError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(OutOfBandError::InvalidAddress(raw.to_string()));
        }
        if let Ok(sock) = raw.parse::<SocketAddr>() {
            return Ok(Self::new(sock.ip().to_string(), sock.port()));
        }
        if let Ok(ip) = raw.parse::<IpAddr>() {
            return Ok(Self::new(ip.to_string(), default_port));
        }
        match raw.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| OutOfBandError::InvalidAddress(raw.to_string()))?;
                Ok(Self::new(host, port))
            }
            Some(_) => Err(OutOfBandError::InvalidAddress(raw.to_string())),
            None => Ok(Self::new(raw, default_port)),
        }
    }
}

impl fmt::Display for BmcAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// BMC connection details as carried by commands and the inventory service
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BmcDetails {
    pub address: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

impl BmcDetails {
    pub fn bmc_address(&self, default_port: u16) -> Result<BmcAddress, OutOfBandError> {
        BmcAddress::parse(&self.address, default_port)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(&self.user, &self.password)
    }
}

impl fmt::Debug for BmcDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BmcDetails")
            .field("address", &self.address)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootTarget {
    Bios,
    Disk,
    Pxe,
}

/// Firmware kinds a flash can be requested for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareKind {
    Bios,
    Bmc,
}

impl FromStr for FirmwareKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bios" => Ok(FirmwareKind::Bios),
            "bmc" => Ok(FirmwareKind::Bmc),
            _ => Err(s.to_string()),
        }
    }
}

impl fmt::Display for FirmwareKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirmwareKind::Bios => write!(f, "bios"),
            FirmwareKind::Bmc => write!(f, "bmc"),
        }
    }
}

/// Field replaceable unit identifiers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fru {
    pub board_mfg: Option<String>,
    pub board_mfg_serial: Option<String>,
    pub board_part_number: Option<String>,
    pub chassis_part_number: Option<String>,
    pub chassis_part_serial: Option<String>,
    pub product_manufacturer: Option<String>,
    pub product_part_number: Option<String>,
    pub product_serial: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareInventory {
    pub bmc_version: Option<String>,
    pub bios_version: Option<String>,
    pub fru: Option<Fru>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerMetric {
    pub average_consumed_watts: f32,
    pub interval_in_min: f32,
    pub max_consumed_watts: f32,
    pub min_consumed_watts: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerSupply {
    pub health: String,
    pub state: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoardFacts {
    pub indicator_led: Option<String>,
    pub power_metric: Option<PowerMetric>,
    pub power_supplies: Vec<PowerSupply>,
}

/// Bidirectional byte stream of a machine's serial console
pub trait ConsoleIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ConsoleIo for T {}

pub type ConsoleStream = Box<dyn ConsoleIo>;

/// One open management session to one BMC
#[async_trait]
pub trait OutOfBandSession: Send + Sync {
    async fn power_on(&self) -> Result<(), OutOfBandError>;
    async fn power_off(&self) -> Result<(), OutOfBandError>;
    async fn power_reset(&self) -> Result<(), OutOfBandError>;
    async fn power_cycle(&self) -> Result<(), OutOfBandError>;
    async fn select_boot_target(&self, target: BootTarget) -> Result<(), OutOfBandError>;
    async fn identify_led_on(&self) -> Result<(), OutOfBandError>;
    async fn identify_led_off(&self) -> Result<(), OutOfBandError>;

    /// Machine UUID, lowercase hyphenated
    async fn read_uuid(&self) -> Result<String, OutOfBandError>;
    async fn read_firmware_inventory(&self) -> Result<FirmwareInventory, OutOfBandError>;
    /// Power state label as reported by the BMC
    async fn read_power_state(&self) -> Result<String, OutOfBandError>;
    async fn read_board(&self) -> Result<BoardFacts, OutOfBandError>;

    /// Flash firmware from `url`; may run for a long time
    async fn update_firmware(&self, kind: FirmwareKind, url: &str) -> Result<(), OutOfBandError>;
    async fn read_event_log(&self) -> Result<Vec<String>, OutOfBandError>;
    async fn open_console(&self) -> Result<ConsoleStream, OutOfBandError>;
}

#[async_trait]
pub trait OutOfBandConnector: Send + Sync {
    async fn open(
        &self,
        address: &BmcAddress,
        credentials: &Credentials,
    ) -> Result<Box<dyn OutOfBandSession>, OutOfBandError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bmc_address() {
        assert_eq!(
            BmcAddress::parse("10.0.0.5", 443).unwrap(),
            BmcAddress::new("10.0.0.5", 443)
        );
        assert_eq!(
            BmcAddress::parse("10.0.0.5:623", 443).unwrap(),
            BmcAddress::new("10.0.0.5", 623)
        );
        assert_eq!(
            BmcAddress::parse("bmc-01.rack:8443", 443).unwrap(),
            BmcAddress::new("bmc-01.rack", 8443)
        );
        assert_eq!(
            BmcAddress::parse("[fd00::5]:443", 623).unwrap().to_string(),
            "[fd00::5]:443"
        );
        assert_eq!(BmcAddress::parse("fd00::5", 623).unwrap().port, 623);
        assert!(BmcAddress::parse("", 443).is_err());
        assert!(BmcAddress::parse("10.0.0.5:http", 443).is_err());
    }

    #[test]
    fn test_firmware_kind() {
        assert_eq!("bios".parse::<FirmwareKind>(), Ok(FirmwareKind::Bios));
        assert_eq!("BMC".parse::<FirmwareKind>(), Ok(FirmwareKind::Bmc));
        assert_eq!("nic".parse::<FirmwareKind>(), Err("nic".to_string()));
    }

    #[test]
    fn test_credentials_are_redacted() {
        let details = BmcDetails {
            address: "10.0.0.5".to_string(),
            user: "ADMIN".to_string(),
            password: "secret".to_string(),
        };
        assert!(!format!("{:?}", details).contains("secret"));
        assert!(!format!("{:?}", details.credentials()).contains("secret"));
    }
}
