//! Configuration management
//!
//! Handles:
//! - TOML config file, path from `BMC_AGENT_CONFIG`
//! - `.env` and environment overrides for secrets
//! - Validation before anything is started
//! - Conversion into the settings of the individual components

use crate::console::ConsoleSettings;
use crate::leases::{normalize_macs, LeaseFormat};
use crate::oob::sol::SolSettings;
use crate::oob::Credentials;
use crate::reconciler::ReconcilerSettings;
use crate::transport::mqtt::{MqttSettings, MqttTls};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_PATH_ENV: &str = "BMC_AGENT_CONFIG";
pub const BMC_PASSWORD_ENV: &str = "BMC_AGENT_BMC_PASSWORD";
pub const INVENTORY_TOKEN_ENV: &str = "BMC_AGENT_INVENTORY_TOKEN";
const DEFAULT_CONFIG_PATH: &str = "bmc-agent.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub partition_id: String,
    #[serde(default)]
    pub leases: LeasesConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub bmc: BmcConfig,
    pub inventory: InventoryConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub console: ConsoleConfig,
    #[serde(default)]
    pub event_log: EventLogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeasesConfig {
    pub file: PathBuf,
    pub format: LeaseFormat,
    pub allowed_cidrs: Vec<String>,
    pub ignore_macs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub interval_secs: u64,
    pub concurrency: usize,
    pub enrich_timeout_secs: u64,
    pub warmup_on_start: bool,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BmcConfig {
    pub port: u16,
    pub user: String,
    pub password: String,
    pub request_timeout_secs: u64,
    pub accept_invalid_certs: bool,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct InventoryConfig {
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_inventory_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: Option<String>,
    pub keep_alive_secs: u64,
    pub topic_prefix: String,
    pub resolve_from_inventory: bool,
    pub max_attempts: u32,
    pub requeue_delay_secs: u64,
    pub resubscribe_delay_secs: u64,
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,
    pub port: u16,
    pub ca_cert_file: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// ipmitool binary used for serial-over-LAN
    pub ipmitool: PathBuf,
    pub ipmi_interface: String,
    pub ipmi_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    /// Disabled when absent
    pub interval_secs: Option<u64>,
    pub concurrency: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_inventory_timeout() -> u64 {
    30
}

impl Default for LeasesConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("/var/lib/dhcp/dhcpd.leases"),
            format: LeaseFormat::Isc,
            allowed_cidrs: vec!["0.0.0.0/0".to_string()],
            ignore_macs: Vec::new(),
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            concurrency: 20,
            enrich_timeout_secs: 60,
            warmup_on_start: true,
        }
    }
}

impl Default for BmcConfig {
    fn default() -> Self {
        Self {
            port: 443,
            user: "ADMIN".to_string(),
            password: "ADMIN".to_string(),
            request_timeout_secs: 20,
            accept_invalid_certs: true,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: None,
            keep_alive_secs: 30,
            topic_prefix: "bmc/commands".to_string(),
            resolve_from_inventory: false,
            max_attempts: 2,
            requeue_delay_secs: 5,
            resubscribe_delay_secs: 5,
            ca_cert: None,
            client_cert: None,
            client_key: None,
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 3333,
            ca_cert_file: PathBuf::from("ca.pem"),
            cert_file: PathBuf::from("cert.pem"),
            key_file: PathBuf::from("key.pem"),
            ipmitool: PathBuf::from("ipmitool"),
            ipmi_interface: "lanplus".to_string(),
            ipmi_port: 623,
        }
    }
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            interval_secs: None,
            concurrency: 10,
        }
    }
}

// Secrets never show up in logs
impl fmt::Debug for BmcConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BmcConfig")
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .finish()
    }
}

impl fmt::Debug for InventoryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InventoryConfig")
            .field("url", &self.url)
            .field("token", &"<redacted>")
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl Config {
    /// Load `.env`, the config file and environment overrides, then validate
    pub async fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::from_file(Path::new(&path)).await?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub async fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(password) = lookup(BMC_PASSWORD_ENV) {
            self.bmc.password = password;
        }
        if let Some(token) = lookup(INVENTORY_TOKEN_ENV) {
            self.inventory.token = token;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.partition_id.trim().is_empty() {
            return Err(ConfigError::Invalid("partition_id must not be empty".to_string()));
        }
        self.allowed_networks()?;

        let nonzero = [
            ("report.interval_secs", self.report.interval_secs),
            ("report.concurrency", self.report.concurrency as u64),
            ("report.enrich_timeout_secs", self.report.enrich_timeout_secs),
            ("bmc.request_timeout_secs", self.bmc.request_timeout_secs),
            ("inventory.request_timeout_secs", self.inventory.request_timeout_secs),
            ("mqtt.keep_alive_secs", self.mqtt.keep_alive_secs),
            ("mqtt.max_attempts", self.mqtt.max_attempts as u64),
            ("event_log.concurrency", self.event_log.concurrency as u64),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than 0", name)));
            }
        }
        if self.event_log.interval_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "event_log.interval_secs must be greater than 0".to_string(),
            ));
        }

        let url = self.inventory.url.trim();
        let host = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .map(|rest| rest.split(['/', ':']).next().unwrap_or_default());
        match host {
            Some(host) if !host.is_empty() => {}
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "inventory.url {:?} must be an http(s) url with a host",
                    self.inventory.url
                )))
            }
        }
        if self.inventory.token.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "inventory.token must be set, in the config file or {}",
                INVENTORY_TOKEN_ENV
            )));
        }

        if self.console.enabled
            && (self.console.ipmitool.as_os_str().is_empty() || self.console.ipmi_port == 0)
        {
            return Err(ConfigError::Invalid(
                "console.ipmitool and console.ipmi_port are required while the console is enabled"
                    .to_string(),
            ));
        }

        if self.mqtt.client_cert.is_some() != self.mqtt.client_key.is_some() {
            return Err(ConfigError::Invalid(
                "mqtt.client_cert and mqtt.client_key must be given together".to_string(),
            ));
        }
        if self.mqtt.client_cert.is_some() && self.mqtt.ca_cert.is_none() {
            return Err(ConfigError::Invalid(
                "mqtt.client_cert requires mqtt.ca_cert".to_string(),
            ));
        }

        Ok(())
    }

    pub fn allowed_networks(&self) -> Result<Vec<IpNetwork>, ConfigError> {
        self.leases
            .allowed_cidrs
            .iter()
            .map(|cidr| {
                cidr.parse::<IpNetwork>().map_err(|e| {
                    ConfigError::Invalid(format!("allowed cidr {:?} is not parsable: {}", cidr, e))
                })
            })
            .collect()
    }

    pub fn bmc_credentials(&self) -> Credentials {
        Credentials::new(&self.bmc.user, &self.bmc.password)
    }

    pub fn reconciler_settings(&self) -> Result<ReconcilerSettings, ConfigError> {
        Ok(ReconcilerSettings {
            partition_id: self.partition_id.clone(),
            lease_file: self.leases.file.clone(),
            lease_format: self.leases.format,
            allowed_networks: self.allowed_networks()?,
            ignored_macs: normalize_macs(&self.leases.ignore_macs),
            interval: Duration::from_secs(self.report.interval_secs),
            concurrency: self.report.concurrency,
            enrich_timeout: Duration::from_secs(self.report.enrich_timeout_secs),
            bmc_port: self.bmc.port,
        })
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        let mqtt = &self.mqtt;
        let client_id = mqtt.client_id.clone().unwrap_or_else(|| {
            format!("bmc-agent-{}", gethostname::gethostname().to_string_lossy())
        });
        MqttSettings {
            host: mqtt.host.clone(),
            port: mqtt.port,
            client_id,
            keep_alive: Duration::from_secs(mqtt.keep_alive_secs),
            topic_prefix: mqtt.topic_prefix.clone(),
            max_attempts: mqtt.max_attempts,
            requeue_delay: Duration::from_secs(mqtt.requeue_delay_secs),
            tls: mqtt.ca_cert.clone().map(|ca_cert| MqttTls {
                ca_cert,
                client_cert: mqtt.client_cert.clone(),
                client_key: mqtt.client_key.clone(),
            }),
        }
    }

    pub fn console_settings(&self) -> ConsoleSettings {
        ConsoleSettings {
            port: self.console.port,
            ca_cert_file: self.console.ca_cert_file.clone(),
            cert_file: self.console.cert_file.clone(),
            key_file: self.console.key_file.clone(),
        }
    }

    /// Serial-over-LAN settings, `None` while the console is disabled
    pub fn sol_settings(&self) -> Option<SolSettings> {
        self.console.enabled.then(|| SolSettings {
            program: self.console.ipmitool.clone(),
            interface: self.console.ipmi_interface.clone(),
            port: self.console.ipmi_port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MINIMAL: &str = r#"
        partition_id = "fra-equ01"

        [inventory]
        url = "https://inventory.example.com/api"
        token = "secret-token"
    "#;

    fn minimal() -> Config {
        toml::from_str(MINIMAL).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = minimal();
        config.validate().unwrap();

        assert_eq!(config.log_level, "info");
        assert_eq!(config.leases.file, PathBuf::from("/var/lib/dhcp/dhcpd.leases"));
        assert_eq!(config.leases.format, LeaseFormat::Isc);
        assert_eq!(config.report.interval_secs, 300);
        assert_eq!(config.report.concurrency, 20);
        assert_eq!(config.bmc.port, 443);
        assert_eq!(config.mqtt.max_attempts, 2);
        assert_eq!(config.mqtt.topic_prefix, "bmc/commands");
        assert!(config.console.enabled);
        assert_eq!(config.sol_settings(), Some(SolSettings::default()));
        assert_eq!(config.event_log.interval_secs, None);
    }

    #[test]
    fn test_console_needs_sol() {
        let mut config = minimal();
        config.console.ipmitool = PathBuf::new();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.console.enabled = false;
        config.validate().unwrap();
        assert_eq!(config.sol_settings(), None);
    }

    #[test]
    fn test_sections_override_defaults() {
        let config: Config = toml::from_str(
            r#"
            partition_id = "p1"
            [leases]
            format = "kea"
            allowed_cidrs = ["10.0.0.0/8"]
            ignore_macs = ["AA:BB:CC:DD:EE:FF"]
            [report]
            concurrency = 5
            [inventory]
            url = "http://inventory:8080"
            token = "t"
            [mqtt]
            client_id = "agent-1"
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        let settings = config.reconciler_settings().unwrap();
        assert_eq!(settings.lease_format, LeaseFormat::Kea);
        assert_eq!(settings.concurrency, 5);
        assert!(settings.ignored_macs.contains("aa:bb:cc:dd:ee:ff"));
        assert_eq!(config.mqtt_settings().client_id, "agent-1");
        assert_eq!(config.mqtt_settings().topic("p1"), "bmc/commands/p1");
        // File leaves the remaining report values untouched
        assert_eq!(settings.interval, Duration::from_secs(300));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = minimal();
        config.partition_id = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.leases.allowed_cidrs = vec!["10.0.0.0/33".to_string()];
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.report.interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.report.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.inventory.url = "https://".to_string();
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.inventory.url = "inventory.example.com".to_string();
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.mqtt.client_cert = Some(PathBuf::from("cert.pem"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = minimal();
        let env: HashMap<&str, &str> = [(BMC_PASSWORD_ENV, "hunter2"), (INVENTORY_TOKEN_ENV, "t2")].into();
        config.apply_env_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.bmc.password, "hunter2");
        assert_eq!(config.inventory.token, "t2");
    }

    #[test]
    fn test_secrets_redacted() {
        let rendered = format!("{:?}", minimal());
        assert!(!rendered.contains("secret-token"));
        assert!(!rendered.contains("ADMIN\", password: \"ADMIN"));
    }

    #[tokio::test]
    async fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bmc-agent.toml");
        tokio::fs::write(&path, MINIMAL).await.unwrap();

        let config = Config::from_file(&path).await.unwrap();
        assert_eq!(config.partition_id, "fra-equ01");

        let missing = Config::from_file(&dir.path().join("nope.toml")).await;
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
