//! Inventory service client
//!
//! The reconciler submits one batch of BMC reports per tick; the dispatcher,
//! console proxy and event log collector look machines' BMC details up.

use crate::enrich::ReportItem;
use crate::oob::{BmcDetails, Fru, PowerMetric, PowerSupply};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("inventory request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("inventory service answered {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("machine {0} not found")]
    NotFound(String),

    #[error("machine {0} has no bmc details")]
    NoBmcDetails(String),

    #[error("invalid inventory url {0:?}")]
    InvalidUrl(String),
}

/// BMC section of a report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BmcInfo {
    pub address: String,
    pub version: String,
    pub power_state: String,
}

/// What the inventory service learns about one machine per tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BmcReport {
    pub bmc: BmcInfo,
    pub bios_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fru: Option<Fru>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_metric: Option<PowerMetric>,
    pub led_state: String,
    pub power_supplies: Vec<PowerSupply>,
}

impl BmcReport {
    /// Map an enriched item, `bmc_port` completes the lease IP to an address
    pub fn from_item(item: &ReportItem, bmc_port: u16) -> Self {
        let ip = &item.lease.ip;
        let address = if ip.contains(':') {
            format!("[{}]:{}", ip, bmc_port)
        } else {
            format!("{}:{}", ip, bmc_port)
        };
        Self {
            bmc: BmcInfo {
                address,
                version: item.bmc_version.clone().unwrap_or_default(),
                power_state: item.power_state.clone().unwrap_or_default(),
            },
            bios_version: item.bios_version.clone().unwrap_or_default(),
            fru: item.fru.clone(),
            power_metric: item.power_metric.clone(),
            led_state: item.indicator_led.clone().unwrap_or_default(),
            power_supplies: item.power_supplies.clone().unwrap_or_default(),
        }
    }
}

/// Machine ids the service touched while applying a batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOutcome {
    #[serde(default)]
    pub created: Vec<String>,
    #[serde(default)]
    pub updated: Vec<String>,
}

/// A machine of the partition with its BMC details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineBmc {
    pub machine_id: String,
    pub bmc: Option<BmcDetails>,
}

#[async_trait]
pub trait InventoryClient: Send + Sync {
    async fn submit_bmc_report(
        &self,
        partition: &str,
        reports: BTreeMap<String, BmcReport>,
    ) -> Result<SubmitOutcome, InventoryError>;

    async fn machine_bmc(&self, machine_id: &str) -> Result<BmcDetails, InventoryError>;

    async fn list_machine_bmcs(&self, partition: &str) -> Result<Vec<MachineBmc>, InventoryError>;
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    partition: &'a str,
    reports: BTreeMap<String, BmcReport>,
}

/// Inventory service over HTTP with bearer token auth
pub struct HttpInventoryClient {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpInventoryClient {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, InventoryError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(InventoryError::InvalidUrl(base_url));
        }
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("bmc-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url,
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, InventoryError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(InventoryError::Status { status, body })
    }
}

#[async_trait]
impl InventoryClient for HttpInventoryClient {
    async fn submit_bmc_report(
        &self,
        partition: &str,
        reports: BTreeMap<String, BmcReport>,
    ) -> Result<SubmitOutcome, InventoryError> {
        debug!(partition = %partition, reports = reports.len(), "submitting bmc reports");
        let response = self
            .client
            .post(self.url("v1/bmc/reports"))
            .bearer_auth(&self.token)
            .json(&SubmitRequest { partition, reports })
            .send()
            .await?;
        let outcome = Self::check(response).await?.json::<SubmitOutcome>().await?;
        Ok(outcome)
    }

    async fn machine_bmc(&self, machine_id: &str) -> Result<BmcDetails, InventoryError> {
        let response = self
            .client
            .get(self.url(&format!("v1/machines/{}/bmc", machine_id)))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(InventoryError::NotFound(machine_id.to_string()));
        }
        let machine = Self::check(response).await?.json::<MachineBmc>().await?;
        machine
            .bmc
            .filter(|bmc| !bmc.address.is_empty())
            .ok_or_else(|| InventoryError::NoBmcDetails(machine_id.to_string()))
    }

    async fn list_machine_bmcs(&self, partition: &str) -> Result<Vec<MachineBmc>, InventoryError> {
        let response = self
            .client
            .get(self.url("v1/machines/bmc"))
            .query(&[("partition", partition)])
            .bearer_auth(&self.token)
            .send()
            .await?;
        let machines = Self::check(response).await?.json::<Vec<MachineBmc>>().await?;
        Ok(machines)
    }
}
