//! Out-of-band enrichment of report items
//!
//! One session per machine; every fact is read independently so a failing
//! inventory read never hides an already known power state.

use crate::leases::Lease;
use crate::oob::{
    BmcAddress, Credentials, Fru, OutOfBandConnector, OutOfBandError, PowerMetric, PowerSupply,
};
use thiserror::Error;
use tracing::warn;

/// Everything learned about one machine during one reconciliation run
#[derive(Debug, Clone, PartialEq)]
pub struct ReportItem {
    pub lease: Lease,
    pub uuid: Option<String>,
    pub bmc_version: Option<String>,
    pub bios_version: Option<String>,
    pub power_state: Option<String>,
    pub indicator_led: Option<String>,
    pub power_metric: Option<PowerMetric>,
    pub fru: Option<Fru>,
    pub power_supplies: Option<Vec<PowerSupply>>,
}

impl ReportItem {
    pub fn new(lease: Lease) -> Self {
        Self {
            lease,
            uuid: None,
            bmc_version: None,
            bios_version: None,
            power_state: None,
            indicator_led: None,
            power_metric: None,
            fru: None,
            power_supplies: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("could not establish out-of-band session: {0}")]
    Connect(#[source] OutOfBandError),

    #[error("could not read {fact}: {source}")]
    Partial {
        fact: &'static str,
        #[source]
        source: OutOfBandError,
    },

    #[error("enrichment did not finish within {0:?}")]
    Timeout(std::time::Duration),
}

/// Fill `item` with everything the BMC at `address` exposes
///
/// Returns the first fact read failure after trying all facts.
pub async fn enrich(
    item: &mut ReportItem,
    connector: &dyn OutOfBandConnector,
    address: &BmcAddress,
    credentials: &Credentials,
) -> Result<(), EnrichError> {
    let session = connector
        .open(address, credentials)
        .await
        .map_err(EnrichError::Connect)?;

    let mac = item.lease.mac.clone();
    let mut first_error: Option<EnrichError> = None;
    let mut record = |fact: &'static str, source: OutOfBandError| {
        warn!(
            mac = %mac,
            bmc = %address,
            "could not read {} of device: {}",
            fact,
            source
        );
        if first_error.is_none() {
            first_error = Some(EnrichError::Partial { fact, source });
        }
    };

    match session.read_firmware_inventory().await {
        Ok(inventory) => {
            item.bmc_version = inventory.bmc_version;
            item.bios_version = inventory.bios_version;
            item.fru = inventory.fru;
        }
        Err(e) => record("firmware inventory", e),
    }

    match session.read_power_state().await {
        Ok(state) => item.power_state = Some(state),
        Err(e) => record("power state", e),
    }

    match session.read_board().await {
        Ok(board) => {
            item.indicator_led = board.indicator_led;
            item.power_metric = board.power_metric;
            item.power_supplies = Some(board.power_supplies);
        }
        Err(e) => record("board details", e),
    }

    match session.read_uuid().await {
        Ok(uuid) => item.uuid = Some(uuid),
        Err(e) => record("uuid", e),
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
