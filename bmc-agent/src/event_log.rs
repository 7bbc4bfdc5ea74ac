//! Periodic system event log collection
//!
//! Every interval the partition's machines are listed from the inventory
//! service and each BMC's event log is written to the agent log.

use crate::inventory::{InventoryClient, MachineBmc};
use crate::oob::{OutOfBandConnector, OutOfBandError};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct EventLogCollector {
    partition_id: String,
    inventory: Arc<dyn InventoryClient>,
    connector: Arc<dyn OutOfBandConnector>,
    bmc_port: u16,
    interval: Duration,
    concurrency: usize,
    running: Arc<Semaphore>,
}

impl EventLogCollector {
    pub fn new(
        partition_id: impl Into<String>,
        inventory: Arc<dyn InventoryClient>,
        connector: Arc<dyn OutOfBandConnector>,
        bmc_port: u16,
        interval: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            partition_id: partition_id.into(),
            inventory,
            connector,
            bmc_port,
            interval,
            concurrency: concurrency.max(1),
            running: Arc::new(Semaphore::new(1)),
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.interval, "event log collection started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Ok(permit) = self.running.clone().try_acquire_owned() else {
                        warn!("event log collection is still running");
                        continue;
                    };
                    let this = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        this.collect().await;
                    });
                }
            }
        }

        let _ = self.running.acquire().await;
        info!("event log collection stopped");
    }

    /// Collect once; returns the number of machines whose log was read
    pub async fn collect(&self) -> usize {
        let machines = match self.inventory.list_machine_bmcs(&self.partition_id).await {
            Ok(machines) => machines,
            Err(e) => {
                error!(partition = %self.partition_id, "unable to list machines: {}", e);
                return 0;
            }
        };
        debug!(machines = machines.len(), "fetching system event logs");

        stream::iter(machines)
            .map(|machine| async move {
                let machine_id = machine.machine_id.clone();
                match self.read_log(machine).await {
                    Ok(Some(entries)) => {
                        for entry in entries {
                            info!(machine = %machine_id, log = %entry, "system event log");
                        }
                        true
                    }
                    Ok(None) => false,
                    Err(e) => {
                        error!(machine = %machine_id, "unable to fetch system event log: {}", e);
                        false
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .filter(|read| futures::future::ready(*read))
            .count()
            .await
    }

    async fn read_log(&self, machine: MachineBmc) -> Result<Option<Vec<String>>, OutOfBandError> {
        let Some(details) = machine.bmc.filter(|bmc| !bmc.address.is_empty()) else {
            debug!(machine = %machine.machine_id, "machine has no bmc details");
            return Ok(None);
        };
        let address = details.bmc_address(self.bmc_port)?;
        let session = self.connector.open(&address, &details.credentials()).await?;
        Ok(Some(session.read_event_log().await?))
    }
}
