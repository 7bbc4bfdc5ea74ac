//! Periodic lease reconciliation
//!
//! Every tick re-reads the lease store, picks the newest active lease of
//! every allowed BMC, enriches it through an out-of-band session and submits
//! the whole batch to the inventory service. At most one run is in flight.

use crate::enrich::{enrich, EnrichError, ReportItem};
use crate::inventory::{BmcReport, InventoryClient, InventoryError, SubmitOutcome};
use crate::leases::{read_leases, LeaseFormat, LeaseReadError};
use crate::oob::{BmcAddress, Credentials, OutOfBandConnector};
use crate::uuid_cache::UuidCache;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use ipnetwork::IpNetwork;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Leases(#[from] LeaseReadError),

    #[error("could not submit bmc reports: {0}")]
    Submit(#[from] InventoryError),
}

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub partition_id: String,
    pub lease_file: PathBuf,
    pub lease_format: LeaseFormat,
    pub allowed_networks: Vec<IpNetwork>,
    /// Lowercase MACs
    pub ignored_macs: HashSet<String>,
    pub interval: Duration,
    pub concurrency: usize,
    pub enrich_timeout: Duration,
    pub bmc_port: u16,
}

/// What one run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Allowed leases handed to enrichment
    pub considered: usize,
    /// Items submitted, i.e. with a known UUID
    pub reported: usize,
    pub outcome: Option<SubmitOutcome>,
}

#[derive(Clone)]
pub struct Reconciler {
    settings: Arc<ReconcilerSettings>,
    connector: Arc<dyn OutOfBandConnector>,
    inventory: Arc<dyn InventoryClient>,
    credentials: Credentials,
    uuid_cache: Arc<UuidCache>,
    running: Arc<Semaphore>,
}

impl Reconciler {
    pub fn new(
        settings: ReconcilerSettings,
        connector: Arc<dyn OutOfBandConnector>,
        inventory: Arc<dyn InventoryClient>,
        credentials: Credentials,
        uuid_cache: Arc<UuidCache>,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            connector,
            inventory,
            credentials,
            uuid_cache,
            running: Arc::new(Semaphore::new(1)),
        }
    }

    /// Tick every interval until `shutdown`, then wait for the in-flight run
    pub async fn run(&self, shutdown: CancellationToken) {
        let period = self.settings.interval;
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            partition = %self.settings.partition_id,
            interval = ?period,
            "reconciler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }

        info!("reconciler stopping, waiting for running report");
        // The permit is only free once a spawned run has dropped it
        let _ = self.running.acquire().await;
        info!("reconciler stopped");
    }

    /// Start a run unless one is still in flight
    pub fn tick(&self) -> Option<JoinHandle<()>> {
        let permit = match self.running.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("lease reporting is still running");
                return None;
            }
        };

        let this = self.clone();
        Some(tokio::spawn(async move {
            let _permit = permit;
            let start = Instant::now();
            match this.collect_and_report().await {
                Ok(summary) => info!(
                    considered = summary.considered,
                    reported = summary.reported,
                    took = ?start.elapsed(),
                    "lease reporting finished"
                ),
                Err(e) => error!("collect and report: {}", e),
            }
        }))
    }

    /// One complete run, without single-flight protection
    pub async fn collect_and_report(&self) -> Result<RunSummary, ReconcileError> {
        let settings = &self.settings;
        let parsed = read_leases(&settings.lease_file, settings.lease_format).await?;
        for skipped in &parsed.skipped {
            warn!(file = %settings.lease_file.display(), "skipped lease row: {}", skipped);
        }

        let leases = parsed.leases;
        if leases.is_empty() {
            warn!("empty leases returned, nothing to report");
            return Ok(RunSummary::default());
        }

        let active = leases.filter_active(Utc::now());
        let latest = active.latest_by_identifier();
        let unique_active = latest.len();
        let allowed = latest
            .into_values()
            .collect::<crate::leases::LeaseSet>()
            .filter_allowed(&settings.allowed_networks, &settings.ignored_macs);

        info!(
            all = leases.len(),
            active = active.len(),
            unique_active,
            allowed = allowed.len(),
            "consider reporting leases"
        );

        let considered = allowed.len();
        let items: Vec<ReportItem> = stream::iter(allowed.into_iter().map(ReportItem::new))
            .map(|item| self.enrich_item(item))
            .buffer_unordered(settings.concurrency.max(1))
            .collect()
            .await;

        let mut reports = BTreeMap::new();
        for item in &items {
            match &item.uuid {
                Some(uuid) => {
                    reports.insert(uuid.clone(), BmcReport::from_item(item, settings.bmc_port));
                }
                None => error!(
                    mac = %item.lease.mac,
                    ip = %item.lease.ip,
                    "could not determine uuid of device"
                ),
            }
        }

        let reported = reports.len();
        let outcome = self
            .inventory
            .submit_bmc_report(&settings.partition_id, reports)
            .await?;

        info!(
            partition = %settings.partition_id,
            created = outcome.created.len(),
            updated = outcome.updated.len(),
            "updated bmc information"
        );
        for uuid in &outcome.updated {
            debug!(uuid = %uuid, "bmc information was updated for machine");
        }
        for uuid in &outcome.created {
            debug!(uuid = %uuid, "bmc information was set and machine was created");
        }

        Ok(RunSummary {
            considered,
            reported,
            outcome: Some(outcome),
        })
    }

    async fn enrich_item(&self, mut item: ReportItem) -> ReportItem {
        let address = BmcAddress::new(item.lease.ip.clone(), self.settings.bmc_port);
        let limit = self.settings.enrich_timeout;

        let result = match timeout(
            limit,
            enrich(&mut item, self.connector.as_ref(), &address, &self.credentials),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(EnrichError::Timeout(limit)),
        };
        if let Err(e) = &result {
            warn!(mac = %item.lease.mac, ip = %item.lease.ip, "could not enrich bmc details: {}", e);
        }

        match &item.uuid {
            Some(uuid) => self.uuid_cache.remember(&item.lease.mac, uuid),
            None => {
                let cached = match result {
                    // Session already failed, only a cached value helps
                    Err(EnrichError::Connect(_)) | Err(EnrichError::Timeout(_)) => {
                        self.uuid_cache.lookup(&item.lease.mac)
                    }
                    _ => match timeout(limit, self.uuid_cache.get(&item.lease.mac, &address)).await {
                        Ok(Ok(uuid)) => Some(uuid),
                        Ok(Err(e)) => {
                            debug!(mac = %item.lease.mac, "uuid cache miss: {}", e);
                            None
                        }
                        Err(_) => None,
                    },
                };
                item.uuid = cached;
            }
        }

        item
    }
}
