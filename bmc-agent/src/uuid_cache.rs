//! UUID-by-MAC cache
//!
//! Reading a BMC UUID costs a full session. Machines keep their UUID for
//! their lifetime, so once seen it is remembered and used as fallback when
//! a later enrichment fails to read it.

use crate::enrich::EnrichError;
use crate::oob::{BmcAddress, Credentials, OutOfBandConnector};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct UuidCache {
    connector: Arc<dyn OutOfBandConnector>,
    credentials: Credentials,
    concurrency: usize,
    entries: Mutex<HashMap<String, String>>,
}

impl UuidCache {
    pub fn new(
        connector: Arc<dyn OutOfBandConnector>,
        credentials: Credentials,
        concurrency: usize,
    ) -> Self {
        Self {
            connector,
            credentials,
            concurrency: concurrency.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Populate the cache for every `mac -> address` pair not yet known
    pub async fn warmup(&self, targets: &BTreeMap<String, BmcAddress>) {
        let pending: Vec<(&String, &BmcAddress)> = {
            let entries = self.entries.lock();
            targets
                .iter()
                .filter(|(mac, _)| !entries.contains_key(mac.as_str()))
                .collect()
        };
        info!(machines = pending.len(), "warming up uuid cache");

        let filled = stream::iter(pending)
            .map(|(mac, address)| async move { (mac, self.get(mac, address).await) })
            .buffer_unordered(self.concurrency)
            .fold(0usize, |filled, (mac, result)| async move {
                match result {
                    Ok(_) => filled + 1,
                    Err(e) => {
                        warn!(mac = %mac, "could not warm up uuid: {}", e);
                        filled
                    }
                }
            })
            .await;

        info!(filled, cached = self.len(), "uuid cache warmed up");
    }

    /// Cached UUID of `mac`, read from the BMC at `address` on a miss
    pub async fn get(&self, mac: &str, address: &BmcAddress) -> Result<String, EnrichError> {
        if let Some(uuid) = self.lookup(mac) {
            return Ok(uuid);
        }

        let session = self
            .connector
            .open(address, &self.credentials)
            .await
            .map_err(EnrichError::Connect)?;
        let uuid = session
            .read_uuid()
            .await
            .map_err(|source| EnrichError::Partial {
                fact: "uuid",
                source,
            })?;

        debug!(mac = %mac, uuid = %uuid, "uuid cached");
        self.remember(mac, &uuid);
        Ok(uuid)
    }

    pub fn remember(&self, mac: &str, uuid: &str) {
        self.entries.lock().insert(mac.to_string(), uuid.to_string());
    }

    pub fn lookup(&self, mac: &str) -> Option<String> {
        self.entries.lock().get(mac).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
