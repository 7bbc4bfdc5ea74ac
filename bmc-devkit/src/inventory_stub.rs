/*!
Fake inventory service

Records every submitted batch. With a gate, submissions block until the
test opens it, which keeps a reconciliation run in flight on demand.
*/

use async_trait::async_trait;
use bmc_agent::inventory::{
    BmcReport, InventoryClient, InventoryError, MachineBmc, SubmitOutcome,
};
use bmc_agent::oob::BmcDetails;
use parking_lot::Mutex;
use reqwest::StatusCode;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub partition: String,
    pub reports: BTreeMap<String, BmcReport>,
}

#[derive(Clone, Default)]
pub struct FakeInventory {
    submissions: Arc<Mutex<Vec<Submission>>>,
    machines: Arc<Mutex<HashMap<String, BmcDetails>>>,
    submit_calls: Arc<AtomicUsize>,
    fail_submit: Arc<AtomicBool>,
    gate: Option<Arc<Semaphore>>,
}

impl FakeInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submissions wait until [`FakeInventory::open_gate`]
    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::default()
        }
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn with_machine(self, machine_id: &str, bmc: BmcDetails) -> Self {
        self.machines.lock().insert(machine_id.to_string(), bmc);
        self
    }

    pub fn fail_submissions(&self, fail: bool) {
        self.fail_submit.store(fail, Ordering::SeqCst);
    }

    /// Submissions that went through
    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().clone()
    }

    /// Submit calls started, including gated and failed ones
    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InventoryClient for FakeInventory {
    async fn submit_bmc_report(
        &self,
        partition: &str,
        reports: BTreeMap<String, BmcReport>,
    ) -> Result<SubmitOutcome, InventoryError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(InventoryError::Status {
                status: StatusCode::SERVICE_UNAVAILABLE,
                body: format!("partition {partition} is unavailable"),
            });
        }

        let known = self.machines.lock();
        let (updated, created): (Vec<String>, Vec<String>) =
            reports.keys().cloned().partition(|uuid| known.contains_key(uuid));
        drop(known);

        self.submissions.lock().push(Submission {
            partition: partition.to_string(),
            reports,
        });
        Ok(SubmitOutcome { created, updated })
    }

    async fn machine_bmc(&self, machine_id: &str) -> Result<BmcDetails, InventoryError> {
        self.machines
            .lock()
            .get(machine_id)
            .cloned()
            .ok_or_else(|| InventoryError::NotFound(machine_id.to_string()))
    }

    async fn list_machine_bmcs(&self, _partition: &str) -> Result<Vec<MachineBmc>, InventoryError> {
        let mut machines: Vec<MachineBmc> = self
            .machines
            .lock()
            .iter()
            .map(|(id, bmc)| MachineBmc {
                machine_id: id.clone(),
                bmc: Some(bmc.clone()),
            })
            .collect();
        machines.sort_by(|a, b| a.machine_id.cmp(&b.machine_id));
        Ok(machines)
    }
}
