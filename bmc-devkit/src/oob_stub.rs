/*!
Spy out-of-band sessions

`FakeConnector` hands out `SpySession`s that answer from a per-host
`MachineProfile` and record every call, so tests can assert on exactly which
BMC actions were attempted and in which order.
*/

use async_trait::async_trait;
use bmc_agent::oob::{
    BmcAddress, BoardFacts, BootTarget, ConsoleStream, Credentials, FirmwareInventory,
    FirmwareKind, Fru, OutOfBandConnector, OutOfBandError, OutOfBandSession,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    PowerOn,
    PowerOff,
    PowerReset,
    PowerCycle,
    BootTarget(BootTarget),
    IdentifyLedOn,
    IdentifyLedOff,
    ReadUuid,
    ReadFirmwareInventory,
    ReadPowerState,
    ReadBoard,
    UpdateFirmware(FirmwareKind, String),
    ReadEventLog,
    OpenConsole,
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Call::PowerOn => "power_on",
            Call::PowerOff => "power_off",
            Call::PowerReset => "power_reset",
            Call::PowerCycle => "power_cycle",
            Call::BootTarget(_) => "select_boot_target",
            Call::IdentifyLedOn => "identify_led_on",
            Call::IdentifyLedOff => "identify_led_off",
            Call::ReadUuid => "read_uuid",
            Call::ReadFirmwareInventory => "read_firmware_inventory",
            Call::ReadPowerState => "read_power_state",
            Call::ReadBoard => "read_board",
            Call::UpdateFirmware(..) => "update_firmware",
            Call::ReadEventLog => "read_event_log",
            Call::OpenConsole => "open_console",
        }
    }
}

/// What a fake BMC answers
#[derive(Debug, Clone, Default)]
pub struct MachineProfile {
    pub uuid: Option<String>,
    pub inventory: FirmwareInventory,
    pub power_state: String,
    pub board: BoardFacts,
    pub event_log: Vec<String>,
    /// Call names, see [`Call::name`], that fail with a request error
    pub failing: HashSet<&'static str>,
    /// Applied before every call answers
    pub delay: Duration,
    /// Console banner; the console echoes everything after it
    pub console_banner: Option<String>,
}

impl MachineProfile {
    pub fn with_uuid(uuid: &str) -> Self {
        Self {
            uuid: Some(uuid.to_string()),
            inventory: FirmwareInventory {
                bmc_version: Some("1.74".to_string()),
                bios_version: Some("3.2".to_string()),
                fru: Some(Fru {
                    board_mfg: Some("Supermicro".to_string()),
                    product_serial: Some(format!("S-{uuid}")),
                    ..Fru::default()
                }),
            },
            power_state: "ON".to_string(),
            board: BoardFacts {
                indicator_led: Some("Off".to_string()),
                ..BoardFacts::default()
            },
            ..Self::default()
        }
    }

    pub fn failing(mut self, call: &'static str) -> Self {
        self.failing.insert(call);
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Default)]
struct Shared {
    calls: Mutex<Vec<(String, Call)>>,
    opened: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
}

/// Connector answering from profiles registered per BMC host
#[derive(Clone, Default)]
pub struct FakeConnector {
    profiles: Arc<Mutex<HashMap<String, MachineProfile>>>,
    unreachable: Arc<Mutex<HashSet<String>>>,
    fallback: Arc<Mutex<Option<MachineProfile>>>,
    shared: Arc<Shared>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_machine(self, host: &str, profile: MachineProfile) -> Self {
        self.profiles.lock().insert(host.to_string(), profile);
        self
    }

    /// Profile for hosts without their own
    pub fn with_fallback(self, profile: MachineProfile) -> Self {
        *self.fallback.lock() = Some(profile);
        self
    }

    pub fn unreachable(self, host: &str) -> Self {
        self.unreachable.lock().insert(host.to_string());
        self
    }

    pub fn set_profile(&self, host: &str, profile: MachineProfile) {
        self.profiles.lock().insert(host.to_string(), profile);
    }

    /// Every call on every session, tagged with the BMC host
    pub fn calls(&self) -> Vec<(String, Call)> {
        self.shared.calls.lock().clone()
    }

    pub fn calls_for(&self, host: &str) -> Vec<Call> {
        self.shared
            .calls
            .lock()
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn sessions_opened(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    /// Highest number of sessions alive at the same time
    pub fn max_concurrent_sessions(&self) -> usize {
        self.shared.max_live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OutOfBandConnector for FakeConnector {
    async fn open(
        &self,
        address: &BmcAddress,
        _credentials: &Credentials,
    ) -> Result<Box<dyn OutOfBandSession>, OutOfBandError> {
        if self.unreachable.lock().contains(&address.host) {
            return Err(OutOfBandError::Connect {
                address: address.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        let profile = self
            .profiles
            .lock()
            .get(&address.host)
            .cloned()
            .or_else(|| self.fallback.lock().clone())
            .ok_or_else(|| OutOfBandError::Connect {
                address: address.to_string(),
                reason: "no route to host".to_string(),
            })?;

        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        let live = self.shared.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_live.fetch_max(live, Ordering::SeqCst);

        Ok(Box::new(SpySession {
            host: address.host.clone(),
            profile,
            shared: self.shared.clone(),
        }))
    }
}

pub struct SpySession {
    host: String,
    profile: MachineProfile,
    shared: Arc<Shared>,
}

impl Drop for SpySession {
    fn drop(&mut self) {
        self.shared.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SpySession {
    async fn record(&self, call: Call) -> Result<(), OutOfBandError> {
        let name = call.name();
        self.shared.calls.lock().push((self.host.clone(), call));
        if !self.profile.delay.is_zero() {
            tokio::time::sleep(self.profile.delay).await;
        }
        if self.profile.failing.contains(name) {
            return Err(OutOfBandError::Request(format!("{name} failed on {}", self.host)));
        }
        Ok(())
    }
}

#[async_trait]
impl OutOfBandSession for SpySession {
    async fn power_on(&self) -> Result<(), OutOfBandError> {
        self.record(Call::PowerOn).await
    }

    async fn power_off(&self) -> Result<(), OutOfBandError> {
        self.record(Call::PowerOff).await
    }

    async fn power_reset(&self) -> Result<(), OutOfBandError> {
        self.record(Call::PowerReset).await
    }

    async fn power_cycle(&self) -> Result<(), OutOfBandError> {
        self.record(Call::PowerCycle).await
    }

    async fn select_boot_target(&self, target: BootTarget) -> Result<(), OutOfBandError> {
        self.record(Call::BootTarget(target)).await
    }

    async fn identify_led_on(&self) -> Result<(), OutOfBandError> {
        self.record(Call::IdentifyLedOn).await
    }

    async fn identify_led_off(&self) -> Result<(), OutOfBandError> {
        self.record(Call::IdentifyLedOff).await
    }

    async fn read_uuid(&self) -> Result<String, OutOfBandError> {
        self.record(Call::ReadUuid).await?;
        self.profile
            .uuid
            .clone()
            .ok_or_else(|| OutOfBandError::InvalidResponse("no uuid".to_string()))
    }

    async fn read_firmware_inventory(&self) -> Result<FirmwareInventory, OutOfBandError> {
        self.record(Call::ReadFirmwareInventory).await?;
        Ok(self.profile.inventory.clone())
    }

    async fn read_power_state(&self) -> Result<String, OutOfBandError> {
        self.record(Call::ReadPowerState).await?;
        Ok(self.profile.power_state.clone())
    }

    async fn read_board(&self) -> Result<BoardFacts, OutOfBandError> {
        self.record(Call::ReadBoard).await?;
        Ok(self.profile.board.clone())
    }

    async fn update_firmware(&self, kind: FirmwareKind, url: &str) -> Result<(), OutOfBandError> {
        self.record(Call::UpdateFirmware(kind, url.to_string())).await
    }

    async fn read_event_log(&self) -> Result<Vec<String>, OutOfBandError> {
        self.record(Call::ReadEventLog).await?;
        Ok(self.profile.event_log.clone())
    }

    async fn open_console(&self) -> Result<ConsoleStream, OutOfBandError> {
        self.record(Call::OpenConsole).await?;
        let Some(banner) = self.profile.console_banner.clone() else {
            return Err(OutOfBandError::Unsupported("serial console"));
        };

        let (agent_side, mut bmc_side) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            if bmc_side.write_all(banner.as_bytes()).await.is_err() {
                return;
            }
            let mut buf = [0u8; 256];
            loop {
                match bmc_side.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if bmc_side.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(Box::new(agent_side))
    }
}
