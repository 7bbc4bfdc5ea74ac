//! Redfish adapter for out-of-band sessions
//!
//! Speaks DMTF Redfish over HTTPS with basic authentication:
//! - resolves the first ComputerSystem, Manager and Chassis on open
//! - maps power/boot/identify operations onto Reset actions and PATCHes
//! - polls the update task monitor while a firmware flash runs
//! - serial consoles go through IPMI SOL when configured
//!
//! BMCs ship self-signed certificates, verification is configurable.

use super::sol::{self, SolSettings};
use super::{
    BmcAddress, BoardFacts, BootTarget, ConsoleStream, Credentials, FirmwareInventory,
    FirmwareKind, Fru, OutOfBandConnector, OutOfBandError, OutOfBandSession, PowerMetric,
    PowerSupply,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::LOCATION;
use reqwest::{Client, Method, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const SERVICE_ROOT: &str = "/redfish/v1";
const TASK_POLL_INTERVAL: Duration = Duration::from_secs(10);
const TASK_POLL_LIMIT: u32 = 360;

/// Opens Redfish sessions with a shared HTTP connection pool
#[derive(Clone)]
pub struct RedfishConnector {
    client: Client,
    console: Option<SolSettings>,
}

impl RedfishConnector {
    pub fn new(request_timeout: Duration, accept_invalid_certs: bool) -> Result<Self, OutOfBandError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()?;
        Ok(Self {
            client,
            console: None,
        })
    }

    /// Serve `open_console` through IPMI SOL
    pub fn with_console(mut self, settings: SolSettings) -> Self {
        self.console = Some(settings);
        self
    }
}

#[async_trait]
impl OutOfBandConnector for RedfishConnector {
    async fn open(
        &self,
        address: &BmcAddress,
        credentials: &Credentials,
    ) -> Result<Box<dyn OutOfBandSession>, OutOfBandError> {
        let mut session = RedfishSession {
            client: self.client.clone(),
            base_url: format!("https://{}", address),
            host: address.host.clone(),
            credentials: credentials.clone(),
            console: self.console.clone(),
            system_document: Mutex::new(None),
            system: String::new(),
            manager: String::new(),
            chassis: String::new(),
        };

        let connect_err = |e: OutOfBandError| OutOfBandError::Connect {
            address: address.to_string(),
            reason: e.to_string(),
        };
        session.system = session.first_member("Systems").await.map_err(connect_err)?;
        session.manager = session.first_member("Managers").await.map_err(connect_err)?;
        session.chassis = session.first_member("Chassis").await.map_err(connect_err)?;

        debug!(bmc = %address, system = %session.system, "redfish session opened");
        Ok(Box::new(session))
    }
}

pub struct RedfishSession {
    client: Client,
    base_url: String,
    host: String,
    credentials: Credentials,
    console: Option<SolSettings>,
    /// ComputerSystem as last read, dropped on every write
    system_document: Mutex<Option<Arc<ComputerSystem>>>,
    system: String,
    manager: String,
    chassis: String,
}

#[derive(Deserialize)]
struct Collection {
    #[serde(rename = "Members", default)]
    members: Vec<Link>,
}

#[derive(Deserialize)]
struct Link {
    #[serde(rename = "@odata.id")]
    id: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct ComputerSystem {
    #[serde(rename = "UUID")]
    uuid: Option<String>,
    power_state: Option<String>,
    bios_version: Option<String>,
    #[serde(rename = "IndicatorLED")]
    indicator_led: Option<String>,
    manufacturer: Option<String>,
    part_number: Option<String>,
    serial_number: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct Manager {
    firmware_version: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct Chassis {
    manufacturer: Option<String>,
    part_number: Option<String>,
    serial_number: Option<String>,
    #[serde(rename = "SKU")]
    sku: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct Power {
    power_control: Vec<PowerControl>,
    power_supplies: Vec<PowerSupplyResource>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct PowerControl {
    power_metrics: Option<PowerMetrics>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct PowerMetrics {
    average_consumed_watts: Option<f32>,
    interval_in_min: Option<f32>,
    max_consumed_watts: Option<f32>,
    min_consumed_watts: Option<f32>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct PowerSupplyResource {
    status: Option<Status>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct Status {
    health: Option<String>,
    state: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct LogEntries {
    members: Vec<LogEntry>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct LogEntry {
    created: Option<String>,
    severity: Option<String>,
    message: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct Task {
    task_state: Option<String>,
}

impl RedfishSession {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, OutOfBandError> {
        if method != Method::GET {
            self.system_document.lock().take();
        }
        let mut request = self
            .client
            .request(method, self.url(path))
            .basic_auth(&self.credentials.user, Some(&self.credentials.password));
        if let Some(body) = body {
            request = request.json(&body);
        }
        Ok(request.send().await?.error_for_status()?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, OutOfBandError> {
        let response = self.send(Method::GET, path, None).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| OutOfBandError::InvalidResponse(format!("{}: {}", path, e)))
    }

    async fn first_member(&self, collection: &str) -> Result<String, OutOfBandError> {
        let path = format!("{}/{}", SERVICE_ROOT, collection);
        let members: Collection = self.get(&path).await?;
        members
            .members
            .into_iter()
            .next()
            .map(|link| link.id)
            .ok_or_else(|| OutOfBandError::InvalidResponse(format!("{} is empty", path)))
    }

    async fn reset(&self, reset_type: &str) -> Result<(), OutOfBandError> {
        let path = format!("{}/Actions/ComputerSystem.Reset", self.system);
        self.send(Method::POST, &path, Some(json!({ "ResetType": reset_type })))
            .await?;
        Ok(())
    }

    async fn system(&self) -> Result<Arc<ComputerSystem>, OutOfBandError> {
        if let Some(system) = self.system_document.lock().clone() {
            return Ok(system);
        }
        let system: Arc<ComputerSystem> = Arc::new(self.get(&self.system).await?);
        *self.system_document.lock() = Some(system.clone());
        Ok(system)
    }

    async fn wait_for_task(&self, task: &str) -> Result<(), OutOfBandError> {
        for _ in 0..TASK_POLL_LIMIT {
            tokio::time::sleep(TASK_POLL_INTERVAL).await;
            let state: Task = self.get(task).await?;
            match state.task_state.as_deref() {
                Some("Completed") => return Ok(()),
                Some(s @ ("Exception" | "Killed" | "Cancelled")) => {
                    return Err(OutOfBandError::Request(format!("update task {} ended {}", task, s)))
                }
                _ => {}
            }
        }
        Err(OutOfBandError::Request(format!(
            "update task {} did not finish in time",
            task
        )))
    }
}

/// Path of a task monitor `Location`, which may be relative or absolute
fn task_path(location: &str) -> String {
    match Url::parse(location) {
        Ok(url) => url.path().to_string(),
        Err(_) => location.to_string(),
    }
}

fn boot_override(target: BootTarget) -> &'static str {
    match target {
        BootTarget::Bios => "BiosSetup",
        BootTarget::Disk => "Hdd",
        BootTarget::Pxe => "Pxe",
    }
}

#[async_trait]
impl OutOfBandSession for RedfishSession {
    async fn power_on(&self) -> Result<(), OutOfBandError> {
        self.reset("On").await
    }

    async fn power_off(&self) -> Result<(), OutOfBandError> {
        self.reset("ForceOff").await
    }

    async fn power_reset(&self) -> Result<(), OutOfBandError> {
        self.reset("ForceRestart").await
    }

    async fn power_cycle(&self) -> Result<(), OutOfBandError> {
        self.reset("PowerCycle").await
    }

    async fn select_boot_target(&self, target: BootTarget) -> Result<(), OutOfBandError> {
        let body = json!({
            "Boot": {
                "BootSourceOverrideEnabled": "Once",
                "BootSourceOverrideTarget": boot_override(target),
            }
        });
        self.send(Method::PATCH, &self.system, Some(body)).await?;
        Ok(())
    }

    async fn identify_led_on(&self) -> Result<(), OutOfBandError> {
        self.send(Method::PATCH, &self.system, Some(json!({ "IndicatorLED": "Lit" })))
            .await?;
        Ok(())
    }

    async fn identify_led_off(&self) -> Result<(), OutOfBandError> {
        self.send(Method::PATCH, &self.system, Some(json!({ "IndicatorLED": "Off" })))
            .await?;
        Ok(())
    }

    async fn read_uuid(&self) -> Result<String, OutOfBandError> {
        let raw = self
            .system()
            .await?
            .uuid
            .clone()
            .ok_or_else(|| OutOfBandError::InvalidResponse("system has no UUID".to_string()))?;
        uuid::Uuid::parse_str(&raw)
            .map(|u| u.hyphenated().to_string())
            .map_err(|e| OutOfBandError::InvalidResponse(format!("invalid UUID {:?}: {}", raw, e)))
    }

    async fn read_firmware_inventory(&self) -> Result<FirmwareInventory, OutOfBandError> {
        let manager: Manager = self.get(&self.manager).await?;
        let system = self.system().await?;
        let chassis: Chassis = self.get(&self.chassis).await?;

        let fru = Fru {
            board_mfg: chassis.manufacturer,
            board_mfg_serial: chassis.serial_number.clone(),
            board_part_number: chassis.sku,
            chassis_part_number: chassis.part_number,
            chassis_part_serial: chassis.serial_number,
            product_manufacturer: system.manufacturer.clone(),
            product_part_number: system.part_number.clone(),
            product_serial: system.serial_number.clone(),
        };

        Ok(FirmwareInventory {
            bmc_version: manager.firmware_version,
            bios_version: system.bios_version.clone(),
            fru: Some(fru),
        })
    }

    async fn read_power_state(&self) -> Result<String, OutOfBandError> {
        self.system()
            .await?
            .power_state
            .as_deref()
            .map(str::to_uppercase)
            .ok_or_else(|| OutOfBandError::InvalidResponse("system has no PowerState".to_string()))
    }

    async fn read_board(&self) -> Result<BoardFacts, OutOfBandError> {
        let system = self.system().await?;
        let power: Power = self.get(&format!("{}/Power", self.chassis)).await?;

        let power_metric = power
            .power_control
            .into_iter()
            .find_map(|control| control.power_metrics)
            .map(|m| PowerMetric {
                average_consumed_watts: m.average_consumed_watts.unwrap_or_default(),
                interval_in_min: m.interval_in_min.unwrap_or_default(),
                max_consumed_watts: m.max_consumed_watts.unwrap_or_default(),
                min_consumed_watts: m.min_consumed_watts.unwrap_or_default(),
            });
        let power_supplies = power
            .power_supplies
            .into_iter()
            .filter_map(|ps| ps.status)
            .map(|status| PowerSupply {
                health: status.health.unwrap_or_default(),
                state: status.state.unwrap_or_default(),
            })
            .collect();

        Ok(BoardFacts {
            indicator_led: system.indicator_led.clone(),
            power_metric,
            power_supplies,
        })
    }

    async fn update_firmware(&self, kind: FirmwareKind, url: &str) -> Result<(), OutOfBandError> {
        let target = match kind {
            FirmwareKind::Bios => &self.system,
            FirmwareKind::Bmc => &self.manager,
        };
        let body = json!({ "ImageURI": url, "Targets": [target] });
        let path = format!("{}/UpdateService/Actions/UpdateService.SimpleUpdate", SERVICE_ROOT);
        let response = self.send(Method::POST, &path, Some(body)).await?;
        info!(kind = %kind, url = %url, "firmware update accepted by bmc");

        let task = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(task_path);
        match task {
            Some(task) => self.wait_for_task(&task).await,
            None => Ok(()),
        }
    }

    async fn read_event_log(&self) -> Result<Vec<String>, OutOfBandError> {
        let entries: LogEntries = self
            .get(&format!("{}/LogServices/SEL/Entries", self.system))
            .await?;
        Ok(entries
            .members
            .into_iter()
            .map(|e| {
                format!(
                    "{} {} {}",
                    e.created.unwrap_or_default(),
                    e.severity.unwrap_or_default(),
                    e.message.unwrap_or_default()
                )
                .trim()
                .to_string()
            })
            .collect())
    }

    async fn open_console(&self) -> Result<ConsoleStream, OutOfBandError> {
        match &self.console {
            Some(settings) => sol::activate(settings, &self.host, &self.credentials).await,
            None => Err(OutOfBandError::Unsupported("serial console")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_override_targets() {
        assert_eq!(boot_override(BootTarget::Bios), "BiosSetup");
        assert_eq!(boot_override(BootTarget::Disk), "Hdd");
        assert_eq!(boot_override(BootTarget::Pxe), "Pxe");
    }

    #[test]
    fn test_task_path() {
        assert_eq!(
            task_path("https://10.0.0.5/redfish/v1/TaskService/Tasks/1"),
            "/redfish/v1/TaskService/Tasks/1"
        );
        assert_eq!(
            task_path("https://10.0.0.5:443/redfish/v1/TaskService/Tasks/2"),
            "/redfish/v1/TaskService/Tasks/2"
        );
        assert_eq!(
            task_path("/redfish/v1/TaskService/Tasks/3"),
            "/redfish/v1/TaskService/Tasks/3"
        );
    }

    #[test]
    fn test_decode_system() {
        let system: ComputerSystem = serde_json::from_value(json!({
            "UUID": "4C4C4544-0042-3510-8054-B3C04F4E4E32",
            "PowerState": "On",
            "BiosVersion": "2.3.4",
            "IndicatorLED": "Off",
            "Boot": { "BootSourceOverrideTarget": "None" }
        }))
        .unwrap();
        assert_eq!(system.power_state.as_deref(), Some("On"));
        assert_eq!(system.bios_version.as_deref(), Some("2.3.4"));
        assert!(system.uuid.is_some());
        assert!(system.serial_number.is_none());
    }

    const SYSTEM_JSON: &str = r#"{"UUID":"4C4C4544-0042-3510-8054-B3C04F4E4E32","PowerState":"On","BiosVersion":"2.3.4","IndicatorLED":"Off"}"#;

    /// Answers every request with `SYSTEM_JSON` and records the request lines
    async fn serve(listener: tokio::net::TcpListener, hits: Arc<Mutex<Vec<String>>>) {
        use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let hits = hits.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(socket);
                loop {
                    let mut request_line = String::new();
                    if reader.read_line(&mut request_line).await.unwrap_or(0) == 0 {
                        return;
                    }
                    let mut length = 0usize;
                    loop {
                        let mut header = String::new();
                        reader.read_line(&mut header).await.unwrap();
                        let header = header.trim().to_ascii_lowercase();
                        if header.is_empty() {
                            break;
                        }
                        if let Some(value) = header.strip_prefix("content-length:") {
                            length = value.trim().parse().unwrap();
                        }
                    }
                    let mut body = vec![0u8; length];
                    reader.read_exact(&mut body).await.unwrap();
                    hits.lock().push(request_line.trim().to_string());

                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                        SYSTEM_JSON.len(),
                        SYSTEM_JSON
                    );
                    reader.get_mut().write_all(response.as_bytes()).await.unwrap();
                }
            });
        }
    }

    #[tokio::test]
    async fn test_system_document_is_read_once_per_session() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(serve(listener, hits.clone()));

        let session = RedfishSession {
            client: Client::new(),
            base_url: format!("http://{addr}"),
            host: addr.ip().to_string(),
            credentials: Credentials::new("ADMIN", "ADMIN"),
            console: None,
            system_document: Mutex::new(None),
            system: "/redfish/v1/Systems/1".to_string(),
            manager: "/redfish/v1/Managers/1".to_string(),
            chassis: "/redfish/v1/Chassis/1".to_string(),
        };
        let system_reads = || {
            hits.lock()
                .iter()
                .filter(|line| line.as_str() == "GET /redfish/v1/Systems/1 HTTP/1.1")
                .count()
        };

        let inventory = session.read_firmware_inventory().await.unwrap();
        assert_eq!(inventory.bios_version.as_deref(), Some("2.3.4"));
        assert_eq!(session.read_power_state().await.unwrap(), "ON");
        assert_eq!(session.read_board().await.unwrap().indicator_led.as_deref(), Some("Off"));
        assert_eq!(
            session.read_uuid().await.unwrap(),
            "4c4c4544-0042-3510-8054-b3c04f4e4e32"
        );
        assert_eq!(system_reads(), 1);

        // Writes invalidate the cached document
        session.identify_led_on().await.unwrap();
        session.read_power_state().await.unwrap();
        assert_eq!(system_reads(), 2);
    }

    #[tokio::test]
    async fn test_console_without_sol_is_unsupported() {
        let session = RedfishSession {
            client: Client::new(),
            base_url: "http://127.0.0.1:1".to_string(),
            host: "127.0.0.1".to_string(),
            credentials: Credentials::new("ADMIN", "ADMIN"),
            console: None,
            system_document: Mutex::new(None),
            system: String::new(),
            manager: String::new(),
            chassis: String::new(),
        };
        assert!(matches!(
            session.open_console().await,
            Err(OutOfBandError::Unsupported(_))
        ));
    }

    #[test]
    fn test_decode_power() {
        let power: Power = serde_json::from_value(json!({
            "PowerControl": [{
                "PowerMetrics": { "AverageConsumedWatts": 180.0, "IntervalInMin": 1.0 }
            }],
            "PowerSupplies": [
                { "Status": { "Health": "OK", "State": "Enabled" } },
                { "Name": "PSU2" }
            ]
        }))
        .unwrap();
        let metrics = power.power_control[0].power_metrics.as_ref().unwrap();
        assert_eq!(metrics.average_consumed_watts, Some(180.0));
        assert_eq!(metrics.max_consumed_watts, None);
        assert_eq!(power.power_supplies.len(), 2);
        assert!(power.power_supplies[1].status.is_none());
    }
}
