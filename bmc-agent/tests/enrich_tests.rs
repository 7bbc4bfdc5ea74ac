use bmc_agent::enrich::{enrich, EnrichError, ReportItem};
use bmc_agent::event_log::EventLogCollector;
use bmc_agent::leases::Lease;
use bmc_agent::oob::{BmcAddress, BmcDetails, Credentials, OutOfBandConnector};
use bmc_agent::uuid_cache::UuidCache;
use bmc_devkit::{Call, FakeConnector, FakeInventory, MachineProfile};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn item(ip: &str, mac: &str) -> ReportItem {
    ReportItem::new(Lease {
        mac: mac.to_string(),
        ip: ip.to_string(),
        begin: None,
        end: Utc::now(),
    })
}

fn credentials() -> Credentials {
    Credentials::new("ADMIN", "ADMIN")
}

#[tokio::test]
async fn test_enrich_reads_every_fact() {
    let connector = FakeConnector::new().with_machine("10.0.0.5", MachineProfile::with_uuid("u1"));
    let mut item = item("10.0.0.5", "aa:01");

    enrich(&mut item, &connector, &BmcAddress::new("10.0.0.5", 443), &credentials())
        .await
        .unwrap();

    assert_eq!(item.uuid.as_deref(), Some("u1"));
    assert_eq!(item.bmc_version.as_deref(), Some("1.74"));
    assert_eq!(item.bios_version.as_deref(), Some("3.2"));
    assert_eq!(item.power_state.as_deref(), Some("ON"));
    assert_eq!(item.indicator_led.as_deref(), Some("Off"));
    assert_eq!(item.fru.unwrap().board_mfg.as_deref(), Some("Supermicro"));
    assert_eq!(item.power_supplies, Some(Vec::new()));
    assert_eq!(connector.sessions_opened(), 1);
}

#[tokio::test]
async fn test_enrich_keeps_facts_read_before_and_after_a_failure() {
    let connector = FakeConnector::new().with_machine(
        "10.0.0.5",
        MachineProfile::with_uuid("u1").failing("read_firmware_inventory"),
    );
    let mut item = item("10.0.0.5", "aa:01");

    let err = enrich(&mut item, &connector, &BmcAddress::new("10.0.0.5", 443), &credentials())
        .await
        .unwrap_err();

    assert!(matches!(err, EnrichError::Partial { fact: "firmware inventory", .. }));
    assert_eq!(item.bmc_version, None);
    assert_eq!(item.bios_version, None);
    assert_eq!(item.power_state.as_deref(), Some("ON"));
    assert_eq!(item.uuid.as_deref(), Some("u1"));
    // All reads were still attempted
    assert_eq!(
        connector.calls_for("10.0.0.5"),
        vec![
            Call::ReadFirmwareInventory,
            Call::ReadPowerState,
            Call::ReadBoard,
            Call::ReadUuid
        ]
    );
}

#[tokio::test]
async fn test_enrich_without_session_leaves_item_untouched() {
    let connector = FakeConnector::new().unreachable("10.0.0.5");
    let mut item = item("10.0.0.5", "aa:01");
    let before = item.clone();

    let err = enrich(&mut item, &connector, &BmcAddress::new("10.0.0.5", 443), &credentials())
        .await
        .unwrap_err();

    assert!(matches!(err, EnrichError::Connect(_)));
    assert_eq!(item, before);
}

#[tokio::test]
async fn test_uuid_cache_fills_lazily_once() {
    let connector = FakeConnector::new().with_machine("10.0.0.5", MachineProfile::with_uuid("u1"));
    let cache = UuidCache::new(Arc::new(connector.clone()), credentials(), 2);
    let address = BmcAddress::new("10.0.0.5", 443);

    assert!(cache.is_empty());
    assert_eq!(cache.get("aa:01", &address).await.unwrap(), "u1");
    assert_eq!(cache.get("aa:01", &address).await.unwrap(), "u1");
    assert_eq!(connector.sessions_opened(), 1);

    cache.remember("aa:02", "u2");
    assert_eq!(cache.lookup("aa:02").as_deref(), Some("u2"));
    assert_eq!(cache.len(), 2);
}

#[tokio::test]
async fn test_uuid_cache_warmup() {
    let connector = FakeConnector::new()
        .with_machine("10.0.0.1", MachineProfile::with_uuid("u1").delayed(Duration::from_millis(20)))
        .with_machine("10.0.0.2", MachineProfile::with_uuid("u2").delayed(Duration::from_millis(20)))
        .with_machine("10.0.0.3", MachineProfile::with_uuid("u3").delayed(Duration::from_millis(20)))
        .unreachable("10.0.0.4");
    let cache = UuidCache::new(Arc::new(connector.clone()), credentials(), 2);
    cache.remember("aa:03", "known");

    let targets: BTreeMap<String, BmcAddress> = (1..=4)
        .map(|n| (format!("aa:0{n}"), BmcAddress::new(format!("10.0.0.{n}"), 443)))
        .collect();
    cache.warmup(&targets).await;

    assert_eq!(cache.lookup("aa:01").as_deref(), Some("u1"));
    assert_eq!(cache.lookup("aa:02").as_deref(), Some("u2"));
    // Known entries are not refreshed
    assert_eq!(cache.lookup("aa:03").as_deref(), Some("known"));
    assert_eq!(cache.lookup("aa:04"), None);
    assert!(connector.calls_for("10.0.0.3").is_empty());
    assert!(connector.max_concurrent_sessions() <= 2);
}

#[tokio::test]
async fn test_event_log_collection() {
    let mut profile = MachineProfile::with_uuid("u1");
    profile.event_log = vec!["power supply failure".to_string(), "fan ok".to_string()];
    let connector = FakeConnector::new()
        .with_machine("10.0.0.5", profile)
        .unreachable("10.0.0.6");
    let details = |address: &str| BmcDetails {
        address: address.to_string(),
        user: "ADMIN".to_string(),
        password: "secret".to_string(),
    };
    let inventory = FakeInventory::new()
        .with_machine("m1", details("10.0.0.5:443"))
        .with_machine("m2", details("10.0.0.6"))
        .with_machine("m3", details(""));
    let connector_dyn: Arc<dyn OutOfBandConnector> = Arc::new(connector.clone());

    let collector = EventLogCollector::new(
        "p1",
        Arc::new(inventory),
        connector_dyn,
        443,
        Duration::from_secs(60),
        2,
    );

    assert_eq!(collector.collect().await, 1);
    assert_eq!(connector.calls_for("10.0.0.5"), vec![Call::ReadEventLog]);
}
