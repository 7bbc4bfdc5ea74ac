use bmc_agent::console::{load_acceptor, ConsoleError, ConsoleProxy, ConsoleSettings};
use bmc_agent::inventory::InventoryError;
use bmc_agent::oob::{BmcDetails, OutOfBandError};
use bmc_devkit::{within, Call, FakeConnector, FakeInventory, MachineProfile};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

fn inventory() -> FakeInventory {
    FakeInventory::new().with_machine(
        "m1",
        BmcDetails {
            address: "10.0.0.5".to_string(),
            user: "ADMIN".to_string(),
            password: "secret".to_string(),
        },
    )
}

fn proxy(connector: &FakeConnector) -> Arc<ConsoleProxy> {
    Arc::new(ConsoleProxy::new(
        Arc::new(inventory()),
        Arc::new(connector.clone()),
        443,
    ))
}

async fn read_until(client: &mut DuplexStream, needle: &str) -> String {
    let mut seen = String::new();
    let mut buf = [0u8; 256];
    within(Duration::from_secs(2), async {
        while !seen.contains(needle) {
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0, "stream closed before {needle:?}, got {seen:?}");
            seen.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    })
    .await;
    seen
}

#[tokio::test]
async fn test_console_session_is_piped() {
    let mut profile = MachineProfile::with_uuid("u1");
    profile.console_banner = Some("login: ".to_string());
    let connector = FakeConnector::new().with_machine("10.0.0.5", profile);
    let proxy = proxy(&connector);

    let (mut client, server) = tokio::io::duplex(1024);
    let session = tokio::spawn(async move { proxy.handle_connection(server).await });

    client.write_all(b"m1\n").await.unwrap();
    let greeting = read_until(&mut client, "login: ").await;
    assert!(greeting.starts_with("Connecting to console of \"m1\" (10.0.0.5:443)\r\n"));

    client.write_all(b"uname\n").await.unwrap();
    read_until(&mut client, "uname\n").await;

    drop(client);
    within(Duration::from_secs(2), session).await.unwrap().unwrap();
    assert_eq!(connector.calls_for("10.0.0.5"), vec![Call::OpenConsole]);
}

#[tokio::test]
async fn test_unknown_machine_is_reported_to_client() {
    let connector = FakeConnector::new();
    let proxy = proxy(&connector);

    let (mut client, server) = tokio::io::duplex(1024);
    let session = tokio::spawn(async move { proxy.handle_connection(server).await });

    client.write_all(b"m2\n").await.unwrap();
    let reply = read_until(&mut client, "\r\n").await;
    assert!(reply.starts_with("error: machine m2 not found"));

    let result = within(Duration::from_secs(2), session).await.unwrap();
    assert!(matches!(
        result,
        Err(ConsoleError::Inventory(InventoryError::NotFound(_)))
    ));
    assert_eq!(connector.sessions_opened(), 0);
}

#[tokio::test]
async fn test_bmc_without_console() {
    let connector = FakeConnector::new().with_machine("10.0.0.5", MachineProfile::with_uuid("u1"));
    let proxy = proxy(&connector);

    let (mut client, server) = tokio::io::duplex(1024);
    let session = tokio::spawn(async move { proxy.handle_connection(server).await });

    client.write_all(b"m1\r\n").await.unwrap();
    let reply = read_until(&mut client, "error: ").await;
    assert!(reply.starts_with("Connecting to console of \"m1\""));

    let result = within(Duration::from_secs(2), session).await.unwrap();
    assert!(matches!(
        result,
        Err(ConsoleError::OutOfBand(OutOfBandError::Unsupported(_)))
    ));
}

#[tokio::test]
async fn test_empty_machine_id() {
    let proxy = proxy(&FakeConnector::new());

    let (mut client, server) = tokio::io::duplex(1024);
    let session = tokio::spawn(async move { proxy.handle_connection(server).await });
    client.write_all(b"\n").await.unwrap();

    let result = within(Duration::from_secs(2), session).await.unwrap();
    assert!(matches!(result, Err(ConsoleError::MissingMachineId)));
}

#[test]
fn test_acceptor_requires_certificates() {
    let settings = ConsoleSettings {
        port: 3333,
        ca_cert_file: PathBuf::from("/nonexistent/ca.pem"),
        cert_file: PathBuf::from("/nonexistent/cert.pem"),
        key_file: PathBuf::from("/nonexistent/key.pem"),
    };
    assert!(matches!(load_acceptor(&settings), Err(ConsoleError::Tls(_))));
}
