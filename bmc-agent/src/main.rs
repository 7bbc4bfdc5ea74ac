//! bmc-agent - bare-metal fleet control agent
//!
//! Runs until SIGINT/SIGTERM:
//! - lease reconciliation and BMC reporting
//! - command dispatching from the MQTT command channel
//! - console proxy (optional)
//! - system event log collection (optional)

use anyhow::{Context, Result};
use bmc_agent::config::Config;
use bmc_agent::console::{load_acceptor, ConsoleProxy};
use bmc_agent::dispatcher::{BmcResolver, Dispatcher, InventoryResolver, PayloadResolver};
use bmc_agent::event_log::EventLogCollector;
use bmc_agent::inventory::{HttpInventoryClient, InventoryClient};
use bmc_agent::leases::read_leases;
use bmc_agent::oob::redfish::RedfishConnector;
use bmc_agent::oob::{BmcAddress, OutOfBandConnector};
use bmc_agent::reconciler::{Reconciler, ReconcilerSettings};
use bmc_agent::transport::mqtt::MqttCommandSource;
use bmc_agent::uuid_cache::UuidCache;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().await.context("Failed to load configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("Invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(version = env!("CARGO_PKG_VERSION"), "bmc-agent starting");
    info!(config = ?config, "loaded configuration");

    let mut redfish = RedfishConnector::new(
        Duration::from_secs(config.bmc.request_timeout_secs),
        config.bmc.accept_invalid_certs,
    )
    .context("Failed to create bmc client")?;
    if let Some(sol) = config.sol_settings() {
        redfish = redfish.with_console(sol);
    }
    let connector: Arc<dyn OutOfBandConnector> = Arc::new(redfish);
    let inventory: Arc<dyn InventoryClient> = Arc::new(
        HttpInventoryClient::new(
            &config.inventory.url,
            &config.inventory.token,
            Duration::from_secs(config.inventory.request_timeout_secs),
        )
        .context("Failed to create inventory client")?,
    );

    let settings = config.reconciler_settings()?;
    let uuid_cache = Arc::new(UuidCache::new(
        connector.clone(),
        config.bmc_credentials(),
        config.report.concurrency,
    ));
    if config.report.warmup_on_start {
        warmup(&uuid_cache, &settings).await;
    }

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    let reconciler = Reconciler::new(
        settings,
        connector.clone(),
        inventory.clone(),
        config.bmc_credentials(),
        uuid_cache,
    );
    tasks.spawn({
        let shutdown = shutdown.clone();
        async move { reconciler.run(shutdown).await }
    });

    let resolver: Arc<dyn BmcResolver> = if config.mqtt.resolve_from_inventory {
        Arc::new(InventoryResolver::new(inventory.clone()))
    } else {
        Arc::new(PayloadResolver)
    };
    let dispatcher = Dispatcher::new(
        config.partition_id.clone(),
        connector.clone(),
        resolver,
        config.bmc.port,
        Duration::from_secs(config.mqtt.resubscribe_delay_secs),
    );
    let source = MqttCommandSource::new(config.mqtt_settings());
    tasks.spawn({
        let shutdown = shutdown.clone();
        async move { dispatcher.run(&source, shutdown).await }
    });

    if config.console.enabled {
        let console = config.console_settings();
        let acceptor = load_acceptor(&console).context("Failed to set up console tls")?;
        let listener = TcpListener::bind(("0.0.0.0", console.port))
            .await
            .with_context(|| format!("Failed to bind console port {}", console.port))?;
        let proxy = Arc::new(ConsoleProxy::new(inventory.clone(), connector.clone(), config.bmc.port));
        tasks.spawn(proxy.serve(listener, acceptor, shutdown.clone()));
    }

    if let Some(interval_secs) = config.event_log.interval_secs {
        let collector = Arc::new(EventLogCollector::new(
            config.partition_id.clone(),
            inventory.clone(),
            connector.clone(),
            config.bmc.port,
            Duration::from_secs(interval_secs),
            config.event_log.concurrency,
        ));
        tasks.spawn(collector.run(shutdown.clone()));
    }

    wait_for_signal().await;
    info!("shutdown requested");
    shutdown.cancel();

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            warn!("task ended abnormally: {}", e);
        }
    }

    info!("bmc-agent stopped");
    Ok(())
}

/// Fill the uuid cache from the currently active leases
async fn warmup(cache: &UuidCache, settings: &ReconcilerSettings) {
    let parsed = match read_leases(&settings.lease_file, settings.lease_format).await {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("skipping uuid cache warmup: {}", e);
            return;
        }
    };
    let targets: BTreeMap<String, BmcAddress> = parsed
        .leases
        .filter_active(Utc::now())
        .latest_by_identifier()
        .into_values()
        .collect::<bmc_agent::leases::LeaseSet>()
        .filter_allowed(&settings.allowed_networks, &settings.ignored_macs)
        .into_iter()
        .map(|lease| (lease.mac, BmcAddress::new(lease.ip, settings.bmc_port)))
        .collect();
    cache.warmup(&targets).await;
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!("could not install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
