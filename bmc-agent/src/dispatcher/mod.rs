//! Command dispatcher
//!
//! Receives machine commands from the command channel and executes them on
//! the machine's BMC:
//! - one out-of-band session per command, opened after validation
//! - two-step commands stop at the first failing step
//! - firmware flashes run on their own task, the message succeeds at once
//! - a lost subscription is re-established until shutdown

pub mod command;
pub mod resolver;

pub use command::{CommandEnvelope, DecodeError, MachineCommand};
pub use resolver::{BmcResolver, InventoryResolver, PayloadResolver, ResolveError};

use crate::oob::{
    BootTarget, FirmwareKind, OutOfBandConnector, OutOfBandError, OutOfBandSession,
};
use crate::transport::{CommandSource, CommandStream, Delivery, TransportError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("command without machine id")]
    MissingMachineId,

    #[error("unknown firmware kind {0:?}")]
    UnknownFirmwareKind(String),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("invalid bmc address: {0}")]
    InvalidAddress(#[source] OutOfBandError),

    #[error("error creating outband connection: {0}")]
    Connect(#[source] OutOfBandError),

    #[error("{command} failed: {source}")]
    Action {
        command: String,
        #[source]
        source: OutOfBandError,
    },
}

/// How a successfully handled message was dealt with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Executed,
    /// Command name unknown to this agent
    Unhandled,
    FirmwareUpdateStarted,
}

enum StreamEnd {
    Ended,
    Failed(TransportError),
    Shutdown,
}

pub struct Dispatcher {
    partition_id: String,
    connector: Arc<dyn OutOfBandConnector>,
    resolver: Arc<dyn BmcResolver>,
    bmc_port: u16,
    resubscribe_delay: Duration,
}

impl Dispatcher {
    pub fn new(
        partition_id: impl Into<String>,
        connector: Arc<dyn OutOfBandConnector>,
        resolver: Arc<dyn BmcResolver>,
        bmc_port: u16,
        resubscribe_delay: Duration,
    ) -> Self {
        Self {
            partition_id: partition_id.into(),
            connector,
            resolver,
            bmc_port,
            resubscribe_delay,
        }
    }

    /// Subscribe, consume, resubscribe; returns only on shutdown
    pub async fn run(&self, source: &dyn CommandSource, shutdown: CancellationToken) {
        info!(partition = %self.partition_id, "start waiting for bmc commands");

        loop {
            let subscribed = tokio::select! {
                _ = shutdown.cancelled() => break,
                subscribed = source.subscribe(&self.partition_id) => subscribed,
            };

            match subscribed {
                Ok(mut stream) => match self.consume(stream.as_mut(), &shutdown).await {
                    StreamEnd::Shutdown => break,
                    StreamEnd::Ended => warn!(partition = %self.partition_id, "command stream ended"),
                    StreamEnd::Failed(e) => {
                        error!(partition = %self.partition_id, "command stream failed: {}", e)
                    }
                },
                Err(e) => error!(partition = %self.partition_id, "{}", e),
            }

            debug!(delay = ?self.resubscribe_delay, "resubscribing to command stream");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.resubscribe_delay) => {}
            }
        }

        info!("dispatcher stopped");
    }

    async fn consume(&self, stream: &mut dyn CommandStream, shutdown: &CancellationToken) -> StreamEnd {
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => return StreamEnd::Shutdown,
                next = stream.next() => next,
            };
            match next {
                None => return StreamEnd::Ended,
                Some(Err(e)) => return StreamEnd::Failed(e),
                Some(Ok(delivery)) => self.process(stream, delivery).await,
            }
        }
    }

    async fn process(&self, stream: &mut dyn CommandStream, delivery: Delivery) {
        debug!(delivery = delivery.id, attempt = delivery.attempt, "got command message");

        match self.handle(&delivery.payload).await {
            Ok(outcome) => {
                debug!(delivery = delivery.id, ?outcome, "command message handled");
                if let Err(e) = stream.ack(&delivery).await {
                    warn!("{}", e);
                }
            }
            Err(e) => {
                error!(
                    delivery = delivery.id,
                    attempt = delivery.attempt,
                    "could not handle command message: {}",
                    e
                );
                if let Err(e) = stream.reject(&delivery).await {
                    warn!("{}", e);
                }
            }
        }
    }

    /// Decode and execute one command message
    pub async fn handle(&self, payload: &[u8]) -> Result<Outcome, DispatchError> {
        let envelope = CommandEnvelope::decode(payload)?;
        if envelope.machine_id.trim().is_empty() {
            return Err(DispatchError::MissingMachineId);
        }

        info!(
            machine = %envelope.machine_id,
            command = %envelope.command,
            "handle command"
        );

        let firmware = match &envelope.command {
            MachineCommand::Unhandled(name) => {
                warn!(machine = %envelope.machine_id, command = %name, "unhandled command");
                return Ok(Outcome::Unhandled);
            }
            MachineCommand::UpdateFirmware { kind, url } => {
                let kind = kind
                    .parse::<FirmwareKind>()
                    .map_err(DispatchError::UnknownFirmwareKind)?;
                Some((kind, url.clone()))
            }
            _ => None,
        };

        let details = self.resolver.resolve(&envelope).await?;
        let address = details
            .bmc_address(self.bmc_port)
            .map_err(DispatchError::InvalidAddress)?;
        let session = self
            .connector
            .open(&address, &details.credentials())
            .await
            .map_err(DispatchError::Connect)?;

        if let Some((kind, url)) = firmware {
            info!(machine = %envelope.machine_id, %kind, url = %url, "update firmware");
            let machine_id = envelope.machine_id.clone();
            tokio::spawn(async move {
                match session.update_firmware(kind, &url).await {
                    Ok(()) => info!(machine = %machine_id, %kind, "firmware update finished"),
                    Err(e) => error!(machine = %machine_id, %kind, "firmware update failed: {}", e),
                }
            });
            return Ok(Outcome::FirmwareUpdateStarted);
        }

        execute(session.as_ref(), &envelope.command)
            .await
            .map_err(|source| DispatchError::Action {
                command: envelope.command.to_string(),
                source,
            })?;
        Ok(Outcome::Executed)
    }
}

async fn execute(
    session: &dyn OutOfBandSession,
    command: &MachineCommand,
) -> Result<(), OutOfBandError> {
    match command {
        MachineCommand::PowerOn => session.power_on().await,
        MachineCommand::PowerOff => session.power_off().await,
        MachineCommand::PowerReset => session.power_reset().await,
        MachineCommand::PowerCycle => session.power_cycle().await,
        MachineCommand::BootToBios => session.select_boot_target(BootTarget::Bios).await,
        MachineCommand::BootFromDisk | MachineCommand::Created => {
            session.select_boot_target(BootTarget::Disk).await
        }
        MachineCommand::BootFromPxe => session.select_boot_target(BootTarget::Pxe).await,
        MachineCommand::Reinstall => {
            session.select_boot_target(BootTarget::Pxe).await?;
            session.power_cycle().await
        }
        MachineCommand::Deleted => {
            session.select_boot_target(BootTarget::Pxe).await?;
            session.power_reset().await
        }
        MachineCommand::IdentifyLedOn => session.identify_led_on().await,
        MachineCommand::IdentifyLedOff => session.identify_led_off().await,
        // Dealt with before a session is opened
        MachineCommand::UpdateFirmware { .. } | MachineCommand::Unhandled(_) => Ok(()),
    }
}
