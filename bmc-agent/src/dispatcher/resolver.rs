//! Where a command's BMC connection details come from

use super::command::CommandEnvelope;
use crate::inventory::{InventoryClient, InventoryError};
use crate::oob::BmcDetails;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("command for machine {0} does not contain bmc details")]
    Missing(String),

    #[error("could not look up bmc details of machine {machine_id}: {source}")]
    Lookup {
        machine_id: String,
        #[source]
        source: InventoryError,
    },
}

#[async_trait]
pub trait BmcResolver: Send + Sync {
    async fn resolve(&self, envelope: &CommandEnvelope) -> Result<BmcDetails, ResolveError>;
}

/// Details embedded in the command itself
pub struct PayloadResolver;

#[async_trait]
impl BmcResolver for PayloadResolver {
    async fn resolve(&self, envelope: &CommandEnvelope) -> Result<BmcDetails, ResolveError> {
        envelope
            .bmc
            .clone()
            .filter(|bmc| !bmc.address.trim().is_empty())
            .ok_or_else(|| ResolveError::Missing(envelope.machine_id.clone()))
    }
}

/// Embedded details first, inventory lookup otherwise
pub struct InventoryResolver {
    inventory: Arc<dyn InventoryClient>,
}

impl InventoryResolver {
    pub fn new(inventory: Arc<dyn InventoryClient>) -> Self {
        Self { inventory }
    }
}

#[async_trait]
impl BmcResolver for InventoryResolver {
    async fn resolve(&self, envelope: &CommandEnvelope) -> Result<BmcDetails, ResolveError> {
        if let Ok(details) = PayloadResolver.resolve(envelope).await {
            return Ok(details);
        }
        self.inventory
            .machine_bmc(&envelope.machine_id)
            .await
            .map_err(|source| ResolveError::Lookup {
                machine_id: envelope.machine_id.clone(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::command::MachineCommand;

    fn envelope(bmc: Option<BmcDetails>) -> CommandEnvelope {
        CommandEnvelope {
            machine_id: "m1".to_string(),
            command: MachineCommand::PowerOn,
            bmc,
        }
    }

    #[tokio::test]
    async fn test_payload_resolver() {
        let details = BmcDetails {
            address: "10.0.0.5".to_string(),
            user: "u".to_string(),
            password: "p".to_string(),
        };
        let resolved = PayloadResolver
            .resolve(&envelope(Some(details.clone())))
            .await
            .unwrap();
        assert_eq!(resolved, details);
    }

    #[tokio::test]
    async fn test_payload_resolver_missing_details() {
        assert!(matches!(
            PayloadResolver.resolve(&envelope(None)).await,
            Err(ResolveError::Missing(id)) if id == "m1"
        ));

        let empty = BmcDetails {
            address: " ".to_string(),
            user: String::new(),
            password: String::new(),
        };
        assert!(PayloadResolver.resolve(&envelope(Some(empty))).await.is_err());
    }
}
