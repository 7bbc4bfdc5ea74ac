//! Command delivery channel
//!
//! A `CommandSource` hands out one `CommandStream` per subscription. Every
//! delivery must be either acknowledged or rejected; rejected deliveries may
//! come back through `next` with a higher `attempt`.

pub mod mqtt;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to subscribe: {0}")]
    Subscribe(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("could not acknowledge delivery {id}: {reason}")]
    Ack { id: u64, reason: String },

    #[error("tls setup failed: {0}")]
    Tls(String),
}

/// One command message as received from the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: u64,
    pub payload: Vec<u8>,
    /// 1 on first delivery
    pub attempt: u32,
}

#[async_trait]
pub trait CommandSource: Send + Sync {
    async fn subscribe(&self, partition: &str) -> Result<Box<dyn CommandStream>, TransportError>;
}

#[async_trait]
pub trait CommandStream: Send {
    /// Next delivery; `None` once the stream has ended
    async fn next(&mut self) -> Option<Result<Delivery, TransportError>>;
    async fn ack(&mut self, delivery: &Delivery) -> Result<(), TransportError>;
    async fn reject(&mut self, delivery: &Delivery) -> Result<(), TransportError>;
}
