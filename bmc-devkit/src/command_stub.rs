/*!
Scripted command source

Every `subscribe` consumes the next scripted `Subscription`. Once the script
is exhausted, subscriptions succeed with a stream that never yields, so the
dispatcher idles until shutdown.
*/

use async_trait::async_trait;
use bmc_agent::transport::{CommandSource, CommandStream, Delivery, TransportError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// How one subscription behaves
#[derive(Debug, Clone)]
pub enum Subscription {
    /// `subscribe` itself fails
    Refused(String),
    /// Deliver the payloads, then end cleanly
    Deliver(Vec<Vec<u8>>),
    /// Deliver the payloads, then fail with a connection error
    DeliverThenFail(Vec<Vec<u8>>, String),
}

#[derive(Default)]
struct Record {
    acked: Mutex<Vec<Delivery>>,
    rejected: Mutex<Vec<Delivery>>,
}

#[derive(Clone, Default)]
pub struct ScriptedSource {
    script: Arc<Mutex<VecDeque<Subscription>>>,
    subscriptions: Arc<AtomicUsize>,
    partitions: Arc<Mutex<Vec<String>>>,
    next_id: Arc<AtomicU64>,
    record: Arc<Record>,
}

impl ScriptedSource {
    pub fn new(script: Vec<Subscription>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            ..Self::default()
        }
    }

    /// Number of `subscribe` calls so far
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    pub fn partitions(&self) -> Vec<String> {
        self.partitions.lock().clone()
    }

    pub fn acked(&self) -> Vec<Delivery> {
        self.record.acked.lock().clone()
    }

    pub fn rejected(&self) -> Vec<Delivery> {
        self.record.rejected.lock().clone()
    }
}

#[async_trait]
impl CommandSource for ScriptedSource {
    async fn subscribe(&self, partition: &str) -> Result<Box<dyn CommandStream>, TransportError> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        self.partitions.lock().push(partition.to_string());

        let next = self.script.lock().pop_front();
        let (payloads, end) = match next {
            Some(Subscription::Refused(reason)) => return Err(TransportError::Subscribe(reason)),
            Some(Subscription::Deliver(payloads)) => (payloads, Some(None)),
            Some(Subscription::DeliverThenFail(payloads, reason)) => (payloads, Some(Some(reason))),
            None => (Vec::new(), None),
        };

        let deliveries = payloads
            .into_iter()
            .map(|payload| Delivery {
                id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
                payload,
                attempt: 1,
            })
            .collect();

        Ok(Box::new(ScriptedStream {
            deliveries,
            end,
            record: self.record.clone(),
        }))
    }
}

struct ScriptedStream {
    deliveries: VecDeque<Delivery>,
    /// `None` hangs, `Some(None)` ends, `Some(Some(reason))` fails
    end: Option<Option<String>>,
    record: Arc<Record>,
}

#[async_trait]
impl CommandStream for ScriptedStream {
    async fn next(&mut self) -> Option<Result<Delivery, TransportError>> {
        if let Some(delivery) = self.deliveries.pop_front() {
            return Some(Ok(delivery));
        }
        match self.end.take() {
            Some(None) => None,
            Some(Some(reason)) => Some(Err(TransportError::Connection(reason))),
            None => std::future::pending().await,
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), TransportError> {
        self.record.acked.lock().push(delivery.clone());
        Ok(())
    }

    async fn reject(&mut self, delivery: &Delivery) -> Result<(), TransportError> {
        self.record.rejected.lock().push(delivery.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_is_replayed_in_order() {
        let source = ScriptedSource::new(vec![
            Subscription::Refused("broker down".to_string()),
            Subscription::DeliverThenFail(vec![b"a".to_vec()], "reset".to_string()),
        ]);

        assert!(source.subscribe("p1").await.is_err());

        let mut stream = source.subscribe("p1").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.payload, b"a");
        stream.ack(&delivery).await.unwrap();
        assert!(matches!(
            stream.next().await,
            Some(Err(TransportError::Connection(_)))
        ));

        assert_eq!(source.subscriptions(), 2);
        assert_eq!(source.acked().len(), 1);
        assert_eq!(source.partitions(), vec!["p1".to_string(), "p1".to_string()]);
    }
}
