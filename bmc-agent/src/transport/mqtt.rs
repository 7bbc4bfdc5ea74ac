//! MQTT command stream
//!
//! One client per subscription, QoS 1 with manual acks and a persistent
//! session, so the broker redelivers unacknowledged messages after a
//! reconnect. The event loop runs on its own task and feeds the stream
//! through a channel; keep-alives and acks keep flowing while a command
//! executes. A rejected delivery is acknowledged towards the broker and
//! retried locally after `requeue_delay` until `max_attempts` is reached.
//! Retries belong to the source and survive resubscription.

use super::{CommandSource, CommandStream, Delivery, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Publish, QoS, Transport};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttTls {
    pub ca_cert: PathBuf,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    /// Must be stable across restarts for the broker session to persist
    pub client_id: String,
    pub keep_alive: Duration,
    pub topic_prefix: String,
    pub max_attempts: u32,
    pub requeue_delay: Duration,
    pub tls: Option<MqttTls>,
}

impl MqttSettings {
    pub fn topic(&self, partition: &str) -> String {
        format!("{}/{}", self.topic_prefix.trim_end_matches('/'), partition)
    }
}

struct Pending {
    publish: Publish,
    attempt: u32,
    broker_acked: bool,
}

struct Retry {
    due: Instant,
    id: u64,
    pending: Pending,
}

/// Delivery ids and pending retries shared by every stream of a source
#[derive(Default)]
struct Retries {
    next_id: AtomicU64,
    queue: Mutex<VecDeque<Retry>>,
}

impl Retries {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn push(&self, retry: Retry) {
        self.queue.lock().push_back(retry);
    }

    fn take_due(&self, now: Instant) -> Option<Retry> {
        let mut queue = self.queue.lock();
        match queue.front() {
            Some(retry) if retry.due <= now => queue.pop_front(),
            _ => None,
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.queue.lock().front().map(|retry| retry.due)
    }

    fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

pub struct MqttCommandSource {
    settings: MqttSettings,
    retries: Arc<Retries>,
}

impl MqttCommandSource {
    pub fn new(settings: MqttSettings) -> Self {
        Self {
            settings,
            retries: Arc::new(Retries::default()),
        }
    }

    /// Deliveries waiting for another attempt
    pub fn pending_retries(&self) -> usize {
        self.retries.len()
    }

    async fn options(&self) -> Result<MqttOptions, TransportError> {
        let s = &self.settings;
        let mut options = MqttOptions::new(&s.client_id, &s.host, s.port);
        options.set_keep_alive(s.keep_alive);
        options.set_clean_session(false);
        options.set_manual_acks(true);

        if let Some(tls) = &s.tls {
            let ca = read_pem(&tls.ca_cert).await?;
            let client_auth = match (&tls.client_cert, &tls.client_key) {
                (Some(cert), Some(key)) => Some((read_pem(cert).await?, read_pem(key).await?)),
                (None, None) => None,
                _ => {
                    return Err(TransportError::Tls(
                        "client_cert and client_key must be given together".to_string(),
                    ))
                }
            };
            options.set_transport(Transport::tls(ca, client_auth, None));
        }

        Ok(options)
    }
}

async fn read_pem(path: &PathBuf) -> Result<Vec<u8>, TransportError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| TransportError::Tls(format!("could not read {}: {}", path.display(), e)))
}

#[async_trait]
impl CommandSource for MqttCommandSource {
    async fn subscribe(&self, partition: &str) -> Result<Box<dyn CommandStream>, TransportError> {
        let topic = self.settings.topic(partition);
        let options = self.options().await?;
        let (client, eventloop) = AsyncClient::new(options, 10);
        let (events_tx, events) = mpsc::unbounded_channel();
        tokio::spawn(pump(eventloop, events_tx));

        client
            .subscribe(&topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        let mut stream = MqttCommandStream::new(
            client,
            events,
            topic.clone(),
            self.settings.max_attempts,
            self.settings.requeue_delay,
            self.retries.clone(),
        );

        // Wait for the broker to confirm before handing the stream out
        let confirmed = timeout(SUBSCRIBE_TIMEOUT, async {
            loop {
                match stream.events.recv().await {
                    Some(StreamEvent::Subscribed) => return Ok(()),
                    Some(StreamEvent::Publish(publish)) => stream.accept(publish).await,
                    Some(StreamEvent::Failed(reason)) => return Err(TransportError::Subscribe(reason)),
                    Some(StreamEvent::Disconnected) | None => {
                        return Err(TransportError::Subscribe(
                            "connection closed before suback".to_string(),
                        ))
                    }
                }
            }
        })
        .await
        .map_err(|_| TransportError::Subscribe(format!("no suback within {:?}", SUBSCRIBE_TIMEOUT)))?;
        confirmed?;

        info!(topic = %topic, "subscribed to machine bmc commands");
        Ok(Box::new(stream))
    }
}

#[derive(Debug)]
enum StreamEvent {
    Subscribed,
    Publish(Publish),
    Disconnected,
    Failed(String),
}

/// Drive the event loop until it fails or the stream is dropped
async fn pump(mut eventloop: EventLoop, events: UnboundedSender<StreamEvent>) {
    loop {
        let polled = tokio::select! {
            _ = events.closed() => break,
            polled = eventloop.poll() => polled,
        };
        let event = match polled {
            Ok(Event::Incoming(Incoming::Publish(publish))) => StreamEvent::Publish(publish),
            Ok(Event::Incoming(Incoming::SubAck(_))) => StreamEvent::Subscribed,
            Ok(Event::Incoming(Incoming::Disconnect)) => StreamEvent::Disconnected,
            Ok(_) => continue,
            Err(e) => StreamEvent::Failed(e.to_string()),
        };
        let last = matches!(event, StreamEvent::Disconnected | StreamEvent::Failed(_));
        if events.send(event).is_err() || last {
            break;
        }
    }
    debug!("mqtt event loop stopped");
}

struct MqttCommandStream {
    client: AsyncClient,
    events: UnboundedReceiver<StreamEvent>,
    topic: String,
    max_attempts: u32,
    requeue_delay: Duration,
    retries: Arc<Retries>,
    in_flight: HashMap<u64, Pending>,
    ready: VecDeque<(u64, Pending)>,
}

impl MqttCommandStream {
    fn new(
        client: AsyncClient,
        events: UnboundedReceiver<StreamEvent>,
        topic: String,
        max_attempts: u32,
        requeue_delay: Duration,
        retries: Arc<Retries>,
    ) -> Self {
        Self {
            client,
            events,
            topic,
            max_attempts: max_attempts.max(1),
            requeue_delay,
            retries,
            in_flight: HashMap::new(),
            ready: VecDeque::new(),
        }
    }

    async fn accept(&mut self, publish: Publish) {
        if publish.topic != self.topic {
            debug!(topic = %publish.topic, "ignoring message of foreign topic");
            if let Err(e) = self.client.ack(&publish).await {
                warn!("could not acknowledge foreign message: {}", e);
            }
            return;
        }
        self.ready.push_back((
            self.retries.next_id(),
            Pending {
                publish,
                attempt: 1,
                broker_acked: false,
            },
        ));
    }

    fn hand_out(&mut self, id: u64, pending: Pending) -> Delivery {
        let delivery = Delivery {
            id,
            payload: pending.publish.payload.to_vec(),
            attempt: pending.attempt,
        };
        self.in_flight.insert(id, pending);
        delivery
    }

    async fn ack_broker(&self, id: u64, pending: &mut Pending) -> Result<(), TransportError> {
        if pending.broker_acked {
            return Ok(());
        }
        self.client
            .ack(&pending.publish)
            .await
            .map_err(|e| TransportError::Ack {
                id,
                reason: e.to_string(),
            })?;
        pending.broker_acked = true;
        Ok(())
    }
}

#[async_trait]
impl CommandStream for MqttCommandStream {
    async fn next(&mut self) -> Option<Result<Delivery, TransportError>> {
        loop {
            if let Some((id, pending)) = self.ready.pop_front() {
                return Some(Ok(self.hand_out(id, pending)));
            }
            if let Some(retry) = self.retries.take_due(Instant::now()) {
                return Some(Ok(self.hand_out(retry.id, retry.pending)));
            }

            let event = match self.retries.next_due() {
                Some(due) => tokio::select! {
                    event = self.events.recv() => event,
                    _ = sleep_until(due) => continue,
                },
                None => self.events.recv().await,
            };

            match event {
                Some(StreamEvent::Publish(publish)) => self.accept(publish).await,
                Some(StreamEvent::Subscribed) => {}
                Some(StreamEvent::Failed(reason)) => {
                    return Some(Err(TransportError::Connection(reason)))
                }
                Some(StreamEvent::Disconnected) => {
                    info!(topic = %self.topic, "broker closed the command stream");
                    return None;
                }
                None => return None,
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), TransportError> {
        match self.in_flight.remove(&delivery.id) {
            Some(mut pending) => self.ack_broker(delivery.id, &mut pending).await,
            None => Ok(()),
        }
    }

    async fn reject(&mut self, delivery: &Delivery) -> Result<(), TransportError> {
        let Some(mut pending) = self.in_flight.remove(&delivery.id) else {
            return Ok(());
        };
        self.ack_broker(delivery.id, &mut pending).await?;

        if pending.attempt >= self.max_attempts {
            error!(
                delivery = delivery.id,
                attempts = pending.attempt,
                "giving up on command message"
            );
            return Ok(());
        }

        pending.attempt += 1;
        debug!(
            delivery = delivery.id,
            attempt = pending.attempt,
            "requeueing command message"
        );
        self.retries.push(Retry {
            due: Instant::now() + self.requeue_delay,
            id: delivery.id,
            pending,
        });
        Ok(())
    }
}
