//! AMQP transport built on `lapin`.
//!
//! The transport keeps a record of every queue, binding and consumer it has
//! set up. A supervisor task watches the connection; when it drops, the task
//! waits `reconnect_delay`, opens a fresh connection and replays that record
//! so consumers keep receiving on the same [`DeliveryReceiver`]. Calls made
//! while disconnected fail with [`BrokerError::Disconnected`]. Losses and
//! recoveries are reported to a [`ConnectionObserver`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use courier_config::BrokerUri;
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::BROKER_TARGET;
use super::errors::BrokerError;
use super::transport::{
    BrokerTransport, Delivery, DeliveryReceiver, GLOBAL_EXCHANGE, MessageProperties,
    PublishOutcome, SCOPED_EXCHANGE,
};

const CLOSE_REPLY_CODE: u16 = 200;
const CLOSE_REPLY_TEXT: &str = "courier shutdown";

/// What a fresh connection re-declared from the recorded topology.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TopologyReplay {
    /// Queues declared again.
    pub queues: usize,
    /// Bindings restored.
    pub bindings: usize,
    /// Consumers restarted.
    pub consumers: usize,
    /// Connection attempts it took, counting the successful one.
    pub attempts: u32,
}

/// Receives connection notices from the reconnect supervisor.
#[cfg_attr(test, mockall::automock)]
pub trait ConnectionObserver: Send + Sync {
    /// The connection to `endpoint` dropped; reconnection is starting.
    fn connection_lost(&self, endpoint: &str);

    /// An attempt to reconnect failed and will be retried.
    fn reconnect_failed(&self, endpoint: &str, attempt: u32, error: &BrokerError);

    /// The connection is back and the topology has been replayed.
    fn reconnected(&self, endpoint: &str, replay: &TopologyReplay);
}

#[derive(Debug, Clone)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

#[derive(Debug, Default, Clone)]
struct Topology {
    queues: Vec<String>,
    bindings: Vec<Binding>,
    consumers: Vec<(String, mpsc::UnboundedSender<Delivery>)>,
}

type LostSignal = mpsc::UnboundedReceiver<()>;

struct Shared {
    uri: String,
    endpoint: String,
    reconnect_delay: Duration,
    connection: Mutex<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
    topology: Mutex<Topology>,
    closed: AtomicBool,
}

impl Shared {
    fn channel(&self) -> Result<Channel, BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        self.channel.read().clone().ok_or(BrokerError::Disconnected)
    }

    /// Connects, declares the exchanges and replays the recorded topology.
    ///
    /// Returns a receiver that yields once the connection is lost.
    async fn open_session(&self) -> Result<(LostSignal, TopologyReplay), BrokerError> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|source| BrokerError::Connect {
                endpoint: self.endpoint.clone(),
                source,
            })?;

        let (lost_sender, lost_receiver) = mpsc::unbounded_channel();
        connection.on_error(move |error| {
            warn!(target: BROKER_TARGET, error = %error, "broker connection lost");
            if lost_sender.send(()).is_err() {
                debug!(target: BROKER_TARGET, "connection supervisor already stopped");
            }
        });

        let channel = connection
            .create_channel()
            .await
            .map_err(|source| BrokerError::amqp("create_channel", source))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|source| BrokerError::amqp("confirm_select", source))?;
        for exchange in [GLOBAL_EXCHANGE, SCOPED_EXCHANGE] {
            channel
                .exchange_declare(
                    exchange,
                    ExchangeKind::Direct,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|source| BrokerError::amqp("exchange_declare", source))?;
        }

        let topology = self.topology.lock().clone();
        let replay = TopologyReplay {
            queues: topology.queues.len(),
            bindings: topology.bindings.len(),
            consumers: topology.consumers.len(),
            attempts: 1,
        };
        for queue in &topology.queues {
            declare_queue(&channel, queue).await?;
        }
        for binding in &topology.bindings {
            bind_queue(&channel, binding).await?;
        }
        for (queue, sender) in topology.consumers {
            start_consumer(&channel, &queue, sender).await?;
        }

        *self.channel.write() = Some(channel);
        *self.connection.lock() = Some(connection);
        info!(target: BROKER_TARGET, endpoint = %self.endpoint, "connected to broker");
        Ok((lost_receiver, replay))
    }

    fn drop_session(&self) -> (Option<Channel>, Option<Connection>) {
        (self.channel.write().take(), self.connection.lock().take())
    }
}

async fn declare_queue(channel: &Channel, queue: &str) -> Result<(), BrokerError> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                exclusive: true,
                auto_delete: true,
                durable: false,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|source| BrokerError::amqp("queue_declare", source))?;
    Ok(())
}

async fn bind_queue(channel: &Channel, binding: &Binding) -> Result<(), BrokerError> {
    channel
        .queue_bind(
            &binding.queue,
            &binding.exchange,
            &binding.routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|source| BrokerError::amqp("queue_bind", source))
}

async fn start_consumer(
    channel: &Channel,
    queue: &str,
    sender: mpsc::UnboundedSender<Delivery>,
) -> Result<(), BrokerError> {
    let consumer = channel
        .basic_consume(
            queue,
            "",
            BasicConsumeOptions {
                no_ack: true,
                ..BasicConsumeOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|source| BrokerError::amqp("basic_consume", source))?;
    tokio::spawn(forward_deliveries(consumer, sender));
    Ok(())
}

async fn forward_deliveries(mut consumer: Consumer, sender: mpsc::UnboundedSender<Delivery>) {
    while let Some(next) = consumer.next().await {
        match next {
            Ok(delivery) => {
                let converted = Delivery {
                    properties: from_amqp(&delivery.properties),
                    body: delivery.data,
                };
                if sender.send(converted).is_err() {
                    return;
                }
            }
            Err(error) => {
                debug!(target: BROKER_TARGET, error = %error, "consumer stream ended");
                return;
            }
        }
    }
}

fn short_string(value: Option<&ShortString>) -> Option<String> {
    value.map(|text| text.as_str().to_owned())
}

fn from_amqp(properties: &BasicProperties) -> MessageProperties {
    MessageProperties {
        app_id: short_string(properties.app_id().as_ref()),
        correlation_id: short_string(properties.correlation_id().as_ref()),
        kind: short_string(properties.kind().as_ref()),
        reply_to: short_string(properties.reply_to().as_ref()),
    }
}

fn to_amqp(properties: MessageProperties) -> BasicProperties {
    let MessageProperties {
        app_id,
        correlation_id,
        kind,
        reply_to,
    } = properties;
    let mut amqp = BasicProperties::default().with_content_type("application/json".into());
    if let Some(value) = app_id {
        amqp = amqp.with_app_id(value.into());
    }
    if let Some(value) = correlation_id {
        amqp = amqp.with_correlation_id(value.into());
    }
    if let Some(value) = kind {
        amqp = amqp.with_kind(value.into());
    }
    if let Some(value) = reply_to {
        amqp = amqp.with_reply_to(value.into());
    }
    amqp
}

// The supervisor's view of a connection, separated from `lapin` so the
// reconnect loop can run against a scripted session.
#[async_trait]
trait Session: Send + Sync {
    fn endpoint(&self) -> &str;
    fn reconnect_delay(&self) -> Duration;
    fn is_closed(&self) -> bool;
    fn discard(&self);
    async fn reopen(&self) -> Result<(LostSignal, TopologyReplay), BrokerError>;
}

#[async_trait]
impl Session for Shared {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn discard(&self) {
        // The old handles are dead; dropping them is all that is left to do.
        drop(self.drop_session());
    }

    async fn reopen(&self) -> Result<(LostSignal, TopologyReplay), BrokerError> {
        self.open_session().await
    }
}

async fn supervise<S>(
    session: Arc<S>,
    observer: Arc<dyn ConnectionObserver>,
    mut lost: LostSignal,
    mut shutdown: watch::Receiver<bool>,
) where
    S: Session + ?Sized,
{
    loop {
        tokio::select! {
            _ = lost.recv() => {}
            _ = shutdown.changed() => return,
        }
        if session.is_closed() {
            return;
        }
        session.discard();
        observer.connection_lost(session.endpoint());

        let mut attempt = 0_u32;
        loop {
            tokio::select! {
                () = tokio::time::sleep(session.reconnect_delay()) => {}
                _ = shutdown.changed() => return,
            }
            attempt = attempt.saturating_add(1);
            match session.reopen().await {
                Ok((receiver, replay)) => {
                    lost = receiver;
                    observer.reconnected(
                        session.endpoint(),
                        &TopologyReplay {
                            attempts: attempt,
                            ..replay
                        },
                    );
                    break;
                }
                Err(error) => {
                    warn!(
                        target: BROKER_TARGET,
                        error = %error,
                        endpoint = session.endpoint(),
                        attempt,
                        "broker reconnection failed; retrying"
                    );
                    observer.reconnect_failed(session.endpoint(), attempt, &error);
                }
            }
        }
    }
}

/// Broker transport speaking AMQP 0-9-1.
pub struct AmqpTransport {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for AmqpTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AmqpTransport")
            .field("endpoint", &self.shared.endpoint)
            .field("connected", &self.shared.channel.read().is_some())
            .finish_non_exhaustive()
    }
}

impl AmqpTransport {
    /// Connects to `uri` and starts the reconnect supervisor, which reports
    /// to `observer`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Connect`] when the first connection attempt
    /// fails, and [`BrokerError::Amqp`] when channel setup fails.
    pub async fn connect(
        uri: &BrokerUri,
        reconnect_delay: Duration,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Result<Self, BrokerError> {
        let shared = Arc::new(Shared {
            uri: uri.as_str().to_owned(),
            endpoint: uri.to_string(),
            reconnect_delay,
            connection: Mutex::new(None),
            channel: RwLock::new(None),
            topology: Mutex::new(Topology::default()),
            closed: AtomicBool::new(false),
        });
        let (lost, _) = shared.open_session().await?;
        let (shutdown, shutdown_receiver) = watch::channel(false);
        tokio::spawn(supervise(
            Arc::clone(&shared),
            observer,
            lost,
            shutdown_receiver,
        ));
        Ok(Self { shared, shutdown })
    }
}

#[async_trait]
impl BrokerTransport for AmqpTransport {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let channel = self.shared.channel()?;
        declare_queue(&channel, queue).await?;
        let mut topology = self.shared.topology.lock();
        if !topology.queues.iter().any(|known| known == queue) {
            topology.queues.push(queue.to_owned());
        }
        Ok(())
    }

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        let binding = Binding {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        };
        let channel = self.shared.channel()?;
        bind_queue(&channel, &binding).await?;
        self.shared.topology.lock().bindings.push(binding);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<PublishOutcome, BrokerError> {
        let channel = self.shared.channel()?;
        let confirmation = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                &body,
                to_amqp(properties),
            )
            .await
            .map_err(|source| BrokerError::amqp("basic_publish", source))?
            .await
            .map_err(|source| BrokerError::amqp("publisher_confirm", source))?;
        Ok(match confirmation {
            Confirmation::Ack(Some(_)) | Confirmation::Nack(Some(_)) => PublishOutcome::Returned,
            Confirmation::Ack(None) | Confirmation::Nack(None) | Confirmation::NotRequested => {
                PublishOutcome::Routed
            }
        })
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        let channel = self.shared.channel()?;
        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &body,
                to_amqp(properties),
            )
            .await
            .map_err(|source| BrokerError::amqp("basic_publish", source))?
            .await
            .map_err(|source| BrokerError::amqp("publisher_confirm", source))?;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryReceiver, BrokerError> {
        let channel = self.shared.channel()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        start_consumer(&channel, queue, sender.clone()).await?;
        self.shared
            .topology
            .lock()
            .consumers
            .push((queue.to_owned(), sender));
        Ok(receiver)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.shutdown.send(true).is_err() {
            debug!(target: BROKER_TARGET, "connection supervisor already stopped");
        }
        let (channel, connection) = self.shared.drop_session();
        if let Some(channel) = channel {
            channel
                .close(CLOSE_REPLY_CODE, CLOSE_REPLY_TEXT)
                .await
                .map_err(|source| BrokerError::amqp("channel_close", source))?;
        }
        if let Some(connection) = connection {
            connection
                .close(CLOSE_REPLY_CODE, CLOSE_REPLY_TEXT)
                .await
                .map_err(|source| BrokerError::amqp("connection_close", source))?;
        }
        debug!(target: BROKER_TARGET, endpoint = %self.shared.endpoint, "broker transport closed");
        Ok(())
    }
}
