//! RabbitMQ consumer for thumbnail requests.
//!
//! One connection and one channel carry two durable queues bound to a direct
//! exchange: one for generation requests, one for deletion requests. Each
//! queue gets its own consumption loop; within a loop messages are handled
//! strictly one after another, while the two loops run concurrently.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicQosOptions, BasicRejectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::AmqpConfig;
use crate::models::{RequestKind, ThumbRequest};
use crate::telemetry::MetricsSink;
use crate::thumbnails::ThumbnailsService;
use crate::thumbs_gen::ThumbnailError;

/// Errors that can occur while consuming thumbnail requests
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Invalid consumer configuration: {0}")]
    InvalidConfig(String),

    #[error("Connection to broker failed: {0}")]
    Connection(String),

    #[error("Failed to open channel: {0}")]
    Channel(String),

    #[error("Failed to declare exchange {exchange}: {message}")]
    ExchangeDeclare { exchange: String, message: String },

    #[error("Failed to declare queue {queue}: {message}")]
    QueueDeclare { queue: String, message: String },

    #[error("Failed to bind queue {queue}: {message}")]
    QueueBind { queue: String, message: String },

    #[error("Failed to start consuming from {queue}: {message}")]
    Consume { queue: String, message: String },

    #[error("Failed to deserialize message: {0}")]
    Deserialization(String),

    #[error("Failed to acknowledge message: {0}")]
    Acknowledge(String),
}

/// Processes one decoded request
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(
        &self,
        kind: RequestKind,
        cancel: &CancellationToken,
        request: &ThumbRequest,
    ) -> Result<(), ThumbnailError>;
}

#[async_trait]
impl RequestHandler for ThumbnailsService {
    async fn handle(
        &self,
        kind: RequestKind,
        cancel: &CancellationToken,
        request: &ThumbRequest,
    ) -> Result<(), ThumbnailError> {
        match kind {
            RequestKind::Generate => self.process_generate(cancel, &request.file_path).await,
            RequestKind::Delete => self.process_delete(cancel, &request.file_path).await,
        }
    }
}

/// A received message that can be settled with the broker
#[async_trait]
pub trait InboundDelivery: Send + Sync {
    fn payload(&self) -> &[u8];

    async fn ack(&self) -> Result<(), ConsumerError>;

    /// Reject without requeue
    async fn reject(&self) -> Result<(), ConsumerError>;
}

#[async_trait]
impl InboundDelivery for Delivery {
    fn payload(&self) -> &[u8] {
        &self.data
    }

    async fn ack(&self) -> Result<(), ConsumerError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| ConsumerError::Acknowledge(e.to_string()))
    }

    async fn reject(&self) -> Result<(), ConsumerError> {
        self.acker
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map_err(|e| ConsumerError::Acknowledge(e.to_string()))
    }
}

/// Lifecycle of a message consumer
#[async_trait]
pub trait MessageConsumer: Send {
    /// Connect, declare topology and launch the consumption loops.
    ///
    /// Loops stop when `cancel` is triggered or the broker closes the stream.
    async fn start(&mut self, cancel: CancellationToken) -> Result<(), ConsumerError>;

    /// Wait up to `grace` for the loops to exit, then close channel and connection.
    async fn stop(&mut self, grace: Duration);
}

/// Dual-queue RabbitMQ consumer
pub struct AmqpConsumer {
    config: AmqpConfig,
    handler: Arc<dyn RequestHandler>,
    metrics: Arc<dyn MetricsSink>,
    connection: Option<Connection>,
    channel: Option<Channel>,
    loops: Vec<JoinHandle<()>>,
}

impl AmqpConsumer {
    /// Create a consumer ready to connect to the broker
    pub fn new(
        config: AmqpConfig,
        handler: Arc<dyn RequestHandler>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, ConsumerError> {
        config
            .validate()
            .map_err(|e| ConsumerError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            config,
            handler,
            metrics,
            connection: None,
            channel: None,
            loops: Vec::new(),
        })
    }

    fn queues(&self) -> [(RequestKind, String); 2] {
        [
            (RequestKind::Generate, self.config.gen_queue.clone()),
            (RequestKind::Delete, self.config.del_queue.clone()),
        ]
    }

    /// Declare exchange and queues, bind them and register both consumers
    async fn declare_and_consume(
        &self,
        channel: &Channel,
    ) -> Result<Vec<(RequestKind, String, lapin::Consumer)>, ConsumerError> {
        if self.config.prefetch_count > 0 {
            channel
                .basic_qos(self.config.prefetch_count, BasicQosOptions::default())
                .await
                .map_err(|e| ConsumerError::Channel(e.to_string()))?;
        }

        channel
            .exchange_declare(
                &self.config.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                    passive: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConsumerError::ExchangeDeclare {
                exchange: self.config.exchange.clone(),
                message: e.to_string(),
            })?;

        for (_, queue) in self.queues() {
            channel
                .queue_declare(
                    &queue,
                    QueueDeclareOptions {
                        durable: true,
                        auto_delete: false,
                        exclusive: false,
                        nowait: false,
                        passive: false,
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| ConsumerError::QueueDeclare {
                    queue: queue.clone(),
                    message: e.to_string(),
                })?;

            // Routing key is the queue name
            channel
                .queue_bind(
                    &queue,
                    &self.config.exchange,
                    &queue,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| ConsumerError::QueueBind {
                    queue: queue.clone(),
                    message: e.to_string(),
                })?;

            debug!(queue = %queue, exchange = %self.config.exchange, "Queue declared and bound");
        }

        let mut consumers = Vec::with_capacity(2);
        for (kind, queue) in self.queues() {
            let consumer_tag = format!("{}-{}", self.config.consumer_tag, kind.as_str());
            let consumer = channel
                .basic_consume(
                    &queue,
                    &consumer_tag,
                    BasicConsumeOptions {
                        no_local: false,
                        no_ack: false,
                        exclusive: false,
                        nowait: false,
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| ConsumerError::Consume {
                    queue: queue.clone(),
                    message: e.to_string(),
                })?;
            consumers.push((kind, queue, consumer));
        }

        Ok(consumers)
    }

    /// Wait for the loops to exit, aborting any still running after `grace`
    async fn drain(&mut self, grace: Duration) {
        let loops = std::mem::take(&mut self.loops);
        if loops.is_empty() {
            return;
        }

        let aborts: Vec<_> = loops.iter().map(|handle| handle.abort_handle()).collect();
        if tokio::time::timeout(grace, futures::future::join_all(loops))
            .await
            .is_err()
        {
            warn!(?grace, "Consumption loops still busy after grace period, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

#[async_trait]
impl MessageConsumer for AmqpConsumer {
    async fn start(&mut self, cancel: CancellationToken) -> Result<(), ConsumerError> {
        debug!(
            host = %self.config.host,
            exchange = %self.config.exchange,
            "Initializing AMQP consumer"
        );

        let connection = Connection::connect(&self.config.uri(), ConnectionProperties::default())
            .await
            .map_err(|e| ConsumerError::Connection(e.to_string()))?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                close_connection(&connection).await;
                return Err(ConsumerError::Channel(e.to_string()));
            }
        };

        let consumers = match self.declare_and_consume(&channel).await {
            Ok(consumers) => consumers,
            Err(e) => {
                close_channel(&channel).await;
                close_connection(&connection).await;
                return Err(e);
            }
        };

        for (kind, queue, consumer) in consumers {
            info!(queue = %queue, kind = %kind, "Starting consumption loop");
            self.loops.push(tokio::spawn(consume_loop(
                kind,
                queue,
                consumer,
                self.handler.clone(),
                self.metrics.clone(),
                cancel.clone(),
            )));
        }

        self.connection = Some(connection);
        self.channel = Some(channel);
        Ok(())
    }

    async fn stop(&mut self, grace: Duration) {
        info!("Stopping AMQP consumer");

        self.drain(grace).await;

        if let Some(channel) = self.channel.take() {
            close_channel(&channel).await;
        }
        if let Some(connection) = self.connection.take() {
            close_connection(&connection).await;
        }

        info!("AMQP consumer stopped");
    }
}

async fn close_channel(channel: &Channel) {
    match channel.close(200, "OK").await {
        Ok(()) => debug!("AMQP channel closed"),
        Err(e) => error!(error = %e, "Failed to close AMQP channel"),
    }
}

async fn close_connection(connection: &Connection) {
    match connection.close(200, "OK").await {
        Ok(()) => debug!("AMQP connection closed"),
        Err(e) => error!(error = %e, "Failed to close AMQP connection"),
    }
}

/// Consume one queue until cancellation or until the delivery stream ends.
///
/// Cancellation wins over already buffered deliveries; those stay unacked
/// and are redelivered by the broker.
#[instrument(skip_all, fields(queue = %queue, kind = %kind))]
pub async fn consume_loop<S, D, E>(
    kind: RequestKind,
    queue: String,
    deliveries: S,
    handler: Arc<dyn RequestHandler>,
    metrics: Arc<dyn MetricsSink>,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<D, E>> + Send,
    D: InboundDelivery,
    E: Display + Send,
{
    tokio::pin!(deliveries);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!("Cancellation received, stopping consumption loop");
                break;
            }
            next = deliveries.next() => {
                match next {
                    Some(Ok(delivery)) => {
                        process_delivery(kind, &queue, &delivery, handler.as_ref(), metrics.as_ref(), &cancel)
                            .await;
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Delivery stream error");
                    }
                    None => {
                        info!("Delivery stream closed, stopping consumption loop");
                        break;
                    }
                }
            }
        }
    }
}

/// Decode a message payload into a [`ThumbRequest`]
pub fn decode_request(payload: &[u8]) -> Result<ThumbRequest, ConsumerError> {
    serde_json::from_slice(payload).map_err(|e| ConsumerError::Deserialization(e.to_string()))
}

async fn process_delivery<D: InboundDelivery>(
    kind: RequestKind,
    queue: &str,
    delivery: &D,
    handler: &dyn RequestHandler,
    metrics: &dyn MetricsSink,
    cancel: &CancellationToken,
) {
    let request = match decode_request(delivery.payload()) {
        Ok(request) => request,
        Err(e) => {
            error!(
                error = %e,
                payload = %String::from_utf8_lossy(delivery.payload()),
                "Discarding undecodable message"
            );
            reject(delivery).await;
            return;
        }
    };

    metrics.increment(
        kind.received_counter(),
        &[
            ("queue", queue.to_string()),
            ("filePath", request.file_path.clone()),
        ],
    );

    match handler.handle(kind, cancel, &request).await {
        Ok(()) => {
            if let Err(e) = delivery.ack().await {
                error!(error = %e, file_path = %request.file_path, "Failed to ack message");
            }
        }
        Err(e) => {
            error!(
                error = %e,
                request_id = %request.thumb_request_id,
                file_path = %request.file_path,
                "Failed to process thumb request"
            );
            reject(delivery).await;
        }
    }
}

async fn reject<D: InboundDelivery>(delivery: &D) {
    if let Err(e) = delivery.reject().await {
        error!(error = %e, "Failed to reject message");
    }
}
