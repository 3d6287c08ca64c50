use crate::ack::AckAction;
use crate::config::{Config, QUEUE_NAME};
use crate::consume::{DeliveryHandle, InboundDelivery};
use anyhow::{Context, Result};
use chrono::Utc;
use futures::{Stream, StreamExt};
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};

/// Persistent delivery mode for published messages.
const PERSISTENT: u8 = 2;

/// Broker connection shared by all workers. Each worker opens its own channel.
pub struct Broker {
    connection: Connection,
}

impl Broker {
    pub async fn connect(config: &Config) -> Result<Self> {
        let connection = Connection::connect(&config.rabbitmq_url, ConnectionProperties::default())
            .await
            .context("failed to connect to RabbitMQ")?;
        tracing::info!("connected to RabbitMQ");
        Ok(Self { connection })
    }

    /// Opens a channel, declares the queues and registers a manual-ack consumer.
    pub async fn open_worker(&self, config: &Config, consumer_tag: &str) -> Result<WorkerBinding> {
        let channel = self
            .connection
            .create_channel()
            .await
            .context("failed to open a channel")?;
        channel
            .basic_qos(config.prefetch, BasicQosOptions::default())
            .await
            .context("failed to set channel prefetch")?;

        channel
            .queue_declare(QUEUE_NAME, durable(), FieldTable::default())
            .await
            .with_context(|| format!("failed to declare queue {QUEUE_NAME}"))?;

        let dead_letter_queue = if config.max_rejections.is_some() {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .context("failed to enable publisher confirms")?;
            channel
                .queue_declare(&config.dead_letter_queue, durable(), FieldTable::default())
                .await
                .with_context(|| format!("failed to declare queue {}", config.dead_letter_queue))?;
            Some(config.dead_letter_queue.clone())
        } else {
            None
        };

        let consumer = channel
            .basic_consume(
                QUEUE_NAME,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .context("failed to register a consumer")?;
        tracing::info!(queue = QUEUE_NAME, consumer_tag, "waiting for messages");

        Ok(WorkerBinding {
            channel,
            consumer,
            dead_letter_queue,
        })
    }

    pub async fn close(&self) {
        if let Err(err) = self.connection.close(200, "worker shutdown").await {
            tracing::debug!(error=%err, "failed to close RabbitMQ connection");
        }
    }
}

fn durable() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    }
}

/// One worker's channel and consumer.
pub struct WorkerBinding {
    channel: Channel,
    consumer: lapin::Consumer,
    dead_letter_queue: Option<String>,
}

impl WorkerBinding {
    pub fn into_deliveries(
        self,
    ) -> impl Stream<Item = Result<InboundDelivery<AmqpHandle>, lapin::Error>> + Unpin + Send {
        let WorkerBinding {
            channel,
            consumer,
            dead_letter_queue,
        } = self;
        consumer.map(move |delivery| {
            delivery.map(|delivery| InboundDelivery {
                tag: delivery.delivery_tag,
                payload: delivery.data,
                redelivered: delivery.redelivered,
                handle: AmqpHandle {
                    acker: delivery.acker,
                    channel: channel.clone(),
                    dead_letter_queue: dead_letter_queue.clone(),
                },
            })
        })
    }
}

pub struct AmqpHandle {
    acker: Acker,
    channel: Channel,
    dead_letter_queue: Option<String>,
}

impl AmqpHandle {
    async fn publish_dead_letter(&self, queue: &str, payload: &[u8], reason: &str, rejections: u32) -> Result<()> {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from("x-death-reason"),
            AMQPValue::LongString(LongString::from(reason)),
        );
        headers.insert(ShortString::from("x-rejection-count"), AMQPValue::LongUInt(rejections));
        headers.insert(
            ShortString::from("x-dead-lettered-at"),
            AMQPValue::LongString(LongString::from(Utc::now().to_rfc3339())),
        );
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type(ShortString::from("application/json"))
            .with_headers(headers);

        let confirmation = self
            .channel
            .basic_publish("", queue, BasicPublishOptions::default(), payload, properties)
            .await
            .context("publish to dead-letter queue")?
            .await
            .context("await dead-letter publish confirm")?;
        if confirmation.is_nack() {
            anyhow::bail!("broker nacked dead-letter publish to {queue}");
        }
        Ok(())
    }
}

impl DeliveryHandle for AmqpHandle {
    async fn commit(self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .context("ack delivery")
    }

    async fn requeue(self) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue: true,
            })
            .await
            .context("nack delivery with requeue")
    }

    async fn discard(self) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue: false,
            })
            .await
            .context("nack delivery without requeue")
    }

    async fn dead_letter(self, payload: &[u8], reason: &str, rejections: u32) -> Result<AckAction> {
        let published = match self.dead_letter_queue.as_deref() {
            Some(queue) => self.publish_dead_letter(queue, payload, reason, rejections).await,
            None => Err(anyhow::anyhow!("no dead-letter queue declared")),
        };
        match published {
            Ok(()) => {
                tracing::warn!(rejections, reason, "moved reading to dead-letter queue");
                self.commit().await?;
                Ok(AckAction::DeadLetter)
            }
            Err(err) => {
                tracing::error!(error=%err, "dead-letter publish failed; requeueing");
                self.requeue().await?;
                Ok(AckAction::RequeueRetry)
            }
        }
    }
}
