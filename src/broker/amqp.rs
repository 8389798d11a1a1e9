//! RabbitMQ adapter over `lapin`.
//!
//! Publishing uses a dedicated confirm-mode channel with `mandatory` set, so a
//! returned (unroutable) message or a broker nack surfaces as an error. Every
//! subscription owns its own channel with the requested prefetch.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
};
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use super::{
    Acknowledger, Broker, BrokerError, DeathReason, DeathRecord, Delivery, DeliveryHeaders,
    Envelope, QueueDecl, Subscription, Topology,
};

const X_DEATH: &str = "x-death";
const X_FIRST_DEATH_QUEUE: &str = "x-first-death-queue";
const X_FIRST_DEATH_REASON: &str = "x-first-death-reason";
const X_FINAL_ERROR: &str = "x-final-error";
const PERSISTENT: u8 = 2;
const TRANSIENT: u8 = 1;

pub struct AmqpBroker {
    connection: Connection,
    publisher: Channel,
}

impl AmqpBroker {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, BrokerError> {
        let connection = tokio::time::timeout(
            timeout,
            Connection::connect(url, ConnectionProperties::default()),
        )
        .await
        .map_err(|_| BrokerError::transport("timed out connecting to broker"))?
        .map_err(BrokerError::transport)?;

        let publisher = connection
            .create_channel()
            .await
            .map_err(BrokerError::transport)?;
        publisher
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(BrokerError::transport)?;

        info!(target = "vhub::broker::amqp", "Connected to AMQP broker");
        Ok(Self {
            connection,
            publisher,
        })
    }

    pub async fn close(&self) -> Result<(), BrokerError> {
        self.connection
            .close(200, "shutdown")
            .await
            .map_err(BrokerError::transport)
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare(&self, topology: &Topology) -> Result<(), BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(BrokerError::transport)?;

        for exchange in topology.exchanges() {
            channel
                .exchange_declare(
                    &exchange.name,
                    ExchangeKind::Direct,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(BrokerError::transport)?;
        }

        for queue in topology.queues() {
            channel
                .queue_declare(
                    &queue.name,
                    QueueDeclareOptions {
                        durable: true,
                        ..QueueDeclareOptions::default()
                    },
                    queue_arguments(queue),
                )
                .await
                .map_err(BrokerError::transport)?;
        }

        for binding in topology.bindings() {
            channel
                .queue_bind(
                    &binding.queue,
                    &binding.exchange,
                    &binding.routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(BrokerError::transport)?;
        }

        let _ = channel.close(200, "declared").await;
        info!(
            target = "vhub::broker::amqp",
            exchanges = topology.exchanges().len(),
            queues = topology.queues().len(),
            bindings = topology.bindings().len(),
            "Declared broker topology"
        );
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Envelope,
    ) -> Result<(), BrokerError> {
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(message.content_type.as_str()))
            .with_message_id(ShortString::from(message.message_id.as_str()))
            .with_delivery_mode(if message.persistent {
                PERSISTENT
            } else {
                TRANSIENT
            })
            .with_headers(encode_headers(&message.headers));

        let confirmation = self
            .publisher
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                &message.payload,
                properties,
            )
            .await
            .map_err(BrokerError::transport)?
            .await
            .map_err(BrokerError::transport)?;

        match confirmation {
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
            Confirmation::Ack(Some(_)) => Err(BrokerError::Unroutable {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            }),
            Confirmation::Nack(_) => Err(BrokerError::Nacked(format!(
                "publish to `{exchange}` with key `{routing_key}` was nacked"
            ))),
        }
    }

    async fn subscribe(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(BrokerError::transport)?;
        channel
            .basic_qos(prefetch.max(1), BasicQosOptions::default())
            .await
            .map_err(BrokerError::transport)?;

        let tag = format!("vhub-{}", Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::transport)?;

        Ok(Box::new(AmqpSubscription {
            consumer,
            _channel: channel,
        }))
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64, BrokerError> {
        // A passive declare of a missing queue closes its channel.
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(BrokerError::transport)?;
        let declared = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|_| BrokerError::UnknownQueue(queue.to_string()))?;
        let _ = channel.close(200, "depth").await;
        Ok(u64::from(declared.message_count()))
    }
}

struct AmqpSubscription {
    consumer: Consumer,
    _channel: Channel,
}

#[async_trait]
impl Subscription for AmqpSubscription {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        let next = self.consumer.next().await?;
        Some(next.map_err(BrokerError::transport).map(into_delivery))
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(BrokerError::transport)
    }

    async fn reject(&self) -> Result<(), BrokerError> {
        self.acker
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map(|_| ())
            .map_err(BrokerError::transport)
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let properties = &delivery.properties;
    let envelope = Envelope {
        message_id: properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string())
            .unwrap_or_default(),
        content_type: properties
            .content_type()
            .as_ref()
            .map(|value| value.as_str().to_string())
            .unwrap_or_default(),
        persistent: properties.delivery_mode().unwrap_or(TRANSIENT) == PERSISTENT,
        payload: Bytes::from(delivery.data.clone()),
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        headers: properties
            .headers()
            .as_ref()
            .map(decode_headers)
            .unwrap_or_default(),
    };

    Delivery::new(
        envelope,
        Box::new(AmqpAcker {
            acker: delivery.acker,
        }),
    )
}

fn queue_arguments(queue: &QueueDecl) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(exchange) = queue.dead_letter_exchange.as_deref() {
        arguments.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(exchange)),
        );
    }
    if let Some(key) = queue.dead_letter_routing_key.as_deref() {
        arguments.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(key)),
        );
    }
    if let Some(ttl) = queue.message_ttl {
        let millis = u32::try_from(ttl.as_millis()).unwrap_or(u32::MAX);
        arguments.insert(
            ShortString::from("x-message-ttl"),
            AMQPValue::LongUInt(millis),
        );
    }
    arguments
}

fn encode_headers(headers: &DeliveryHeaders) -> FieldTable {
    let mut table = FieldTable::default();

    if !headers.deaths.is_empty() {
        let deaths: Vec<AMQPValue> = headers
            .deaths
            .iter()
            .map(|death| AMQPValue::FieldTable(encode_death(death)))
            .collect();
        table.insert(
            ShortString::from(X_DEATH),
            AMQPValue::FieldArray(FieldArray::from(deaths)),
        );
    }
    if let Some(queue) = headers.first_death_queue.as_deref() {
        table.insert(
            ShortString::from(X_FIRST_DEATH_QUEUE),
            AMQPValue::LongString(LongString::from(queue)),
        );
    }
    if let Some(reason) = headers.first_death_reason {
        table.insert(
            ShortString::from(X_FIRST_DEATH_REASON),
            AMQPValue::LongString(LongString::from(reason.as_str())),
        );
    }
    if let Some(error) = headers.final_error.as_deref() {
        table.insert(
            ShortString::from(X_FINAL_ERROR),
            AMQPValue::LongString(LongString::from(error)),
        );
    }
    table
}

fn encode_death(death: &DeathRecord) -> FieldTable {
    let mut table = FieldTable::default();
    table.insert(
        ShortString::from("queue"),
        AMQPValue::LongString(LongString::from(death.queue.as_str())),
    );
    table.insert(
        ShortString::from("reason"),
        AMQPValue::LongString(LongString::from(death.reason.as_str())),
    );
    table.insert(
        ShortString::from("count"),
        AMQPValue::LongLongInt(i64::try_from(death.count).unwrap_or(i64::MAX)),
    );
    table.insert(
        ShortString::from("exchange"),
        AMQPValue::LongString(LongString::from(death.exchange.as_str())),
    );
    let keys: Vec<AMQPValue> = death
        .routing_keys
        .iter()
        .map(|key| AMQPValue::LongString(LongString::from(key.as_str())))
        .collect();
    table.insert(
        ShortString::from("routing-keys"),
        AMQPValue::FieldArray(FieldArray::from(keys)),
    );
    table.insert(
        ShortString::from("time"),
        AMQPValue::Timestamp(u64::try_from(death.time.unix_timestamp()).unwrap_or_default()),
    );
    table
}

fn field<'a>(table: &'a FieldTable, key: &str) -> Option<&'a AMQPValue> {
    table.inner().get(&ShortString::from(key))
}

fn decode_headers(table: &FieldTable) -> DeliveryHeaders {
    let deaths = match field(table, X_DEATH) {
        Some(AMQPValue::FieldArray(array)) => array
            .as_slice()
            .iter()
            .filter_map(|value| match value {
                AMQPValue::FieldTable(entry) => decode_death(entry),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    DeliveryHeaders {
        deaths,
        first_death_queue: field(table, X_FIRST_DEATH_QUEUE).and_then(text),
        first_death_reason: field(table, X_FIRST_DEATH_REASON)
            .and_then(text)
            .and_then(|reason| DeathReason::parse(&reason)),
        final_error: field(table, X_FINAL_ERROR).and_then(text),
    }
}

fn decode_death(table: &FieldTable) -> Option<DeathRecord> {
    let queue = field(table, "queue").and_then(text)?;
    let reason = field(table, "reason")
        .and_then(text)
        .and_then(|reason| DeathReason::parse(&reason))?;
    let count = field(table, "count").and_then(number).unwrap_or(1);
    let exchange = field(table, "exchange").and_then(text).unwrap_or_default();
    let routing_keys = match field(table, "routing-keys") {
        Some(AMQPValue::FieldArray(keys)) => keys.as_slice().iter().filter_map(text).collect(),
        _ => Vec::new(),
    };
    let time = match field(table, "time") {
        Some(AMQPValue::Timestamp(seconds)) => i64::try_from(*seconds)
            .ok()
            .and_then(|seconds| OffsetDateTime::from_unix_timestamp(seconds).ok())
            .unwrap_or(OffsetDateTime::UNIX_EPOCH),
        _ => OffsetDateTime::UNIX_EPOCH,
    };

    Some(DeathRecord {
        queue,
        reason,
        count,
        exchange,
        routing_keys,
        time,
    })
}

fn text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(value) => {
            Some(String::from_utf8_lossy(value.as_bytes()).into_owned())
        }
        AMQPValue::ShortString(value) => Some(value.as_str().to_string()),
        _ => None,
    }
}

fn number(value: &AMQPValue) -> Option<u64> {
    match value {
        AMQPValue::LongLongInt(value) => u64::try_from(*value).ok(),
        AMQPValue::LongInt(value) => u64::try_from(*value).ok(),
        AMQPValue::LongUInt(value) => Some(u64::from(*value)),
        AMQPValue::ShortInt(value) => u64::try_from(*value).ok(),
        AMQPValue::ShortUInt(value) => Some(u64::from(*value)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn queue_arguments_carry_dead_letter_target_and_ttl() {
        let queue = QueueDecl {
            name: "volunteer.request.queue.retry.1".to_string(),
            dead_letter_exchange: Some("volunteer.request.queue.retry".to_string()),
            dead_letter_routing_key: Some("retry-tier-2".to_string()),
            message_ttl: Some(Duration::from_secs(5)),
        };
        let arguments = queue_arguments(&queue);

        assert_eq!(
            field(&arguments, "x-message-ttl"),
            Some(&AMQPValue::LongUInt(5_000))
        );
        assert_eq!(
            field(&arguments, "x-dead-letter-routing-key")
                .and_then(text)
                .as_deref(),
            Some("retry-tier-2")
        );
    }

    #[test]
    fn headers_survive_encoding() {
        let headers = DeliveryHeaders {
            deaths: vec![DeathRecord {
                queue: "volunteer.request.queue".to_string(),
                reason: DeathReason::Rejected,
                count: 2,
                exchange: "volunteer.request.exchange".to_string(),
                routing_keys: vec!["volunteer.request.create".to_string()],
                time: datetime!(2024-05-01 10:00 UTC),
            }],
            first_death_queue: Some("volunteer.request.queue".to_string()),
            first_death_reason: Some(DeathReason::Rejected),
            final_error: Some("database timeout".to_string()),
        };

        assert_eq!(decode_headers(&encode_headers(&headers)), headers);
    }
}
