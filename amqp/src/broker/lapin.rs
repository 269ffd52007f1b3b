//! AMQP 0-9-1 over lapin.

use super::{Broker, BrokerLink, LinkEvent, LinkEvents, Message};
use crate::binding::{Binding, ExchangeType};
use crate::command::{ChannelId, CorrelationId, Delivery, ServerId};
use crate::error::{AmqpError, AmqpResult};
use crate::topology::ServerAddr;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use nebula_utils::uuid;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::warn;

fn broker_error(e: lapin::Error) -> AmqpError {
    AmqpError::Broker(e.to_string())
}

/// A nack means the broker refused to take responsibility for the message.
fn confirmed(confirmation: Confirmation) -> AmqpResult<()> {
    if confirmation.is_nack() {
        return Err(AmqpError::Broker("publish nacked".to_string()));
    }
    Ok(())
}

/// A consumer stream that ends without us cancelling it means the broker
/// dropped the consumer (queue deleted, node gone), and its binding with it.
fn stream_ended(cancelled: &AtomicBool, tag: &str) -> Option<LinkEvent> {
    if cancelled.load(Ordering::Acquire) {
        return None;
    }
    Some(LinkEvent::Lost(format!("consumer {tag} cancelled by broker")))
}

fn exchange_kind(kind: ExchangeType) -> ExchangeKind {
    match kind {
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Topic => ExchangeKind::Topic,
        ExchangeType::Fanout => ExchangeKind::Fanout,
        ExchangeType::Headers => ExchangeKind::Headers,
    }
}

#[derive(Default)]
pub struct LapinBroker;

impl LapinBroker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Broker for LapinBroker {
    async fn connect(
        &self,
        server: &ServerAddr,
    ) -> AmqpResult<(Box<dyn BrokerLink>, LinkEvents)> {
        let connection = Connection::connect(&server.url, ConnectionProperties::default())
            .await
            .map_err(broker_error)?;
        let (tx, rx) = mpsc::unbounded_channel();

        let lost = tx.clone();
        connection.on_error(move |e| {
            let _ = lost.send(LinkEvent::Lost(e.to_string()));
        });

        // replies arrive on a server-named exclusive queue with its own
        // channel, reported as channel 0
        let reply_channel = connection.create_channel().await.map_err(broker_error)?;
        let queue = reply_channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(broker_error)?;
        let reply_queue = queue.name().as_str().to_string();
        let reply_tag = format!("reply-{}", uuid());
        let consumer = reply_channel
            .basic_consume(
                &reply_queue,
                &reply_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(broker_error)?;
        let reply_cancelled = Arc::new(AtomicBool::new(false));
        forward(consumer, reply_tag, server.id, 0, reply_cancelled.clone(), tx.clone());

        let link = LapinLink {
            server_id: server.id,
            connection,
            reply_channel,
            reply_queue,
            reply_cancelled,
            channels: HashMap::new(),
            consumers: HashMap::new(),
            events: tx,
        };
        Ok((Box::new(link), rx))
    }
}

fn forward(
    mut consumer: lapin::Consumer,
    tag: String,
    server_id: ServerId,
    channel_id: ChannelId,
    cancelled: Arc<AtomicBool>,
    events: UnboundedSender<LinkEvent>,
) {
    tokio::spawn(async move {
        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(e) => {
                    let _ = events.send(LinkEvent::Lost(e.to_string()));
                    return;
                }
            };
            let properties = &delivery.properties;
            let event = LinkEvent::Delivery(Delivery {
                server_id,
                channel_id,
                delivery_tag: delivery.delivery_tag,
                exchange: delivery.exchange.as_str().to_string(),
                routing_key: delivery.routing_key.as_str().to_string(),
                correlation_id: properties
                    .correlation_id()
                    .as_ref()
                    .map(|id| CorrelationId(id.as_str().to_string())),
                reply_to: properties
                    .reply_to()
                    .as_ref()
                    .map(|queue| queue.as_str().to_string()),
                payload: String::from_utf8_lossy(&delivery.data).to_string(),
                event_key: None,
                event_subkey: None,
                redelivered: delivery.redelivered,
            });
            if events.send(event).is_err() {
                return;
            }
        }
        if let Some(lost) = stream_ended(&cancelled, &tag) {
            let _ = events.send(lost);
        }
    });
}

struct ConsumerTag {
    tag: String,
    cancelled: Arc<AtomicBool>,
}

pub struct LapinLink {
    server_id: ServerId,
    connection: Connection,
    reply_channel: Channel,
    reply_queue: String,
    reply_cancelled: Arc<AtomicBool>,
    channels: HashMap<ChannelId, Channel>,
    consumers: HashMap<ChannelId, ConsumerTag>,
    events: UnboundedSender<LinkEvent>,
}

impl LapinLink {
    fn channel(&self, id: ChannelId) -> AmqpResult<&Channel> {
        self.channels
            .get(&id)
            .ok_or_else(|| AmqpError::Broker(format!("channel {id} not open")))
    }
}

#[async_trait]
impl BrokerLink for LapinLink {
    fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    async fn open_channel(&mut self, channel: ChannelId) -> AmqpResult<()> {
        let amqp_channel = self.connection.create_channel().await.map_err(broker_error)?;
        amqp_channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(broker_error)?;
        self.channels.insert(channel, amqp_channel);
        Ok(())
    }

    async fn publish(&mut self, channel: ChannelId, message: Message) -> AmqpResult<()> {
        let mut properties = BasicProperties::default();
        if let Some(id) = &message.correlation_id {
            properties = properties.with_correlation_id(id.0.as_str().into());
        }
        if let Some(reply_to) = &message.reply_to {
            properties = properties.with_reply_to(reply_to.as_str().into());
        }
        let confirm = self
            .channel(channel)?
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                message.payload.as_bytes(),
                properties,
            )
            .await
            .map_err(broker_error)?;
        confirmed(confirm.await.map_err(broker_error)?)
    }

    async fn bind(&mut self, channel: ChannelId, binding: &Binding) -> AmqpResult<()> {
        let amqp_channel = self.channel(channel)?.clone();
        if !binding.exchange.is_empty() {
            amqp_channel
                .exchange_declare(
                    &binding.exchange,
                    exchange_kind(binding.exchange_type),
                    ExchangeDeclareOptions {
                        passive: binding.passive,
                        durable: binding.durable,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(broker_error)?;
        }
        amqp_channel
            .queue_declare(
                &binding.queue,
                QueueDeclareOptions {
                    passive: binding.passive,
                    durable: binding.durable,
                    exclusive: binding.exclusive,
                    auto_delete: binding.auto_delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(broker_error)?;
        if !binding.exchange.is_empty() {
            amqp_channel
                .queue_bind(
                    &binding.queue,
                    &binding.exchange,
                    &binding.routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(broker_error)?;
        }

        let tag = format!("{}-{}", binding.queue, uuid());
        let consumer = amqp_channel
            .basic_consume(
                &binding.queue,
                &tag,
                BasicConsumeOptions {
                    no_ack: binding.no_ack,
                    exclusive: binding.exclusive,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(broker_error)?;
        let cancelled = Arc::new(AtomicBool::new(false));
        forward(
            consumer,
            tag.clone(),
            self.server_id,
            channel,
            cancelled.clone(),
            self.events.clone(),
        );
        self.consumers.insert(channel, ConsumerTag { tag, cancelled });
        Ok(())
    }

    async fn unbind(&mut self, channel: ChannelId, binding: &Binding) -> AmqpResult<()> {
        let amqp_channel = self.channel(channel)?.clone();
        if let Some(consumer) = self.consumers.remove(&channel) {
            consumer.cancelled.store(true, Ordering::Release);
            amqp_channel
                .basic_cancel(&consumer.tag, BasicCancelOptions::default())
                .await
                .map_err(broker_error)?;
        }
        if !binding.exchange.is_empty() && !binding.durable {
            amqp_channel
                .queue_unbind(
                    &binding.queue,
                    &binding.exchange,
                    &binding.routing_key,
                    FieldTable::default(),
                )
                .await
                .map_err(broker_error)?;
        }
        Ok(())
    }

    async fn ack(&mut self, channel: ChannelId, delivery_tag: u64) -> AmqpResult<()> {
        self.channel(channel)?
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(broker_error)
    }

    async fn close(&mut self) {
        self.reply_cancelled.store(true, Ordering::Release);
        for consumer in self.consumers.values() {
            consumer.cancelled.store(true, Ordering::Release);
        }
        if let Err(e) = self.reply_channel.close(200, "closing").await {
            warn!(server = self.server_id, "reply channel close failed: {e}");
        }
        if let Err(e) = self.connection.close(200, "closing").await {
            warn!(server = self.server_id, "amqp close failed: {e}");
        }
        self.channels.clear();
        self.consumers.clear();
    }
}
