//! Boundary to the AMQP client library. The gateway only needs a handful
//! of operations from a broker connection; framing, authentication and
//! exchange/queue semantics stay on the other side of these traits.

pub mod memory;

#[cfg(feature = "lapin")]
pub mod lapin;

use crate::binding::{Binding, ExchangeType};
use crate::command::{ChannelId, Command, CorrelationId, Delivery};
use crate::error::AmqpResult;
use crate::topology::ServerAddr;
use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub exchange: String,
    pub exchange_type: ExchangeType,
    pub routing_key: String,
    pub reply_to: Option<String>,
    pub correlation_id: Option<CorrelationId>,
    pub payload: String,
}

impl Message {
    pub fn from_command(command: &Command, reply_to: Option<String>) -> Self {
        Self {
            exchange: command.exchange.clone(),
            exchange_type: command.exchange_type,
            routing_key: command.routing_key.clone(),
            reply_to,
            correlation_id: command.correlation_id.clone(),
            payload: command.payload.clone(),
        }
    }

    /// A reply to `request` on the default exchange.
    pub fn reply(request: &Delivery, reply_to: &str, payload: &str) -> Self {
        Self {
            exchange: String::new(),
            exchange_type: ExchangeType::Direct,
            routing_key: reply_to.to_string(),
            reply_to: None,
            correlation_id: request.correlation_id.clone(),
            payload: payload.to_string(),
        }
    }
}

/// What a broker connection reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Delivery(Delivery),
    Lost(String),
}

pub type LinkEvents = UnboundedReceiver<LinkEvent>;

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Performs the handshake with one server. The returned stream carries
    /// every delivery on the connection; it ending means the connection is
    /// gone.
    async fn connect(&self, server: &ServerAddr)
        -> AmqpResult<(Box<dyn BrokerLink>, LinkEvents)>;
}

#[async_trait]
pub trait BrokerLink: Send {
    /// Queue where replies to calls sent on this connection arrive.
    fn reply_queue(&self) -> &str;

    async fn open_channel(&mut self, channel: ChannelId) -> AmqpResult<()>;

    /// Returns once the broker confirmed the publish.
    async fn publish(&mut self, channel: ChannelId, message: Message) -> AmqpResult<()>;

    /// Declares the exchange and queue, binds them and starts consuming.
    async fn bind(&mut self, channel: ChannelId, binding: &Binding) -> AmqpResult<()>;

    async fn unbind(&mut self, channel: ChannelId, binding: &Binding) -> AmqpResult<()>;

    async fn ack(&mut self, channel: ChannelId, delivery_tag: u64) -> AmqpResult<()>;

    async fn close(&mut self);
}
