use crate::binding::{Binding, ExchangeType};
use crate::error::AmqpError;
use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::EnumString;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

pub type ServerId = usize;
pub type ChannelId = u16;
pub type CommandResult = Result<String, AmqpError>;

#[derive(
    strum_macros::Display,
    EnumString,
    Debug,
    PartialEq,
    Eq,
    Clone,
    Copy,
    Hash,
    Deserialize,
    Serialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Publish,
    Call,
    Consume,
    Ack,
    TargetedConsumer,
    PublishBroadcast,
    Collect,
    AsyncCall,
    AsyncCollect,
    Unsubscribe,
}

impl CommandKind {
    /// Kinds whose completion lives in the correlation table until a reply
    /// with the same correlation id arrives.
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            CommandKind::Call
                | CommandKind::AsyncCall
                | CommandKind::Collect
                | CommandKind::AsyncCollect
        )
    }

    pub fn is_async(&self) -> bool {
        matches!(self, CommandKind::AsyncCall | CommandKind::AsyncCollect)
    }

    pub fn is_collect(&self) -> bool {
        matches!(self, CommandKind::Collect | CommandKind::AsyncCollect)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(pub String);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        CorrelationId(id.to_string())
    }
}

/// Index/label pair identifying a suspended request-processing context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TransactionHandle {
    pub index: u32,
    pub label: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Continuation {
    pub success_route: String,
    pub error_route: String,
    pub transaction: TransactionHandle,
}

impl Continuation {
    pub fn new(
        success_route: &str,
        error_route: &str,
        transaction: TransactionHandle,
    ) -> Self {
        Self {
            success_route: success_route.to_string(),
            error_route: error_route.to_string(),
            transaction,
        }
    }

    pub fn route(&self, result: &CommandResult) -> &str {
        match result {
            Ok(_) => &self.success_route,
            Err(_) => &self.error_route,
        }
    }
}

/// The request-processing engine that owns suspended transactions.
pub trait Resume: Send + Sync {
    fn resume(&self, transaction: TransactionHandle, route: &str, result: CommandResult);
}

#[derive(Debug)]
pub struct Resumption {
    pub transaction: TransactionHandle,
    pub route: String,
    pub result: CommandResult,
}

/// Hands resumptions to the engine over a queue, so the resolving task
/// never runs engine code itself.
pub struct ResumeQueue {
    tx: mpsc::UnboundedSender<Resumption>,
}

impl ResumeQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Resumption>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Resume for ResumeQueue {
    fn resume(&self, transaction: TransactionHandle, route: &str, result: CommandResult) {
        let _ = self.tx.send(Resumption {
            transaction,
            route: route.to_string(),
            result,
        });
    }
}

/// Where the outcome of a command goes. Consumed on completion, so a
/// command can only ever be completed once.
#[derive(Debug)]
pub enum Completion {
    Waiter(oneshot::Sender<CommandResult>),
    Continuation(Continuation),
    Detached,
}

impl Completion {
    pub fn complete(self, result: CommandResult, resumer: &dyn Resume) {
        match self {
            Completion::Waiter(tx) => {
                // the receiver is gone when the caller stopped waiting
                let _ = tx.send(result);
            }
            Completion::Continuation(continuation) => {
                let route = continuation.route(&result).to_string();
                resumer.resume(continuation.transaction, &route, result);
            }
            Completion::Detached => {}
        }
    }
}

#[derive(Debug)]
pub struct Command {
    pub kind: CommandKind,
    pub exchange: String,
    pub exchange_type: ExchangeType,
    pub routing_key: String,
    pub reply_routing_key: Option<String>,
    pub queue: Option<String>,
    pub payload: String,
    pub correlation_id: Option<CorrelationId>,
    pub server_id: Option<ServerId>,
    pub channel_id: Option<ChannelId>,
    pub delivery_tag: u64,
    pub deadline: Instant,
    pub binding: Option<Binding>,
    pub expected_replies: Option<usize>,
    pub(crate) completion: Option<Completion>,
}

impl Command {
    pub fn new(kind: CommandKind, exchange: &str, routing_key: &str, payload: &str) -> Self {
        Self {
            kind,
            exchange: exchange.to_string(),
            exchange_type: ExchangeType::default(),
            routing_key: routing_key.to_string(),
            reply_routing_key: None,
            queue: None,
            payload: payload.to_string(),
            correlation_id: None,
            server_id: None,
            channel_id: None,
            delivery_tag: 0,
            deadline: Instant::now(),
            binding: None,
            expected_replies: None,
            completion: None,
        }
    }

    pub fn with_binding(kind: CommandKind, binding: Binding) -> Self {
        let mut command =
            Command::new(kind, &binding.exchange, &binding.routing_key, "");
        command.exchange_type = binding.exchange_type;
        command.queue = Some(binding.queue.clone());
        command.binding = Some(binding);
        command
    }

    pub fn ack(server_id: ServerId, channel_id: ChannelId, delivery_tag: u64) -> Self {
        let mut command = Command::new(CommandKind::Ack, "", "", "");
        command.server_id = Some(server_id);
        command.channel_id = Some(channel_id);
        command.delivery_tag = delivery_tag;
        command
    }

    pub fn take_completion(&mut self) -> Option<Completion> {
        self.completion.take()
    }

    pub fn set_completion(&mut self, completion: Completion) {
        self.completion = Some(completion);
    }

    /// Completes a command that never went through the correlation table.
    pub fn finish(mut self, result: CommandResult, resumer: &dyn Resume) {
        if let Some(completion) = self.completion.take() {
            completion.complete(result, resumer);
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline <= now
    }
}

/// A message received from the broker, matched or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub server_id: ServerId,
    pub channel_id: ChannelId,
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub correlation_id: Option<CorrelationId>,
    pub reply_to: Option<String>,
    pub payload: String,
    pub event_key: Option<String>,
    pub event_subkey: Option<String>,
    pub redelivered: bool,
}
