pub mod binding;
pub mod broker;
pub mod channel;
pub mod command;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod correlation;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod pool;
pub mod publisher;
pub mod server;
pub mod sweeper;
pub mod topology;

pub use binding::{Binding, ExchangeType};
pub use broker::memory::MemoryBroker;
pub use broker::{Broker, BrokerLink, LinkEvent, Message};
pub use command::{
    Command, CommandKind, CommandResult, Completion, Continuation, CorrelationId, Delivery,
    Resume, ResumeQueue, Resumption, TransactionHandle,
};
pub use config::{Config, ZoneConfig};
pub use consumer::DeliveryHandler;
pub use error::{AmqpError, AmqpResult};
pub use gateway::Gateway;
pub use pool::ConnectionEvent;
