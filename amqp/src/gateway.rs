use crate::binding::Binding;
use crate::broker::Broker;
use crate::command::{
    ChannelId, Command, CommandKind, CommandResult, Completion, Continuation, CorrelationId,
    Resume, ServerId,
};
use crate::config::Config;
use crate::consumer::{ConsumerSupervisor, ConsumerWorker, DeliveryHandler};
use crate::correlation::{CorrelationIds, CorrelationTable, Pending};
use crate::dispatch::Dispatcher;
use crate::error::AmqpError;
use crate::pool::ConnectionEvent;
use crate::publisher::Publisher;
use crate::sweeper::Sweeper;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

/// Entry point for request-processing code. Nothing here touches the
/// broker: commands are handed to the publisher and consumer tasks and the
/// outcome comes back through the correlation table.
pub struct Gateway {
    dispatcher: Dispatcher,
    table: Arc<CorrelationTable>,
    ids: CorrelationIds,
    bus: broadcast::Sender<ConnectionEvent>,
    query_timeout: Duration,
    sweep_interval: Duration,
    handles: Vec<JoinHandle<()>>,
}

impl Gateway {
    pub fn start(
        mut config: Config,
        broker: Arc<dyn Broker>,
        handler: Arc<dyn DeliveryHandler>,
        resumer: Arc<dyn Resume>,
    ) -> Result<Gateway, AmqpError> {
        config.validate()?;

        let table = Arc::new(CorrelationTable::new(config.correlation_shards, resumer));
        let (dispatcher, queues) = Dispatcher::new(
            table.clone(),
            config.dispatch_queue,
            config.dispatch_timeout(),
        );
        let (bus, _) = broadcast::channel(64);
        let mut handles = Vec::new();

        let publisher = Publisher::new(
            &config,
            broker.clone(),
            table.clone(),
            queues.publisher,
            bus.clone(),
        );
        handles.push(tokio::spawn(publisher.run()));

        let (acks_tx, acks_rx) = mpsc::unbounded_channel();
        let mut workers = Vec::new();
        for id in 0..config.consumer_workers {
            let (tx, rx) = mpsc::channel(config.dispatch_queue);
            let worker = ConsumerWorker::new(id, rx, handler.clone(), acks_tx.clone());
            handles.push(tokio::spawn(worker.run()));
            workers.push(tx);
        }
        let consumer = ConsumerSupervisor::new(
            &config,
            broker,
            table.clone(),
            dispatcher.clone(),
            queues.consumer,
            bus.clone(),
            workers,
            acks_rx,
        );
        handles.push(tokio::spawn(consumer.run()));

        let sweeper = Sweeper::new(
            table.clone(),
            dispatcher.clone(),
            queues.sweeper,
            config.sweep_interval(),
        );
        handles.push(tokio::spawn(sweeper.run()));

        info!(
            zones = config.zones.len(),
            workers = config.consumer_workers,
            "amqp gateway started"
        );
        Ok(Gateway {
            dispatcher,
            table,
            ids: CorrelationIds::new(),
            bus,
            query_timeout: config.query_timeout(),
            sweep_interval: config.sweep_interval(),
            handles,
        })
    }

    pub fn table(&self) -> &Arc<CorrelationTable> {
        &self.table
    }

    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.bus.subscribe()
    }

    /// Reply-expecting commands get a correlation id and a table entry
    /// before they are dispatched; everything else carries its completion
    /// along.
    pub async fn issue(
        &self,
        mut command: Command,
        completion: Completion,
        timeout: Duration,
    ) -> Result<Option<CorrelationId>, AmqpError> {
        command.deadline = Instant::now() + timeout;
        let id = if command.kind.expects_reply() {
            let id = self.ids.next();
            let pending = Pending::new(command.kind, command.deadline, completion)
                .expecting(command.expected_replies);
            if let Err(pending) = self.table.insert(id.clone(), pending) {
                warn!(correlation_id = %id, "correlation id already in use");
                let error = AmqpError::Broker(format!("correlation id {id} already in use"));
                pending.fail(error.clone(), self.table.resumer());
                return Err(error);
            }
            command.correlation_id = Some(id.clone());
            Some(id)
        } else {
            command.set_completion(completion);
            None
        };
        self.dispatcher.dispatch(command).await?;
        Ok(id)
    }

    async fn wait(&self, command: Command, timeout: Duration) -> CommandResult {
        let (tx, rx) = oneshot::channel();
        // a failed dispatch resolves the waiter too
        let _ = self.issue(command, Completion::Waiter(tx), timeout).await;
        // the sweeper can take up to a full interval past the deadline
        let wait = timeout + self.sweep_interval * 2;
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AmqpError::Shutdown),
            Err(_) => Err(AmqpError::TimedOut),
        }
    }

    /// Fire and forget.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &str,
    ) -> Result<(), AmqpError> {
        let command = Command::new(CommandKind::Publish, exchange, routing_key, payload);
        self.issue(command, Completion::Detached, self.query_timeout)
            .await
            .map(|_| ())
    }

    /// Publishes once per zone and returns how many zones it reached.
    pub async fn broadcast(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &str,
    ) -> CommandResult {
        let command =
            Command::new(CommandKind::PublishBroadcast, exchange, routing_key, payload);
        self.wait(command, self.query_timeout).await
    }

    pub async fn query(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &str,
        timeout: Option<Duration>,
    ) -> CommandResult {
        let command = Command::new(CommandKind::Call, exchange, routing_key, payload);
        self.wait(command, timeout.unwrap_or(self.query_timeout)).await
    }

    /// The reply resumes `continuation` instead of waking a caller.
    pub async fn async_query(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &str,
        continuation: Continuation,
        timeout: Option<Duration>,
    ) -> Result<CorrelationId, AmqpError> {
        let command = Command::new(CommandKind::AsyncCall, exchange, routing_key, payload);
        let timeout = timeout.unwrap_or(self.query_timeout);
        self.issue(command, Completion::Continuation(continuation), timeout)
            .await?
            .ok_or_else(|| {
                AmqpError::Broker("async call without a correlation id".to_string())
            })
    }

    /// Gathers replies until `expected` have arrived or the deadline
    /// passes. The result is a JSON array of whatever came back.
    pub async fn collect(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &str,
        expected: Option<usize>,
        timeout: Option<Duration>,
    ) -> CommandResult {
        let mut command = Command::new(CommandKind::Collect, exchange, routing_key, payload);
        command.expected_replies = expected;
        self.wait(command, timeout.unwrap_or(self.query_timeout)).await
    }

    pub async fn async_collect(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &str,
        expected: Option<usize>,
        continuation: Continuation,
        timeout: Option<Duration>,
    ) -> Result<CorrelationId, AmqpError> {
        let mut command =
            Command::new(CommandKind::AsyncCollect, exchange, routing_key, payload);
        command.expected_replies = expected;
        let timeout = timeout.unwrap_or(self.query_timeout);
        self.issue(command, Completion::Continuation(continuation), timeout)
            .await?
            .ok_or_else(|| {
                AmqpError::Broker("async collect without a correlation id".to_string())
            })
    }

    pub async fn subscribe(&self, binding: Binding) -> CommandResult {
        let command = Command::with_binding(CommandKind::Consume, binding);
        self.wait(command, self.query_timeout).await
    }

    /// Binds a queue whose deliveries are first offered to the correlation
    /// table, then to the workers.
    pub async fn targeted_consumer(&self, binding: Binding) -> CommandResult {
        let command = Command::with_binding(CommandKind::TargetedConsumer, binding);
        self.wait(command, self.query_timeout).await
    }

    pub async fn unsubscribe(&self, binding: Binding) -> CommandResult {
        let command = Command::with_binding(CommandKind::Unsubscribe, binding);
        self.wait(command, self.query_timeout).await
    }

    pub async fn ack(
        &self,
        server_id: ServerId,
        channel_id: ChannelId,
        delivery_tag: u64,
    ) -> Result<(), AmqpError> {
        let command = Command::ack(server_id, channel_id, delivery_tag);
        self.issue(command, Completion::Detached, self.query_timeout)
            .await
            .map(|_| ())
    }

    /// Stops every role and waits for them to finish. Whatever is still
    /// queued is resolved with `Shutdown`.
    pub async fn shutdown(self) {
        self.dispatcher.shutdown().await;
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("amqp task ended badly: {e}");
            }
        }
        info!("amqp gateway stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::command::{Delivery, ResumeQueue, TransactionHandle};

    struct Ignore;

    #[async_trait::async_trait]
    impl DeliveryHandler for Ignore {
        async fn handle(&self, _delivery: &Delivery) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn colliding_correlation_id_is_a_broker_error() {
        let (resumer, mut resumptions) = ResumeQueue::new();
        let mut gateway = Gateway::start(
            Config::single_zone("a", &["amqp://a1"]),
            Arc::new(MemoryBroker::new()),
            Arc::new(Ignore),
            Arc::new(resumer),
        )
        .unwrap();
        gateway.ids = CorrelationIds::with_prefix("fixed");
        let (tx, _rx) = oneshot::channel();
        let taken = Pending::new(
            CommandKind::Call,
            Instant::now() + Duration::from_secs(5),
            Completion::Waiter(tx),
        );
        gateway.table.insert(CorrelationId::from("fixed-1"), taken).unwrap();

        let result = gateway.query("svc", "ping", "{}", None).await;
        assert!(matches!(result, Err(AmqpError::Broker(_))));

        gateway.ids = CorrelationIds::with_prefix("fixed");
        let handle = TransactionHandle { index: 2, label: 9 };
        let result = gateway
            .async_query("svc", "ping", "{}", Continuation::new("OK", "ERR", handle), None)
            .await;
        assert!(matches!(result, Err(AmqpError::Broker(_))));
        let resumed = resumptions.recv().await.unwrap();
        assert_eq!(resumed.route, "ERR");
        assert!(matches!(resumed.result, Err(AmqpError::Broker(_))));

        gateway.shutdown().await;
    }
}
