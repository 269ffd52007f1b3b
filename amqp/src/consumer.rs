use crate::binding::Binding;
use crate::broker::{Broker, LinkEvent};
use crate::command::{ChannelId, Command, CommandKind, CommandResult, Delivery, ServerId};
use crate::config::Config;
use crate::correlation::{CorrelationTable, Reply};
use crate::dispatch::{Dispatcher, Request, Role};
use crate::error::AmqpError;
use crate::pool::{ConnectionEvent, Pool, PoolEvent};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Turns deliveries nobody was waiting for into whatever the application
/// makes of them (presence and dialog updates, mostly).
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()>;
}

#[derive(Debug)]
pub struct Job {
    pub delivery: Delivery,
    /// Ack once the handler is done with it.
    pub ack: bool,
}

pub struct ConsumerWorker {
    id: usize,
    jobs: mpsc::Receiver<Job>,
    handler: Arc<dyn DeliveryHandler>,
    acks: mpsc::UnboundedSender<Command>,
}

impl ConsumerWorker {
    pub fn new(
        id: usize,
        jobs: mpsc::Receiver<Job>,
        handler: Arc<dyn DeliveryHandler>,
        acks: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            id,
            jobs,
            handler,
            acks,
        }
    }

    pub async fn run(mut self) {
        while let Some(job) = self.jobs.recv().await {
            let delivery = &job.delivery;
            match self.handler.handle(delivery).await {
                Ok(()) => {
                    if job.ack {
                        let _ = self.acks.send(Command::ack(
                            delivery.server_id,
                            delivery.channel_id,
                            delivery.delivery_tag,
                        ));
                    }
                }
                Err(e) => warn!(
                    worker = self.id,
                    routing_key = %delivery.routing_key,
                    "delivery handler failed: {e}"
                ),
            }
        }
        debug!(worker = self.id, "consumer worker stopped");
    }
}

/// A binding the gateway keeps alive, and where it currently lives.
#[derive(Debug)]
struct Subscription {
    kind: CommandKind,
    binding: Binding,
    placed: Vec<(ServerId, ChannelId)>,
}

impl Subscription {
    fn same(&self, binding: &Binding) -> bool {
        self.binding.queue == binding.queue
            && self.binding.exchange == binding.exchange
            && self.binding.routing_key == binding.routing_key
    }
}

/// Owns the consuming connections: declares and binds queues, restores
/// bindings after a reconnect, matches targeted replies and hands
/// everything else to the workers.
pub struct ConsumerSupervisor {
    pool: Pool,
    table: Arc<CorrelationTable>,
    dispatcher: Dispatcher,
    requests: mpsc::Receiver<Request>,
    events: mpsc::UnboundedReceiver<PoolEvent>,
    acks: mpsc::UnboundedReceiver<Command>,
    workers: Vec<mpsc::Sender<Job>>,
    next_worker: usize,
    subscriptions: Vec<Subscription>,
    tick: Duration,
}

impl ConsumerSupervisor {
    pub fn new(
        config: &Config,
        broker: Arc<dyn Broker>,
        table: Arc<CorrelationTable>,
        dispatcher: Dispatcher,
        requests: mpsc::Receiver<Request>,
        bus: broadcast::Sender<ConnectionEvent>,
        workers: Vec<mpsc::Sender<Job>>,
        acks: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (pool, events) = Pool::new(Role::Consumer, config, broker, bus);
        Self {
            pool,
            table,
            dispatcher,
            requests,
            events,
            acks,
            workers,
            next_worker: 0,
            subscriptions: Vec::new(),
            tick: config.sweep_interval(),
        }
    }

    pub async fn run(mut self) {
        self.pool.connect_all().await;
        info!(workers = self.workers.len(), "amqp consumer started");

        let mut tick = tokio::time::interval(self.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(Request::Command(command)) => self.on_command(command).await,
                    Some(Request::Release { server_id, channel_id, .. }) => {
                        debug!(server = server_id, channel = channel_id, "nothing to release");
                    }
                    Some(Request::Shutdown) | None => break,
                },
                Some(event) = self.events.recv() => self.on_event(event).await,
                Some(ack) = self.acks.recv() => self.on_command(ack).await,
                _ = tick.tick() => {
                    if !self.pool.reconnect_due().await.is_empty() {
                        self.restore().await;
                    }
                }
            }
        }

        self.shutdown().await;
        info!("amqp consumer stopped");
    }

    async fn on_command(&mut self, mut command: Command) {
        let result = match command.kind {
            CommandKind::Consume | CommandKind::TargetedConsumer => {
                self.subscribe(&command).await
            }
            CommandKind::Unsubscribe => self.unsubscribe(&command).await,
            CommandKind::Ack => self.ack(&command).await,
            kind => Err(AmqpError::InvalidTransition {
                from: Role::Consumer.to_string(),
                to: kind.to_string(),
            }),
        };
        if let Some(completion) = command.take_completion() {
            completion.complete(result, self.table.resumer());
        }
    }

    async fn subscribe(&mut self, command: &Command) -> CommandResult {
        let binding = command.binding.clone().ok_or_else(|| {
            AmqpError::Broker("subscription without a binding".to_string())
        })?;
        if self.subscriptions.iter().any(|s| s.same(&binding)) {
            return Ok(String::new());
        }
        let mut subscription = Subscription {
            kind: command.kind,
            binding,
            placed: Vec::new(),
        };
        let placed = self.place(&mut subscription).await;
        if subscription.placed.is_empty() {
            return Err(placed.err().unwrap_or(AmqpError::NoAvailableServer));
        }
        info!(
            queue = %subscription.binding.queue,
            exchange = %subscription.binding.exchange,
            servers = subscription.placed.len(),
            "subscribed"
        );
        self.subscriptions.push(subscription);
        Ok(String::new())
    }

    /// Binds the subscription wherever it's missing: one server per zone
    /// when federated, otherwise the first healthy server in failover
    /// order.
    async fn place(&mut self, subscription: &mut Subscription) -> Result<(), AmqpError> {
        let targets = if subscription.binding.federate {
            let placed_zones: Vec<String> = subscription
                .placed
                .iter()
                .filter_map(|(server, _)| self.pool.zone_of(*server).map(String::from))
                .collect();
            self.pool
                .per_zone()
                .into_iter()
                .filter(|server| {
                    self.pool
                        .zone_of(*server)
                        .map(|zone| !placed_zones.iter().any(|z| z == zone))
                        .unwrap_or(false)
                })
                .collect()
        } else if subscription.placed.is_empty() {
            self.pool.candidates()?
        } else {
            return Ok(());
        };

        let mut last = Ok(());
        for server_id in targets {
            match self.bind_on(server_id, subscription).await {
                Ok(channel_id) => {
                    subscription.placed.push((server_id, channel_id));
                    if !subscription.binding.federate {
                        return Ok(());
                    }
                }
                Err(e) => {
                    warn!(
                        queue = %subscription.binding.queue,
                        server = server_id,
                        "bind failed: {e}"
                    );
                    last = Err(e);
                }
            }
        }
        last
    }

    async fn bind_on(
        &mut self,
        server_id: ServerId,
        subscription: &Subscription,
    ) -> Result<ChannelId, AmqpError> {
        let server = self
            .pool
            .server_mut(server_id)
            .ok_or(AmqpError::NoAvailableServer)?;
        let binding = &subscription.binding;
        let channel_id = server.acquire(subscription.kind, None, Some(binding.clone()))?;
        let bound = server.connection.link_mut()?.bind(channel_id, binding).await;
        if let Err(e) = bound {
            if let Some(channel) = server.channel_mut(channel_id) {
                let _ = channel.unbind();
            }
            return Err(e);
        }
        Ok(channel_id)
    }

    /// Re-establishes bindings lost with a connection.
    async fn restore(&mut self) {
        let mut subscriptions = std::mem::take(&mut self.subscriptions);
        for subscription in subscriptions.iter_mut() {
            let before = subscription.placed.len();
            let _ = self.place(subscription).await;
            if subscription.placed.len() > before {
                info!(queue = %subscription.binding.queue, "binding restored");
            }
        }
        self.subscriptions = subscriptions;
    }

    async fn unsubscribe(&mut self, command: &Command) -> CommandResult {
        let binding = command.binding.as_ref().ok_or_else(|| {
            AmqpError::Broker("unsubscribe without a binding".to_string())
        })?;
        let Some(index) = self.subscriptions.iter().position(|s| s.same(binding)) else {
            return Err(AmqpError::Broker(format!("not subscribed to {}", binding.queue)));
        };
        let subscription = self.subscriptions.remove(index);
        for (server_id, channel_id) in subscription.placed {
            let Some(server) = self.pool.server_mut(server_id) else {
                continue;
            };
            let Some(channel) = server.channel_mut(channel_id) else {
                continue;
            };
            channel.unbind()?;
            if let Ok(link) = server.connection.link_mut() {
                if let Err(e) = link.unbind(channel_id, &subscription.binding).await {
                    warn!(queue = %subscription.binding.queue, "unbind failed: {e}");
                }
            }
        }
        info!(queue = %subscription.binding.queue, "unsubscribed");
        Ok(String::new())
    }

    async fn ack(&mut self, command: &Command) -> CommandResult {
        let (Some(server_id), Some(channel_id)) = (command.server_id, command.channel_id)
        else {
            return Err(AmqpError::Broker("ack without a delivery".to_string()));
        };
        let server = self
            .pool
            .server_mut(server_id)
            .ok_or(AmqpError::ConnectionNotOpen)?;
        let acked = server
            .connection
            .link_mut()?
            .ack(channel_id, command.delivery_tag)
            .await;
        if let Err(e) = &acked {
            warn!(server = server_id, channel = channel_id, "ack failed: {e}");
        }
        acked.map(|_| String::new())
    }

    async fn on_event(&mut self, event: PoolEvent) {
        if !self.pool.is_current(&event) {
            debug!(server = event.server_id, "event from a stale consumer link");
            return;
        }
        match event.event {
            LinkEvent::Delivery(delivery) => self.on_delivery(delivery).await,
            LinkEvent::Lost(reason) => {
                let closed = self.pool.lost(event.server_id, &reason).await;
                for subscription in self.subscriptions.iter_mut() {
                    subscription
                        .placed
                        .retain(|(server, _)| *server != event.server_id);
                }
                if !closed.is_empty() {
                    self.restore().await;
                }
            }
        }
    }

    async fn on_delivery(&mut self, mut delivery: Delivery) {
        if let Some(id) = &delivery.correlation_id {
            if self.table.lookup_without_remove(id).is_some() {
                match self.table.reply(id, delivery.payload.clone()) {
                    // the call went out on a publisher channel that is
                    // still CALLING
                    Ok(Reply::Resolved(Some(location)))
                        if location.role != Role::Consumer =>
                    {
                        self.dispatcher.release(location, id.clone()).await;
                        return;
                    }
                    Ok(_) => return,
                    Err(_) => {}
                }
            }
        }

        let binding = self
            .pool
            .server(delivery.server_id)
            .and_then(|server| server.channel(delivery.channel_id))
            .and_then(|channel| channel.binding())
            .cloned();
        let mut ack_later = false;
        if let Some(binding) = &binding {
            let (key, subkey) = binding.classify(&delivery.payload);
            delivery.event_key = key;
            delivery.event_subkey = subkey;
            if binding.needs_ack() {
                if binding.wait_for_consumer_ack {
                    ack_later = true;
                } else {
                    let ack = Command::ack(
                        delivery.server_id,
                        delivery.channel_id,
                        delivery.delivery_tag,
                    );
                    let _ = self.ack(&ack).await;
                }
            }
        }

        if self.workers.is_empty() {
            warn!(routing_key = %delivery.routing_key, "no consumer workers, delivery dropped");
            return;
        }
        let worker = self.next_worker % self.workers.len();
        self.next_worker = worker + 1;
        let job = Job {
            delivery,
            ack: ack_later,
        };
        if self.workers[worker].send(job).await.is_err() {
            warn!(worker, "consumer worker is gone");
        }
    }

    async fn shutdown(&mut self) {
        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            if let Request::Command(mut command) = request {
                if let Some(completion) = command.take_completion() {
                    completion.complete(Err(AmqpError::Shutdown), self.table.resumer());
                }
            }
        }
        self.workers.clear();
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::ExchangeType;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::{BrokerLink, Message};
    use crate::command::{Completion, CorrelationId, ResumeQueue};
    use crate::config::ZoneConfig;
    use crate::correlation::{Location, Pending};
    use crate::topology::ServerAddr;
    use tokio::sync::oneshot;
    use tokio::time::Instant;

    struct Harness {
        broker: MemoryBroker,
        table: Arc<CorrelationTable>,
        requests: mpsc::Sender<Request>,
        jobs: mpsc::Receiver<Job>,
        /// What the supervisor hands back to the publisher.
        publisher: mpsc::Receiver<Request>,
    }

    fn start(config: Config) -> Harness {
        let broker = MemoryBroker::new();
        let (resumer, _rx) = ResumeQueue::new();
        let table = Arc::new(CorrelationTable::new(4, Arc::new(resumer)));
        let (requests, rx) = mpsc::channel(16);
        let (bus, _) = broadcast::channel(16);
        let (worker, jobs) = mpsc::channel(16);
        let (_acks_tx, acks) = mpsc::unbounded_channel();
        let (dispatcher, queues) =
            Dispatcher::new(table.clone(), 16, Duration::from_millis(100));
        let supervisor = ConsumerSupervisor::new(
            &config,
            Arc::new(broker.clone()),
            table.clone(),
            dispatcher,
            rx,
            bus,
            vec![worker],
            acks,
        );
        tokio::spawn(supervisor.run());
        Harness {
            broker,
            table,
            requests,
            jobs,
            publisher: queues.publisher,
        }
    }

    async fn request(h: &Harness, kind: CommandKind, binding: Binding) -> CommandResult {
        let (tx, rx) = oneshot::channel();
        let mut command = Command::with_binding(kind, binding);
        command.set_completion(Completion::Waiter(tx));
        h.requests.send(Request::Command(command)).await.unwrap();
        rx.await.unwrap()
    }

    async fn publish(broker: &MemoryBroker, exchange: &str, routing_key: &str, payload: &str) {
        let addr = ServerAddr {
            id: 99,
            zone: "test".to_string(),
            url: "amqp://producer".to_string(),
        };
        let (mut link, _) = broker.connect(&addr).await.unwrap();
        link.open_channel(1).await.unwrap();
        let message = Message {
            exchange: exchange.to_string(),
            exchange_type: ExchangeType::Topic,
            routing_key: routing_key.to_string(),
            reply_to: None,
            correlation_id: None,
            payload: payload.to_string(),
        };
        link.publish(1, message).await.unwrap();
    }

    #[tokio::test]
    async fn deliveries_are_classified_and_acked() {
        let mut h = start(Config::single_zone("a", &["amqp://a1"]));
        let binding = Binding::new("presence", ExchangeType::Topic, "watch", "user.*")
            .with_event_keys("event", "user");
        assert!(request(&h, CommandKind::Consume, binding).await.is_ok());
        assert_eq!(h.broker.consumers("watch"), 1);

        publish(&h.broker, "presence", "user.1", r#"{"event":"online","user":"1"}"#).await;
        let job = h.jobs.recv().await.unwrap();
        assert_eq!(job.delivery.event_key.as_deref(), Some("online"));
        assert_eq!(job.delivery.event_subkey.as_deref(), Some("1"));
        assert!(!job.ack);
        assert_eq!(h.broker.acks().len(), 1);
    }

    #[tokio::test]
    async fn consumer_ack_waits_for_worker() {
        let mut h = start(Config::single_zone("a", &["amqp://a1"]));
        let mut binding = Binding::new("callmgr", ExchangeType::Direct, "jobs", "job");
        binding.wait_for_consumer_ack = true;
        request(&h, CommandKind::Consume, binding).await.unwrap();

        publish(&h.broker, "callmgr", "job", "{}").await;
        let job = h.jobs.recv().await.unwrap();
        assert!(job.ack);
        assert!(h.broker.acks().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_frees_the_queue() {
        let h = start(Config::single_zone("a", &["amqp://a1"]));
        let binding = Binding::new("presence", ExchangeType::Topic, "watch", "#");
        request(&h, CommandKind::Consume, binding.clone()).await.unwrap();
        assert!(request(&h, CommandKind::Unsubscribe, binding.clone()).await.is_ok());
        assert_eq!(h.broker.consumers("watch"), 0);
        assert!(request(&h, CommandKind::Unsubscribe, binding).await.is_err());
    }

    #[tokio::test]
    async fn federated_binding_lands_in_every_zone() {
        let mut config = Config::single_zone("a", &["amqp://a1"]);
        config.zones.push(ZoneConfig {
            name: "b".to_string(),
            primary: false,
            servers: vec!["amqp://b1".to_string()],
        });
        let h = start(config);
        let binding =
            Binding::new("presence", ExchangeType::Fanout, "everywhere", "").federated();
        request(&h, CommandKind::Consume, binding).await.unwrap();
        assert_eq!(h.broker.consumers("everywhere"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn bindings_come_back_after_reconnect() {
        let mut config = Config::single_zone("a", &["amqp://a1"]);
        config.reconnect_min_ms = 50;
        let h = start(config);
        let binding = Binding::new("presence", ExchangeType::Topic, "watch", "#");
        request(&h, CommandKind::Consume, binding).await.unwrap();

        h.broker.kill("amqp://a1");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.broker.consumers("watch"), 0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.broker.connections("amqp://a1"), 1);
        assert_eq!(h.broker.consumers("watch"), 1);
    }

    #[tokio::test]
    async fn targeted_reply_frees_the_calling_channel() {
        let mut h = start(Config::single_zone("a", &["amqp://a1"]));
        let binding = Binding::new("", ExchangeType::Direct, "node-7", "node-7");
        request(&h, CommandKind::TargetedConsumer, binding).await.unwrap();

        let (tx, rx) = oneshot::channel();
        let id = CorrelationId::from("via-node-7");
        let deadline = Instant::now() + Duration::from_secs(5);
        h.table
            .insert(
                id.clone(),
                Pending::new(CommandKind::Call, deadline, Completion::Waiter(tx)),
            )
            .unwrap();
        h.table.set_location(
            &id,
            Location {
                role: Role::Publisher,
                server_id: 0,
                channel_id: 1,
            },
        );

        let addr = ServerAddr {
            id: 99,
            zone: "test".to_string(),
            url: "amqp://peer".to_string(),
        };
        let (mut link, _) = h.broker.connect(&addr).await.unwrap();
        link.open_channel(1).await.unwrap();
        let reply = Message {
            exchange: String::new(),
            exchange_type: ExchangeType::Direct,
            routing_key: "node-7".to_string(),
            reply_to: None,
            correlation_id: Some(id.clone()),
            payload: "answer".to_string(),
        };
        link.publish(1, reply).await.unwrap();

        assert_eq!(rx.await.unwrap(), Ok("answer".to_string()));
        let Some(Request::Release {
            server_id,
            channel_id,
            id: released,
        }) = h.publisher.recv().await
        else {
            panic!("expected the publisher channel back");
        };
        assert_eq!((server_id, channel_id), (0, 1));
        assert_eq!(released, id);
        assert!(h.jobs.try_recv().is_err());
    }
}
