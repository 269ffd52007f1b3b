use crate::broker::{Broker, LinkEvent, Message};
use crate::command::{ChannelId, Command, CommandKind, CommandResult, CorrelationId, ServerId};
use crate::config::Config;
use crate::correlation::{CorrelationTable, Location, Reply};
use crate::dispatch::{Request, Role};
use crate::error::AmqpError;
use crate::pool::{ConnectionEvent, Pool, PoolEvent};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

enum Sent {
    Confirmed(String),
    AwaitingReply,
}

/// Owns the publishing connections. Every PUBLISH, CALL and COLLECT goes
/// out through this task, one at a time, so messages leave each channel in
/// the order they were dispatched.
pub struct Publisher {
    pool: Pool,
    table: Arc<CorrelationTable>,
    requests: mpsc::Receiver<Request>,
    events: mpsc::UnboundedReceiver<PoolEvent>,
    deferred: VecDeque<(Command, usize)>,
    max_retries: usize,
    tick: Duration,
}

impl Publisher {
    pub fn new(
        config: &Config,
        broker: Arc<dyn Broker>,
        table: Arc<CorrelationTable>,
        requests: mpsc::Receiver<Request>,
        bus: broadcast::Sender<ConnectionEvent>,
    ) -> Self {
        let (pool, events) = Pool::new(Role::Publisher, config, broker, bus);
        Self {
            pool,
            table,
            requests,
            events,
            deferred: VecDeque::new(),
            max_retries: config.max_retries,
            tick: config.sweep_interval(),
        }
    }

    pub async fn run(mut self) {
        self.pool.connect_all().await;
        info!("amqp publisher started");

        let mut tick = tokio::time::interval(self.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(Request::Command(command)) => self.submit(command, 0).await,
                    Some(Request::Release { server_id, channel_id, id }) => {
                        if self.release(server_id, channel_id, &id) {
                            self.retry_deferred().await;
                        }
                    }
                    Some(Request::Shutdown) | None => break,
                },
                Some(event) = self.events.recv() => self.on_event(event).await,
                _ = tick.tick() => {
                    let reconnected = self.pool.reconnect_due().await;
                    if !reconnected.is_empty() {
                        debug!(servers = ?reconnected, "publisher reconnected");
                    }
                    self.retry_deferred().await;
                }
            }
        }

        self.shutdown().await;
        info!("amqp publisher stopped");
    }

    fn complete(&self, command: Command, result: CommandResult) {
        match &command.correlation_id {
            Some(id) => {
                let _ = self.table.resolve(id, result);
            }
            None => command.finish(result, self.table.resumer()),
        }
    }

    async fn submit(&mut self, command: Command, attempts: usize) {
        if attempts > 0 && command.is_expired(Instant::now()) {
            self.complete(command, Err(AmqpError::TimedOut));
            return;
        }
        if let Some(id) = &command.correlation_id {
            // the waiter gave up or the sweeper got there first
            if self.table.lookup_without_remove(id).is_none() {
                return;
            }
        }

        let sent = match command.kind {
            CommandKind::PublishBroadcast => self.broadcast(&command).await,
            _ => self.send(&command).await,
        };
        match sent {
            Ok(Sent::Confirmed(payload)) => self.complete(command, Ok(payload)),
            Ok(Sent::AwaitingReply) => {}
            Err(e) if e.is_retryable() => {
                if attempts >= self.max_retries {
                    warn!(kind = %command.kind, attempts, "giving up on command: {e}");
                    self.complete(command, Err(AmqpError::NoAvailableServer));
                } else {
                    self.deferred.push_back((command, attempts + 1));
                }
            }
            Err(e) => self.complete(command, Err(e)),
        }
    }

    async fn retry_deferred(&mut self) {
        let deferred = std::mem::take(&mut self.deferred);
        for (command, attempts) in deferred {
            self.submit(command, attempts).await;
        }
    }

    /// Walks the open servers in failover order until one has a free
    /// channel.
    async fn send(&mut self, command: &Command) -> Result<Sent, AmqpError> {
        let mut last = AmqpError::NoAvailableServer;
        for server_id in self.pool.candidates()? {
            match self.send_on(server_id, command).await {
                Ok(sent) => return Ok(sent),
                Err(e) if e.is_retryable() => last = e,
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// One copy per zone, on the first healthy server of each.
    async fn broadcast(&mut self, command: &Command) -> Result<Sent, AmqpError> {
        let servers = self.pool.per_zone();
        if servers.is_empty() {
            return Err(AmqpError::NoAvailableServer);
        }
        let mut reached = 0;
        let mut last = AmqpError::NoAvailableServer;
        for server_id in servers {
            match self.send_on(server_id, command).await {
                Ok(_) => reached += 1,
                Err(e) => last = e,
            }
        }
        if reached == 0 {
            return Err(last);
        }
        Ok(Sent::Confirmed(reached.to_string()))
    }

    async fn send_on(
        &mut self,
        server_id: ServerId,
        command: &Command,
    ) -> Result<Sent, AmqpError> {
        let server = self
            .pool
            .server_mut(server_id)
            .ok_or(AmqpError::NoAvailableServer)?;
        let channel_id =
            server.acquire(command.kind, command.correlation_id.clone(), None)?;
        if let Some(id) = &command.correlation_id {
            let location = Location {
                role: Role::Publisher,
                server_id,
                channel_id,
            };
            if !self.table.set_location(id, location) {
                let _ = server.channel_mut(channel_id).map(|c| c.release());
                return Err(AmqpError::AlreadyResolved);
            }
        }

        let link = server.connection.link_mut()?;
        let reply_to = command
            .kind
            .expects_reply()
            .then(|| link.reply_queue().to_string());
        let message = Message::from_command(command, reply_to);
        let published = link.publish(channel_id, message).await;
        match published {
            Ok(()) if command.kind.expects_reply() => Ok(Sent::AwaitingReply),
            Ok(()) => {
                if let Some(channel) = server.channel_mut(channel_id) {
                    channel.release()?;
                }
                Ok(Sent::Confirmed(String::new()))
            }
            Err(e) => {
                // this command gets another server, the rest of the
                // connection is lost with it
                if let Some(channel) = server.channel_mut(channel_id) {
                    let _ = channel.release();
                }
                self.lost(server_id, &e.to_string()).await;
                Err(AmqpError::ConnectionLost)
            }
        }
    }

    async fn on_event(&mut self, event: PoolEvent) {
        if !self.pool.is_current(&event) {
            debug!(server = event.server_id, "event from a stale publisher link");
            return;
        }
        match event.event {
            LinkEvent::Delivery(delivery) => {
                let Some(id) = delivery.correlation_id else {
                    warn!(
                        routing_key = %delivery.routing_key,
                        "reply without correlation id"
                    );
                    return;
                };
                if let Ok(Reply::Resolved(Some(location))) =
                    self.table.reply(&id, delivery.payload)
                {
                    if self.release(location.server_id, location.channel_id, &id) {
                        self.retry_deferred().await;
                    }
                }
            }
            LinkEvent::Lost(reason) => self.lost(event.server_id, &reason).await,
        }
    }

    /// Frees a CALLING channel, provided it still carries `id`.
    fn release(
        &mut self,
        server_id: ServerId,
        channel_id: ChannelId,
        id: &CorrelationId,
    ) -> bool {
        let Some(channel) = self
            .pool
            .server_mut(server_id)
            .and_then(|server| server.channel_mut(channel_id))
        else {
            return false;
        };
        if channel.command() != Some(id) {
            return false;
        }
        match channel.release() {
            Ok(_) => true,
            Err(e) => {
                warn!(server = server_id, channel = channel_id, "release failed: {e}");
                false
            }
        }
    }

    async fn lost(&mut self, server_id: ServerId, reason: &str) {
        for closed in self.pool.lost(server_id, reason).await {
            let location = Location {
                role: Role::Publisher,
                server_id,
                channel_id: closed.channel_id,
            };
            self.table.fail_channel(location, AmqpError::ConnectionLost);
        }
    }

    async fn shutdown(&mut self) {
        for (command, _) in std::mem::take(&mut self.deferred) {
            self.complete(command, Err(AmqpError::Shutdown));
        }
        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            if let Request::Command(command) = request {
                self.complete(command, Err(AmqpError::Shutdown));
            }
        }
        let closed = self.pool.shutdown().await;
        for closed in closed {
            if let Some(id) = closed.command {
                let _ = self.table.resolve(&id, Err(AmqpError::Shutdown));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::command::{Completion, ResumeQueue};
    use crate::correlation::Pending;
    use tokio::sync::oneshot;

    struct Harness {
        broker: MemoryBroker,
        table: Arc<CorrelationTable>,
        requests: mpsc::Sender<Request>,
    }

    fn start(config: Config) -> Harness {
        let broker = MemoryBroker::new();
        let (resumer, _rx) = ResumeQueue::new();
        let table = Arc::new(CorrelationTable::new(4, Arc::new(resumer)));
        let (requests, rx) = mpsc::channel(16);
        let (bus, _) = broadcast::channel(16);
        let publisher =
            Publisher::new(&config, Arc::new(broker.clone()), table.clone(), rx, bus);
        tokio::spawn(publisher.run());
        Harness {
            broker,
            table,
            requests,
        }
    }

    fn call(
        table: &CorrelationTable,
        id: &str,
    ) -> (Command, oneshot::Receiver<CommandResult>) {
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + Duration::from_secs(5);
        table
            .insert(
                id.into(),
                Pending::new(CommandKind::Call, deadline, Completion::Waiter(tx)),
            )
            .unwrap();
        let mut command = Command::new(CommandKind::Call, "svc", "ping", "{}");
        command.correlation_id = Some(id.into());
        command.deadline = deadline;
        (command, rx)
    }

    #[tokio::test]
    async fn publish_is_confirmed() {
        let h = start(Config::single_zone("a", &["amqp://a1"]));
        let (tx, rx) = oneshot::channel();
        let mut command = Command::new(CommandKind::Publish, "presence", "update", "x");
        command.set_completion(Completion::Waiter(tx));
        h.requests.send(Request::Command(command)).await.unwrap();

        assert_eq!(rx.await.unwrap(), Ok(String::new()));
        let published = h.broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].message.reply_to, None);
    }

    #[tokio::test]
    async fn call_carries_reply_queue() {
        let h = start(Config::single_zone("a", &["amqp://a1"]));
        let (command, _rx) = call(&h.table, "c-1");
        h.requests.send(Request::Command(command)).await.unwrap();

        while h.broker.published().is_empty() {
            tokio::task::yield_now().await;
        }
        let published = h.broker.published();
        let message = &published[0].message;
        assert_eq!(message.correlation_id, Some("c-1".into()));
        assert!(message.reply_to.as_deref().unwrap().starts_with("amq.gen-"));
        let location = h.table.lookup_without_remove(&"c-1".into()).unwrap().location;
        assert_eq!(location.map(|l| l.role), Some(Role::Publisher));
    }

    #[tokio::test]
    async fn lost_connection_fails_outstanding_calls() {
        let h = start(Config::single_zone("a", &["amqp://a1"]));
        let mut waiters = Vec::new();
        for n in 0..3 {
            let (command, rx) = call(&h.table, &format!("lost-{n}"));
            h.requests.send(Request::Command(command)).await.unwrap();
            waiters.push(rx);
        }
        while h.broker.published().len() < 3 {
            tokio::task::yield_now().await;
        }

        h.broker.kill("amqp://a1");
        for rx in waiters {
            assert_eq!(rx.await.unwrap(), Err(AmqpError::ConnectionLost));
        }
        assert!(h.table.is_empty());
    }

    #[tokio::test]
    async fn nothing_open_fails_fast() {
        let h = start(Config::single_zone("a", &["amqp://down"]));
        h.broker.set_down("amqp://down", true);
        let (command, rx) = call(&h.table, "nope");
        h.requests.send(Request::Command(command)).await.unwrap();
        assert_eq!(rx.await.unwrap(), Err(AmqpError::NoAvailableServer));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_channels_retry_then_give_up() {
        let mut config = Config::single_zone("a", &["amqp://a1"]);
        config.max_channels = 1;
        config.max_retries = 2;
        let h = start(config);

        let (first, _first_rx) = call(&h.table, "holds-channel");
        h.requests.send(Request::Command(first)).await.unwrap();
        let (second, second_rx) = call(&h.table, "waits");
        h.requests.send(Request::Command(second)).await.unwrap();

        assert_eq!(second_rx.await.unwrap(), Err(AmqpError::NoAvailableServer));
        assert!(h.table.lookup_without_remove(&"holds-channel".into()).is_some());
    }
}
