use crate::command::{ChannelId, Command, CommandKind, CorrelationId, ServerId};
use crate::correlation::{CorrelationTable, Location};
use crate::error::AmqpError;
use std::sync::Arc;
use std::time::Duration;
use strum_macros::EnumString;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tracing::warn;

#[derive(strum_macros::Display, EnumString, Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[strum(serialize_all = "snake_case")]
pub enum Role {
    Publisher,
    Consumer,
    Sweeper,
}

impl Role {
    pub fn for_command(kind: CommandKind) -> Role {
        match kind {
            CommandKind::Publish
            | CommandKind::PublishBroadcast
            | CommandKind::Call
            | CommandKind::AsyncCall
            | CommandKind::Collect
            | CommandKind::AsyncCollect => Role::Publisher,
            CommandKind::Consume
            | CommandKind::TargetedConsumer
            | CommandKind::Ack
            | CommandKind::Unsubscribe => Role::Consumer,
        }
    }
}

#[derive(Debug)]
pub enum Request {
    Command(Command),
    /// Free the channel still held by a command that was resolved
    /// elsewhere.
    Release {
        server_id: ServerId,
        channel_id: ChannelId,
        id: CorrelationId,
    },
    Shutdown,
}

/// Write ends of the queues feeding the dedicated roles.
#[derive(Clone)]
pub struct Dispatcher {
    publisher: mpsc::Sender<Request>,
    consumer: mpsc::Sender<Request>,
    sweeper: mpsc::Sender<Request>,
    table: Arc<CorrelationTable>,
    timeout: Duration,
}

pub struct Queues {
    pub publisher: mpsc::Receiver<Request>,
    pub consumer: mpsc::Receiver<Request>,
    pub sweeper: mpsc::Receiver<Request>,
}

impl Dispatcher {
    pub fn new(
        table: Arc<CorrelationTable>,
        capacity: usize,
        timeout: Duration,
    ) -> (Dispatcher, Queues) {
        let (publisher, publisher_rx) = mpsc::channel(capacity);
        let (consumer, consumer_rx) = mpsc::channel(capacity);
        let (sweeper, sweeper_rx) = mpsc::channel(1);
        let dispatcher = Dispatcher {
            publisher,
            consumer,
            sweeper,
            table,
            timeout,
        };
        let queues = Queues {
            publisher: publisher_rx,
            consumer: consumer_rx,
            sweeper: sweeper_rx,
        };
        (dispatcher, queues)
    }

    fn sender(&self, role: Role) -> &mpsc::Sender<Request> {
        match role {
            Role::Publisher => &self.publisher,
            Role::Consumer => &self.consumer,
            Role::Sweeper => &self.sweeper,
        }
    }

    /// Hands the command to the role responsible for its kind. If the
    /// queue stays full past the write timeout, the command is failed here
    /// without ever reaching the broker.
    pub async fn dispatch(&self, command: Command) -> Result<(), AmqpError> {
        let role = Role::for_command(command.kind);
        match self
            .sender(role)
            .send_timeout(Request::Command(command), self.timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(request)) => {
                warn!(%role, "dispatch queue full, failing command");
                self.fail(request, AmqpError::DispatchTimeout);
                Err(AmqpError::DispatchTimeout)
            }
            Err(SendTimeoutError::Closed(request)) => {
                self.fail(request, AmqpError::Shutdown);
                Err(AmqpError::Shutdown)
            }
        }
    }

    fn fail(&self, request: Request, error: AmqpError) {
        let Request::Command(command) = request else {
            return;
        };
        if let Some(id) = &command.correlation_id {
            let _ = self.table.resolve(id, Err(error.clone()));
        }
        command.finish(Err(error), self.table.resumer());
    }

    pub async fn release(&self, location: Location, id: CorrelationId) {
        let request = Request::Release {
            server_id: location.server_id,
            channel_id: location.channel_id,
            id,
        };
        if self
            .sender(location.role)
            .send_timeout(request, self.timeout)
            .await
            .is_err()
        {
            warn!(role = %location.role, "couldn't hand back an expired channel");
        }
    }

    pub async fn shutdown(&self) {
        for role in [Role::Publisher, Role::Consumer, Role::Sweeper] {
            let _ = self.sender(role).send(Request::Shutdown).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandResult, Completion, ResumeQueue};
    use crate::correlation::Pending;
    use tokio::sync::oneshot;
    use tokio::time::Instant;

    fn setup(capacity: usize) -> (Dispatcher, Queues, Arc<CorrelationTable>) {
        let (resumer, _rx) = ResumeQueue::new();
        let table = Arc::new(CorrelationTable::new(4, Arc::new(resumer)));
        let (dispatcher, queues) =
            Dispatcher::new(table.clone(), capacity, Duration::from_millis(50));
        (dispatcher, queues, table)
    }

    #[test]
    fn roles_by_kind() {
        assert_eq!(Role::for_command(CommandKind::AsyncCollect), Role::Publisher);
        assert_eq!(Role::for_command(CommandKind::TargetedConsumer), Role::Consumer);
        assert_eq!(Role::for_command(CommandKind::Ack), Role::Consumer);
        assert_eq!(Role::Publisher.to_string(), "publisher");
    }

    #[tokio::test]
    async fn routes_to_role_queue() {
        let (dispatcher, mut queues, _table) = setup(4);
        dispatcher
            .dispatch(Command::new(CommandKind::Publish, "x", "y", "z"))
            .await
            .unwrap();
        dispatcher.dispatch(Command::ack(0, 1, 7)).await.unwrap();

        let Some(Request::Command(command)) = queues.publisher.recv().await else {
            panic!("expected a command");
        };
        assert_eq!(command.kind, CommandKind::Publish);
        let Some(Request::Command(command)) = queues.consumer.recv().await else {
            panic!("expected a command");
        };
        assert_eq!(command.delivery_tag, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_fails_locally() {
        let (dispatcher, _queues, table) = setup(1);
        dispatcher
            .dispatch(Command::new(CommandKind::Publish, "x", "y", "1"))
            .await
            .unwrap();

        let id = CorrelationId::from("stuck");
        let (tx, rx) = oneshot::channel::<CommandResult>();
        table
            .insert(
                id.clone(),
                Pending::new(CommandKind::Call, Instant::now(), Completion::Waiter(tx)),
            )
            .unwrap();
        let mut call = Command::new(CommandKind::Call, "x", "y", "2");
        call.correlation_id = Some(id.clone());

        assert_eq!(dispatcher.dispatch(call).await, Err(AmqpError::DispatchTimeout));
        assert_eq!(rx.await.unwrap(), Err(AmqpError::DispatchTimeout));
        assert!(table.lookup_without_remove(&id).is_none());

        let (tx, rx) = oneshot::channel();
        let mut publish = Command::new(CommandKind::Publish, "x", "y", "3");
        publish.set_completion(Completion::Waiter(tx));
        assert_eq!(
            dispatcher.dispatch(publish).await,
            Err(AmqpError::DispatchTimeout)
        );
        assert_eq!(rx.await.unwrap(), Err(AmqpError::DispatchTimeout));
    }

    #[tokio::test]
    async fn closed_queue_is_shutdown() {
        let (dispatcher, queues, _table) = setup(1);
        drop(queues);
        assert_eq!(
            dispatcher
                .dispatch(Command::new(CommandKind::Consume, "x", "y", ""))
                .await,
            Err(AmqpError::Shutdown)
        );
    }
}
