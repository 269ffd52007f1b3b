use crate::correlation::CorrelationTable;
use crate::dispatch::{Dispatcher, Request};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Fails whatever outlived its deadline and asks the owning role to free
/// the channel the command was holding.
pub struct Sweeper {
    table: Arc<CorrelationTable>,
    dispatcher: Dispatcher,
    requests: mpsc::Receiver<Request>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(
        table: Arc<CorrelationTable>,
        dispatcher: Dispatcher,
        requests: mpsc::Receiver<Request>,
        interval: Duration,
    ) -> Self {
        Self {
            table,
            dispatcher,
            requests,
            interval,
        }
    }

    pub async fn run(mut self) {
        info!(interval = ?self.interval, "amqp timeout sweeper started");
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(Request::Shutdown) | None => break,
                    Some(_) => {}
                },
                _ = tick.tick() => {
                    self.sweep().await;
                }
            }
        }
        info!("amqp timeout sweeper stopped");
    }

    pub async fn sweep(&self) -> usize {
        let expired = self.table.expire(Instant::now());
        let count = expired.len();
        for entry in expired {
            if let Some(location) = entry.location {
                self.dispatcher.release(location, entry.id).await;
            }
        }
        if count > 0 {
            debug!(count, "expired commands swept");
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandKind, Completion, CorrelationId, ResumeQueue};
    use crate::correlation::{Location, Pending};
    use crate::dispatch::Role;
    use crate::error::AmqpError;
    use tokio::sync::oneshot;

    #[tokio::test(start_paused = true)]
    async fn expired_entries_release_their_channel() {
        let (resumer, _rx) = ResumeQueue::new();
        let table = Arc::new(CorrelationTable::new(4, Arc::new(resumer)));
        let (dispatcher, mut queues) =
            Dispatcher::new(table.clone(), 8, Duration::from_millis(50));
        let sweeper = Sweeper::new(
            table.clone(),
            dispatcher.clone(),
            queues.sweeper,
            Duration::from_millis(100),
        );

        let (tx, rx) = oneshot::channel();
        let id = CorrelationId::from("late");
        let deadline = Instant::now() + Duration::from_millis(250);
        table
            .insert(
                id.clone(),
                Pending::new(CommandKind::Call, deadline, Completion::Waiter(tx)),
            )
            .unwrap();
        let location = Location {
            role: Role::Publisher,
            server_id: 0,
            channel_id: 2,
        };
        table.set_location(&id, location);

        let handle = tokio::spawn(sweeper.run());
        assert_eq!(rx.await.unwrap(), Err(AmqpError::TimedOut));
        assert!(Instant::now() <= deadline + Duration::from_millis(100));

        let Some(Request::Release {
            server_id,
            channel_id,
            id: released,
        }) = queues.publisher.recv().await
        else {
            panic!("expected a release");
        };
        assert_eq!((server_id, channel_id), (0, 2));
        assert_eq!(released, id);

        dispatcher.shutdown().await;
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_sweeping_until_shutdown() {
        let (resumer, _rx) = ResumeQueue::new();
        let table = Arc::new(CorrelationTable::new(2, Arc::new(resumer)));
        let (dispatcher, queues) = Dispatcher::new(table.clone(), 8, Duration::from_millis(50));
        let sweeper = Sweeper::new(
            table.clone(),
            dispatcher.clone(),
            queues.sweeper,
            Duration::from_millis(100),
        );
        let handle = tokio::spawn(sweeper.run());

        let mut waiters = Vec::new();
        for (n, after) in [150u64, 450, 900].into_iter().enumerate() {
            let (tx, rx) = oneshot::channel();
            let deadline = Instant::now() + Duration::from_millis(after);
            table
                .insert(
                    CorrelationId(format!("tick-{n}")),
                    Pending::new(CommandKind::Call, deadline, Completion::Waiter(tx)),
                )
                .unwrap();
            waiters.push(rx);
        }
        for rx in waiters {
            assert_eq!(rx.await.unwrap(), Err(AmqpError::TimedOut));
        }
        assert!(table.is_empty());

        dispatcher.shutdown().await;
        handle.await.unwrap();
    }
}
