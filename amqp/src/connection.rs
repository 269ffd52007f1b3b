use crate::broker::BrokerLink;
use crate::command::ChannelId;
use crate::error::AmqpError;
use nebula_utils::backoff;
use std::time::Duration;
use strum_macros::EnumString;
use tokio::time::Instant;

#[derive(strum_macros::Display, EnumString, Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConnectionState {
    Closed,
    Open,
    Failure,
}

/// One transport to one broker server.
pub struct Connection {
    state: ConnectionState,
    link: Option<Box<dyn BrokerLink>>,
    generation: u64,
    next_channel_id: ChannelId,
    active_channels: usize,
    attempts: u32,
    retry_at: Option<Instant>,
    reconnect_min: Duration,
    reconnect_max: Duration,
}

impl Connection {
    pub fn new(reconnect_min: Duration, reconnect_max: Duration) -> Self {
        Self {
            state: ConnectionState::Closed,
            link: None,
            generation: 0,
            next_channel_id: 0,
            active_channels: 0,
            attempts: 0,
            retry_at: None,
            reconnect_min,
            reconnect_max,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Bumped every time the connection opens, so events from a previous
    /// link can be told apart.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn active_channels(&self) -> usize {
        self.active_channels
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn opened(&mut self, link: Box<dyn BrokerLink>) -> Result<u64, AmqpError> {
        if self.state == ConnectionState::Open {
            return Err(AmqpError::InvalidTransition {
                from: self.state.to_string(),
                to: ConnectionState::Open.to_string(),
            });
        }
        self.state = ConnectionState::Open;
        self.link = Some(link);
        self.generation += 1;
        self.next_channel_id = 0;
        self.active_channels = 0;
        self.attempts = 0;
        self.retry_at = None;
        Ok(self.generation)
    }

    /// Arms the reconnect timer and hands back the link, if there was one,
    /// so the caller can close it.
    pub fn failed(&mut self, now: Instant) -> (Duration, Option<Box<dyn BrokerLink>>) {
        let delay = backoff(self.reconnect_min, self.reconnect_max, self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        self.retry_at = Some(now + delay);
        self.state = ConnectionState::Failure;
        self.active_channels = 0;
        (delay, self.link.take())
    }

    pub fn closed(&mut self) -> Option<Box<dyn BrokerLink>> {
        self.state = ConnectionState::Closed;
        self.retry_at = None;
        self.active_channels = 0;
        self.link.take()
    }

    pub fn reconnect_due(&self, now: Instant) -> bool {
        self.state == ConnectionState::Failure
            && self.retry_at.map(|at| at <= now).unwrap_or(true)
    }

    pub fn allocate_channel_id(&mut self) -> ChannelId {
        self.next_channel_id = self.next_channel_id.wrapping_add(1).max(1);
        self.active_channels += 1;
        self.next_channel_id
    }

    /// Only valid while the connection is open.
    pub fn link_mut(&mut self) -> Result<&mut Box<dyn BrokerLink>, AmqpError> {
        if self.state != ConnectionState::Open {
            return Err(AmqpError::ConnectionNotOpen);
        }
        self.link.as_mut().ok_or(AmqpError::ConnectionNotOpen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::Broker;
    use crate::topology::ServerAddr;

    async fn link() -> Box<dyn BrokerLink> {
        let addr = ServerAddr {
            id: 0,
            zone: "local".to_string(),
            url: "amqp://a".to_string(),
        };
        MemoryBroker::new().connect(&addr).await.unwrap().0
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_until_open() {
        let mut conn =
            Connection::new(Duration::from_millis(100), Duration::from_millis(350));
        assert!(conn.link_mut().is_err());
        let now = Instant::now();

        assert_eq!(conn.failed(now).0, Duration::from_millis(100));
        assert_eq!(conn.failed(now).0, Duration::from_millis(200));
        assert_eq!(conn.failed(now).0, Duration::from_millis(350));
        assert_eq!(conn.state(), ConnectionState::Failure);
        assert!(!conn.reconnect_due(now));
        assert!(conn.reconnect_due(now + Duration::from_millis(350)));
        assert_eq!(conn.link_mut().err(), Some(AmqpError::ConnectionNotOpen));

        assert_eq!(conn.opened(link().await).unwrap(), 1);
        assert!(conn.is_open());
        assert_eq!(conn.attempts(), 0);
        assert!(conn.link_mut().is_ok());
        assert!(conn.opened(link().await).is_err());
    }

    #[tokio::test]
    async fn channel_ids_reset_on_open() {
        let mut conn = Connection::new(Duration::from_millis(1), Duration::from_secs(1));
        conn.opened(link().await).unwrap();
        assert_eq!(conn.allocate_channel_id(), 1);
        assert_eq!(conn.allocate_channel_id(), 2);
        assert_eq!(conn.active_channels(), 2);

        assert!(conn.failed(Instant::now()).1.is_some());
        assert_eq!(conn.active_channels(), 0);
        assert_eq!(conn.opened(link().await).unwrap(), 2);
        assert_eq!(conn.allocate_channel_id(), 1);
    }
}
