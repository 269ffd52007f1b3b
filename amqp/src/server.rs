use crate::binding::Binding;
use crate::broker::BrokerLink;
use crate::channel::{Channel, ChannelState};
use crate::command::{ChannelId, CommandKind, CorrelationId, ServerId};
use crate::connection::Connection;
use crate::error::AmqpError;
use crate::topology::ServerAddr;
use std::time::Duration;
use tokio::time::Instant;

/// A channel torn down by a connection failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedChannel {
    pub channel_id: ChannelId,
    pub command: Option<CorrelationId>,
    pub binding: Option<Binding>,
}

pub struct Server {
    pub addr: ServerAddr,
    pub connection: Connection,
    channels: Vec<Channel>,
    next: usize,
}

impl Server {
    pub fn new(
        addr: ServerAddr,
        max_channels: u16,
        reconnect_min: Duration,
        reconnect_max: Duration,
    ) -> Self {
        Self {
            addr,
            connection: Connection::new(reconnect_min, reconnect_max),
            channels: (1..=max_channels).map(Channel::new).collect(),
            next: 0,
        }
    }

    pub fn id(&self) -> ServerId {
        self.addr.id
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get((id as usize).checked_sub(1)?)
    }

    pub fn channel_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.channels.get_mut((id as usize).checked_sub(1)?)
    }

    /// Opens the broker side of every channel and moves them to FREE.
    pub async fn opened(&mut self, link: Box<dyn BrokerLink>) -> Result<u64, AmqpError> {
        let generation = self.connection.opened(link)?;
        for i in 0..self.channels.len() {
            let id = self.connection.allocate_channel_id();
            self.connection.link_mut()?.open_channel(id).await?;
            self.channels[i].open()?;
        }
        self.next = 0;
        Ok(generation)
    }

    /// Claims the next FREE channel after the round-robin index.
    pub fn acquire(
        &mut self,
        kind: CommandKind,
        command: Option<CorrelationId>,
        binding: Option<Binding>,
    ) -> Result<ChannelId, AmqpError> {
        if !self.connection.is_open() {
            return Err(AmqpError::ConnectionNotOpen);
        }
        let len = self.channels.len();
        for i in 0..len {
            let idx = (self.next + i) % len;
            if self.channels[idx].state() == ChannelState::Free {
                self.channels[idx].attach(kind, command, binding)?;
                self.next = idx + 1;
                return Ok(self.channels[idx].id);
            }
        }
        Err(AmqpError::NoFreeChannel)
    }

    /// Moves the connection to FAILURE and closes every channel. The link,
    /// if any, is returned for the caller to close.
    pub fn fail(&mut self, now: Instant) -> (Vec<ClosedChannel>, Option<Box<dyn BrokerLink>>) {
        let (_, link) = self.connection.failed(now);
        (self.close_channels(), link)
    }

    pub fn shutdown(&mut self) -> (Vec<ClosedChannel>, Option<Box<dyn BrokerLink>>) {
        let link = self.connection.closed();
        (self.close_channels(), link)
    }

    fn close_channels(&mut self) -> Vec<ClosedChannel> {
        self.channels
            .iter_mut()
            .map(|channel| {
                let (command, binding) = channel.close();
                ClosedChannel {
                    channel_id: channel.id,
                    command,
                    binding,
                }
            })
            .filter(|closed| closed.command.is_some() || closed.binding.is_some())
            .collect()
    }

    pub fn free_channels(&self) -> usize {
        self.channels
            .iter()
            .filter(|c| c.state() == ChannelState::Free)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::ExchangeType;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::Broker;

    async fn open_server(max_channels: u16) -> Server {
        let addr = ServerAddr {
            id: 0,
            zone: "local".to_string(),
            url: "amqp://a".to_string(),
        };
        let (link, _events) = MemoryBroker::new().connect(&addr).await.unwrap();
        let mut server = Server::new(
            addr,
            max_channels,
            Duration::from_millis(10),
            Duration::from_secs(1),
        );
        server.opened(link).await.unwrap();
        server
    }

    #[tokio::test]
    async fn closed_server_has_no_channels() {
        let addr = ServerAddr {
            id: 0,
            zone: "local".to_string(),
            url: "amqp://a".to_string(),
        };
        let mut server =
            Server::new(addr, 2, Duration::from_millis(10), Duration::from_secs(1));
        assert_eq!(
            server.acquire(CommandKind::Publish, None, None),
            Err(AmqpError::ConnectionNotOpen)
        );
    }

    #[tokio::test]
    async fn round_robin_until_exhausted() {
        let mut server = open_server(3).await;
        assert_eq!(server.free_channels(), 3);
        assert_eq!(server.acquire(CommandKind::Call, Some("a".into()), None), Ok(1));
        assert_eq!(server.acquire(CommandKind::Call, Some("b".into()), None), Ok(2));

        server.channel_mut(1).unwrap().release().unwrap();
        assert_eq!(server.acquire(CommandKind::Publish, None, None), Ok(3));
        assert_eq!(server.acquire(CommandKind::Publish, None, None), Ok(1));
        assert_eq!(
            server.acquire(CommandKind::Publish, None, None),
            Err(AmqpError::NoFreeChannel)
        );
    }

    #[tokio::test]
    async fn failure_closes_everything() {
        let mut server = open_server(4).await;
        let binding = Binding::new("presence", ExchangeType::Topic, "q", "#");
        server.acquire(CommandKind::Call, Some("x".into()), None).unwrap();
        server
            .acquire(CommandKind::Consume, None, Some(binding.clone()))
            .unwrap();

        let (closed, link) = server.fail(Instant::now());
        assert!(link.is_some());
        assert_eq!(closed.len(), 2);
        assert_eq!(closed[0].command, Some("x".into()));
        assert_eq!(closed[1].binding, Some(binding));
        assert!(server
            .channels()
            .iter()
            .all(|c| c.state() == ChannelState::Closed));
        assert_eq!(
            server.acquire(CommandKind::Publish, None, None),
            Err(AmqpError::ConnectionNotOpen)
        );
    }
}
