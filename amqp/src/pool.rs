use crate::broker::{Broker, LinkEvent};
use crate::command::ServerId;
use crate::config::Config;
use crate::connection::ConnectionState;
use crate::dispatch::Role;
use crate::error::AmqpError;
use crate::server::{ClosedChannel, Server};
use crate::topology::Topology;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{info, warn};

/// Connection state change, published for whoever watches broker health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub role: Role,
    pub server_id: ServerId,
    pub zone: String,
    pub url: String,
    pub state: ConnectionState,
}

#[derive(Debug)]
pub struct PoolEvent {
    pub server_id: ServerId,
    pub generation: u64,
    pub event: LinkEvent,
}

/// The servers one role talks to. Every connection and channel in here is
/// owned by that role's task alone.
pub struct Pool {
    role: Role,
    topology: Topology,
    servers: Vec<Server>,
    broker: Arc<dyn Broker>,
    events: mpsc::UnboundedSender<PoolEvent>,
    bus: broadcast::Sender<ConnectionEvent>,
}

impl Pool {
    pub fn new(
        role: Role,
        config: &Config,
        broker: Arc<dyn Broker>,
        bus: broadcast::Sender<ConnectionEvent>,
    ) -> (Pool, mpsc::UnboundedReceiver<PoolEvent>) {
        let topology = Topology::from_config(config);
        let servers = topology
            .servers()
            .iter()
            .map(|addr| {
                Server::new(
                    addr.clone(),
                    config.max_channels,
                    config.reconnect_min(),
                    config.reconnect_max(),
                )
            })
            .collect();
        let (events, rx) = mpsc::unbounded_channel();
        let pool = Pool {
            role,
            topology,
            servers,
            broker,
            events,
            bus,
        };
        (pool, rx)
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn server(&self, id: ServerId) -> Option<&Server> {
        self.servers.get(id)
    }

    pub fn server_mut(&mut self, id: ServerId) -> Option<&mut Server> {
        self.servers.get_mut(id)
    }

    fn is_open(&self, id: ServerId) -> bool {
        self.servers
            .get(id)
            .map(|s| s.connection.is_open())
            .unwrap_or(false)
    }

    /// Open servers in failover order.
    pub fn candidates(&self) -> Result<Vec<ServerId>, AmqpError> {
        self.topology.candidates(|id| self.is_open(id))
    }

    pub fn per_zone(&self) -> Vec<ServerId> {
        self.topology.per_zone(|id| self.is_open(id))
    }

    pub fn zone_of(&self, id: ServerId) -> Option<&str> {
        self.topology.server(id).map(|addr| addr.zone.as_str())
    }

    /// Whether an event comes from the link the server currently holds.
    pub fn is_current(&self, event: &PoolEvent) -> bool {
        self.servers
            .get(event.server_id)
            .map(|s| s.connection.is_open() && s.connection.generation() == event.generation)
            .unwrap_or(false)
    }

    fn publish_state(&self, server: &Server) {
        let _ = self.bus.send(ConnectionEvent {
            role: self.role,
            server_id: server.id(),
            zone: server.addr.zone.clone(),
            url: server.addr.url.clone(),
            state: server.connection.state(),
        });
    }

    pub async fn connect(&mut self, id: ServerId) -> Result<(), AmqpError> {
        let Some(server) = self.servers.get_mut(id) else {
            return Err(AmqpError::NoAvailableServer);
        };
        let result = match self.broker.connect(&server.addr).await {
            Ok((link, mut rx)) => match server.opened(link).await {
                Ok(generation) => {
                    let events = self.events.clone();
                    tokio::spawn(async move {
                        while let Some(event) = rx.recv().await {
                            let lost = matches!(event, LinkEvent::Lost(_));
                            let event = PoolEvent {
                                server_id: id,
                                generation,
                                event,
                            };
                            if events.send(event).is_err() || lost {
                                return;
                            }
                        }
                        let _ = events.send(PoolEvent {
                            server_id: id,
                            generation,
                            event: LinkEvent::Lost("delivery stream closed".to_string()),
                        });
                    });
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!(role = %self.role, url = %server.addr.url, "amqp connection open");
                let server = &self.servers[id];
                self.publish_state(server);
                Ok(())
            }
            Err(e) => {
                let (_, link) = server.fail(Instant::now());
                if let Some(mut link) = link {
                    link.close().await;
                }
                warn!(
                    role = %self.role,
                    url = %server.addr.url,
                    attempts = server.connection.attempts(),
                    "amqp connection failed: {e}"
                );
                let server = &self.servers[id];
                self.publish_state(server);
                Err(e)
            }
        }
    }

    pub async fn connect_all(&mut self) {
        for id in 0..self.servers.len() {
            let _ = self.connect(id).await;
        }
    }

    /// Retries every failed connection whose backoff has run out and
    /// returns the ones that came back.
    pub async fn reconnect_due(&mut self) -> Vec<ServerId> {
        let now = Instant::now();
        let due: Vec<ServerId> = self
            .servers
            .iter()
            .filter(|s| s.connection.reconnect_due(now))
            .map(|s| s.id())
            .collect();
        let mut reconnected = Vec::new();
        for id in due {
            if self.connect(id).await.is_ok() {
                reconnected.push(id);
            }
        }
        reconnected
    }

    /// OPEN → FAILURE after an I/O error. Channels that carried a command
    /// or a binding are returned so the role can resolve or restore them.
    pub async fn lost(&mut self, id: ServerId, reason: &str) -> Vec<ClosedChannel> {
        let Some(server) = self.servers.get_mut(id) else {
            return Vec::new();
        };
        if server.connection.state() != ConnectionState::Open {
            return Vec::new();
        }
        let (closed, link) = server.fail(Instant::now());
        if let Some(mut link) = link {
            link.close().await;
        }
        warn!(role = %self.role, url = %server.addr.url, "amqp connection lost: {reason}");
        let server = &self.servers[id];
        self.publish_state(server);
        closed
    }

    pub async fn shutdown(&mut self) -> Vec<ClosedChannel> {
        let mut closed = Vec::new();
        for server in self.servers.iter_mut() {
            let (channels, link) = server.shutdown();
            if let Some(mut link) = link {
                link.close().await;
            }
            closed.extend(channels);
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::config::ZoneConfig;
    use std::time::Duration;

    fn config() -> Config {
        let mut config = Config::single_zone("a", &["amqp://a1"]);
        config.zones.push(ZoneConfig {
            name: "b".to_string(),
            primary: false,
            servers: vec!["amqp://b1".to_string()],
        });
        config.max_channels = 2;
        config.reconnect_min_ms = 10;
        config
    }

    #[tokio::test]
    async fn failover_to_next_zone() {
        let broker = MemoryBroker::new();
        broker.set_down("amqp://a1", true);
        let (bus, mut states) = broadcast::channel(16);
        let (mut pool, _events) =
            Pool::new(Role::Publisher, &config(), Arc::new(broker.clone()), bus);

        pool.connect_all().await;
        assert_eq!(pool.candidates(), Ok(vec![1]));
        assert_eq!(pool.per_zone(), vec![1]);
        assert_eq!(states.recv().await.unwrap().state, ConnectionState::Failure);
        assert_eq!(states.recv().await.unwrap().state, ConnectionState::Open);

        broker.set_down("amqp://b1", true);
        broker.kill("amqp://b1");
        let closed = pool.lost(1, "killed").await;
        assert!(closed.is_empty());
        assert_eq!(pool.candidates(), Err(AmqpError::NoAvailableServer));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_after_backoff() {
        let broker = MemoryBroker::new();
        broker.set_down("amqp://a1", true);
        let (bus, _) = broadcast::channel(16);
        let (mut pool, _events) =
            Pool::new(Role::Consumer, &config(), Arc::new(broker.clone()), bus);
        pool.connect_all().await;

        broker.set_down("amqp://a1", false);
        assert!(pool.reconnect_due().await.is_empty());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.reconnect_due().await, vec![0]);
        assert_eq!(pool.candidates(), Ok(vec![0, 1]));
        assert_eq!(pool.server(0).unwrap().free_channels(), 2);
    }

    #[tokio::test]
    async fn lost_stream_is_reported() {
        let broker = MemoryBroker::new();
        let (bus, _) = broadcast::channel(16);
        let (mut pool, mut events) =
            Pool::new(Role::Publisher, &config(), Arc::new(broker.clone()), bus);
        pool.connect_all().await;

        broker.kill("amqp://a1");
        let event = events.recv().await.unwrap();
        assert_eq!(event.server_id, 0);
        assert!(pool.is_current(&event));
        assert!(matches!(event.event, LinkEvent::Lost(_)));
        pool.lost(0, "killed").await;
        assert!(!pool.is_current(&event));
    }
}
