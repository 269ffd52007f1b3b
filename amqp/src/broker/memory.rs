//! In-process broker: exchanges, queues and reply queues held in memory,
//! with failure injection for servers going down or dropping connections.

use super::{Broker, BrokerLink, LinkEvent, LinkEvents, Message};
use crate::binding::Binding;
use crate::command::{ChannelId, Delivery, ServerId};
use crate::error::{AmqpError, AmqpResult};
use crate::topology::ServerAddr;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub url: String,
    pub channel: ChannelId,
    pub message: Message,
}

struct Conn {
    url: String,
    server_id: ServerId,
    tx: UnboundedSender<LinkEvent>,
    next_tag: u64,
    channels: HashSet<ChannelId>,
}

#[derive(Default)]
struct Queue {
    consumers: Vec<(u64, ChannelId)>,
    next: usize,
    backlog: VecDeque<Message>,
}

struct QueueBinding {
    pattern: Binding,
    queue: String,
}

#[derive(Default)]
struct State {
    down: HashSet<String>,
    publish_delay: Option<Duration>,
    next_conn: u64,
    conns: HashMap<u64, Conn>,
    queues: HashMap<String, Queue>,
    bindings: Vec<QueueBinding>,
    published: Vec<Published>,
    acks: Vec<(String, ChannelId, u64)>,
}

impl State {
    fn alive(&self, conn_id: u64) -> AmqpResult<()> {
        if self.conns.contains_key(&conn_id) {
            Ok(())
        } else {
            Err(AmqpError::ConnectionLost)
        }
    }

    fn route(&mut self, message: &Message) {
        let mut queues: Vec<String> = if message.exchange.is_empty() {
            vec![message.routing_key.clone()]
        } else {
            self.bindings
                .iter()
                .filter(|b| {
                    b.pattern.exchange == message.exchange
                        && b.pattern.matches(&message.routing_key)
                })
                .map(|b| b.queue.clone())
                .collect()
        };
        queues.sort();
        queues.dedup();
        for name in queues {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.backlog.push_back(message.clone());
                self.flush(&name);
            }
        }
    }

    fn flush(&mut self, name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(name) else {
                return;
            };
            if queue.consumers.is_empty() {
                return;
            }
            let Some(message) = queue.backlog.pop_front() else {
                return;
            };
            let i = queue.next % queue.consumers.len();
            queue.next = i + 1;
            let (conn_id, channel_id) = queue.consumers[i];

            let delivered = match self.conns.get_mut(&conn_id) {
                Some(conn) => {
                    conn.next_tag += 1;
                    let delivery = Delivery {
                        server_id: conn.server_id,
                        channel_id,
                        delivery_tag: conn.next_tag,
                        exchange: message.exchange.clone(),
                        routing_key: message.routing_key.clone(),
                        correlation_id: message.correlation_id.clone(),
                        reply_to: message.reply_to.clone(),
                        payload: message.payload.clone(),
                        event_key: None,
                        event_subkey: None,
                        redelivered: false,
                    };
                    conn.tx.send(LinkEvent::Delivery(delivery)).is_ok()
                }
                None => false,
            };
            if !delivered {
                if let Some(queue) = self.queues.get_mut(name) {
                    queue.consumers.retain(|(id, _)| *id != conn_id);
                    queue.backlog.push_front(message);
                }
            }
        }
    }

    fn drop_conn(&mut self, conn_id: u64) {
        self.conns.remove(&conn_id);
        self.queues.remove(&reply_queue(conn_id));
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|(id, _)| *id != conn_id);
        }
    }
}

fn reply_queue(conn_id: u64) -> String {
    format!("amq.gen-{conn_id}")
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse (or accept again) new connections to `url`.
    pub fn set_down(&self, url: &str, down: bool) {
        let mut state = self.inner.lock();
        if down {
            state.down.insert(url.to_string());
        } else {
            state.down.remove(url);
        }
    }

    /// Drops every live connection to `url`, as an I/O error would.
    pub fn kill(&self, url: &str) {
        let mut state = self.inner.lock();
        let ids: Vec<u64> = state
            .conns
            .iter()
            .filter(|(_, conn)| conn.url == url)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(conn) = state.conns.get(&id) {
                let _ = conn.tx.send(LinkEvent::Lost(format!("{url} killed")));
            }
            state.drop_conn(id);
        }
    }

    pub fn set_publish_delay(&self, delay: Option<Duration>) {
        self.inner.lock().publish_delay = delay;
    }

    pub fn published(&self) -> Vec<Published> {
        self.inner.lock().published.clone()
    }

    pub fn acks(&self) -> Vec<(String, ChannelId, u64)> {
        self.inner.lock().acks.clone()
    }

    pub fn connections(&self, url: &str) -> usize {
        self.inner
            .lock()
            .conns
            .values()
            .filter(|conn| conn.url == url)
            .count()
    }

    pub fn consumers(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(
        &self,
        server: &ServerAddr,
    ) -> AmqpResult<(Box<dyn BrokerLink>, LinkEvents)> {
        let mut state = self.inner.lock();
        if state.down.contains(&server.url) {
            return Err(AmqpError::Broker(format!(
                "connection refused: {}",
                server.url
            )));
        }
        state.next_conn += 1;
        let conn_id = state.next_conn;
        let (tx, rx) = mpsc::unbounded_channel();
        state.conns.insert(
            conn_id,
            Conn {
                url: server.url.clone(),
                server_id: server.id,
                tx,
                next_tag: 0,
                channels: HashSet::new(),
            },
        );
        state.queues.insert(
            reply_queue(conn_id),
            Queue {
                consumers: vec![(conn_id, 0)],
                ..Default::default()
            },
        );
        let link = MemoryLink {
            inner: self.inner.clone(),
            conn_id,
            url: server.url.clone(),
            reply_queue: reply_queue(conn_id),
        };
        Ok((Box::new(link), rx))
    }
}

pub struct MemoryLink {
    inner: Arc<Mutex<State>>,
    conn_id: u64,
    url: String,
    reply_queue: String,
}

#[async_trait]
impl BrokerLink for MemoryLink {
    fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    async fn open_channel(&mut self, channel: ChannelId) -> AmqpResult<()> {
        let mut state = self.inner.lock();
        state.alive(self.conn_id)?;
        if let Some(conn) = state.conns.get_mut(&self.conn_id) {
            conn.channels.insert(channel);
        }
        Ok(())
    }

    async fn publish(&mut self, channel: ChannelId, message: Message) -> AmqpResult<()> {
        let delay = self.inner.lock().publish_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.inner.lock();
        state.alive(self.conn_id)?;
        let open = state
            .conns
            .get(&self.conn_id)
            .map(|conn| conn.channels.contains(&channel))
            .unwrap_or(false);
        if !open {
            return Err(AmqpError::Broker(format!("channel {channel} not open")));
        }
        state.published.push(Published {
            url: self.url.clone(),
            channel,
            message: message.clone(),
        });
        state.route(&message);
        Ok(())
    }

    async fn bind(&mut self, channel: ChannelId, binding: &Binding) -> AmqpResult<()> {
        let mut state = self.inner.lock();
        state.alive(self.conn_id)?;
        if binding.passive && !state.queues.contains_key(&binding.queue) {
            return Err(AmqpError::Broker(format!(
                "queue {} not found",
                binding.queue
            )));
        }
        let queue = state.queues.entry(binding.queue.clone()).or_default();
        if !queue.consumers.contains(&(self.conn_id, channel)) {
            queue.consumers.push((self.conn_id, channel));
        }
        let exists = state.bindings.iter().any(|b| {
            b.queue == binding.queue
                && b.pattern.exchange == binding.exchange
                && b.pattern.routing_key == binding.routing_key
        });
        if !exists && !binding.exchange.is_empty() {
            state.bindings.push(QueueBinding {
                pattern: binding.clone(),
                queue: binding.queue.clone(),
            });
        }
        state.flush(&binding.queue);
        Ok(())
    }

    async fn unbind(&mut self, channel: ChannelId, binding: &Binding) -> AmqpResult<()> {
        let mut state = self.inner.lock();
        state.alive(self.conn_id)?;
        let conn_id = self.conn_id;
        let remaining = match state.queues.get_mut(&binding.queue) {
            Some(queue) => {
                queue.consumers.retain(|c| *c != (conn_id, channel));
                queue.consumers.len()
            }
            None => 0,
        };
        if remaining == 0 {
            state.bindings.retain(|b| {
                !(b.queue == binding.queue
                    && b.pattern.exchange == binding.exchange
                    && b.pattern.routing_key == binding.routing_key)
            });
            if binding.auto_delete || binding.exclusive {
                state.queues.remove(&binding.queue);
            }
        }
        Ok(())
    }

    async fn ack(&mut self, channel: ChannelId, delivery_tag: u64) -> AmqpResult<()> {
        let mut state = self.inner.lock();
        state.alive(self.conn_id)?;
        let url = self.url.clone();
        state.acks.push((url, channel, delivery_tag));
        Ok(())
    }

    async fn close(&mut self) {
        self.inner.lock().drop_conn(self.conn_id);
    }
}
