//! Correlation table: correlation id → pending command, split into a fixed
//! number of shards with one lock each. An entry is always removed under
//! its shard lock before it is completed, which is what makes resolution
//! at-most-once no matter how many tasks race on the same id.

use crate::command::{
    ChannelId, CommandKind, CommandResult, Completion, CorrelationId, Resume,
    ServerId,
};
use crate::dispatch::Role;
use crate::error::AmqpError;
use nebula_utils::rand_string;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// The channel currently carrying a pending command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub role: Role,
    pub server_id: ServerId,
    pub channel_id: ChannelId,
}

#[derive(Debug)]
pub struct Pending {
    pub kind: CommandKind,
    pub deadline: Instant,
    pub location: Option<Location>,
    expected: Option<usize>,
    replies: Vec<String>,
    completion: Completion,
}

impl Pending {
    pub fn new(kind: CommandKind, deadline: Instant, completion: Completion) -> Self {
        Self {
            kind,
            deadline,
            location: None,
            expected: None,
            replies: Vec::new(),
            completion,
        }
    }

    pub fn expecting(mut self, replies: Option<usize>) -> Self {
        self.expected = replies;
        self
    }

    /// Completes an entry that never made it into the table.
    pub fn fail(self, error: AmqpError, resumer: &dyn Resume) {
        self.completion.complete(Err(error), resumer);
    }

    fn finish(self, result: CommandResult, resumer: &dyn Resume) {
        let result = match result {
            // whatever a collect gathered before its deadline is its answer
            Err(AmqpError::TimedOut)
                if self.kind.is_collect() && !self.replies.is_empty() =>
            {
                Ok(collected(self.replies))
            }
            result => result,
        };
        self.completion.complete(result, resumer);
    }
}

fn collected(replies: Vec<String>) -> String {
    let values = replies
        .into_iter()
        .map(|reply| match serde_json::from_str(&reply) {
            Ok(value) => value,
            Err(_) => serde_json::Value::String(reply),
        })
        .collect();
    serde_json::Value::Array(values).to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInfo {
    pub kind: CommandKind,
    pub deadline: Instant,
    pub location: Option<Location>,
    pub replies: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expired {
    pub id: CorrelationId,
    pub location: Option<Location>,
}

/// Outcome of feeding one reply into the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Resolved(Option<Location>),
    Collecting(usize),
}

pub struct CorrelationTable {
    shards: Vec<Mutex<HashMap<CorrelationId, Pending>>>,
    resumer: Arc<dyn Resume>,
}

impl CorrelationTable {
    pub fn new(shards: usize, resumer: Arc<dyn Resume>) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self { shards, resumer }
    }

    pub fn resumer(&self) -> &dyn Resume {
        self.resumer.as_ref()
    }

    fn shard(&self, id: &CorrelationId) -> &Mutex<HashMap<CorrelationId, Pending>> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Gives the pending entry back if the id is already in use.
    pub fn insert(&self, id: CorrelationId, pending: Pending) -> Result<(), Pending> {
        let mut shard = self.shard(&id).lock();
        if shard.contains_key(&id) {
            return Err(pending);
        }
        shard.insert(id, pending);
        Ok(())
    }

    pub fn set_location(&self, id: &CorrelationId, location: Location) -> bool {
        match self.shard(id).lock().get_mut(id) {
            Some(pending) => {
                pending.location = Some(location);
                true
            }
            None => false,
        }
    }

    pub fn resolve(&self, id: &CorrelationId, result: CommandResult) -> Result<(), AmqpError> {
        let pending = self.shard(id).lock().remove(id);
        match pending {
            Some(pending) => {
                pending.finish(result, self.resumer.as_ref());
                Ok(())
            }
            None => {
                debug!(correlation_id = %id, "resolve on an already resolved command");
                Err(AmqpError::AlreadyResolved)
            }
        }
    }

    /// Feeds a broker reply. Collect entries keep gathering until they have
    /// the number of replies they expect, everything else resolves at once.
    pub fn reply(&self, id: &CorrelationId, payload: String) -> Result<Reply, AmqpError> {
        let done = {
            let mut shard = self.shard(id).lock();
            let Some(pending) = shard.get_mut(id) else {
                debug!(correlation_id = %id, "reply for an already resolved command");
                return Err(AmqpError::AlreadyResolved);
            };
            if pending.kind.is_collect() {
                pending.replies.push(payload);
                let count = pending.replies.len();
                if pending.expected.map(|n| count < n).unwrap_or(true) {
                    return Ok(Reply::Collecting(count));
                }
                shard.remove(id).map(|p| (p, None))
            } else {
                shard.remove(id).map(|p| (p, Some(payload)))
            }
        };

        let Some((mut pending, payload)) = done else {
            return Err(AmqpError::AlreadyResolved);
        };
        let location = pending.location;
        let result = match payload {
            Some(payload) => Ok(payload),
            None => Ok(collected(std::mem::take(&mut pending.replies))),
        };
        pending.finish(result, self.resumer.as_ref());
        Ok(Reply::Resolved(location))
    }

    /// Resolves every entry still located on one channel, for when the
    /// channel goes away underneath them.
    pub fn fail_channel(&self, location: Location, error: AmqpError) -> usize {
        let mut failed = 0;
        for shard in self.shards.iter() {
            let entries = {
                let mut shard = shard.lock();
                let ids: Vec<CorrelationId> = shard
                    .iter()
                    .filter(|(_, pending)| pending.location == Some(location))
                    .map(|(id, _)| id.clone())
                    .collect();
                ids.into_iter()
                    .filter_map(|id| shard.remove(&id))
                    .collect::<Vec<_>>()
            };
            for pending in entries {
                failed += 1;
                pending.finish(Err(error.clone()), self.resumer.as_ref());
            }
        }
        failed
    }

    pub fn lookup_without_remove(&self, id: &CorrelationId) -> Option<PendingInfo> {
        self.shard(id).lock().get(id).map(|pending| PendingInfo {
            kind: pending.kind,
            deadline: pending.deadline,
            location: pending.location,
            replies: pending.replies.len(),
        })
    }

    /// Resolves every entry whose deadline has passed. Shards are locked
    /// one at a time and completions run after the lock is dropped.
    pub fn expire(&self, now: Instant) -> Vec<Expired> {
        let mut expired = Vec::new();
        for shard in self.shards.iter() {
            let entries = {
                let mut shard = shard.lock();
                let ids: Vec<CorrelationId> = shard
                    .iter()
                    .filter(|(_, pending)| pending.deadline <= now)
                    .map(|(id, _)| id.clone())
                    .collect();
                ids.into_iter()
                    .filter_map(|id| shard.remove(&id).map(|p| (id, p)))
                    .collect::<Vec<_>>()
            };
            for (id, pending) in entries {
                warn!(correlation_id = %id, kind = %pending.kind, "command timed out");
                expired.push(Expired {
                    id,
                    location: pending.location,
                });
                pending.finish(Err(AmqpError::TimedOut), self.resumer.as_ref());
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-unique correlation ids: a random per-process prefix and a
/// monotonically increasing counter.
pub struct CorrelationIds {
    prefix: String,
    counter: AtomicU64,
}

impl Default for CorrelationIds {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationIds {
    pub fn new() -> Self {
        Self::with_prefix(&format!("{}-{}", std::process::id(), rand_string(8)))
    }

    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            counter: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> CorrelationId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        CorrelationId(format!("{}-{}", self.prefix, n))
    }
}
