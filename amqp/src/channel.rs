use crate::binding::Binding;
use crate::command::{ChannelId, CommandKind, CorrelationId};
use crate::error::AmqpError;
use strum_macros::EnumString;
use tokio::time::Instant;

#[derive(strum_macros::Display, EnumString, Debug, PartialEq, Eq, Clone, Copy)]
pub enum ChannelState {
    Closed,
    Free,
    Publishing,
    Binded,
    Calling,
    Consuming,
}

impl ChannelState {
    /// The state a free channel moves to when a command of `kind` is
    /// attached to it.
    pub fn for_command(kind: CommandKind) -> Option<ChannelState> {
        match kind {
            CommandKind::Publish | CommandKind::PublishBroadcast => {
                Some(ChannelState::Publishing)
            }
            CommandKind::Call
            | CommandKind::AsyncCall
            | CommandKind::Collect
            | CommandKind::AsyncCollect => Some(ChannelState::Calling),
            CommandKind::TargetedConsumer => Some(ChannelState::Binded),
            CommandKind::Consume => Some(ChannelState::Consuming),
            CommandKind::Ack | CommandKind::Unsubscribe => None,
        }
    }
}

fn invalid(from: ChannelState, to: ChannelState) -> AmqpError {
    AmqpError::InvalidTransition {
        from: from.to_string(),
        to: to.to_string(),
    }
}

#[derive(Debug)]
pub struct Channel {
    pub id: ChannelId,
    state: ChannelState,
    command: Option<CorrelationId>,
    targeted: Option<Binding>,
    consumer: Option<Binding>,
    last_activity: Instant,
}

impl Channel {
    pub fn new(id: ChannelId) -> Self {
        Self {
            id,
            state: ChannelState::Closed,
            command: None,
            targeted: None,
            consumer: None,
            last_activity: Instant::now(),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn command(&self) -> Option<&CorrelationId> {
        self.command.as_ref()
    }

    pub fn binding(&self) -> Option<&Binding> {
        self.consumer.as_ref().or(self.targeted.as_ref())
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    fn transition(&mut self, to: ChannelState) -> Result<(), AmqpError> {
        use ChannelState::*;
        let allowed = match (self.state, to) {
            (_, Closed) => true,
            (Closed, Free) => true,
            (Free, Publishing | Calling | Binded | Consuming) => true,
            (Publishing | Calling, Free) => true,
            (Binded | Consuming, Free) => true,
            _ => false,
        };
        if !allowed {
            return Err(invalid(self.state, to));
        }
        self.state = to;
        self.last_activity = Instant::now();
        Ok(())
    }

    /// The connection came up.
    pub fn open(&mut self) -> Result<(), AmqpError> {
        match self.state {
            ChannelState::Closed => self.transition(ChannelState::Free),
            state => Err(invalid(state, ChannelState::Free)),
        }
    }

    pub fn attach(
        &mut self,
        kind: CommandKind,
        command: Option<CorrelationId>,
        binding: Option<Binding>,
    ) -> Result<(), AmqpError> {
        let to = ChannelState::for_command(kind).ok_or_else(|| {
            AmqpError::InvalidTransition {
                from: self.state.to_string(),
                to: kind.to_string(),
            }
        })?;
        self.transition(to)?;
        self.command = command;
        match to {
            ChannelState::Binded => self.targeted = binding,
            ChannelState::Consuming => self.consumer = binding,
            _ => {}
        }
        Ok(())
    }

    /// The broker acknowledged the publish or the reply came back. Returns
    /// the command that was attached.
    pub fn release(&mut self) -> Result<Option<CorrelationId>, AmqpError> {
        match self.state {
            ChannelState::Publishing | ChannelState::Calling => {
                self.transition(ChannelState::Free)?;
                Ok(self.command.take())
            }
            state => Err(invalid(state, ChannelState::Free)),
        }
    }

    /// Explicit unbind or unsubscribe.
    pub fn unbind(&mut self) -> Result<Option<Binding>, AmqpError> {
        match self.state {
            ChannelState::Binded | ChannelState::Consuming => {
                self.transition(ChannelState::Free)?;
                self.command = None;
                Ok(self.consumer.take().or(self.targeted.take()))
            }
            state => Err(invalid(state, ChannelState::Free)),
        }
    }

    /// Connection failure or shutdown. Hands back the attached command and
    /// the binding so the owner can fail the one and restore the other.
    pub fn close(&mut self) -> (Option<CorrelationId>, Option<Binding>) {
        let _ = self.transition(ChannelState::Closed);
        let binding = self.consumer.take().or(self.targeted.take());
        (self.command.take(), binding)
    }
}
