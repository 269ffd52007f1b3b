use thiserror::Error;

/// Every outcome of a command flows through the correlation table as
/// `Result<String, AmqpError>`, so the error has to be cheap to clone:
/// one connection failure resolves many commands with the same value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AmqpError {
    #[error("no primary zone")]
    NoPrimaryZone,

    #[error("no available server")]
    NoAvailableServer,

    #[error("connection not open")]
    ConnectionNotOpen,

    #[error("connection lost")]
    ConnectionLost,

    #[error("no free channel")]
    NoFreeChannel,

    #[error("dispatch timeout")]
    DispatchTimeout,

    #[error("timed out")]
    TimedOut,

    #[error("already resolved")]
    AlreadyResolved,

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("broker error: {0}")]
    Broker(String),

    #[error("gateway shut down")]
    Shutdown,

    #[error("invalid config: {0}")]
    Config(String),
}

impl AmqpError {
    /// Errors after which the command may be retried on another server.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AmqpError::NoFreeChannel
                | AmqpError::ConnectionNotOpen
                | AmqpError::ConnectionLost
        )
    }
}

pub type AmqpResult<T> = std::result::Result<T, AmqpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(AmqpError::NoFreeChannel.is_retryable());
        assert!(AmqpError::ConnectionNotOpen.is_retryable());
        assert!(!AmqpError::TimedOut.is_retryable());
        assert!(!AmqpError::NoAvailableServer.is_retryable());
    }

    #[test]
    fn display_transition() {
        let err = AmqpError::InvalidTransition {
            from: "Closed".to_string(),
            to: "Calling".to_string(),
        };
        assert_eq!(err.to_string(), "invalid transition from Closed to Calling");
    }
}
