use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors raised by the agent.
///
/// Message-level kinds (`MalformedMessage`, `UnregisteredHandler`, `Transport`)
/// are logged and dropped by the hub shim. The rest stop the agent.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("cannot access config file {}: {source}", .path.display())]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {}: {reason}", .path.display())]
    ConfigParse { path: PathBuf, reason: String },

    #[error("malformed {kind}: {reason}")]
    MalformedMessage { kind: &'static str, reason: String },

    #[error("no handler registered for '{0}'")]
    UnregisteredHandler(String),

    #[error("hub client initialization failed: {0}")]
    HubClientInit(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection retry expired after {0}s")]
    RetryExpired(u64),

    #[error("logger setup failed: {0}")]
    Logger(String),
}

impl AgentError {
    pub fn malformed(kind: &'static str, err: impl std::fmt::Display) -> Self {
        AgentError::MalformedMessage {
            kind,
            reason: err.to_string(),
        }
    }

    /// Whether the agent can keep running after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AgentError::MalformedMessage { .. }
                | AgentError::UnregisteredHandler(_)
                | AgentError::Transport(_)
        )
    }
}

impl From<rumqttc::ClientError> for AgentError {
    fn from(err: rumqttc::ClientError) -> Self {
        AgentError::Transport(err.to_string())
    }
}
