//! Agent error types.

use thiserror::Error;

/// Agent result type.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors raised by triggers, the job manager and the trigger manager.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Conf(#[from] courier_conf::ConfError),

    #[error("Store error: {0}")]
    Db(#[from] courier_db::DbError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Profile lacks required keys
    #[error("Invalid profile: {0}")]
    InvalidProfile(String),

    /// No constructor registered for `job.trigger`
    #[error("Unknown trigger kind: {0}")]
    UnknownTriggerKind(String),

    /// Trigger failed to initialise or start
    #[error("Trigger {id} failed: {reason}")]
    Trigger { id: String, reason: String },

    #[error("Job error: {0}")]
    Job(String),

    /// A trigger panicked inside a lifecycle call
    #[error("Trigger {0} panicked")]
    Panicked(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl AgentError {
    pub fn invalid_profile(msg: impl Into<String>) -> Self {
        Self::InvalidProfile(msg.into())
    }

    pub fn trigger(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Trigger {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn job(msg: impl Into<String>) -> Self {
        Self::Job(msg.into())
    }
}
