use serde::{Deserialize, Serialize};

use nbsql_db::{DriverError, PoolError, ProfileId};

use crate::classify::StatementKind;
use crate::commands::CommandName;

/// Failures of a single execution. A user cancel is not among them; it is
/// reported as [`crate::pipeline::ExecutionOutcome::Cancelled`].
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ExecError {
    #[error("could not connect to '{profile}': {source}")]
    ConnectFailed {
        profile: ProfileId,
        #[source]
        source: DriverError,
    },
    #[error("no free connection for '{profile}' within {waited_ms}ms")]
    PoolExhausted { profile: ProfileId, waited_ms: u64 },
    #[error("session '{0}' not found")]
    SessionNotFound(String),
    #[error("session '{0}' is busy")]
    SessionBusy(String),
    #[error("session '{0}' is not bound to a connection")]
    SessionUnbound(String),
    #[error("{keyword} statement ({kind}) rejected by read-only policy")]
    ReadOnlyViolation {
        kind: StatementKind,
        keyword: String,
    },
    #[error("statement timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
    #[error(transparent)]
    Driver(DriverError),
    #[error("unknown profile '{0}'")]
    UnknownProfile(ProfileId),
    #[error("connection pool is closed")]
    Closed,
}

impl ExecError {
    pub fn kind(&self) -> &'static str {
        match self {
            ExecError::ConnectFailed { .. } => "ConnectFailed",
            ExecError::PoolExhausted { .. } => "PoolExhausted",
            ExecError::SessionNotFound(_) => "SessionNotFound",
            ExecError::SessionBusy(_) => "SessionBusy",
            ExecError::SessionUnbound(_) => "SessionUnbound",
            ExecError::ReadOnlyViolation { .. } => "ReadOnlyViolation",
            ExecError::Timeout { .. } => "Timeout",
            ExecError::Driver(_) => "DriverError",
            ExecError::UnknownProfile(_) => "UnknownProfile",
            ExecError::Closed => "Closed",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecError::PoolExhausted { .. })
    }
}

impl From<PoolError> for ExecError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::ConnectFailed { profile, source } => {
                ExecError::ConnectFailed { profile, source }
            }
            PoolError::PoolExhausted { profile, waited_ms } => {
                ExecError::PoolExhausted { profile, waited_ms }
            }
            PoolError::Cancelled => ExecError::Driver(DriverError::Cancelled),
            PoolError::Closed => ExecError::Closed,
            PoolError::UnknownProfile(profile) => ExecError::UnknownProfile(profile),
        }
    }
}

impl From<DriverError> for ExecError {
    fn from(err: DriverError) -> Self {
        ExecError::Driver(err)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("a handler for '{0}' is already registered")]
    DuplicateHandler(CommandName),
    #[error("invalid payload for '{command}': {message}")]
    InvalidPayload { command: String, message: String },
    #[error("'{command}' requires a {field} in its context")]
    MissingContext {
        command: CommandName,
        field: &'static str,
    },
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("could not encode reply: {0}")]
    Encode(#[from] serde_json::Error),
}

impl DispatchError {
    pub fn invalid(command: impl Into<String>, message: impl Into<String>) -> Self {
        DispatchError::InvalidPayload {
            command: command.into(),
            message: message.into(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        DispatchError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::UnknownCommand(_) => "UnknownCommand",
            DispatchError::DuplicateHandler(_) => "DuplicateHandler",
            DispatchError::InvalidPayload { .. } => "InvalidPayload",
            DispatchError::MissingContext { .. } => "MissingContext",
            DispatchError::Exec(err) => err.kind(),
            DispatchError::Io { .. } => "IoError",
            DispatchError::Driver(_) => "DriverError",
            DispatchError::Encode(_) => "EncodeError",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::Exec(err) => err.is_retryable(),
            _ => false,
        }
    }
}

impl From<PoolError> for DispatchError {
    fn from(err: PoolError) -> Self {
        DispatchError::Exec(err.into())
    }
}

/// Uniform failure shape handed to the UI layer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailurePayload {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&DispatchError> for FailurePayload {
    fn from(err: &DispatchError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

impl From<&ExecError> for FailurePayload {
    fn from(err: &ExecError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}
