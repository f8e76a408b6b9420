//! The database capability set the rest of nbsql is written against.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::profile::ConnectionProfile;

/// Server-side process identifier of a live connection.
pub type BackendPid = i32;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DriverError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("{message}")]
    Query {
        code: Option<String>,
        message: String,
    },
    #[error("statement cancelled by server")]
    Cancelled,
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
    #[error("tls setup failed: {0}")]
    Tls(String),
    #[error("invalid connection settings: {0}")]
    Config(String),
}

impl DriverError {
    pub fn query(message: impl Into<String>) -> Self {
        DriverError::Query {
            code: None,
            message: message.into(),
        }
    }

    /// True when the connection cannot be reused after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DriverError::ConnectionClosed(_) | DriverError::Connect(_) | DriverError::Tls(_)
        )
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Column {
    pub name: String,
}

impl Column {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

pub type Cell = Option<String>;

/// Text-format output of a single statement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryOutput {
    Rows {
        columns: Vec<Column>,
        rows: Vec<Vec<Cell>>,
    },
    Affected(u64),
}

impl QueryOutput {
    pub fn rows(&self) -> &[Vec<Cell>] {
        match self {
            QueryOutput::Rows { rows, .. } => rows,
            QueryOutput::Affected(_) => &[],
        }
    }
}

/// One physical connection. Calls take `&self` so a cancel can be issued
/// while a query on the same connection is still awaiting the server.
#[async_trait]
pub trait SqlConnection: Send + Sync {
    fn backend_pid(&self) -> BackendPid;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<(), DriverError>;

    async fn query(&self, sql: &str) -> Result<QueryOutput, DriverError>;

    /// Asks the server to abort whatever this connection is running.
    async fn cancel_current(&self) -> Result<(), DriverError>;

    /// Signals another backend to abort its statement.
    async fn cancel_backend(&self, pid: BackendPid) -> Result<bool, DriverError>;

    /// Signals another backend to exit.
    async fn terminate_backend(&self, pid: BackendPid) -> Result<bool, DriverError>;

    async fn close(&self) -> Result<(), DriverError>;
}

#[async_trait]
pub trait SqlDriver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn connect(
        &self,
        profile: &ConnectionProfile,
    ) -> Result<Box<dyn SqlConnection>, DriverError>;
}
