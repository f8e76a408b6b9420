//! Notebook-side SQL execution for nbsql.
//!
//! [`notebook::NotebookCore`] owns a connection pool, the session registry and
//! the execution pipeline, and routes inbound UI commands to handlers that
//! reply directly or post [`commands::OutboundMessage`]s.

pub mod classify;
pub mod commands;
pub mod dispatch;
pub mod error;
pub mod export;
pub mod handlers;
pub mod lockgraph;
pub mod monitor;
pub mod notebook;
pub mod pipeline;
pub mod policy;
pub mod session;

pub use classify::{Classification, RowCap, StatementKind, apply_row_cap, classify};
pub use commands::{
    Command, CommandContext, CommandName, OutboundMessage, Outbox, OutboxReceiver,
};
pub use dispatch::{CommandHandler, Dispatcher, DispatcherBuilder, Reply};
pub use error::{DispatchError, ExecError, FailurePayload};
pub use lockgraph::{LockForest, LockNode, LockRole, LockRow};
pub use monitor::{DetailsKind, DetailsTable, Monitor, StatsCounters, StatsSnapshot};
pub use notebook::{CoreConfig, CorePaths, MonitorConfig, NotebookCore, Services};
pub use pipeline::{
    ExecutionOutcome, ExecutionPipeline, ExecutionRequest, ExecutionResult, PipelineConfig,
};
pub use policy::EffectivePolicy;
pub use session::{SessionKey, SessionRegistry, SessionState, SessionStatus};
