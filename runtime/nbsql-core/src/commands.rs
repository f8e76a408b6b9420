//! The closed set of inbound commands and outbound UI messages.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use nbsql_db::{BackendPid, CancelToken, ProfileId};

use crate::error::{DispatchError, FailurePayload};
use crate::monitor::{DetailsKind, DetailsTable, StatsSnapshot};
use crate::pipeline::ExecutionResult;
use crate::session::SessionKey;

macro_rules! command_names {
    ($($variant:ident => $wire:literal),+ $(,)?) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum CommandName {
            $(#[serde(rename = $wire)] $variant,)+
        }

        impl CommandName {
            pub const ALL: &'static [CommandName] = &[$(CommandName::$variant,)+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(CommandName::$variant => $wire,)+
                }
            }

            pub fn parse(name: &str) -> Option<Self> {
                match name {
                    $($wire => Some(CommandName::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

command_names! {
    CancelQuery => "cancelQuery",
    TerminateQuery => "terminateQuery",
    Refresh => "refresh",
    Details => "details",
    ExplainQuery => "explainQuery",
    ExportRequest => "export_request",
    SaveChanges => "saveChanges",
    ScriptDelete => "script_delete",
    ExecuteCell => "executeCell",
    CancelCell => "cancelCell",
    BindSession => "bindSession",
    SetSafetyProfile => "setSafetyProfile",
    CloseSession => "closeSession",
    SessionStatus => "sessionStatus",
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct PidArgs {
    pub pid: BackendPid,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct DetailsArgs {
    #[serde(rename = "type")]
    pub kind: DetailsKind,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ExplainArgs {
    pub query: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
    Sql,
    Txt,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
            ExportFormat::Sql => "sql",
            ExportFormat::Txt => "txt",
        }
    }
}

/// Either pre-rendered text or a result grid to render in the export format.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ExportContent {
    Text(String),
    Table {
        columns: Vec<String>,
        rows: Vec<Vec<Option<String>>>,
    },
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ExportArgs {
    pub format: ExportFormat,
    pub content: ExportContent,
    pub filename: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct CellEdit {
    /// Key value of the row being edited.
    pub key: String,
    pub column: String,
    /// New value; `None` writes SQL `NULL`.
    pub value: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct SaveChangesArgs {
    pub table: String,
    pub key_column: String,
    pub edits: Vec<CellEdit>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ScriptArgs {
    pub name: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ExecuteCellArgs {
    pub sql: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct BindSessionArgs {
    pub profile_id: ProfileId,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct SafetyProfileArgs {
    #[serde(default)]
    pub safety_profile_id: Option<ProfileId>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct NoArgs {}

/// One decoded inbound command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    CancelQuery(PidArgs),
    TerminateQuery(PidArgs),
    Refresh(NoArgs),
    Details(DetailsArgs),
    ExplainQuery(ExplainArgs),
    ExportRequest(ExportArgs),
    SaveChanges(SaveChangesArgs),
    ScriptDelete(ScriptArgs),
    ExecuteCell(ExecuteCellArgs),
    CancelCell(NoArgs),
    BindSession(BindSessionArgs),
    SetSafetyProfile(SafetyProfileArgs),
    CloseSession(NoArgs),
    SessionStatus(NoArgs),
}

fn args<T: DeserializeOwned>(name: CommandName, payload: Value) -> Result<T, DispatchError> {
    // Commands without arguments accept an absent payload.
    let payload = if payload.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        payload
    };
    serde_json::from_value(payload).map_err(|err| DispatchError::invalid(name.as_str(), err.to_string()))
}

impl Command {
    pub fn decode(name: CommandName, payload: Value) -> Result<Self, DispatchError> {
        Ok(match name {
            CommandName::CancelQuery => Command::CancelQuery(args(name, payload)?),
            CommandName::TerminateQuery => Command::TerminateQuery(args(name, payload)?),
            CommandName::Refresh => Command::Refresh(args(name, payload)?),
            CommandName::Details => Command::Details(args(name, payload)?),
            CommandName::ExplainQuery => Command::ExplainQuery(args(name, payload)?),
            CommandName::ExportRequest => Command::ExportRequest(args(name, payload)?),
            CommandName::SaveChanges => Command::SaveChanges(args(name, payload)?),
            CommandName::ScriptDelete => Command::ScriptDelete(args(name, payload)?),
            CommandName::ExecuteCell => Command::ExecuteCell(args(name, payload)?),
            CommandName::CancelCell => Command::CancelCell(args(name, payload)?),
            CommandName::BindSession => Command::BindSession(args(name, payload)?),
            CommandName::SetSafetyProfile => Command::SetSafetyProfile(args(name, payload)?),
            CommandName::CloseSession => Command::CloseSession(args(name, payload)?),
            CommandName::SessionStatus => Command::SessionStatus(args(name, payload)?),
        })
    }

    pub fn name(&self) -> CommandName {
        match self {
            Command::CancelQuery(_) => CommandName::CancelQuery,
            Command::TerminateQuery(_) => CommandName::TerminateQuery,
            Command::Refresh(_) => CommandName::Refresh,
            Command::Details(_) => CommandName::Details,
            Command::ExplainQuery(_) => CommandName::ExplainQuery,
            Command::ExportRequest(_) => CommandName::ExportRequest,
            Command::SaveChanges(_) => CommandName::SaveChanges,
            Command::ScriptDelete(_) => CommandName::ScriptDelete,
            Command::ExecuteCell(_) => CommandName::ExecuteCell,
            Command::CancelCell(_) => CommandName::CancelCell,
            Command::BindSession(_) => CommandName::BindSession,
            Command::SetSafetyProfile(_) => CommandName::SetSafetyProfile,
            Command::CloseSession(_) => CommandName::CloseSession,
            Command::SessionStatus(_) => CommandName::SessionStatus,
        }
    }
}

/// Per-request context supplied by the host alongside a command.
#[derive(Clone, Debug, Default)]
pub struct CommandContext {
    pub session: Option<SessionKey>,
    pub profile: Option<ProfileId>,
    pub cancel: CancelToken,
}

impl CommandContext {
    pub fn for_session(session: impl Into<SessionKey>) -> Self {
        Self {
            session: Some(session.into()),
            ..Self::default()
        }
    }

    pub fn with_profile(mut self, profile: impl Into<ProfileId>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn require_session(&self, command: CommandName) -> Result<&str, DispatchError> {
        self.session
            .as_deref()
            .ok_or(DispatchError::MissingContext {
                command,
                field: "session",
            })
    }
}

/// Unsolicited messages posted back to the UI layer.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum OutboundMessage {
    UpdateStats {
        stats: Box<StatsSnapshot>,
    },
    ShowDetails(DetailsTable),
    QueryResult {
        session: SessionKey,
        result: ExecutionResult,
    },
    CommandFailed {
        command: String,
        error: FailurePayload,
    },
}

pub type Outbox = UnboundedSender<OutboundMessage>;
pub type OutboxReceiver = UnboundedReceiver<OutboundMessage>;
