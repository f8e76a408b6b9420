//! Name-keyed routing of inbound commands to their handlers.
//!
//! The table is filled once through [`DispatcherBuilder`] and frozen; the
//! dispatcher only decodes, routes and maps errors to a uniform reply.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::commands::{Command, CommandContext, CommandName};
use crate::error::{DispatchError, FailurePayload};

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: Command, ctx: &CommandContext) -> Result<Value, DispatchError>;
}

#[derive(Default)]
pub struct DispatcherBuilder {
    handlers: BTreeMap<CommandName, Arc<dyn CommandHandler>>,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(mut self, name: CommandName, handler: H) -> Result<Self, DispatchError>
    where
        H: CommandHandler + 'static,
    {
        if self.handlers.contains_key(&name) {
            return Err(DispatchError::DuplicateHandler(name));
        }
        self.handlers.insert(name, Arc::new(handler));
        Ok(self)
    }

    pub fn build(self) -> Dispatcher {
        Dispatcher {
            handlers: self.handlers,
        }
    }
}

/// Reply to one command, successful or not.
#[derive(Clone, Debug, Serialize)]
pub struct Reply {
    /// `"Ok"` or the failure kind.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FailurePayload>,
    pub elapsed_ms: u64,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

pub struct Dispatcher {
    handlers: BTreeMap<CommandName, Arc<dyn CommandHandler>>,
}

impl Dispatcher {
    pub fn registered(&self) -> Vec<CommandName> {
        self.handlers.keys().copied().collect()
    }

    pub async fn handle(
        &self,
        name: &str,
        payload: Value,
        ctx: &CommandContext,
    ) -> Result<Value, DispatchError> {
        let command_name =
            CommandName::parse(name).ok_or_else(|| DispatchError::UnknownCommand(name.to_string()))?;
        let handler = self
            .handlers
            .get(&command_name)
            .ok_or_else(|| DispatchError::UnknownCommand(name.to_string()))?;
        let command = Command::decode(command_name, payload)?;
        handler.handle(command, ctx).await
    }

    /// Like [`Dispatcher::handle`] but never fails: errors become a
    /// [`FailurePayload`] on the reply.
    pub async fn respond(&self, name: &str, payload: Value, ctx: &CommandContext) -> Reply {
        let started = Instant::now();
        let result = self.handle(name, payload, ctx).await;
        let elapsed_ms = started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64;
        match result {
            Ok(payload) => {
                tracing::debug!(command = name, elapsed_ms, "command handled");
                Reply {
                    status: "Ok".to_string(),
                    payload: Some(payload),
                    error: None,
                    elapsed_ms,
                }
            }
            Err(err) => {
                tracing::debug!(command = name, elapsed_ms, error = %err, "command failed");
                let failure = FailurePayload::from(&err);
                Reply {
                    status: failure.kind.clone(),
                    payload: None,
                    error: Some(failure),
                    elapsed_ms,
                }
            }
        }
    }
}
