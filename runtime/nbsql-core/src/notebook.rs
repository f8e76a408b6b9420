//! Wiring of the pool, session registry, pipeline and monitor behind one
//! dispatcher, plus the background tasks that keep them tidy.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use nbsql_db::{CloseReport, ConnectionPool, PoolConfig, ProfileId, ProfileStore, SqlDriver};

use crate::commands::{CommandContext, CommandName, OutboundMessage, Outbox, OutboxReceiver};
use crate::dispatch::Dispatcher;
use crate::error::{DispatchError, ExecError, FailurePayload};
use crate::handlers;
use crate::monitor::Monitor;
use crate::pipeline::{ExecutionPipeline, PipelineConfig};
use crate::session::SessionRegistry;

#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Profile polled for `updateStats`; also the fallback target of
    /// admin commands that carry no profile of their own.
    pub profile: Option<ProfileId>,
    /// Zero disables polling.
    pub interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            profile: None,
            interval: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CorePaths {
    pub export_dir: PathBuf,
    pub scripts_dir: PathBuf,
}

impl Default for CorePaths {
    fn default() -> Self {
        Self {
            export_dir: PathBuf::from("exports"),
            scripts_dir: PathBuf::from("scripts"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CoreConfig {
    pub pool: PoolConfig,
    pub pipeline: PipelineConfig,
    pub monitor: MonitorConfig,
    pub paths: CorePaths,
    /// Zero disables the idle sweeper.
    pub sweep_interval: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            pipeline: PipelineConfig::default(),
            monitor: MonitorConfig::default(),
            paths: CorePaths::default(),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Shared state every handler works against.
pub struct Services {
    pub profiles: Arc<dyn ProfileStore>,
    pub pool: Arc<ConnectionPool>,
    pub sessions: Arc<SessionRegistry>,
    pub pipeline: Arc<ExecutionPipeline>,
    pub monitor: Arc<Monitor>,
    pub paths: CorePaths,
    pub monitor_profile: Option<ProfileId>,
    pub outbox: Outbox,
}

impl Services {
    /// Target of an admin statement: the context's profile, then the
    /// session's binding, then the monitor profile.
    pub fn admin_profile(
        &self,
        ctx: &CommandContext,
        command: CommandName,
    ) -> Result<ProfileId, DispatchError> {
        if let Some(profile) = &ctx.profile {
            return Ok(profile.clone());
        }
        let bound = ctx
            .session
            .as_deref()
            .and_then(|key| self.sessions.status(key))
            .and_then(|status| status.profile_id);
        bound
            .or_else(|| self.monitor_profile.clone())
            .ok_or(DispatchError::MissingContext {
                command,
                field: "profile",
            })
    }

    /// Queues a message for the UI layer. Dropped once the host stopped
    /// listening.
    pub fn post(&self, message: OutboundMessage) {
        if self.outbox.send(message).is_err() {
            tracing::debug!("outbox closed; message dropped");
        }
    }

    /// Takes a fresh snapshot in the background and posts it, or a
    /// `commandFailed` for `command` if that fails.
    pub fn refresh_later(self: &Arc<Self>, profile: ProfileId, command: CommandName) {
        let services = Arc::clone(self);
        tokio::spawn(async move {
            match services.monitor.snapshot(&profile).await {
                Ok(stats) => services.post(OutboundMessage::UpdateStats {
                    stats: Box::new(stats),
                }),
                Err(ExecError::Closed) => {}
                Err(err) => {
                    tracing::warn!(profile = %profile, error = %err, "refresh after {command} failed");
                    services.post(OutboundMessage::CommandFailed {
                        command: command.as_str().to_string(),
                        error: FailurePayload::from(&err),
                    });
                }
            }
        });
    }
}

pub struct NotebookCore {
    services: Arc<Services>,
    dispatcher: Dispatcher,
    background: Vec<JoinHandle<()>>,
}

impl NotebookCore {
    /// Builds the core, registers every command handler and starts the idle
    /// sweeper and stats poller. Must be called inside a tokio runtime.
    pub fn start(
        config: CoreConfig,
        driver: Arc<dyn SqlDriver>,
        profiles: Arc<dyn ProfileStore>,
    ) -> Result<(Self, OutboxReceiver), DispatchError> {
        let (outbox, inbox) = mpsc::unbounded_channel();
        let pool = ConnectionPool::new(config.pool, driver, Arc::clone(&profiles));
        let sessions = Arc::new(SessionRegistry::new());
        let pipeline = Arc::new(ExecutionPipeline::new(
            Arc::clone(&pool),
            Arc::clone(&sessions),
            Arc::clone(&profiles),
            config.pipeline,
        ));
        let monitor = Arc::new(Monitor::new(Arc::clone(&pool), Arc::clone(&sessions)));
        let services = Arc::new(Services {
            profiles,
            pool,
            sessions,
            pipeline,
            monitor,
            paths: config.paths,
            monitor_profile: config.monitor.profile.clone(),
            outbox,
        });
        let dispatcher = handlers::dispatcher(&services)?;

        let mut background = Vec::new();
        if !config.sweep_interval.is_zero() {
            background.push(services.pool.spawn_idle_sweeper(config.sweep_interval));
        }
        if let Some(profile) = config.monitor.profile {
            if !config.monitor.interval.is_zero() {
                background.push(services.monitor.spawn_poller(
                    profile,
                    config.monitor.interval,
                    services.outbox.clone(),
                ));
            }
        }
        tracing::info!(
            handlers = dispatcher.registered().len(),
            background = background.len(),
            "notebook core started"
        );
        Ok((
            Self {
                services,
                dispatcher,
                background,
            },
            inbox,
        ))
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Stops background work, cancels every session and closes all pooled
    /// connections. Later commands fail with `Closed`.
    pub async fn shutdown(&self) -> CloseReport {
        for task in &self.background {
            task.abort();
        }
        let sessions = self.services.sessions.destroy_all();
        let report = self.services.pool.close_all().await;
        tracing::info!(
            sessions,
            attempted = report.attempted,
            failed = report.failures.len(),
            "notebook core stopped"
        );
        report
    }
}
