//! One handler per inbound command.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};

use nbsql_db::BackendPid;

use crate::classify;
use crate::commands::{Command, CommandContext, CommandName, OutboundMessage};
use crate::notebook::Services;
use crate::dispatch::{CommandHandler, Dispatcher, DispatcherBuilder};
use crate::error::{DispatchError, ExecError};
use crate::export;
use crate::pipeline::{ExecutionOutcome, ExecutionRequest};

fn unexpected(expected: CommandName, got: &Command) -> DispatchError {
    DispatchError::invalid(
        expected.as_str(),
        format!("handler received '{}'", got.name()),
    )
}

fn encode<T: Serialize>(value: &T) -> Result<Value, DispatchError> {
    Ok(serde_json::to_value(value)?)
}

/// Registers every handler against `services`.
pub fn dispatcher(services: &Arc<Services>) -> Result<Dispatcher, DispatchError> {
    let shared = || Arc::clone(services);
    Ok(DispatcherBuilder::new()
        .register(CommandName::CancelQuery, CancelQuery(shared()))?
        .register(CommandName::TerminateQuery, TerminateQuery(shared()))?
        .register(CommandName::Refresh, Refresh(shared()))?
        .register(CommandName::Details, Details(shared()))?
        .register(CommandName::ExplainQuery, ExplainQuery(shared()))?
        .register(CommandName::ExportRequest, ExportRequest(shared()))?
        .register(CommandName::SaveChanges, SaveChanges(shared()))?
        .register(CommandName::ScriptDelete, ScriptDelete(shared()))?
        .register(CommandName::ExecuteCell, ExecuteCell(shared()))?
        .register(CommandName::CancelCell, CancelCell(shared()))?
        .register(CommandName::BindSession, BindSession(shared()))?
        .register(CommandName::SetSafetyProfile, SetSafetyProfile(shared()))?
        .register(CommandName::CloseSession, CloseSession(shared()))?
        .register(CommandName::SessionStatus, SessionStatus(shared()))?
        .build())
}

#[derive(Clone, Copy)]
enum Signal {
    Cancel,
    Terminate,
}

/// Sends a cancel or terminate signal for `pid` through a pooled admin
/// connection, then refreshes the stats view.
async fn signal_backend(
    services: &Arc<Services>,
    ctx: &CommandContext,
    command: CommandName,
    pid: BackendPid,
    signal: Signal,
) -> Result<bool, DispatchError> {
    let profile = services.admin_profile(ctx, command)?;
    let lease = services.pool.acquire(&profile).await?;
    let sent = match signal {
        Signal::Cancel => lease.connection().cancel_backend(pid).await,
        Signal::Terminate => lease.connection().terminate_backend(pid).await,
    };
    match sent {
        Ok(sent) => {
            services.pool.release(lease);
            tracing::info!(profile = %profile, pid, sent, "{command} signalled backend");
            services.refresh_later(profile, command);
            Ok(sent)
        }
        Err(err) => {
            if err.is_fatal() {
                lease.discard().await;
            } else {
                services.pool.release(lease);
            }
            Err(ExecError::from(err).into())
        }
    }
}

pub struct CancelQuery(Arc<Services>);

#[async_trait]
impl CommandHandler for CancelQuery {
    async fn handle(&self, command: Command, ctx: &CommandContext) -> Result<Value, DispatchError> {
        let args = match command {
            Command::CancelQuery(args) => args,
            other => return Err(unexpected(CommandName::CancelQuery, &other)),
        };
        // Statements owned by a notebook session go through its token so the
        // pipeline sees a user cancel rather than a server error.
        if let Some(owner) = self.0.sessions.find_by_pid(args.pid) {
            if owner.state.in_flight() {
                let cancelled = self.0.sessions.cancel(&owner.key)?;
                return Ok(json!({
                    "pid": args.pid,
                    "cancelled": cancelled,
                    "via": "session",
                    "session": owner.key,
                }));
            }
        }
        let sent = signal_backend(&self.0, ctx, CommandName::CancelQuery, args.pid, Signal::Cancel).await?;
        Ok(json!({ "pid": args.pid, "cancelled": sent, "via": "backend" }))
    }
}

pub struct TerminateQuery(Arc<Services>);

#[async_trait]
impl CommandHandler for TerminateQuery {
    async fn handle(&self, command: Command, ctx: &CommandContext) -> Result<Value, DispatchError> {
        let args = match command {
            Command::TerminateQuery(args) => args,
            other => return Err(unexpected(CommandName::TerminateQuery, &other)),
        };
        let sent = signal_backend(
            &self.0,
            ctx,
            CommandName::TerminateQuery,
            args.pid,
            Signal::Terminate,
        )
        .await?;
        Ok(json!({ "pid": args.pid, "terminated": sent }))
    }
}

pub struct Refresh(Arc<Services>);

#[async_trait]
impl CommandHandler for Refresh {
    async fn handle(&self, command: Command, ctx: &CommandContext) -> Result<Value, DispatchError> {
        if !matches!(command, Command::Refresh(_)) {
            return Err(unexpected(CommandName::Refresh, &command));
        }
        let profile = self.0.admin_profile(ctx, CommandName::Refresh)?;
        let stats = self.0.monitor.snapshot(&profile).await?;
        let reply = json!({ "profile": profile, "counters": encode(&stats.counters)? });
        self.0.post(OutboundMessage::UpdateStats {
            stats: Box::new(stats),
        });
        Ok(reply)
    }
}

pub struct Details(Arc<Services>);

#[async_trait]
impl CommandHandler for Details {
    async fn handle(&self, command: Command, ctx: &CommandContext) -> Result<Value, DispatchError> {
        let args = match command {
            Command::Details(args) => args,
            other => return Err(unexpected(CommandName::Details, &other)),
        };
        let profile = self.0.admin_profile(ctx, CommandName::Details)?;
        let stats = self.0.monitor.snapshot(&profile).await?;
        let table = stats.details(args.kind);
        let reply = encode(&table)?;
        self.0.post(OutboundMessage::ShowDetails(table));
        Ok(reply)
    }
}

pub struct ExplainQuery(Arc<Services>);

#[async_trait]
impl CommandHandler for ExplainQuery {
    async fn handle(&self, command: Command, ctx: &CommandContext) -> Result<Value, DispatchError> {
        let args = match command {
            Command::ExplainQuery(args) => args,
            other => return Err(unexpected(CommandName::ExplainQuery, &other)),
        };
        let session = ctx.require_session(CommandName::ExplainQuery)?;
        let query = args.query.trim().trim_end_matches(';').trim_end();
        match classify::statement_count(query) {
            0 => return Err(DispatchError::invalid(CommandName::ExplainQuery.as_str(), "query is empty")),
            1 => {}
            n => {
                return Err(DispatchError::invalid(
                    CommandName::ExplainQuery.as_str(),
                    format!("expected a single statement, got {n}"),
                ));
            }
        }
        let request = ExecutionRequest::new(session, format!("EXPLAIN (FORMAT JSON) {query}"))
            .with_cancel(ctx.cancel.clone());
        let result = self.0.pipeline.execute(request).await?;
        let reply = encode(&result)?;
        self.0.post(OutboundMessage::QueryResult {
            session: session.to_string(),
            result,
        });
        Ok(reply)
    }
}

pub struct ExportRequest(Arc<Services>);

#[async_trait]
impl CommandHandler for ExportRequest {
    async fn handle(&self, command: Command, _ctx: &CommandContext) -> Result<Value, DispatchError> {
        let args = match command {
            Command::ExportRequest(args) => args,
            other => return Err(unexpected(CommandName::ExportRequest, &other)),
        };
        let path = export::write_export(&self.0.paths.export_dir, &args)?;
        Ok(json!({ "path": path.display().to_string(), "format": args.format }))
    }
}

pub struct SaveChanges(Arc<Services>);

#[async_trait]
impl CommandHandler for SaveChanges {
    async fn handle(&self, command: Command, ctx: &CommandContext) -> Result<Value, DispatchError> {
        let args = match command {
            Command::SaveChanges(args) => args,
            other => return Err(unexpected(CommandName::SaveChanges, &other)),
        };
        let session = ctx.require_session(CommandName::SaveChanges)?;
        let statements = export::update_statements(&args)?;
        let mut applied = 0usize;
        let mut affected = 0u64;
        for sql in &statements {
            let request = ExecutionRequest::new(session, sql.as_str()).with_cancel(ctx.cancel.clone());
            let result = match self.0.pipeline.execute(request).await {
                Ok(result) => result,
                Err(err) => {
                    tracing::warn!(session, table = %args.table, applied, error = %err, "saving edits stopped");
                    return Err(err.into());
                }
            };
            match result.outcome {
                ExecutionOutcome::Affected { count } => affected += count,
                ExecutionOutcome::Cancelled => {
                    return Ok(json!({
                        "applied": applied,
                        "affected": affected,
                        "cancelled": true,
                    }));
                }
                ExecutionOutcome::Rows { .. } => {}
            }
            applied += 1;
        }
        Ok(json!({ "applied": applied, "affected": affected, "cancelled": false }))
    }
}

pub struct ScriptDelete(Arc<Services>);

#[async_trait]
impl CommandHandler for ScriptDelete {
    async fn handle(&self, command: Command, _ctx: &CommandContext) -> Result<Value, DispatchError> {
        let args = match command {
            Command::ScriptDelete(args) => args,
            other => return Err(unexpected(CommandName::ScriptDelete, &other)),
        };
        let path = export::delete_script(&self.0.paths.scripts_dir, &args.name)?;
        Ok(json!({ "deleted": path.display().to_string() }))
    }
}

pub struct ExecuteCell(Arc<Services>);

#[async_trait]
impl CommandHandler for ExecuteCell {
    async fn handle(&self, command: Command, ctx: &CommandContext) -> Result<Value, DispatchError> {
        let args = match command {
            Command::ExecuteCell(args) => args,
            other => return Err(unexpected(CommandName::ExecuteCell, &other)),
        };
        let session = ctx.require_session(CommandName::ExecuteCell)?;
        let request = ExecutionRequest::new(session, args.sql)
            .with_cancel(ctx.cancel.clone())
            .with_timeout(args.timeout_ms.map(Duration::from_millis));
        let result = self.0.pipeline.execute(request).await?;
        encode(&result)
    }
}

pub struct CancelCell(Arc<Services>);

#[async_trait]
impl CommandHandler for CancelCell {
    async fn handle(&self, command: Command, ctx: &CommandContext) -> Result<Value, DispatchError> {
        if !matches!(command, Command::CancelCell(_)) {
            return Err(unexpected(CommandName::CancelCell, &command));
        }
        let session = ctx.require_session(CommandName::CancelCell)?;
        let cancelled = self.0.sessions.cancel(session)?;
        Ok(json!({ "cancelled": cancelled }))
    }
}

pub struct BindSession(Arc<Services>);

#[async_trait]
impl CommandHandler for BindSession {
    async fn handle(&self, command: Command, ctx: &CommandContext) -> Result<Value, DispatchError> {
        let args = match command {
            Command::BindSession(args) => args,
            other => return Err(unexpected(CommandName::BindSession, &other)),
        };
        let session = ctx.require_session(CommandName::BindSession)?;
        if self.0.profiles.connection(&args.profile_id).is_none() {
            return Err(ExecError::UnknownProfile(args.profile_id).into());
        }
        self.0.sessions.get_or_create(session);
        let status = self.0.sessions.bind(session, &args.profile_id)?;
        encode(&status)
    }
}

pub struct SetSafetyProfile(Arc<Services>);

#[async_trait]
impl CommandHandler for SetSafetyProfile {
    async fn handle(&self, command: Command, ctx: &CommandContext) -> Result<Value, DispatchError> {
        let args = match command {
            Command::SetSafetyProfile(args) => args,
            other => return Err(unexpected(CommandName::SetSafetyProfile, &other)),
        };
        let session = ctx.require_session(CommandName::SetSafetyProfile)?;
        if let Some(id) = &args.safety_profile_id {
            if self.0.profiles.safety(id).is_none() {
                return Err(ExecError::UnknownProfile(id.clone()).into());
            }
        }
        let status = self
            .0
            .sessions
            .set_active_safety_profile(session, args.safety_profile_id.as_deref())?;
        encode(&status)
    }
}

pub struct CloseSession(Arc<Services>);

#[async_trait]
impl CommandHandler for CloseSession {
    async fn handle(&self, command: Command, ctx: &CommandContext) -> Result<Value, DispatchError> {
        if !matches!(command, Command::CloseSession(_)) {
            return Err(unexpected(CommandName::CloseSession, &command));
        }
        let session = ctx.require_session(CommandName::CloseSession)?;
        let closed = self.0.sessions.destroy(session);
        Ok(json!({ "closed": closed.is_some() }))
    }
}

pub struct SessionStatus(Arc<Services>);

#[async_trait]
impl CommandHandler for SessionStatus {
    async fn handle(&self, command: Command, ctx: &CommandContext) -> Result<Value, DispatchError> {
        if !matches!(command, Command::SessionStatus(_)) {
            return Err(unexpected(CommandName::SessionStatus, &command));
        }
        let session = ctx.require_session(CommandName::SessionStatus)?;
        let status = self
            .0
            .sessions
            .status(session)
            .ok_or_else(|| ExecError::SessionNotFound(session.to_string()))?;
        encode(&status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::OutboxReceiver;
    use crate::notebook::{CoreConfig, CorePaths, MonitorConfig, NotebookCore};
    use crate::monitor::DetailsKind;
    use crate::session::SessionState;
    use nbsql_db::testing::ScriptedDriver;
    use nbsql_db::{
        CancelToken, ConnectionProfile, MemoryProfileStore, PoolConfig, ProfileStore, SafetyProfile,
    };

    struct Fixture {
        core: NotebookCore,
        inbox: OutboxReceiver,
        driver: ScriptedDriver,
        dir: tempfile::TempDir,
    }

    fn fixture_with(driver: ScriptedDriver) -> Fixture {
        let mut capped = SafetyProfile::new("capped", "Capped reads");
        capped.read_only = true;
        capped.auto_limit_select_results = 2;
        let profiles: Arc<dyn ProfileStore> = Arc::new(
            MemoryProfileStore::new(
                vec![ConnectionProfile::new("local", "localhost", "app")],
                vec![capped],
            )
            .expect("profiles"),
        );
        let dir = tempfile::tempdir().expect("tempdir");
        let config = CoreConfig {
            pool: PoolConfig {
                max_per_profile: 2,
                ..PoolConfig::default()
            },
            monitor: MonitorConfig {
                profile: Some("local".into()),
                interval: Duration::ZERO,
            },
            paths: CorePaths {
                export_dir: dir.path().join("exports"),
                scripts_dir: dir.path().join("scripts"),
            },
            sweep_interval: Duration::ZERO,
            ..CoreConfig::default()
        };
        let (core, inbox) =
            NotebookCore::start(config, Arc::new(driver.clone()), profiles).expect("start");
        Fixture {
            core,
            inbox,
            driver,
            dir,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(crate::monitor::tests::catalog_driver().with_counted_table("items", 10))
    }

    impl Fixture {
        async fn send(&self, name: &str, payload: Value, ctx: &CommandContext) -> Result<Value, DispatchError> {
            self.core.dispatcher().handle(name, payload, ctx).await
        }

        async fn bind(&self, session: &str) -> CommandContext {
            let ctx = CommandContext::for_session(session);
            self.send("bindSession", json!({ "profile_id": "local" }), &ctx)
                .await
                .expect("bind");
            ctx
        }

        async fn next_message(&mut self) -> OutboundMessage {
            self.inbox.recv().await.expect("message")
        }
    }

    #[tokio::test]
    async fn execute_cell_returns_rows_and_counts_executions() {
        let fx = fixture();
        let ctx = fx.bind("cell-1").await;
        let reply = fx
            .send("executeCell", json!({ "sql": "SELECT * FROM items" }), &ctx)
            .await
            .expect("execute");
        assert_eq!(reply["kind"], "rows");
        assert_eq!(reply["row_count"], 10);
        let status = fx
            .send("sessionStatus", Value::Null, &ctx)
            .await
            .expect("status");
        assert_eq!(status["executions"], 1);
        assert_eq!(status["state"], "idle");
    }

    #[tokio::test]
    async fn safety_profile_caps_and_guards_a_session() {
        let fx = fixture();
        let ctx = fx.bind("cell-1").await;
        fx.send("setSafetyProfile", json!({ "safety_profile_id": "capped" }), &ctx)
            .await
            .expect("set");
        let reply = fx
            .send("executeCell", json!({ "sql": "SELECT * FROM items" }), &ctx)
            .await
            .expect("execute");
        assert_eq!(reply["row_count"], 2);
        assert_eq!(reply["truncated"], true);
        let err = fx
            .send("executeCell", json!({ "sql": "DELETE FROM items" }), &ctx)
            .await
            .expect_err("read-only");
        assert_eq!(err.kind(), "ReadOnlyViolation");

        let err = fx
            .send("setSafetyProfile", json!({ "safety_profile_id": "missing" }), &ctx)
            .await
            .expect_err("unknown");
        assert_eq!(err.kind(), "UnknownProfile");
        fx.send("setSafetyProfile", json!({}), &ctx).await.expect("clear");
        fx.send("executeCell", json!({ "sql": "DELETE FROM items" }), &ctx)
            .await
            .expect("write allowed again");
    }

    #[tokio::test]
    async fn binding_requires_a_known_profile_and_a_session() {
        let fx = fixture();
        let err = fx
            .send("bindSession", json!({ "profile_id": "nope" }), &CommandContext::for_session("c"))
            .await
            .expect_err("unknown");
        assert_eq!(err.kind(), "UnknownProfile");
        let err = fx
            .send("bindSession", json!({ "profile_id": "local" }), &CommandContext::default())
            .await
            .expect_err("no session");
        assert!(matches!(err, DispatchError::MissingContext { field: "session", .. }));
    }

    #[tokio::test]
    async fn cancel_query_routes_session_pids_through_the_session() {
        let fx = fixture();
        let ctx = fx.bind("cell-1").await;
        let services = Arc::clone(fx.core.services());
        let running = tokio::spawn({
            let services = Arc::clone(&services);
            let request = ExecutionRequest::new("cell-1", "SELECT pg_sleep(60)").with_cancel(ctx.cancel.clone());
            async move { services.pipeline.execute(request).await }
        });
        let pid = loop {
            let status = services.sessions.status("cell-1").expect("session");
            if status.state == SessionState::Executing {
                break status.backend_pid.expect("pid");
            }
            tokio::task::yield_now().await;
        };
        let reply = fx
            .send("cancelQuery", json!({ "pid": pid }), &CommandContext::default())
            .await
            .expect("cancel");
        assert_eq!(reply["via"], "session");
        assert_eq!(reply["session"], "cell-1");
        let result = running.await.expect("join").expect("result");
        assert!(result.is_cancelled());
        assert!(fx.driver.signalled().is_empty());
    }

    #[tokio::test]
    async fn cancel_and_terminate_foreign_pids_signal_the_backend() {
        let mut fx = fixture();
        let reply = fx
            .send("cancelQuery", json!({ "pid": 300 }), &CommandContext::default())
            .await
            .expect("cancel");
        assert_eq!(reply, json!({ "pid": 300, "cancelled": true, "via": "backend" }));
        assert!(matches!(fx.next_message().await, OutboundMessage::UpdateStats { .. }));

        let reply = fx
            .send("terminateQuery", json!({ "pid": 200 }), &CommandContext::default())
            .await
            .expect("terminate");
        assert_eq!(reply["terminated"], true);
        assert!(matches!(fx.next_message().await, OutboundMessage::UpdateStats { .. }));
        assert_eq!(fx.driver.signalled(), vec![("cancel", 300), ("terminate", 200)]);
    }

    #[tokio::test]
    async fn refresh_and_details_post_to_the_outbox() {
        let mut fx = fixture();
        let reply = fx
            .send("refresh", Value::Null, &CommandContext::default())
            .await
            .expect("refresh");
        assert_eq!(reply["counters"]["blocked"], 2);
        match fx.next_message().await {
            OutboundMessage::UpdateStats { stats } => assert_eq!(stats.lock_forest.roots[0].pid, 200),
            other => panic!("unexpected {other:?}"),
        }

        fx.send("details", json!({ "type": "connections" }), &CommandContext::default())
            .await
            .expect("details");
        match fx.next_message().await {
            OutboundMessage::ShowDetails(table) => {
                assert_eq!(table.kind, DetailsKind::Connections);
                assert_eq!(table.data.len(), 5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn explain_wraps_a_single_statement() {
        let mut fx = fixture();
        let ctx = fx.bind("cell-1").await;
        fx.send("explainQuery", json!({ "query": "SELECT * FROM items;" }), &ctx)
            .await
            .expect("explain");
        assert!(
            fx.driver
                .executed_sql()
                .contains(&"EXPLAIN (FORMAT JSON) SELECT * FROM items".to_string())
        );
        match fx.next_message().await {
            OutboundMessage::QueryResult { session, .. } => assert_eq!(session, "cell-1"),
            other => panic!("unexpected {other:?}"),
        }

        let err = fx
            .send("explainQuery", json!({ "query": "SELECT 1; DELETE FROM items" }), &ctx)
            .await
            .expect_err("batch");
        assert_eq!(err.kind(), "InvalidPayload");
        let err = fx
            .send("explainQuery", json!({ "query": " ; " }), &ctx)
            .await
            .expect_err("empty");
        assert_eq!(err.kind(), "InvalidPayload");
    }

    #[tokio::test]
    async fn save_changes_applies_edits_in_order() {
        let fx = fixture();
        let ctx = fx.bind("cell-1").await;
        let reply = fx
            .send(
                "saveChanges",
                json!({
                    "table": "items",
                    "key_column": "id",
                    "edits": [
                        { "key": "1", "column": "name", "value": "first" },
                        { "key": "2", "column": "name", "value": null },
                    ],
                }),
                &ctx,
            )
            .await
            .expect("save");
        assert_eq!(reply, json!({ "applied": 2, "affected": 2, "cancelled": false }));
        let updates: Vec<String> = fx
            .driver
            .executed_sql()
            .into_iter()
            .filter(|sql| sql.starts_with("UPDATE"))
            .collect();
        assert_eq!(
            updates,
            vec![
                "UPDATE \"items\" SET \"name\" = 'first' WHERE \"id\" = '1'".to_string(),
                "UPDATE \"items\" SET \"name\" = NULL WHERE \"id\" = '2'".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn save_changes_stops_at_the_first_failure() {
        let driver = ScriptedDriver::new();
        driver.respond_with(|sql| {
            sql.contains("'bad'")
                .then(|| Err(nbsql_db::DriverError::query("value too long")))
        });
        let fx = fixture_with(driver);
        let ctx = fx.bind("cell-1").await;
        let err = fx
            .send(
                "saveChanges",
                json!({
                    "table": "items",
                    "key_column": "id",
                    "edits": [
                        { "key": "1", "column": "name", "value": "ok" },
                        { "key": "bad", "column": "name", "value": "x" },
                        { "key": "3", "column": "name", "value": "never" },
                    ],
                }),
                &ctx,
            )
            .await
            .expect_err("failure");
        assert_eq!(err.to_string(), "value too long");
        assert_eq!(
            fx.driver.executed_sql().iter().filter(|sql| sql.starts_with("UPDATE")).count(),
            2
        );
    }

    #[tokio::test]
    async fn export_and_script_delete_use_their_directories() {
        let fx = fixture();
        let reply = fx
            .send(
                "export_request",
                json!({ "format": "txt", "content": "plain text", "filename": "notes" }),
                &CommandContext::default(),
            )
            .await
            .expect("export");
        let path = fx.dir.path().join("exports").join("notes.txt");
        assert_eq!(reply["path"], path.display().to_string());
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "plain text");

        let scripts = fx.dir.path().join("scripts");
        std::fs::create_dir_all(&scripts).expect("mkdir");
        std::fs::write(scripts.join("old.sql"), "SELECT 1").expect("write");
        fx.send("script_delete", json!({ "name": "old.sql" }), &CommandContext::default())
            .await
            .expect("delete");
        assert!(!scripts.join("old.sql").exists());
    }

    #[tokio::test]
    async fn cancel_cell_and_close_session() {
        let fx = fixture();
        let ctx = fx.bind("cell-1").await;
        let reply = fx.send("cancelCell", Value::Null, &ctx).await.expect("cancel");
        assert_eq!(reply["cancelled"], false);
        let reply = fx.send("closeSession", Value::Null, &ctx).await.expect("close");
        assert_eq!(reply["closed"], true);
        let err = fx.send("sessionStatus", Value::Null, &ctx).await.expect_err("gone");
        assert_eq!(err.kind(), "SessionNotFound");
        let reply = fx.send("closeSession", Value::Null, &ctx).await.expect("again");
        assert_eq!(reply["closed"], false);
    }

    #[tokio::test]
    async fn execute_cell_honours_the_context_cancel_token() {
        let fx = fixture();
        let cancel = CancelToken::new();
        let ctx = fx.bind("cell-1").await.with_cancel(cancel.clone());
        cancel.cancel();
        let reply = fx
            .send("executeCell", json!({ "sql": "SELECT pg_sleep(60)" }), &ctx)
            .await
            .expect("cancelled outcome");
        assert_eq!(reply["kind"], "cancelled");
    }
}
