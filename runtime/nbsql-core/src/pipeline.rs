//! The single entry point that turns `(session, sql)` into a result.
//!
//! Steps: claim the session, resolve the effective policy, classify, reject
//! writes under read-only, apply the row cap, lease a connection, run the
//! statement while watching the cancel token, then release everything.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{Instant, timeout};

use nbsql_db::{
    BackendPid, CancelReason, CancelToken, Cell, Column, ConnectionPool, DriverError, Lease,
    PoolError, ProfileStore, QueryOutput,
};

use crate::classify::{RowCap, StatementKind, apply_row_cap, classify};
use crate::error::ExecError;
use crate::policy::EffectivePolicy;
use crate::session::{SessionKey, SessionRegistry};

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// How long a cancelled statement may take to wind down before its
    /// connection is discarded instead of reused.
    pub cancel_grace: Duration,
    pub default_timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cancel_grace: Duration::from_secs(2),
            default_timeout: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExecutionRequest {
    pub session: SessionKey,
    pub sql: String,
    pub cancel: CancelToken,
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    pub fn new(session: impl Into<SessionKey>, sql: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            sql: sql.into(),
            cancel: CancelToken::new(),
            timeout: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Rows {
        columns: Vec<Column>,
        rows: Vec<Vec<Cell>>,
        row_count: usize,
        truncated: bool,
    },
    Affected {
        count: u64,
    },
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    #[serde(flatten)]
    pub outcome: ExecutionOutcome,
    pub statement: StatementKind,
    pub elapsed_ms: u64,
    pub backend_pid: Option<BackendPid>,
    /// Row cap that was applied to the statement, if any.
    pub row_limit: Option<u32>,
}

impl ExecutionResult {
    pub fn is_cancelled(&self) -> bool {
        self.outcome == ExecutionOutcome::Cancelled
    }
}

enum RunOutcome {
    Finished(Result<QueryOutput, DriverError>),
    Cancelled { drained: bool },
}

pub struct ExecutionPipeline {
    pool: Arc<ConnectionPool>,
    sessions: Arc<SessionRegistry>,
    profiles: Arc<dyn ProfileStore>,
    config: PipelineConfig,
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}

impl ExecutionPipeline {
    pub fn new(
        pool: Arc<ConnectionPool>,
        sessions: Arc<SessionRegistry>,
        profiles: Arc<dyn ProfileStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            pool,
            sessions,
            profiles,
            config,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, ExecError> {
        let started = Instant::now();
        let ticket = self.sessions.begin(&request.session, request.cancel.clone())?;

        let connection = self
            .profiles
            .connection(ticket.profile_id())
            .ok_or_else(|| ExecError::UnknownProfile(ticket.profile_id().to_string()))?;
        let safety = match ticket.safety_profile_id() {
            Some(id) => Some(
                self.profiles
                    .safety(id)
                    .ok_or_else(|| ExecError::UnknownProfile(id.to_string()))?,
            ),
            None => None,
        };
        let policy = EffectivePolicy::resolve(
            &connection,
            safety.as_deref(),
            request.timeout,
            self.config.default_timeout,
        );

        let classification = classify(&request.sql);
        if policy.read_only && classification.kind == StatementKind::Write {
            tracing::debug!(
                session = %request.session,
                keyword = %classification.keyword,
                "write rejected by read-only policy"
            );
            return Err(ExecError::ReadOnlyViolation {
                kind: classification.kind,
                keyword: classification.keyword,
            });
        }

        let (sql, row_limit) = match policy.row_limit {
            Some(limit) if classification.kind == StatementKind::Read => {
                match apply_row_cap(&request.sql, limit) {
                    RowCap::Rewritten(sql) => (sql, Some(limit)),
                    RowCap::TrimOnly => (request.sql.clone(), Some(limit)),
                    RowCap::SelfLimited => (request.sql.clone(), None),
                }
            }
            _ => (request.sql.clone(), None),
        };

        let cancel = &request.cancel;
        let _deadline = policy.timeout.map(|after| cancel.expire_after(after));

        let lease = match self
            .pool
            .acquire_with_cancel(&connection.id, Some(cancel))
            .await
        {
            Ok(lease) => lease,
            Err(PoolError::Cancelled) => {
                let result = self.cancelled(cancel, &policy, classification.kind, None, started);
                ticket.finish(elapsed_ms(started));
                return result;
            }
            Err(err) => return Err(err.into()),
        };
        let pid = lease.backend_pid();
        ticket.mark_executing(pid);
        tracing::debug!(session = %request.session, pid, kind = %classification.kind, "executing");

        let outcome = self.run(&lease, &sql, cancel).await;
        let result = match outcome {
            RunOutcome::Finished(Ok(output)) => {
                self.pool.release(lease);
                Ok(ExecutionResult {
                    outcome: shape(output, row_limit),
                    statement: classification.kind,
                    elapsed_ms: elapsed_ms(started),
                    backend_pid: Some(pid),
                    row_limit,
                })
            }
            RunOutcome::Finished(Err(err)) => {
                if err.is_fatal() {
                    tracing::warn!(pid, error = %err, "connection lost during execution");
                    lease.discard().await;
                } else {
                    self.pool.release(lease);
                }
                if err == DriverError::Cancelled {
                    // Cancelled server-side by someone other than this call.
                    self.cancelled(cancel, &policy, classification.kind, Some(pid), started)
                } else {
                    Err(ExecError::Driver(err))
                }
            }
            RunOutcome::Cancelled { drained } => {
                if drained {
                    self.pool.release(lease);
                } else {
                    tracing::warn!(pid, "cancelled statement did not wind down; discarding connection");
                    lease.discard().await;
                }
                self.cancelled(cancel, &policy, classification.kind, Some(pid), started)
            }
        };
        let elapsed = elapsed_ms(started);
        tracing::debug!(
            session = %request.session,
            pid,
            elapsed_ms = elapsed,
            ok = result.is_ok(),
            "execution finished"
        );
        ticket.finish(elapsed);
        result
    }

    /// Runs `sql`, and on cancellation signals the backend and waits up to
    /// the grace period for the statement to end.
    async fn run(&self, lease: &Lease, sql: &str, cancel: &CancelToken) -> RunOutcome {
        let conn = lease.connection();
        let query = conn.query(sql);
        tokio::pin!(query);
        tokio::select! {
            biased;
            result = &mut query => return RunOutcome::Finished(result),
            _ = cancel.cancelled() => {}
        }
        match timeout(self.config.cancel_grace, conn.cancel_current()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(pid = conn.backend_pid(), error = %err, "cancel signal failed"),
            Err(_) => tracing::warn!(pid = conn.backend_pid(), "cancel signal timed out"),
        }
        let drained = timeout(self.config.cancel_grace, &mut query).await.is_ok();
        RunOutcome::Cancelled { drained }
    }

    fn cancelled(
        &self,
        cancel: &CancelToken,
        policy: &EffectivePolicy,
        statement: StatementKind,
        backend_pid: Option<BackendPid>,
        started: Instant,
    ) -> Result<ExecutionResult, ExecError> {
        if cancel.reason() == Some(CancelReason::Timeout) {
            let after_ms = policy
                .timeout
                .map(|t| t.as_millis().min(u128::from(u64::MAX)) as u64)
                .unwrap_or_else(|| elapsed_ms(started));
            return Err(ExecError::Timeout { after_ms });
        }
        Ok(ExecutionResult {
            outcome: ExecutionOutcome::Cancelled,
            statement,
            elapsed_ms: elapsed_ms(started),
            backend_pid,
            row_limit: None,
        })
    }
}

/// Trims a capped result back to `limit` rows, flagging the truncation.
fn shape(output: QueryOutput, row_limit: Option<u32>) -> ExecutionOutcome {
    match output {
        QueryOutput::Affected(count) => ExecutionOutcome::Affected { count },
        QueryOutput::Rows { columns, mut rows } => {
            let mut truncated = false;
            if let Some(limit) = row_limit {
                let limit = limit as usize;
                if rows.len() > limit {
                    rows.truncate(limit);
                    truncated = true;
                }
            }
            ExecutionOutcome::Rows {
                columns,
                row_count: rows.len(),
                rows,
                truncated,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use nbsql_db::testing::ScriptedDriver;
    use nbsql_db::{ConnectionProfile, MemoryProfileStore, PoolConfig, SafetyProfile};

    struct Harness {
        driver: ScriptedDriver,
        pool: Arc<ConnectionPool>,
        sessions: Arc<SessionRegistry>,
        pipeline: Arc<ExecutionPipeline>,
    }

    fn harness_with(
        driver: ScriptedDriver,
        connection: ConnectionProfile,
        safety: Vec<SafetyProfile>,
        pool_config: PoolConfig,
    ) -> Harness {
        let profiles: Arc<dyn ProfileStore> =
            Arc::new(MemoryProfileStore::new(vec![connection], safety).expect("profiles"));
        let pool = ConnectionPool::new(pool_config, Arc::new(driver.clone()), Arc::clone(&profiles));
        let sessions = Arc::new(SessionRegistry::new());
        let pipeline = Arc::new(ExecutionPipeline::new(
            Arc::clone(&pool),
            Arc::clone(&sessions),
            profiles,
            PipelineConfig {
                cancel_grace: Duration::from_millis(200),
                default_timeout: None,
            },
        ));
        sessions.get_or_create("doc");
        sessions.bind("doc", "local").expect("bind");
        Harness {
            driver,
            pool,
            sessions,
            pipeline,
        }
    }

    fn harness(driver: ScriptedDriver, safety: Option<SafetyProfile>) -> Harness {
        let bind_safety = safety.as_ref().map(|s| s.id.clone());
        let h = harness_with(
            driver,
            ConnectionProfile::new("local", "localhost", "app"),
            safety.into_iter().collect(),
            PoolConfig {
                max_per_profile: 1,
                ..PoolConfig::default()
            },
        );
        if let Some(id) = bind_safety {
            h.sessions
                .set_active_safety_profile("doc", Some(&id))
                .expect("safety");
        }
        h
    }

    fn limited(limit: u32) -> SafetyProfile {
        let mut profile = SafetyProfile::new("capped", "Capped");
        profile.auto_limit_select_results = limit;
        profile
    }

    async fn wait_for_state(sessions: &SessionRegistry, state: SessionState) {
        for _ in 0..1000 {
            if sessions.status("doc").map(|s| s.state) == Some(state) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("session never reached {state:?}");
    }

    #[tokio::test]
    async fn read_only_rejects_writes_without_touching_the_pool() {
        let mut safety = SafetyProfile::new("ro", "Read only");
        safety.read_only = true;
        let h = harness(ScriptedDriver::new(), Some(safety));

        let err = h
            .pipeline
            .execute(ExecutionRequest::new("doc", "DELETE FROM t"))
            .await
            .expect_err("rejected");
        assert!(matches!(err, ExecError::ReadOnlyViolation { kind: StatementKind::Write, .. }));
        assert_eq!(h.pool.stats().acquires, 0);
        assert_eq!(h.driver.stats().connects, 0);
        assert_eq!(h.sessions.status("doc").map(|s| s.state), Some(SessionState::Idle));
    }

    #[tokio::test]
    async fn connection_level_read_only_applies_without_a_safety_profile() {
        let h = harness_with(
            ScriptedDriver::new(),
            ConnectionProfile::new("local", "localhost", "app").read_only(true),
            Vec::new(),
            PoolConfig::default(),
        );
        let err = h
            .pipeline
            .execute(ExecutionRequest::new("doc", "UPDATE t SET a = 1"))
            .await
            .expect_err("rejected");
        assert_eq!(err.kind(), "ReadOnlyViolation");
        assert_eq!(h.pool.stats().acquires, 0);
        let ok = h
            .pipeline
            .execute(ExecutionRequest::new("doc", "SELECT 1"))
            .await
            .expect("reads still run");
        assert_eq!(ok.statement, StatementKind::Read);
    }

    #[tokio::test]
    async fn auto_limit_truncates_large_results() {
        let driver = ScriptedDriver::new()
            .with_counted_table("big_table", 100)
            .with_counted_table("small_table", 3);
        let h = harness(driver, Some(limited(5)));

        let big = h
            .pipeline
            .execute(ExecutionRequest::new("doc", "SELECT * FROM big_table"))
            .await
            .expect("big");
        match &big.outcome {
            ExecutionOutcome::Rows { rows, row_count, truncated, .. } => {
                assert_eq!(rows.len(), 5);
                assert_eq!(*row_count, 5);
                assert!(*truncated);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(big.row_limit, Some(5));
        assert!(h
            .driver
            .executed_sql()
            .contains(&"SELECT * FROM big_table LIMIT 6".to_string()));

        let small = h
            .pipeline
            .execute(ExecutionRequest::new("doc", "SELECT * FROM small_table"))
            .await
            .expect("small");
        match small.outcome {
            ExecutionOutcome::Rows { rows, truncated, .. } => {
                assert_eq!(rows.len(), 3);
                assert!(!truncated);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn explicit_limit_is_left_alone() {
        let driver = ScriptedDriver::new().with_counted_table("big_table", 100);
        let h = harness(driver, Some(limited(5)));
        let result = h
            .pipeline
            .execute(ExecutionRequest::new("doc", "SELECT * FROM big_table LIMIT 20"))
            .await
            .expect("result");
        assert_eq!(result.row_limit, None);
        match result.outcome {
            ExecutionOutcome::Rows { rows, truncated, .. } => {
                assert_eq!(rows.len(), 20);
                assert!(!truncated);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    fn assert_capped(result: &ExecutionResult, limit: usize) {
        match &result.outcome {
            ExecutionOutcome::Rows { rows, row_count, truncated, .. } => {
                assert_eq!(rows.len(), limit);
                assert_eq!(*row_count, limit);
                assert!(*truncated);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(result.row_limit, Some(limit as u32));
    }

    #[tokio::test]
    async fn read_batches_are_trimmed() {
        let driver = ScriptedDriver::new().with_counted_table("big_table", 100);
        let h = harness(driver, Some(limited(5)));
        let result = h
            .pipeline
            .execute(ExecutionRequest::new("doc", "SELECT * FROM big_table; SELECT 1"))
            .await
            .expect("batch");
        assert_eq!(result.statement, StatementKind::Read);
        assert_capped(&result, 5);
        assert_eq!(
            h.driver.executed_sql(),
            vec!["SELECT * FROM big_table; SELECT 1".to_string()]
        );
    }

    #[tokio::test]
    async fn locking_reads_are_capped() {
        let driver = ScriptedDriver::new().with_counted_table("big_table", 100);
        let h = harness(driver, Some(limited(5)));
        let result = h
            .pipeline
            .execute(ExecutionRequest::new("doc", "SELECT * FROM big_table FOR UPDATE"))
            .await
            .expect("locking read");
        assert_capped(&result, 5);
        assert_eq!(
            h.driver.executed_sql(),
            vec!["SELECT * FROM big_table FOR UPDATE LIMIT 6".to_string()]
        );
    }

    #[tokio::test]
    async fn limit_all_is_capped() {
        let driver = ScriptedDriver::new().with_counted_table("big_table", 100);
        let h = harness(driver, Some(limited(5)));
        let result = h
            .pipeline
            .execute(ExecutionRequest::new("doc", "SELECT * FROM big_table LIMIT ALL"))
            .await
            .expect("limit all");
        assert_capped(&result, 5);
        assert_eq!(
            h.driver.executed_sql(),
            vec!["SELECT * FROM big_table LIMIT 6".to_string()]
        );
    }

    #[tokio::test]
    async fn writes_report_affected_rows() {
        let h = harness(ScriptedDriver::new(), None);
        let result = h
            .pipeline
            .execute(ExecutionRequest::new("doc", "UPDATE t SET a = 1"))
            .await
            .expect("update");
        assert_eq!(result.outcome, ExecutionOutcome::Affected { count: 1 });
        assert_eq!(result.statement, StatementKind::Write);
        assert_eq!(h.pool.leased_count("local"), 0);
    }

    #[tokio::test]
    async fn busy_session_rejects_until_cancelled_execution_returns() {
        let h = harness(ScriptedDriver::new(), None);
        let token = CancelToken::new();
        let pipeline = Arc::clone(&h.pipeline);
        let request = ExecutionRequest::new("doc", "SELECT pg_sleep(600)").with_cancel(token.clone());
        let running = tokio::spawn(async move { pipeline.execute(request).await });
        wait_for_state(&h.sessions, SessionState::Executing).await;

        let err = h
            .pipeline
            .execute(ExecutionRequest::new("doc", "SELECT 1"))
            .await
            .expect_err("busy");
        assert_eq!(err, ExecError::SessionBusy("doc".into()));

        token.cancel();
        let result = running.await.expect("join").expect("cancelled is not an error");
        assert!(result.is_cancelled());
        assert_eq!(h.driver.stats().cancels, 1);
        assert_eq!(h.sessions.status("doc").map(|s| s.state), Some(SessionState::Idle));
        assert_eq!(h.pool.leased_count("local"), 0);

        // The single pooled connection is free again.
        let lease = tokio::time::timeout(Duration::from_millis(100), h.pool.acquire("local"))
            .await
            .expect("acquire did not block")
            .expect("lease");
        assert_eq!(Some(lease.backend_pid()), result.backend_pid);
    }

    #[tokio::test]
    async fn registry_cancel_reaches_the_running_statement() {
        let h = harness(ScriptedDriver::new(), None);
        let pipeline = Arc::clone(&h.pipeline);
        let running = tokio::spawn(async move {
            pipeline
                .execute(ExecutionRequest::new("doc", "SELECT pg_sleep(600)"))
                .await
        });
        wait_for_state(&h.sessions, SessionState::Executing).await;
        assert_eq!(h.sessions.cancel("doc"), Ok(true));
        let result = running.await.expect("join").expect("result");
        assert!(result.is_cancelled());
        assert_eq!(h.sessions.status("doc").map(|s| s.state), Some(SessionState::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn statement_timeout_is_a_failure() {
        let mut safety = SafetyProfile::new("quick", "Quick");
        safety.statement_timeout_ms = Some(50);
        let h = harness(ScriptedDriver::new(), Some(safety));
        let err = h
            .pipeline
            .execute(ExecutionRequest::new("doc", "SELECT pg_sleep(600)"))
            .await
            .expect_err("timed out");
        assert_eq!(err, ExecError::Timeout { after_ms: 50 });
        assert_eq!(h.sessions.status("doc").map(|s| s.state), Some(SessionState::Idle));
        assert_eq!(h.pool.free_count("local"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_is_discarded_when_cancel_does_not_land() {
        let driver = ScriptedDriver::new();
        driver.ignore_cancel(true);
        let h = harness(driver, None);
        let token = CancelToken::new();
        let pipeline = Arc::clone(&h.pipeline);
        let request = ExecutionRequest::new("doc", "SELECT pg_sleep(600)").with_cancel(token.clone());
        let running = tokio::spawn(async move { pipeline.execute(request).await });
        wait_for_state(&h.sessions, SessionState::Executing).await;
        token.cancel();
        let result = running.await.expect("join").expect("result");
        assert!(result.is_cancelled());
        assert_eq!(h.pool.stats().discards, 1);
        assert_eq!(h.pool.free_count("local"), 0);
        assert_eq!(h.driver.stats().closes, 1);
    }

    #[tokio::test]
    async fn driver_errors_are_reported_verbatim() {
        let driver = ScriptedDriver::new();
        driver.respond_with(|sql| {
            sql.contains("missing").then(|| {
                Err(DriverError::Query {
                    code: Some("42P01".into()),
                    message: "relation \"missing\" does not exist".into(),
                })
            })
        });
        let h = harness(driver, None);
        let err = h
            .pipeline
            .execute(ExecutionRequest::new("doc", "SELECT * FROM missing"))
            .await
            .expect_err("driver error");
        assert_eq!(err.kind(), "DriverError");
        assert_eq!(err.to_string(), "relation \"missing\" does not exist");
        assert_eq!(h.pool.free_count("local"), 1);
        assert_eq!(h.sessions.status("doc").map(|s| s.state), Some(SessionState::Idle));
    }

    #[tokio::test]
    async fn fatal_driver_errors_discard_the_connection() {
        let driver = ScriptedDriver::new();
        driver.respond_with(|_| Some(Err(DriverError::ConnectionClosed("eof".into()))));
        let h = harness(driver, None);
        let err = h
            .pipeline
            .execute(ExecutionRequest::new("doc", "SELECT 1"))
            .await
            .expect_err("fatal");
        assert!(matches!(err, ExecError::Driver(DriverError::ConnectionClosed(_))));
        assert_eq!(h.pool.stats().discards, 1);
        assert_eq!(h.pool.free_count("local"), 0);
    }

    #[tokio::test]
    async fn connect_failures_surface_as_connect_failed() {
        let driver = ScriptedDriver::new();
        driver.fail_connects(true);
        let h = harness(driver, None);
        let err = h
            .pipeline
            .execute(ExecutionRequest::new("doc", "SELECT 1"))
            .await
            .expect_err("connect");
        assert_eq!(err.kind(), "ConnectFailed");
        assert_eq!(h.sessions.status("doc").map(|s| s.state), Some(SessionState::Idle));
    }

    #[tokio::test]
    async fn destroying_a_session_mid_statement_cancels_it() {
        let h = harness(ScriptedDriver::new(), None);
        let pipeline = Arc::clone(&h.pipeline);
        let running = tokio::spawn(async move {
            pipeline
                .execute(ExecutionRequest::new("doc", "SELECT pg_sleep(600)"))
                .await
        });
        wait_for_state(&h.sessions, SessionState::Executing).await;
        assert!(h.sessions.destroy("doc").is_some());
        let result = running.await.expect("join").expect("result");
        assert!(result.is_cancelled());
        assert!(h.sessions.status("doc").is_none());
        assert_eq!(h.pool.leased_count("local"), 0);
    }

    #[tokio::test]
    async fn unknown_safety_profile_is_reported() {
        let h = harness(ScriptedDriver::new(), None);
        h.sessions
            .set_active_safety_profile("doc", Some("ghost"))
            .expect("set");
        let err = h
            .pipeline
            .execute(ExecutionRequest::new("doc", "SELECT 1"))
            .await
            .expect_err("unknown");
        assert_eq!(err, ExecError::UnknownProfile("ghost".into()));
    }
}
