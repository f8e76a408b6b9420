//! Scripted in-memory driver for tests.
//!
//! Serves canned tables for `SELECT ... FROM <table>` (honoring a trailing
//! `LIMIT n`), answers every other statement with one affected row, and runs
//! `pg_sleep` statements until the connection is cancelled.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::driver::{BackendPid, Cell, Column, DriverError, QueryOutput, SqlConnection, SqlDriver};
use crate::profile::ConnectionProfile;

type Responder = dyn Fn(&str) -> Option<Result<QueryOutput, DriverError>> + Send + Sync;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScriptedStats {
    pub connects: u64,
    pub pings: u64,
    pub queries: u64,
    pub closes: u64,
    pub cancels: u64,
    pub backend_cancels: u64,
    pub terminates: u64,
}

#[derive(Default)]
struct Shared {
    next_pid: AtomicI32,
    connects: AtomicU64,
    pings: AtomicU64,
    queries: AtomicU64,
    closes: AtomicU64,
    cancels: AtomicU64,
    backend_cancels: AtomicU64,
    terminates: AtomicU64,
    fail_connects: AtomicBool,
    fail_pings: AtomicBool,
    ignore_cancel: AtomicBool,
    fail_close: Mutex<HashSet<BackendPid>>,
    tables: Mutex<HashMap<String, (Vec<Column>, Vec<Vec<Cell>>)>>,
    log: Mutex<Vec<(BackendPid, String)>>,
    responder: Mutex<Option<Arc<Responder>>>,
    signalled: Mutex<Vec<(&'static str, BackendPid)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone, Default)]
pub struct ScriptedDriver {
    shared: Arc<Shared>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        let driver = Self::default();
        driver.shared.next_pid.store(1000, Ordering::SeqCst);
        driver
    }

    /// Registers a table served to `SELECT ... FROM <name>`.
    pub fn with_table(self, name: &str, columns: &[&str], rows: Vec<Vec<Cell>>) -> Self {
        lock(&self.shared.tables).insert(
            name.to_ascii_lowercase(),
            (columns.iter().map(|c| Column::new(*c)).collect(), rows),
        );
        self
    }

    /// Registers `name` with `count` rows of a single `id` column.
    pub fn with_counted_table(self, name: &str, count: usize) -> Self {
        let rows = (1..=count).map(|id| vec![Some(id.to_string())]).collect();
        self.with_table(name, &["id"], rows)
    }

    /// Overrides the default behavior; returning `None` falls through to it.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&str) -> Option<Result<QueryOutput, DriverError>> + Send + Sync + 'static,
    {
        *lock(&self.shared.responder) = Some(Arc::new(responder));
    }

    pub fn fail_connects(&self, fail: bool) {
        self.shared.fail_connects.store(fail, Ordering::SeqCst);
    }

    pub fn fail_pings(&self, fail: bool) {
        self.shared.fail_pings.store(fail, Ordering::SeqCst);
    }

    pub fn ignore_cancel(&self, ignore: bool) {
        self.shared.ignore_cancel.store(ignore, Ordering::SeqCst);
    }

    pub fn fail_close_for(&self, pid: BackendPid) {
        lock(&self.shared.fail_close).insert(pid);
    }

    /// Every statement that reached a connection, with the connection's pid.
    pub fn executed(&self) -> Vec<(BackendPid, String)> {
        lock(&self.shared.log).clone()
    }

    pub fn executed_sql(&self) -> Vec<String> {
        self.executed().into_iter().map(|(_, sql)| sql).collect()
    }

    /// Backend signals sent through `cancel_backend` / `terminate_backend`.
    pub fn signalled(&self) -> Vec<(&'static str, BackendPid)> {
        lock(&self.shared.signalled).clone()
    }

    pub fn stats(&self) -> ScriptedStats {
        let s = &self.shared;
        ScriptedStats {
            connects: s.connects.load(Ordering::SeqCst),
            pings: s.pings.load(Ordering::SeqCst),
            queries: s.queries.load(Ordering::SeqCst),
            closes: s.closes.load(Ordering::SeqCst),
            cancels: s.cancels.load(Ordering::SeqCst),
            backend_cancels: s.backend_cancels.load(Ordering::SeqCst),
            terminates: s.terminates.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl SqlDriver for ScriptedDriver {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn connect(
        &self,
        profile: &ConnectionProfile,
    ) -> Result<Box<dyn SqlConnection>, DriverError> {
        if self.shared.fail_connects.load(Ordering::SeqCst) {
            return Err(DriverError::Connect(format!(
                "connection refused by {}:{}",
                profile.host, profile.port
            )));
        }
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        let pid = self.shared.next_pid.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedConnection {
            pid,
            shared: Arc::clone(&self.shared),
            cancel_requested: AtomicBool::new(false),
            wake: Notify::new(),
        }))
    }
}

struct ScriptedConnection {
    pid: BackendPid,
    shared: Arc<Shared>,
    cancel_requested: AtomicBool,
    wake: Notify,
}

impl ScriptedConnection {
    async fn sleep_until_cancelled(&self) -> Result<QueryOutput, DriverError> {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.cancel_requested.swap(false, Ordering::SeqCst) {
                return Err(DriverError::Cancelled);
            }
            notified.await;
        }
    }

    fn select_from_table(&self, sql: &str) -> Option<QueryOutput> {
        let upper = sql.to_ascii_uppercase();
        let from = upper.find(" FROM ")?;
        let rest = &sql[from + 6..];
        let name: String = rest
            .trim_start()
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '.')
            .collect();
        let tables = lock(&self.shared.tables);
        let (columns, rows) = tables.get(&name.to_ascii_lowercase())?;
        let limit = trailing_limit(&upper).unwrap_or(usize::MAX);
        Some(QueryOutput::Rows {
            columns: columns.clone(),
            rows: rows.iter().take(limit).cloned().collect(),
        })
    }
}

fn trailing_limit(upper: &str) -> Option<usize> {
    let idx = upper.rfind(" LIMIT ")?;
    upper[idx + 7..]
        .trim()
        .trim_end_matches(';')
        .trim()
        .parse()
        .ok()
}

#[async_trait]
impl SqlConnection for ScriptedConnection {
    fn backend_pid(&self) -> BackendPid {
        self.pid
    }

    async fn ping(&self) -> Result<(), DriverError> {
        self.shared.pings.fetch_add(1, Ordering::SeqCst);
        if self.shared.fail_pings.load(Ordering::SeqCst) {
            return Err(DriverError::ConnectionClosed("server closed the connection".into()));
        }
        Ok(())
    }

    async fn query(&self, sql: &str) -> Result<QueryOutput, DriverError> {
        self.shared.queries.fetch_add(1, Ordering::SeqCst);
        lock(&self.shared.log).push((self.pid, sql.to_string()));
        let responder = lock(&self.shared.responder).clone();
        if let Some(responder) = responder {
            if let Some(reply) = responder(sql) {
                return reply;
            }
        }
        if sql.to_ascii_lowercase().contains("pg_sleep") {
            return self.sleep_until_cancelled().await;
        }
        if let Some(output) = self.select_from_table(sql) {
            return Ok(output);
        }
        let upper = sql.trim_start().to_ascii_uppercase();
        if upper.starts_with("SELECT") || upper.starts_with("EXPLAIN") || upper.starts_with("SHOW") {
            return Ok(QueryOutput::Rows {
                columns: vec![Column::new("?column?")],
                rows: vec![vec![Some("1".into())]],
            });
        }
        Ok(QueryOutput::Affected(1))
    }

    async fn cancel_current(&self) -> Result<(), DriverError> {
        self.shared.cancels.fetch_add(1, Ordering::SeqCst);
        if self.shared.ignore_cancel.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
        Ok(())
    }

    async fn cancel_backend(&self, pid: BackendPid) -> Result<bool, DriverError> {
        self.shared.backend_cancels.fetch_add(1, Ordering::SeqCst);
        lock(&self.shared.signalled).push(("cancel", pid));
        Ok(true)
    }

    async fn terminate_backend(&self, pid: BackendPid) -> Result<bool, DriverError> {
        self.shared.terminates.fetch_add(1, Ordering::SeqCst);
        lock(&self.shared.signalled).push(("terminate", pid));
        Ok(true)
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
        if lock(&self.shared.fail_close).contains(&self.pid) {
            return Err(DriverError::ConnectionClosed(format!(
                "synthetic close failure for pid {}",
                self.pid
            )));
        }
        Ok(())
    }
}
