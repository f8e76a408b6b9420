//! Live activity and lock snapshots pulled from the server catalog.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use nbsql_db::{BackendPid, Cell, ConnectionPool, DriverError, PoolStats, ProfileId, QueryOutput};

use crate::commands::{OutboundMessage, Outbox};
use crate::error::ExecError;
use crate::lockgraph::{self, LockForest, LockRow};
use crate::session::{SessionRegistry, SessionStatus};

pub const ACTIVITY_SQL: &str = "\
SELECT pid,
       usename AS user_name,
       datname AS database,
       application_name,
       client_addr::text AS client_addr,
       state,
       wait_event_type,
       wait_event,
       (EXTRACT(EPOCH FROM now() - query_start) * 1000)::bigint AS duration_ms,
       left(query, 4000) AS query
FROM pg_stat_activity
WHERE datname = current_database()
  AND backend_type = 'client backend'
ORDER BY pid";

pub const LOCKS_SQL: &str = "\
SELECT blocker.pid AS blocking_pid,
       blocked.pid AS blocked_pid,
       coalesce(waiting.mode, '') AS lock_mode,
       coalesce(waiting.relation::regclass::text, waiting.locktype, '') AS locked_object,
       coalesce(blocker.usename, '') AS blocking_user,
       coalesce(left(blocker.query, 4000), '') AS blocking_query,
       coalesce(blocked.usename, '') AS blocked_user,
       coalesce(left(blocked.query, 4000), '') AS blocked_query
FROM pg_stat_activity AS blocked
JOIN LATERAL unnest(pg_blocking_pids(blocked.pid)) AS holder(pid) ON true
JOIN pg_stat_activity AS blocker ON blocker.pid = holder.pid
LEFT JOIN LATERAL (
    SELECT l.mode, l.relation, l.locktype
    FROM pg_locks AS l
    WHERE l.pid = blocked.pid AND NOT l.granted
    LIMIT 1
) AS waiting ON true
ORDER BY blocked.pid, blocker.pid";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ActivityRow {
    pub pid: BackendPid,
    pub user: Option<String>,
    pub database: Option<String>,
    pub application: Option<String>,
    pub client_addr: Option<String>,
    pub state: Option<String>,
    pub wait_event_type: Option<String>,
    pub wait_event: Option<String>,
    pub duration_ms: Option<i64>,
    pub query: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsCounters {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub idle_in_transaction: usize,
    /// Backends waiting on a heavyweight lock.
    pub waiting: usize,
    pub blocked: usize,
    pub blockers: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub profile: ProfileId,
    pub monitor_pid: BackendPid,
    pub connections: Vec<ActivityRow>,
    pub queries: Vec<ActivityRow>,
    pub locks: Vec<LockRow>,
    pub lock_forest: LockForest,
    pub counters: StatsCounters,
    pub pool: PoolStats,
    pub sessions: Vec<SessionStatus>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailsKind {
    Connections,
    Queries,
    Locks,
}

/// Drill-down table for one part of a snapshot.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetailsTable {
    #[serde(rename = "type")]
    pub kind: DetailsKind,
    pub data: Vec<Value>,
    pub columns: Vec<String>,
}

const ACTIVITY_COLUMNS: &[&str] = &[
    "pid",
    "user",
    "database",
    "application",
    "client_addr",
    "state",
    "wait_event_type",
    "wait_event",
    "duration_ms",
    "query",
];

const LOCK_COLUMNS: &[&str] = &[
    "blocking_pid",
    "blocked_pid",
    "lock_mode",
    "locked_object",
    "blocking_user",
    "blocking_query",
    "blocked_user",
    "blocked_query",
];

impl StatsSnapshot {
    pub fn details(&self, kind: DetailsKind) -> DetailsTable {
        let (data, columns): (Vec<Value>, &[&str]) = match kind {
            DetailsKind::Connections => (to_values(&self.connections), ACTIVITY_COLUMNS),
            DetailsKind::Queries => (to_values(&self.queries), ACTIVITY_COLUMNS),
            DetailsKind::Locks => (to_values(&self.locks), LOCK_COLUMNS),
        };
        DetailsTable {
            kind,
            data,
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }
}

fn to_values<T: Serialize>(rows: &[T]) -> Vec<Value> {
    rows.iter()
        .filter_map(|row| serde_json::to_value(row).ok())
        .collect()
}

/// Reads text-format cells by column name.
struct Columns {
    index: HashMap<String, usize>,
}

impl Columns {
    fn of(output: &QueryOutput) -> Option<(Self, &[Vec<Cell>])> {
        match output {
            QueryOutput::Rows { columns, rows } => {
                let index = columns
                    .iter()
                    .enumerate()
                    .map(|(i, c)| (c.name.clone(), i))
                    .collect();
                Some((Self { index }, rows.as_slice()))
            }
            QueryOutput::Affected(_) => None,
        }
    }

    fn text(&self, row: &[Cell], name: &str) -> Option<String> {
        let idx = *self.index.get(name)?;
        row.get(idx).cloned().flatten()
    }

    fn parse<T: FromStr>(&self, row: &[Cell], name: &str) -> Option<T> {
        self.text(row, name)?.trim().parse().ok()
    }
}

pub fn parse_activity(output: &QueryOutput) -> Vec<ActivityRow> {
    let Some((cols, rows)) = Columns::of(output) else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            Some(ActivityRow {
                pid: cols.parse(row, "pid")?,
                user: cols.text(row, "user_name"),
                database: cols.text(row, "database"),
                application: cols.text(row, "application_name"),
                client_addr: cols.text(row, "client_addr"),
                state: cols.text(row, "state"),
                wait_event_type: cols.text(row, "wait_event_type"),
                wait_event: cols.text(row, "wait_event"),
                duration_ms: cols.parse(row, "duration_ms"),
                query: cols.text(row, "query"),
            })
        })
        .collect()
}

pub fn parse_locks(output: &QueryOutput) -> Vec<LockRow> {
    let Some((cols, rows)) = Columns::of(output) else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            Some(LockRow {
                blocking_pid: cols.parse(row, "blocking_pid")?,
                blocked_pid: cols.parse(row, "blocked_pid")?,
                lock_mode: cols.text(row, "lock_mode").unwrap_or_default(),
                locked_object: cols.text(row, "locked_object").unwrap_or_default(),
                blocking_user: cols.text(row, "blocking_user").unwrap_or_default(),
                blocking_query: cols.text(row, "blocking_query").unwrap_or_default(),
                blocked_user: cols.text(row, "blocked_user").unwrap_or_default(),
                blocked_query: cols.text(row, "blocked_query").unwrap_or_default(),
            })
        })
        .collect()
}

fn count_state(rows: &[ActivityRow], predicate: impl Fn(&str) -> bool) -> usize {
    rows.iter()
        .filter(|row| row.state.as_deref().is_some_and(&predicate))
        .count()
}

pub struct Monitor {
    pool: Arc<ConnectionPool>,
    sessions: Arc<SessionRegistry>,
}

impl Monitor {
    pub fn new(pool: Arc<ConnectionPool>, sessions: Arc<SessionRegistry>) -> Self {
        Self { pool, sessions }
    }

    /// Takes one snapshot through a pooled connection for `profile`.
    pub async fn snapshot(&self, profile: &str) -> Result<StatsSnapshot, ExecError> {
        let lease = self.pool.acquire(profile).await?;
        let monitor_pid = lease.backend_pid();
        let fetched = async {
            let activity = lease.connection().query(ACTIVITY_SQL).await?;
            let locks = lease.connection().query(LOCKS_SQL).await?;
            Ok::<_, DriverError>((activity, locks))
        }
        .await;
        let (activity, locks) = match fetched {
            Ok(outputs) => {
                self.pool.release(lease);
                outputs
            }
            Err(err) => {
                if err.is_fatal() {
                    lease.discard().await;
                } else {
                    self.pool.release(lease);
                }
                return Err(err.into());
            }
        };

        let connections = parse_activity(&activity);
        let locks = parse_locks(&locks);
        let lock_forest = lockgraph::build(&locks);
        let queries: Vec<ActivityRow> = connections
            .iter()
            .filter(|row| row.pid != monitor_pid)
            .filter(|row| row.state.as_deref().is_some_and(|state| state != "idle"))
            .cloned()
            .collect();
        let counters = StatsCounters {
            total: connections.len(),
            active: count_state(&connections, |s| s == "active"),
            idle: count_state(&connections, |s| s == "idle"),
            idle_in_transaction: count_state(&connections, |s| s.starts_with("idle in transaction")),
            waiting: connections
                .iter()
                .filter(|row| row.wait_event_type.as_deref() == Some("Lock"))
                .count(),
            blocked: lock_forest.waiters.len(),
            blockers: lock_forest.blockers.len(),
        };
        Ok(StatsSnapshot {
            profile: profile.to_string(),
            monitor_pid,
            connections,
            queries,
            locks,
            lock_forest,
            counters,
            pool: self.pool.stats(),
            sessions: self.sessions.snapshot(),
        })
    }

    /// Posts an `updateStats` message every `every` until the outbox or the
    /// pool closes.
    pub fn spawn_poller(
        self: &Arc<Self>,
        profile: ProfileId,
        every: Duration,
        outbox: Outbox,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if outbox.is_closed() {
                    break;
                }
                match monitor.snapshot(&profile).await {
                    Ok(stats) => {
                        let message = OutboundMessage::UpdateStats {
                            stats: Box::new(stats),
                        };
                        if outbox.send(message).is_err() {
                            break;
                        }
                    }
                    Err(ExecError::Closed) => break,
                    Err(err) => {
                        tracing::warn!(profile = %profile, error = %err, "monitor poll failed");
                    }
                }
            }
            tracing::debug!(profile = %profile, "monitor poller stopped");
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use nbsql_db::testing::ScriptedDriver;
    use nbsql_db::{Column, ConnectionProfile, MemoryProfileStore, PoolConfig, ProfileStore};

    fn cell(value: &str) -> Cell {
        Some(value.to_string())
    }

    fn rows(columns: &[&str], data: Vec<Vec<Cell>>) -> QueryOutput {
        QueryOutput::Rows {
            columns: columns.iter().map(|c| Column::new(*c)).collect(),
            rows: data,
        }
    }

    /// Scripted catalog: pid 200 blocks 300, which blocks 400.
    pub(crate) fn catalog_driver() -> ScriptedDriver {
        let driver = ScriptedDriver::new();
        driver.respond_with(|sql| {
            if sql.contains("pg_blocking_pids") {
                let lock = |blocking: &str, blocked: &str| {
                    vec![
                        cell(blocking),
                        cell(blocked),
                        cell("ShareLock"),
                        cell("public.accounts"),
                        cell("alice"),
                        cell("UPDATE accounts SET balance = 0"),
                        cell("bob"),
                        cell("UPDATE accounts SET balance = 1"),
                    ]
                };
                return Some(Ok(rows(
                    LOCK_COLUMNS,
                    vec![lock("200", "300"), lock("300", "400")],
                )));
            }
            if sql.contains("pg_stat_activity") {
                let activity = |pid: &str, state: Option<&str>, wait: Option<&str>| {
                    vec![
                        cell(pid),
                        cell("alice"),
                        cell("app"),
                        cell("psql"),
                        None,
                        state.map(str::to_string),
                        wait.map(str::to_string),
                        None,
                        cell("1500"),
                        cell("SELECT 1"),
                    ]
                };
                return Some(Ok(rows(
                    &[
                        "pid",
                        "user_name",
                        "database",
                        "application_name",
                        "client_addr",
                        "state",
                        "wait_event_type",
                        "wait_event",
                        "duration_ms",
                        "query",
                    ],
                    vec![
                        activity("1000", Some("active"), None),
                        activity("200", Some("idle in transaction"), None),
                        activity("300", Some("active"), Some("Lock")),
                        activity("400", Some("active"), Some("Lock")),
                        activity("500", Some("idle"), None),
                    ],
                )));
            }
            None
        });
        driver
    }

    fn monitor(driver: &ScriptedDriver) -> Arc<Monitor> {
        let profiles: Arc<dyn ProfileStore> = Arc::new(
            MemoryProfileStore::new(vec![ConnectionProfile::new("local", "h", "app")], Vec::new())
                .expect("profiles"),
        );
        let pool = ConnectionPool::new(PoolConfig::default(), Arc::new(driver.clone()), profiles);
        Arc::new(Monitor::new(pool, Arc::new(SessionRegistry::new())))
    }

    #[tokio::test]
    async fn snapshot_aggregates_activity_and_locks() {
        let driver = catalog_driver();
        let stats = monitor(&driver).snapshot("local").await.expect("snapshot");
        assert_eq!(stats.monitor_pid, 1000);
        assert_eq!(stats.connections.len(), 5);
        // The monitor's own backend and idle sessions are not "queries".
        let query_pids: Vec<BackendPid> = stats.queries.iter().map(|q| q.pid).collect();
        assert_eq!(query_pids, vec![200, 300, 400]);
        assert_eq!(
            stats.counters,
            StatsCounters {
                total: 5,
                active: 3,
                idle: 1,
                idle_in_transaction: 1,
                waiting: 2,
                blocked: 2,
                blockers: 2,
            }
        );
        assert_eq!(stats.lock_forest.roots.len(), 1);
        assert_eq!(stats.lock_forest.roots[0].pid, 200);
        assert_eq!(stats.pool.acquires, 1);
        assert_eq!(stats.connections[1].duration_ms, Some(1500));
    }

    #[tokio::test]
    async fn details_tables_carry_their_columns() {
        let driver = catalog_driver();
        let stats = monitor(&driver).snapshot("local").await.expect("snapshot");
        let locks = stats.details(DetailsKind::Locks);
        assert_eq!(locks.columns.len(), LOCK_COLUMNS.len());
        assert_eq!(locks.data.len(), 2);
        assert_eq!(locks.data[0]["blocking_pid"], 200);
        let queries = stats.details(DetailsKind::Queries);
        assert_eq!(queries.data.len(), 3);
        assert_eq!(
            serde_json::to_value(&queries).expect("json")["type"],
            "queries"
        );
    }

    #[test]
    fn rows_without_a_pid_are_skipped() {
        let output = rows(&["pid", "state"], vec![vec![None, cell("idle")], vec![cell("7"), None]]);
        let parsed = parse_activity(&output);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].pid, 7);
        assert!(parse_locks(&QueryOutput::Affected(0)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn poller_posts_update_stats() {
        let driver = catalog_driver();
        let (outbox, mut inbox) = tokio::sync::mpsc::unbounded_channel();
        let poller = monitor(&driver).spawn_poller("local".into(), Duration::from_secs(5), outbox);
        for _ in 0..2 {
            match inbox.recv().await {
                Some(OutboundMessage::UpdateStats { stats }) => assert_eq!(stats.profile, "local"),
                other => panic!("unexpected message {other:?}"),
            }
        }
        drop(inbox);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(poller.is_finished());
    }
}
