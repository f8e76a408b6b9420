//! Postgres driver built on tokio-postgres.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::{ClientConfig, RootCertStore};
use tokio::task::AbortHandle;
use tokio_postgres::config::SslMode;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, Error as PgError, NoTls, SimpleQueryMessage};
use tokio_postgres_rustls::MakeRustlsConnect;

use crate::driver::{BackendPid, Cell, Column, DriverError, QueryOutput, SqlConnection, SqlDriver};
use crate::profile::{ConnectionProfile, CredentialSource, EnvCredentials};

#[derive(Clone, Debug)]
pub struct PgDriverConfig {
    pub connect_timeout: Duration,
    pub application_name: String,
    pub ssl_root_cert: Option<std::path::PathBuf>,
}

impl Default for PgDriverConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            application_name: "nbsql".to_string(),
            ssl_root_cert: None,
        }
    }
}

pub struct PgDriver {
    config: PgDriverConfig,
    credentials: Arc<dyn CredentialSource>,
}

impl PgDriver {
    pub fn new(config: PgDriverConfig) -> Self {
        Self {
            config,
            credentials: Arc::new(EnvCredentials),
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialSource>) -> Self {
        self.credentials = credentials;
        self
    }

    fn pg_config(&self, profile: &ConnectionProfile) -> Result<Config, DriverError> {
        let mut pg_config = Config::new();
        pg_config
            .host(&profile.host)
            .port(profile.port)
            .dbname(&profile.database)
            .application_name(&self.config.application_name)
            .connect_timeout(self.config.connect_timeout);
        if let Some(user) = &profile.user {
            pg_config.user(user);
        }
        if let Some(reference) = &profile.credentials_ref {
            let secret = self.credentials.resolve(reference).ok_or_else(|| {
                DriverError::Config(format!("credentials '{reference}' could not be resolved"))
            })?;
            pg_config.password(secret);
        }
        let ssl_mode = match profile.ssl_mode.as_deref().unwrap_or("prefer") {
            "disable" => SslMode::Disable,
            "prefer" => SslMode::Prefer,
            "require" => SslMode::Require,
            other => return Err(DriverError::Config(format!("unsupported ssl_mode '{other}'"))),
        };
        pg_config.ssl_mode(ssl_mode);
        Ok(pg_config)
    }
}

impl Default for PgDriver {
    fn default() -> Self {
        Self::new(PgDriverConfig::default())
    }
}

#[derive(Clone)]
enum PgTls {
    None,
    Rustls(MakeRustlsConnect),
}

pub struct PgConn {
    client: Client,
    cancel_token: tokio_postgres::CancelToken,
    tls: PgTls,
    pid: BackendPid,
    driver_task: AbortHandle,
}

#[async_trait]
impl SqlDriver for PgDriver {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn connect(
        &self,
        profile: &ConnectionProfile,
    ) -> Result<Box<dyn SqlConnection>, DriverError> {
        let pg_config = self.pg_config(profile)?;
        let (client, tls, driver_task) = if pg_config.get_ssl_mode() == SslMode::Disable {
            let (client, connection) = pg_config.connect(NoTls).await.map_err(connect_error)?;
            let profile_id = profile.id.clone();
            let task = tokio::spawn(async move {
                if let Err(err) = connection.await {
                    tracing::warn!(profile = %profile_id, error = %err, "postgres connection error");
                }
            });
            (client, PgTls::None, task.abort_handle())
        } else {
            let tls = build_tls_connector(&self.config)?;
            let (client, connection) = pg_config
                .connect(tls.clone())
                .await
                .map_err(connect_error)?;
            let profile_id = profile.id.clone();
            let task = tokio::spawn(async move {
                if let Err(err) = connection.await {
                    tracing::warn!(profile = %profile_id, error = %err, "postgres connection error");
                }
            });
            (client, PgTls::Rustls(tls), task.abort_handle())
        };
        let pid = match client.query_one("SELECT pg_backend_pid()", &[]).await {
            Ok(row) => row.try_get::<_, i32>(0).map_err(query_error)?,
            Err(err) => {
                driver_task.abort();
                return Err(connect_error(err));
            }
        };
        let cancel_token = client.cancel_token();
        Ok(Box::new(PgConn {
            client,
            cancel_token,
            tls,
            pid,
            driver_task,
        }))
    }
}

#[async_trait]
impl SqlConnection for PgConn {
    fn backend_pid(&self) -> BackendPid {
        self.pid
    }

    async fn ping(&self) -> Result<(), DriverError> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map(|_| ())
            .map_err(query_error)
    }

    async fn query(&self, sql: &str) -> Result<QueryOutput, DriverError> {
        let messages = self.client.simple_query(sql).await.map_err(query_error)?;
        Ok(decode_simple(messages))
    }

    async fn cancel_current(&self) -> Result<(), DriverError> {
        let result = match &self.tls {
            PgTls::None => self.cancel_token.cancel_query(NoTls).await,
            PgTls::Rustls(tls) => self.cancel_token.cancel_query(tls.clone()).await,
        };
        result.map_err(query_error)
    }

    async fn cancel_backend(&self, pid: BackendPid) -> Result<bool, DriverError> {
        self.signal("pg_cancel_backend", pid).await
    }

    async fn terminate_backend(&self, pid: BackendPid) -> Result<bool, DriverError> {
        self.signal("pg_terminate_backend", pid).await
    }

    async fn close(&self) -> Result<(), DriverError> {
        // Dropping the connection future ends the session server-side.
        self.driver_task.abort();
        Ok(())
    }
}

impl PgConn {
    async fn signal(&self, function: &str, pid: BackendPid) -> Result<bool, DriverError> {
        let sql = format!("SELECT {function}($1)");
        let row = self
            .client
            .query_one(sql.as_str(), &[&pid])
            .await
            .map_err(query_error)?;
        row.try_get::<_, bool>(0).map_err(query_error)
    }
}

/// One simple-query protocol message, reduced to what a result grid needs.
#[derive(Debug)]
enum Frame {
    Describe(Vec<Column>),
    Row(Vec<Column>, Vec<Cell>),
    Complete(u64),
}

fn frame(message: SimpleQueryMessage) -> Option<Frame> {
    match message {
        SimpleQueryMessage::RowDescription(description) => Some(Frame::Describe(
            description.iter().map(|c| Column::new(c.name())).collect(),
        )),
        SimpleQueryMessage::Row(row) => Some(Frame::Row(
            row.columns().iter().map(|c| Column::new(c.name())).collect(),
            (0..row.len()).map(|idx| row.get(idx).map(str::to_string)).collect(),
        )),
        SimpleQueryMessage::CommandComplete(count) => Some(Frame::Complete(count)),
        _ => None,
    }
}

/// Folds a simple-query reply into a [`QueryOutput`]. A batch yields the
/// result of its last statement, as psql shows it.
fn decode_simple(messages: Vec<SimpleQueryMessage>) -> QueryOutput {
    fold_frames(messages.into_iter().filter_map(frame))
}

fn fold_frames(frames: impl IntoIterator<Item = Frame>) -> QueryOutput {
    let mut columns: Option<Vec<Column>> = None;
    let mut rows: Vec<Vec<Cell>> = Vec::new();
    let mut last = None;
    for frame in frames {
        match frame {
            Frame::Describe(described) => {
                columns = Some(described);
                rows.clear();
            }
            Frame::Row(row_columns, row) => {
                columns.get_or_insert(row_columns);
                rows.push(row);
            }
            Frame::Complete(count) => {
                last = Some(match columns.take() {
                    Some(columns) => QueryOutput::Rows {
                        columns,
                        rows: std::mem::take(&mut rows),
                    },
                    None => QueryOutput::Affected(count),
                });
            }
        }
    }
    match (columns, last) {
        (Some(columns), _) => QueryOutput::Rows { columns, rows },
        (None, Some(last)) => last,
        (None, None) => QueryOutput::Affected(0),
    }
}

fn connect_error(err: PgError) -> DriverError {
    DriverError::Connect(err.to_string())
}

fn query_error(err: PgError) -> DriverError {
    if err.code() == Some(&SqlState::QUERY_CANCELED) {
        return DriverError::Cancelled;
    }
    if let Some(db) = err.as_db_error() {
        return DriverError::Query {
            code: Some(db.code().code().to_string()),
            message: db.message().to_string(),
        };
    }
    if err.is_closed() {
        return DriverError::ConnectionClosed(err.to_string());
    }
    DriverError::query(err.to_string())
}

fn build_tls_connector(config: &PgDriverConfig) -> Result<MakeRustlsConnect, DriverError> {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for cert in native.certs {
        roots
            .add(cert)
            .map_err(|err| DriverError::Tls(err.to_string()))?;
    }
    if let Some(path) = config.ssl_root_cert.as_ref() {
        let pem = std::fs::read(path).map_err(|err| DriverError::Tls(err.to_string()))?;
        let mut cursor = std::io::Cursor::new(pem);
        let certs = rustls_pemfile::certs(&mut cursor)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| DriverError::Tls(err.to_string()))?;
        for cert in certs {
            roots
                .add(cert)
                .map_err(|err| DriverError::Tls(err.to_string()))?;
        }
    }
    if roots.is_empty() {
        return Err(DriverError::Tls(
            "no root certificates available for TLS".to_string(),
        ));
    }
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(MakeRustlsConnect::new(tls_config))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(values: &[&str]) -> Vec<Cell> {
        values.iter().map(|v| Some(v.to_string())).collect()
    }

    fn columns(names: &[&str]) -> Vec<Column> {
        names.iter().map(|n| Column::new(*n)).collect()
    }

    #[test]
    fn batches_return_the_last_result_set_whole() {
        let output = fold_frames([
            Frame::Describe(columns(&["a"])),
            Frame::Row(columns(&["a"]), text(&["1"])),
            Frame::Complete(1),
            Frame::Describe(columns(&["b", "c"])),
            Frame::Row(columns(&["b", "c"]), text(&["2", "3"])),
            Frame::Complete(1),
        ]);
        assert_eq!(
            output,
            QueryOutput::Rows {
                columns: columns(&["b", "c"]),
                rows: vec![text(&["2", "3"])],
            }
        );
    }

    #[test]
    fn trailing_command_reports_affected_rows() {
        let output = fold_frames([
            Frame::Describe(columns(&["a"])),
            Frame::Row(columns(&["a"]), text(&["1"])),
            Frame::Complete(1),
            Frame::Complete(4),
        ]);
        assert_eq!(output, QueryOutput::Affected(4));
        assert_eq!(fold_frames(Vec::new()), QueryOutput::Affected(0));
    }

    #[test]
    fn empty_result_sets_keep_their_columns() {
        let output = fold_frames([Frame::Describe(columns(&["id"])), Frame::Complete(0)]);
        assert_eq!(
            output,
            QueryOutput::Rows {
                columns: columns(&["id"]),
                rows: Vec::new(),
            }
        );
    }

    #[test]
    fn profile_maps_to_pg_config() {
        let mut profile = ConnectionProfile::new("local", "db.internal", "app");
        profile.port = 6543;
        profile.user = Some("analyst".into());
        profile.ssl_mode = Some("disable".into());
        let config = PgDriver::default().pg_config(&profile).expect("config");
        assert_eq!(config.get_dbname(), Some("app"));
        assert_eq!(config.get_user(), Some("analyst"));
        assert_eq!(config.get_ports(), &[6543]);
        assert_eq!(config.get_ssl_mode(), SslMode::Disable);
    }

    #[test]
    fn unresolvable_credentials_are_a_config_error() {
        let mut profile = ConnectionProfile::new("local", "localhost", "app");
        profile.credentials_ref = Some("env:NBSQL_TEST_SURELY_UNSET_PASSWORD".into());
        let err = PgDriver::default().pg_config(&profile).expect_err("missing secret");
        assert!(matches!(err, DriverError::Config(_)));
    }

    #[test]
    fn unknown_ssl_mode_is_rejected() {
        let mut profile = ConnectionProfile::new("local", "localhost", "app");
        profile.ssl_mode = Some("verify-full".into());
        assert!(PgDriver::default().pg_config(&profile).is_err());
    }
}
