//! Connection and safety profile records, and the read-only store that serves them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub type ProfileId = String;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

/// A named connection target. Replaced wholesale on edit, never mutated.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionProfile {
    pub id: ProfileId,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    #[serde(default)]
    pub user: Option<String>,
    /// Reference into a [`CredentialSource`], e.g. `env:PGPASSWORD`.
    #[serde(default)]
    pub credentials_ref: Option<String>,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub ssl_mode: Option<String>,
}

fn default_port() -> u16 {
    5432
}

impl ConnectionProfile {
    pub fn new(id: impl Into<String>, host: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port: default_port(),
            database: database.into(),
            user: None,
            credentials_ref: None,
            environment: Environment::Development,
            read_only: false,
            ssl_mode: None,
        }
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

/// A user-defined execution policy, composable with a connection's own
/// `read_only` flag.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SafetyProfile {
    pub id: ProfileId,
    pub name: String,
    #[serde(default)]
    pub read_only: bool,
    /// Row cap for unlimited reads; 0 disables it.
    #[serde(default)]
    pub auto_limit_select_results: u32,
    #[serde(default)]
    pub statement_timeout_ms: Option<u64>,
}

impl SafetyProfile {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            read_only: false,
            auto_limit_select_results: 0,
            statement_timeout_ms: None,
        }
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

/// Read-only access to profile records owned outside the core.
pub trait ProfileStore: Send + Sync {
    fn connection(&self, id: &str) -> Option<Arc<ConnectionProfile>>;

    fn safety(&self, id: &str) -> Option<Arc<SafetyProfile>>;

    fn connection_ids(&self) -> Vec<ProfileId>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProfileLoadError {
    #[error("invalid profile document: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("duplicate {kind} profile id '{id}'")]
    Duplicate { kind: &'static str, id: String },
    #[error("profile id must not be empty")]
    EmptyId,
}

#[derive(Debug, Default, Deserialize)]
struct ProfileDocument {
    #[serde(default)]
    connections: Vec<ConnectionProfile>,
    #[serde(default)]
    safety_profiles: Vec<SafetyProfile>,
}

/// Immutable in-memory store, typically loaded once from configuration.
#[derive(Debug, Default)]
pub struct MemoryProfileStore {
    connections: BTreeMap<ProfileId, Arc<ConnectionProfile>>,
    safety: BTreeMap<ProfileId, Arc<SafetyProfile>>,
}

impl MemoryProfileStore {
    pub fn new(
        connections: Vec<ConnectionProfile>,
        safety_profiles: Vec<SafetyProfile>,
    ) -> Result<Self, ProfileLoadError> {
        let mut store = Self::default();
        for profile in connections {
            if profile.id.trim().is_empty() {
                return Err(ProfileLoadError::EmptyId);
            }
            let id = profile.id.clone();
            if store
                .connections
                .insert(id.clone(), Arc::new(profile))
                .is_some()
            {
                return Err(ProfileLoadError::Duplicate {
                    kind: "connection",
                    id,
                });
            }
        }
        for profile in safety_profiles {
            if profile.id.trim().is_empty() {
                return Err(ProfileLoadError::EmptyId);
            }
            let id = profile.id.clone();
            if store.safety.insert(id.clone(), Arc::new(profile)).is_some() {
                return Err(ProfileLoadError::Duplicate { kind: "safety", id });
            }
        }
        Ok(store)
    }

    /// Parses `[[connections]]` and `[[safety_profiles]]` tables.
    pub fn from_toml_str(text: &str) -> Result<Self, ProfileLoadError> {
        let doc: ProfileDocument = toml::from_str(text)?;
        Self::new(doc.connections, doc.safety_profiles)
    }
}

impl ProfileStore for MemoryProfileStore {
    fn connection(&self, id: &str) -> Option<Arc<ConnectionProfile>> {
        self.connections.get(id).cloned()
    }

    fn safety(&self, id: &str) -> Option<Arc<SafetyProfile>> {
        self.safety.get(id).cloned()
    }

    fn connection_ids(&self) -> Vec<ProfileId> {
        self.connections.keys().cloned().collect()
    }
}

/// Resolves a profile's `credentials_ref` to a secret.
pub trait CredentialSource: Send + Sync {
    fn resolve(&self, reference: &str) -> Option<String>;
}

/// Resolves `env:NAME` references from the process environment.
#[derive(Clone, Copy, Debug, Default)]
pub struct EnvCredentials;

impl CredentialSource for EnvCredentials {
    fn resolve(&self, reference: &str) -> Option<String> {
        let name = reference.strip_prefix("env:")?.trim();
        if name.is_empty() {
            return None;
        }
        std::env::var(name).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_profiles_from_toml() {
        let store = MemoryProfileStore::from_toml_str(
            r#"
            [[connections]]
            id = "local"
            host = "127.0.0.1"
            database = "app"
            environment = "production"
            read_only = true

            [[safety_profiles]]
            id = "safe"
            name = "Safe reads"
            read_only = true
            auto_limit_select_results = 500
            statement_timeout_ms = 30000
            "#,
        )
        .expect("store");
        let conn = store.connection("local").expect("connection");
        assert_eq!(conn.port, 5432);
        assert_eq!(conn.environment, Environment::Production);
        assert!(conn.read_only);
        let safety = store.safety("safe").expect("safety");
        assert_eq!(safety.auto_limit_select_results, 500);
        assert_eq!(safety.statement_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(store.connection_ids(), vec!["local".to_string()]);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let err = MemoryProfileStore::new(
            vec![
                ConnectionProfile::new("a", "h", "d"),
                ConnectionProfile::new("a", "h2", "d2"),
            ],
            Vec::new(),
        )
        .expect_err("duplicate");
        assert!(matches!(err, ProfileLoadError::Duplicate { kind: "connection", .. }));
    }

    #[test]
    fn zero_timeout_means_none() {
        let mut profile = SafetyProfile::new("p", "P");
        profile.statement_timeout_ms = Some(0);
        assert_eq!(profile.statement_timeout(), None);
    }

    #[test]
    fn env_credentials_require_prefix() {
        assert_eq!(EnvCredentials.resolve("plain-secret"), None);
        assert_eq!(EnvCredentials.resolve("env:"), None);
    }
}
