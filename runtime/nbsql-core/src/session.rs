//! Session registry: maps notebook documents to a bound connection profile,
//! an optional safety profile and the backend currently serving them.
//!
//! State transitions that guard execution happen under one lock as a single
//! check-and-set, so two racing `execute` calls on a session cannot both
//! pass the busy check.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;

use nbsql_db::{BackendPid, CancelToken, ProfileId};

use crate::error::ExecError;

pub type SessionKey = String;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unbound,
    Connecting,
    Idle,
    Executing,
    Cancelling,
    Closed,
}

impl SessionState {
    pub fn in_flight(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Executing | SessionState::Cancelling
        )
    }
}

/// Point-in-time view of a session, used for status display.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub key: SessionKey,
    pub profile_id: Option<ProfileId>,
    pub safety_profile_id: Option<ProfileId>,
    pub backend_pid: Option<BackendPid>,
    pub state: SessionState,
    pub executions: u64,
    pub last_elapsed_ms: Option<u64>,
}

struct Session {
    generation: u64,
    profile_id: Option<ProfileId>,
    safety_profile_id: Option<ProfileId>,
    backend_pid: Option<BackendPid>,
    state: SessionState,
    cancel: Option<CancelToken>,
    executions: u64,
    last_elapsed_ms: Option<u64>,
}

impl Session {
    fn status(&self, key: &str) -> SessionStatus {
        SessionStatus {
            key: key.to_string(),
            profile_id: self.profile_id.clone(),
            safety_profile_id: self.safety_profile_id.clone(),
            backend_pid: self.backend_pid,
            state: self.state,
            executions: self.executions,
            last_elapsed_ms: self.last_elapsed_ms,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionKey, Session>,
    next_generation: u64,
}

#[derive(Default)]
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get_or_create(&self, key: &str) -> SessionStatus {
        let mut state = self.lock();
        let generation = state.next_generation;
        let session = state.sessions.entry(key.to_string()).or_insert_with(|| {
            tracing::debug!(session = %key, "session created");
            Session {
                generation,
                profile_id: None,
                safety_profile_id: None,
                backend_pid: None,
                state: SessionState::Unbound,
                cancel: None,
                executions: 0,
                last_elapsed_ms: None,
            }
        });
        let status = session.status(key);
        if session.generation == generation {
            state.next_generation += 1;
        }
        status
    }

    /// Binds the session to a connection profile; only allowed while no
    /// statement is in flight.
    pub fn bind(&self, key: &str, profile_id: &str) -> Result<SessionStatus, ExecError> {
        let mut state = self.lock();
        let session = state
            .sessions
            .get_mut(key)
            .ok_or_else(|| ExecError::SessionNotFound(key.to_string()))?;
        if !matches!(session.state, SessionState::Idle | SessionState::Unbound) {
            return Err(ExecError::SessionBusy(key.to_string()));
        }
        session.profile_id = Some(profile_id.to_string());
        session.backend_pid = None;
        session.state = SessionState::Idle;
        tracing::debug!(session = %key, profile = %profile_id, "session bound");
        Ok(session.status(key))
    }

    /// Takes effect from the next execution.
    pub fn set_active_safety_profile(
        &self,
        key: &str,
        safety_profile_id: Option<&str>,
    ) -> Result<SessionStatus, ExecError> {
        let mut state = self.lock();
        let session = state
            .sessions
            .get_mut(key)
            .ok_or_else(|| ExecError::SessionNotFound(key.to_string()))?;
        session.safety_profile_id = safety_profile_id.map(str::to_string);
        Ok(session.status(key))
    }

    /// Closes and forgets the session, cancelling any in-flight statement.
    /// Returns the final status, or `None` if the session was already gone.
    pub fn destroy(&self, key: &str) -> Option<SessionStatus> {
        let mut session = self.lock().sessions.remove(key)?;
        if let Some(token) = session.cancel.take() {
            token.cancel();
        }
        session.state = SessionState::Closed;
        tracing::debug!(session = %key, "session closed");
        Some(session.status(key))
    }

    /// Closes every session; used at shutdown.
    pub fn destroy_all(&self) -> usize {
        let drained: Vec<(SessionKey, Session)> = self.lock().sessions.drain().collect();
        for (_, session) in &drained {
            if let Some(token) = &session.cancel {
                token.cancel();
            }
        }
        drained.len()
    }

    pub fn status(&self, key: &str) -> Option<SessionStatus> {
        self.lock().sessions.get(key).map(|session| session.status(key))
    }

    pub fn snapshot(&self) -> Vec<SessionStatus> {
        let state = self.lock();
        let mut statuses: Vec<SessionStatus> = state
            .sessions
            .iter()
            .map(|(key, session)| session.status(key))
            .collect();
        statuses.sort_by(|a, b| a.key.cmp(&b.key));
        statuses
    }

    pub fn find_by_pid(&self, pid: BackendPid) -> Option<SessionStatus> {
        self.lock()
            .sessions
            .iter()
            .find(|(_, session)| session.backend_pid == Some(pid))
            .map(|(key, session)| session.status(key))
    }

    /// Fires the in-flight execution's cancel token. Returns whether there
    /// was anything to cancel.
    pub fn cancel(&self, key: &str) -> Result<bool, ExecError> {
        let mut state = self.lock();
        let session = state
            .sessions
            .get_mut(key)
            .ok_or_else(|| ExecError::SessionNotFound(key.to_string()))?;
        if !session.state.in_flight() {
            return Ok(false);
        }
        let Some(token) = session.cancel.as_ref() else {
            return Ok(false);
        };
        token.cancel();
        session.state = SessionState::Cancelling;
        tracing::debug!(session = %key, "execution cancel requested");
        Ok(true)
    }

    /// Claims the session for one execution. The returned ticket puts the
    /// session back to `Idle` when dropped.
    pub fn begin(&self, key: &str, cancel: CancelToken) -> Result<ExecutionTicket<'_>, ExecError> {
        let mut state = self.lock();
        let session = state
            .sessions
            .get_mut(key)
            .ok_or_else(|| ExecError::SessionNotFound(key.to_string()))?;
        match session.state {
            SessionState::Idle => {}
            SessionState::Unbound => return Err(ExecError::SessionUnbound(key.to_string())),
            SessionState::Closed => return Err(ExecError::SessionNotFound(key.to_string())),
            SessionState::Connecting | SessionState::Executing | SessionState::Cancelling => {
                return Err(ExecError::SessionBusy(key.to_string()));
            }
        }
        let Some(profile_id) = session.profile_id.clone() else {
            return Err(ExecError::SessionUnbound(key.to_string()));
        };
        session.state = SessionState::Connecting;
        session.cancel = Some(cancel);
        session.executions += 1;
        Ok(ExecutionTicket {
            registry: self,
            key: key.to_string(),
            generation: session.generation,
            profile_id,
            safety_profile_id: session.safety_profile_id.clone(),
            elapsed_ms: None,
        })
    }

    fn with_ticket_session<F>(&self, ticket: &ExecutionTicket<'_>, apply: F)
    where
        F: FnOnce(&mut Session),
    {
        let mut state = self.lock();
        if let Some(session) = state.sessions.get_mut(&ticket.key) {
            if session.generation == ticket.generation {
                apply(session);
            }
        }
    }
}

/// Exclusive claim on a session for the duration of one execution.
pub struct ExecutionTicket<'a> {
    registry: &'a SessionRegistry,
    key: SessionKey,
    generation: u64,
    profile_id: ProfileId,
    safety_profile_id: Option<ProfileId>,
    elapsed_ms: Option<u64>,
}

impl ExecutionTicket<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    pub fn safety_profile_id(&self) -> Option<&str> {
        self.safety_profile_id.as_deref()
    }

    /// Records the backend serving the statement. A cancel that arrived
    /// while connecting keeps the session in `Cancelling`.
    pub fn mark_executing(&self, pid: BackendPid) {
        self.registry.with_ticket_session(self, |session| {
            session.backend_pid = Some(pid);
            if session.state == SessionState::Connecting {
                session.state = SessionState::Executing;
            }
        });
    }

    pub fn finish(mut self, elapsed_ms: u64) {
        self.elapsed_ms = Some(elapsed_ms);
    }
}

impl Drop for ExecutionTicket<'_> {
    fn drop(&mut self) {
        let elapsed_ms = self.elapsed_ms;
        self.registry.with_ticket_session(self, |session| {
            session.state = SessionState::Idle;
            session.cancel = None;
            if elapsed_ms.is_some() {
                session.last_elapsed_ms = elapsed_ms;
            }
        });
    }
}
