//! Durable, resumable execution state. One `RunSession` per execution
//! attempt, persisted as a JSON record after every mutation so a crash
//! loses at most the in-flight step.

use crate::errors::AutomationError;
use crate::runner::StepResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub type SessionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Running,
    Paused,
    Completed,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Error)
    }

    /// Legal transitions: Running -> {Paused, Completed, Error} and
    /// Paused -> Running. Terminal states only restart as a new session.
    fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (
                SessionStatus::Running,
                SessionStatus::Paused | SessionStatus::Completed | SessionStatus::Error
            ) | (SessionStatus::Paused, SessionStatus::Running)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSession {
    pub session_id: SessionId,
    pub source_ref: String,
    pub current_step_index: usize,
    pub completed_step_indices: BTreeSet<usize>,
    pub pending_step_indices: BTreeSet<usize>,
    pub variables: HashMap<String, String>,
    pub last_error: Option<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunSession {
    pub fn is_resumable(&self) -> bool {
        matches!(self.status, SessionStatus::Running | SessionStatus::Paused)
            && !self.pending_step_indices.is_empty()
    }
}

/// Owns every `RunSession`. The in-memory table sits behind one coarse
/// lock; read-modify-write sequences run entirely under it and each
/// mutation writes the record to disk before the lock drops.
pub struct SessionManager {
    state_dir: PathBuf,
    table: Mutex<HashMap<SessionId, RunSession>>,
}

impl SessionManager {
    /// Opens the manager over `state_dir`, loading any session records
    /// already present.
    pub fn new(state_dir: &Path) -> Result<Self, AutomationError> {
        std::fs::create_dir_all(state_dir)?;
        let mut table = HashMap::new();
        for entry in std::fs::read_dir(state_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                match std::fs::read_to_string(&path)
                    .map_err(AutomationError::from)
                    .and_then(|c| Ok(serde_json::from_str::<RunSession>(&c)?))
                {
                    Ok(session) => {
                        table.insert(session.session_id.clone(), session);
                    }
                    Err(e) => warn!(file = %path.display(), "skipping unreadable session record: {e}"),
                }
            }
        }
        debug!(sessions = table.len(), dir = %state_dir.display(), "session store opened");
        Ok(Self {
            state_dir: state_dir.to_path_buf(),
            table: Mutex::new(table),
        })
    }

    /// Creates a session covering `total_steps` top-level steps, all
    /// pending, and persists it immediately.
    #[instrument(skip(self))]
    pub fn create_session(
        &self,
        source_ref: &str,
        total_steps: usize,
    ) -> Result<SessionId, AutomationError> {
        let now = Utc::now();
        let session = RunSession {
            session_id: Uuid::new_v4().to_string(),
            source_ref: source_ref.to_string(),
            current_step_index: 0,
            completed_step_indices: BTreeSet::new(),
            pending_step_indices: (0..total_steps).collect(),
            variables: HashMap::new(),
            last_error: None,
            status: SessionStatus::Running,
            created_at: now,
            updated_at: now,
        };
        let id = session.session_id.clone();
        let mut table = self.lock()?;
        self.persist(&session)?;
        table.insert(id.clone(), session);
        info!(session_id = %id, total_steps, "created session");
        Ok(id)
    }

    /// The resumability checkpoint: records a completed step, merges
    /// any produced variables, and persists.
    pub fn save_step_result(
        &self,
        id: &str,
        step_index: usize,
        result: &StepResult,
    ) -> Result<(), AutomationError> {
        let mut table = self.lock()?;
        let session = Self::get_mut(&mut table, id)?;
        session.completed_step_indices.insert(step_index);
        session.pending_step_indices.remove(&step_index);
        session.current_step_index = step_index;
        if let StepResult::Completed { produced_variables } = result {
            session
                .variables
                .extend(produced_variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        session.updated_at = Utc::now();
        let snapshot = session.clone();
        self.persist(&snapshot)
    }

    pub fn get_session(&self, id: &str) -> Option<RunSession> {
        self.table.lock().ok()?.get(id).cloned()
    }

    pub fn list_resumable(&self) -> Vec<RunSession> {
        match self.table.lock() {
            Ok(table) => {
                let mut sessions: Vec<RunSession> =
                    table.values().filter(|s| s.is_resumable()).cloned().collect();
                sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                sessions
            }
            Err(_) => Vec::new(),
        }
    }

    pub fn set_variable(&self, id: &str, name: &str, value: &str) -> Result<(), AutomationError> {
        self.mutate(id, |session| {
            session.variables.insert(name.to_string(), value.to_string());
            Ok(())
        })
    }

    /// Drops the remaining pending steps without marking them completed;
    /// used when a step yields `SkipRemaining`.
    pub fn skip_remaining(&self, id: &str) -> Result<(), AutomationError> {
        self.mutate(id, |session| {
            session.pending_step_indices.clear();
            Ok(())
        })
    }

    pub fn pause(&self, id: &str) -> Result<(), AutomationError> {
        self.transition(id, SessionStatus::Paused)
    }

    pub fn resume(&self, id: &str) -> Result<(), AutomationError> {
        self.transition(id, SessionStatus::Running)
    }

    pub fn complete(&self, id: &str) -> Result<(), AutomationError> {
        self.transition(id, SessionStatus::Completed)
    }

    pub fn fail(&self, id: &str, error: &str) -> Result<(), AutomationError> {
        self.mutate(id, |session| {
            if !session.status.can_transition_to(SessionStatus::Error) {
                return Err(AutomationError::SessionError(format!(
                    "illegal transition {:?} -> Error",
                    session.status
                )));
            }
            session.status = SessionStatus::Error;
            session.last_error = Some(error.to_string());
            Ok(())
        })
    }

    /// Retention sweep: removes sessions older than `max_age` from the
    /// table and from disk, regardless of status. Returns the number
    /// removed.
    #[instrument(skip(self))]
    pub fn sweep_expired(&self, max_age: chrono::Duration) -> Result<usize, AutomationError> {
        let cutoff = Utc::now() - max_age;
        let mut table = self.lock()?;
        let expired: Vec<SessionId> = table
            .values()
            .filter(|s| s.updated_at < cutoff)
            .map(|s| s.session_id.clone())
            .collect();
        for id in &expired {
            table.remove(id);
            let path = self.record_path(id);
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(file = %path.display(), "failed to remove expired session record: {e}");
            }
        }
        if !expired.is_empty() {
            info!(removed = expired.len(), "retention sweep removed sessions");
        }
        Ok(expired.len())
    }

    fn transition(&self, id: &str, next: SessionStatus) -> Result<(), AutomationError> {
        self.mutate(id, |session| {
            if !session.status.can_transition_to(next) {
                return Err(AutomationError::SessionError(format!(
                    "illegal transition {:?} -> {:?}",
                    session.status, next
                )));
            }
            session.status = next;
            Ok(())
        })
    }

    fn mutate(
        &self,
        id: &str,
        f: impl FnOnce(&mut RunSession) -> Result<(), AutomationError>,
    ) -> Result<(), AutomationError> {
        let mut table = self.lock()?;
        let session = Self::get_mut(&mut table, id)?;
        f(session)?;
        session.updated_at = Utc::now();
        let snapshot = session.clone();
        self.persist(&snapshot)
    }

    fn get_mut<'a>(
        table: &'a mut HashMap<SessionId, RunSession>,
        id: &str,
    ) -> Result<&'a mut RunSession, AutomationError> {
        table
            .get_mut(id)
            .ok_or_else(|| AutomationError::SessionError(format!("unknown session '{id}'")))
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<SessionId, RunSession>>, AutomationError> {
        self.table
            .lock()
            .map_err(|_| AutomationError::Internal("session table lock poisoned".into()))
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.state_dir.join(format!("{id}.json"))
    }

    /// Synchronous durable write, called under the table lock.
    fn persist(&self, session: &RunSession) -> Result<(), AutomationError> {
        let path = self.record_path(&session.session_id);
        let json = serde_json::to_string_pretty(session)?;
        std::fs::write(&path, json)?;
        Ok(())
    }
}
