//! In-memory session ledger.
//!
//! Sessions live in a [`DashMap`], so operations on sessions in different
//! shards proceed in parallel while operations on the same session are
//! serialized by its shard lock.

use std::path::{Path, PathBuf};

use chrono::Utc;
use dashmap::DashMap;
use tracing::debug;

use super::model::{ProgressSnapshot, Session, SessionState};
use crate::control::intent::Intent;
use crate::executor::ProgressSample;
use crate::{Error, Result};

pub struct SessionStore {
    sessions: DashMap<String, Session>,
    sessions_root: PathBuf,
}

impl SessionStore {
    /// `sessions_root` is the parent of every session's output directory.
    pub fn new(sessions_root: impl Into<PathBuf>) -> Self {
        Self {
            sessions: DashMap::new(),
            sessions_root: sessions_root.into(),
        }
    }

    pub fn sessions_root(&self) -> &Path {
        &self.sessions_root
    }

    /// Register a new session in `Starting`.
    pub fn create(&self, intent: Intent) -> Session {
        let id = uuid::Uuid::new_v4().to_string();
        let session = Session::new(id.clone(), intent, self.sessions_root.join(&id));
        self.sessions.insert(id.clone(), session.clone());
        debug!(session_id = %id, "Session created");
        session
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// All sessions, oldest first.
    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.iter().map(|s| s.clone()).collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Apply a lifecycle transition. `detail` is stored as the last error.
    pub fn update_state(
        &self,
        id: &str,
        new_state: SessionState,
        detail: Option<String>,
    ) -> Result<Session> {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| Error::not_found("Session", id))?;

        let from = entry.state;
        if !from.can_transition_to(new_state) {
            return Err(Error::InvalidStateTransition {
                from: from.to_string(),
                to: new_state.to_string(),
            });
        }

        entry.state = new_state;
        entry.updated_at = Utc::now();
        if detail.is_some() {
            entry.last_error = detail;
        }
        debug!(session_id = %id, %from, to = %new_state, "Session state changed");
        Ok(entry.clone())
    }

    pub fn set_source(&self, id: &str, source: impl Into<String>) {
        if let Some(mut entry) = self.sessions.get_mut(id) {
            entry.source = Some(source.into());
            entry.updated_at = Utc::now();
        }
    }

    pub fn record_progress(&self, id: &str, sample: &ProgressSample) {
        if let Some(mut entry) = self.sessions.get_mut(id) {
            let now = Utc::now();
            entry.progress = Some(ProgressSnapshot::from(sample));
            entry.last_progress_at = Some(now);
            entry.updated_at = now;
        }
    }

    /// Mark the session as read by a client.
    pub fn touch(&self, id: &str) {
        if let Some(mut entry) = self.sessions.get_mut(id) {
            entry.last_access_at = Some(Utc::now());
        }
    }

    pub fn remove(&self, id: &str) -> Option<Session> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    /// Remove only if the session is terminal. Used by eviction.
    pub fn remove_if_terminal(&self, id: &str) -> Option<Session> {
        self.sessions
            .remove_if(id, |_, session| session.is_terminal())
            .map(|(_, session)| session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn count_active(&self) -> usize {
        self.sessions.iter().filter(|s| !s.is_terminal()).count()
    }
}
