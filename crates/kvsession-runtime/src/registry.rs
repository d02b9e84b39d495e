//! Authenticated session records keyed by opaque token.
//!
//! Expired records are swept on every lookup, so a stale token never
//! resolves even if nothing else touched the registry in the meantime.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

/// One authenticated user session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub save_interactions: bool,
}

/// Typed map from session token to [`SessionRecord`] with idle expiry.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<Uuid, SessionRecord>,
    timeout: chrono::Duration,
}

impl SessionRegistry {
    pub fn new(timeout: Duration) -> Self {
        let timeout =
            chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(36_500));
        Self {
            sessions: HashMap::new(),
            timeout,
        }
    }

    /// Register a new session and return its token.
    pub fn register(&mut self, username: &str, save_interactions: bool) -> Uuid {
        self.register_at(username, save_interactions, Utc::now())
    }

    pub fn register_at(
        &mut self,
        username: &str,
        save_interactions: bool,
        now: DateTime<Utc>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.sessions.insert(
            id,
            SessionRecord {
                username: username.to_string(),
                created_at: now,
                last_seen: now,
                save_interactions,
            },
        );
        debug!(%id, user = username, "Registered session");
        id
    }

    /// Look up a live session.
    pub fn get(&mut self, id: &Uuid) -> Option<&SessionRecord> {
        self.get_at(id, Utc::now())
    }

    pub fn get_at(&mut self, id: &Uuid, now: DateTime<Utc>) -> Option<&SessionRecord> {
        self.sweep_at(now);
        self.sessions.get(id)
    }

    /// Refresh a session's idle timer. Returns `false` if it has expired or never existed.
    pub fn touch(&mut self, id: &Uuid) -> bool {
        self.touch_at(id, Utc::now())
    }

    pub fn touch_at(&mut self, id: &Uuid, now: DateTime<Utc>) -> bool {
        self.sweep_at(now);
        match self.sessions.get_mut(id) {
            Some(record) => {
                record.last_seen = now;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<SessionRecord> {
        self.sessions.remove(id)
    }

    /// Drop every session idle for longer than the timeout. Returns how many were dropped.
    pub fn sweep_at(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        let timeout = self.timeout;
        self.sessions
            .retain(|_, record| now.signed_duration_since(record.last_seen) <= timeout);
        let expired = before - self.sessions.len();
        if expired > 0 {
            debug!(expired, "Swept expired sessions");
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
