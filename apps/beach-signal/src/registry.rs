use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use metrics::{counter, gauge};
use serde::Serialize;
use tracing::info;

use crate::id::ConnectionId;
use crate::session::{CloseReason, Session};
use crate::signaling::{Identity, Role};

/// Live sessions keyed by identity. At most one session per identity.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    sessions: Arc<DashMap<Identity, Arc<Session>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub identity: Identity,
    pub connection_id: ConnectionId,
    pub role: Role,
    pub idle_secs: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `session` under its identity. A session already stored there is
    /// closed and returned. The swap happens under the shard lock, so no
    /// observer ever sees two live sessions for one identity.
    pub fn register(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let evicted = match self.sessions.entry(session.identity().clone()) {
            Entry::Occupied(mut entry) => {
                let previous = Arc::clone(entry.get());
                previous.close(CloseReason::Evicted);
                entry.insert(Arc::clone(&session));
                Some(previous)
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&session));
                None
            }
        };

        counter!("beach_signal_sessions_registered_total", 1, "role" => session.role().as_str());
        if let Some(previous) = &evicted {
            counter!("beach_signal_sessions_evicted_total", 1);
            info!(
                identity = %session.identity(),
                previous_connection = %previous.connection_id(),
                connection_id = %session.connection_id(),
                "replaced existing session for identity"
            );
        }
        self.publish_gauge();
        evicted
    }

    pub fn lookup(&self, identity: &str) -> Option<Arc<Session>> {
        self.sessions
            .get(identity)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Removes the entry only while it still maps to `expected`. Removing a
    /// session that has already been replaced is a no-op.
    pub fn remove(&self, identity: &str, expected: &Arc<Session>) -> bool {
        let removed = self
            .sessions
            .remove_if(identity, |_, current| Arc::ptr_eq(current, expected))
            .is_some();
        if removed {
            self.publish_gauge();
        }
        removed
    }

    /// Point-in-time list of identities holding `role`. May race with
    /// concurrent registration; only used for discovery.
    pub fn list_by_role(&self, role: Role) -> Vec<Identity> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().role() == role)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// First live session holding `role`, skipping `excluding`.
    pub fn first_by_role(&self, role: Role, excluding: Option<&Identity>) -> Option<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|entry| excluding != Some(entry.key()))
            .find(|entry| entry.value().role() == role && !entry.value().is_closed())
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn snapshot(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| {
                let session = entry.value();
                SessionSummary {
                    identity: session.identity().clone(),
                    connection_id: session.connection_id(),
                    role: session.role(),
                    idle_secs: session.last_active().elapsed().as_secs(),
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.identity.cmp(&b.identity));
        summaries
    }

    /// Closes and removes every session. Returns how many were closed.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        // Collect first so no shard guard is held while closing.
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut closed = 0;
        for session in sessions {
            self.remove(session.identity().as_str(), &session);
            if session.close(reason) {
                closed += 1;
            }
        }
        closed
    }

    fn publish_gauge(&self) {
        gauge!("beach_signal_sessions_active", self.sessions.len() as f64);
    }
}
