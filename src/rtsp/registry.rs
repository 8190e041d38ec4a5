use std::{collections::HashMap, sync::Arc, time::Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::rtsp::session::{Session, SessionState};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub peer: String,
    pub profile: Option<String>,
    pub state: SessionState,
    pub tracks: usize,
    pub idle_ms: u64,
    pub timeout_secs: u64,
}

impl SessionSummary {
    pub fn of(session: &Session, peer: &str, now: Instant) -> Self {
        Self {
            id: session.id().to_string(),
            peer: peer.to_string(),
            profile: session.profile().map(|p| p.token.clone()),
            state: session.state(),
            tracks: session.transports().count(),
            idle_ms: session.idle_for(now).as_millis() as u64,
            timeout_secs: session.timeout().as_secs(),
        }
    }
}

/// Live sessions, for the status API only. Protocol handling never reads it.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<HashMap<String, SessionSummary>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, summary: SessionSummary) {
        self.inner.lock().insert(summary.id.clone(), summary);
    }

    pub fn remove(&self, id: &str) {
        self.inner.lock().remove(id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Summaries ordered by session id.
    pub fn snapshot(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<_> = self.inner.lock().values().cloned().collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }
}
