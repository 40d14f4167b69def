//! Per-browser session state: the result of the latest download attempt.
//!
//! Each session owns an async mutex that a download holds for its whole
//! duration, so two attempts from the same session never overlap.

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::invoker::DownloadResult;

pub const SESSION_IDLE_TTL: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug)]
pub struct SessionState {
    pub latest: Option<DownloadResult>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub state: Mutex<SessionState>,
}

#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<Uuid, Arc<Session>>>>,
    idle_ttl: Duration,
}

impl SessionRegistry {
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            idle_ttl,
        }
    }

    /// Returns the caller's session, starting a new one when the id is
    /// missing or unknown.
    pub async fn get_or_create(&self, id: Option<Uuid>) -> Arc<Session> {
        let mut sessions = self.sessions.lock().await;

        if let Some(session) = id.and_then(|id| sessions.get(&id)) {
            return Arc::clone(session);
        }

        let id = Uuid::new_v4();
        let session = Arc::new(Session {
            id,
            state: Mutex::new(SessionState {
                latest: None,
                last_seen: Utc::now(),
            }),
        });
        sessions.insert(id, Arc::clone(&session));
        debug!("Started session {id}");
        session
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(&id).cloned()
    }

    /// Drops sessions idle for longer than the TTL and returns the files they
    /// still pointed at. Sessions with a download in flight are kept.
    pub async fn prune_idle(&self, now: DateTime<Utc>) -> Vec<PathBuf> {
        let Ok(ttl) = chrono::Duration::from_std(self.idle_ttl) else {
            return Vec::new();
        };
        let mut orphaned = Vec::new();
        let mut sessions = self.sessions.lock().await;

        sessions.retain(|_, session| {
            let Ok(state) = session.state.try_lock() else {
                return true;
            };
            if now - state.last_seen <= ttl {
                return true;
            }
            if let Some(path) = state
                .latest
                .as_ref()
                .and_then(|result| result.file_path.clone())
            {
                orphaned.push(path);
            }
            false
        });

        orphaned
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}
