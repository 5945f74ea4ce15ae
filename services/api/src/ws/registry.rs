//! Live sessions, keyed by id, for the REST inspection endpoints.

use super::relay::VoiceSession;
use crate::models::SessionSummary;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<VoiceSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, session: Arc<VoiceSession>) {
        self.sessions.write().await.insert(session.id(), session);
    }

    pub async fn unregister(&self, id: Uuid) -> Option<Arc<VoiceSession>> {
        self.sessions.write().await.remove(&id)
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<VoiceSession>> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Summaries of every live session, most recently active first.
    pub async fn summaries(&self) -> Vec<SessionSummary> {
        let sessions: Vec<Arc<VoiceSession>> =
            self.sessions.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(sessions.len());
        for session in sessions {
            summaries.push(session.summary().await);
        }
        summaries.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        summaries
    }

    /// Closes every live session. Used on shutdown.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<VoiceSession>> =
            self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
    }
}
