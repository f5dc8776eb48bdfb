use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;

use super::SessionData;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Loads the data of an unexpired session.
    async fn load(&self, id: &str) -> Result<Option<SessionData>, SessionError>;
    async fn save(
        &self,
        id: &str,
        data: &SessionData,
        expires_at: DateTime<Utc>,
    ) -> Result<(), SessionError>;
    async fn delete(&self, id: &str) -> Result<(), SessionError>;
}

/// Process-local store used when no database is configured.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, (SessionData, DateTime<Utc>)>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, id: &str) -> Result<Option<SessionData>, SessionError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(id)
            .filter(|(_, expires_at)| *expires_at > Utc::now())
            .map(|(data, _)| data.clone()))
    }

    async fn save(
        &self,
        id: &str,
        data: &SessionData,
        expires_at: DateTime<Utc>,
    ) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, (_, expiry)| *expiry > Utc::now());
        sessions.insert(id.to_string(), (data.clone(), expires_at));
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), SessionError> {
        self.sessions.write().await.remove(id);
        Ok(())
    }
}
