//! Active session table

use async_trait::async_trait;
use dashmap::DashMap;

use crate::domain::session::WorkshopSession;
use crate::error::Result;

/// Keyed store of sessions that have not yet been ended
///
/// Final results go to the durable [`Store`](super::store::Store); this
/// table only tracks what is live in the current process.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<WorkshopSession>>;
    /// Insert or replace
    async fn put(&self, session: WorkshopSession) -> Result<()>;
    async fn remove(&self, id: &str) -> Result<Option<WorkshopSession>>;
    async fn list(&self) -> Result<Vec<WorkshopSession>>;
}

/// In-process [`SessionStore`]; contents are lost on restart
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, WorkshopSession>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, id: &str) -> Result<Option<WorkshopSession>> {
        Ok(self.sessions.get(id).map(|s| s.clone()))
    }

    async fn put(&self, session: WorkshopSession) -> Result<()> {
        self.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<Option<WorkshopSession>> {
        Ok(self.sessions.remove(id).map(|(_, s)| s))
    }

    async fn list(&self) -> Result<Vec<WorkshopSession>> {
        Ok(self.sessions.iter().map(|e| e.value().clone()).collect())
    }
}
