use super::types::{HistoryEntry, Role, Session, SessionSummary};
use crate::{Result, SellerError};
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Keyed store of chat sessions.
///
/// The map lock is only held to find or insert an entry; each session has its
/// own lock, so appends to different sessions never contend.
#[derive(Debug, Clone)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<Uuid, Arc<Mutex<Session>>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn entry(&self, id: Uuid) -> Result<Arc<Mutex<Session>>> {
        self.sessions
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| SellerError::not_found("session", id))
    }

    pub fn create(&self) -> Session {
        let session = Session::new();
        self.sessions
            .write()
            .insert(session.id, Arc::new(Mutex::new(session.clone())));
        info!("Created chat session {}", session.id);
        session
    }

    /// Snapshot of one session; never creates it
    pub fn get(&self, id: Uuid) -> Result<Session> {
        Ok(self.entry(id)?.lock().clone())
    }

    pub fn append_message(&self, id: Uuid, role: Role, text: impl Into<String>) -> Result<Session> {
        let entry = self.entry(id)?;
        let mut session = entry.lock();
        ensure_active(&session)?;
        session.push(HistoryEntry::new(role, text));
        debug!("Session {} now has {} messages", id, session.history().len());
        Ok(session.clone())
    }

    /// Append a user message and its reply as one step
    pub fn append_exchange(
        &self,
        id: Uuid,
        user: impl Into<String>,
        assistant: impl Into<String>,
    ) -> Result<Session> {
        let entry = self.entry(id)?;
        let mut session = entry.lock();
        ensure_active(&session)?;
        session.push(HistoryEntry::new(Role::User, user));
        session.push(HistoryEntry::new(Role::Assistant, assistant));
        Ok(session.clone())
    }

    /// Mark a session inactive; it stays readable but accepts no messages
    pub fn end(&self, id: Uuid) -> Result<Session> {
        let entry = self.entry(id)?;
        let mut session = entry.lock();
        session.is_active = false;
        info!("Ended chat session {}", id);
        Ok(session.clone())
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let entries: Vec<_> = self.sessions.read().values().cloned().collect();
        let mut summaries: Vec<_> = entries.iter().map(|s| s.lock().summary()).collect();
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }

    /// Remove sessions with no activity for longer than `ttl`
    pub fn reap_idle(&self, ttl: Duration) -> usize {
        let ttl = ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::days(36_500));
        let cutoff = Utc::now() - ttl;
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, session| session.lock().last_activity_at >= cutoff);
        let removed = before - sessions.len();
        if removed > 0 {
            info!("Reaped {} idle chat sessions", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure_active(session: &Session) -> Result<()> {
    if session.is_active {
        Ok(())
    } else {
        Err(SellerError::InvalidState(format!(
            "session {} has ended",
            session.id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_get() {
        let store = SessionStore::new();
        let session = store.create();
        assert!(session.history().is_empty());

        store.append_message(session.id, Role::User, "hello").unwrap();
        let fetched = store.get(session.id).unwrap();
        assert_eq!(fetched.history().len(), 1);
        assert_eq!(fetched.history()[0].role, Role::User);
        assert!(fetched.last_activity_at >= fetched.created_at);
    }

    #[test]
    fn test_unknown_id() {
        let store = SessionStore::new();
        let id = Uuid::new_v4();
        assert!(matches!(store.get(id), Err(SellerError::NotFound { .. })));
        assert!(matches!(
            store.append_message(id, Role::User, "hi"),
            Err(SellerError::NotFound { .. })
        ));
        // get never creates
        assert!(store.is_empty());
    }

    #[test]
    fn test_ended_session_rejects_messages() {
        let store = SessionStore::new();
        let session = store.create();
        store.end(session.id).unwrap();
        assert!(matches!(
            store.append_message(session.id, Role::User, "hi"),
            Err(SellerError::InvalidState(_))
        ));
        assert!(!store.list()[0].is_active);
    }

    #[test]
    fn test_concurrent_appends_keep_every_message() {
        let store = SessionStore::new();
        let session = store.create();

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        store
                            .append_exchange(session.id, format!("{}-{}", t, i), "ok")
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let history = store.get(session.id).unwrap();
        assert_eq!(history.history().len(), 8 * 25 * 2);
        // Exchanges are never split
        for pair in history.history().chunks(2) {
            assert_eq!(pair[0].role, Role::User);
            assert_eq!(pair[1].role, Role::Assistant);
        }
    }

    #[test]
    fn test_reap_idle() {
        let store = SessionStore::new();
        store.create();
        assert_eq!(store.reap_idle(Duration::from_secs(3600)), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.reap_idle(Duration::ZERO), 1);
        assert!(store.is_empty());
    }
}
