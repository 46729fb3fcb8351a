//! # Session Registry
//!
//! Process-wide bookkeeping of live sessions, used for shutdown fan-out,
//! admission control and the metrics endpoints.
//!
//! ## Thread Safety:
//! A single `RwLock<HashMap<..>>` serializes `insert`/`remove` against
//! `for_each`. `for_each` holds the read lock for the whole walk, so a removal
//! either happens entirely before or entirely after it. The lock is only held
//! for map operations, never across an `.await` or a socket read.
//! [`SessionRegistry::insert_within`] checks capacity and inserts under one
//! write lock, so concurrent admissions cannot overshoot the cap.
//!
//! ## Ownership:
//! Entries are [`SessionRef`]s (weak). Ingest loops own their sessions and
//! remove themselves on exit; `remove` tolerates being called twice.

use super::session::{SessionId, SessionRef};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tokio::sync::Notify;
use tracing::debug;

/// Why a session could not be registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InsertError {
    #[error("session id already registered")]
    Duplicate,

    #[error("registry holds {0} sessions already")]
    Full(usize),
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionRef>>,
    emptied: Notify,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session unless `capacity` sessions are registered already.
    /// The map is left unchanged on error.
    pub fn insert_within(
        &self,
        id: SessionId,
        session: SessionRef,
        capacity: usize,
    ) -> Result<(), InsertError> {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if sessions.contains_key(&id) {
            return Err(InsertError::Duplicate);
        }
        if sessions.len() >= capacity {
            return Err(InsertError::Full(sessions.len()));
        }
        sessions.insert(id, session);
        debug!(active = sessions.len(), "Session registered");
        Ok(())
    }

    /// Register a session with no capacity limit. Returns `false` if the id
    /// is already present.
    #[cfg(test)]
    pub fn insert(&self, id: SessionId, session: SessionRef) -> bool {
        self.insert_within(id, session, usize::MAX).is_ok()
    }

    /// Remove a session. Returns `true` only for the call that actually
    /// removed it.
    pub fn remove(&self, id: &str) -> bool {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let removed = sessions.remove(id).is_some();
        if removed {
            debug!(session_id = %id, active = sessions.len(), "Session unregistered");
            if sessions.is_empty() {
                self.emptied.notify_waiters();
            }
        }
        removed
    }

    /// Visit every registered session under the registry lock.
    ///
    /// `f` must be quick and must not call back into the registry.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&SessionRef),
    {
        let sessions = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for session in sessions.values() {
            f(session);
        }
    }

    pub fn count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[cfg(test)]
    pub fn contains(&self, id: &str) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// Resolve once the registry holds no sessions.
    #[cfg(test)]
    pub async fn wait_until_empty(&self) {
        loop {
            // Register interest before checking, so a removal in between is not missed
            let emptied = self.emptied.notified();
            if self.count() == 0 {
                return;
            }
            emptied.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::connection::{channel, TransportEnd};
    use crate::audio::session::{DrainReason, Session, SessionState};
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    fn session(id: &str) -> (Session, TransportEnd) {
        let (conn, transport) = channel(None, 4, 4);
        (Session::new(id.to_string(), conn), transport)
    }

    #[test]
    fn test_insert_and_count() {
        let registry = SessionRegistry::new();
        let (a, _ta) = session("a");
        assert!(registry.insert("a".to_string(), a.handle()));
        assert!(!registry.insert("a".to_string(), a.handle()));
        assert_eq!(registry.count(), 1);
        assert!(registry.contains("a"));
    }

    #[test]
    fn test_insert_within_respects_capacity() {
        let registry = SessionRegistry::new();
        let (a, _ta) = session("a");
        let (b, _tb) = session("b");
        assert_eq!(registry.insert_within("a".to_string(), a.handle(), 1), Ok(()));
        assert_eq!(
            registry.insert_within("b".to_string(), b.handle(), 1),
            Err(InsertError::Full(1))
        );
        assert_eq!(
            registry.insert_within("a".to_string(), a.handle(), 4),
            Err(InsertError::Duplicate)
        );
        assert_eq!(registry.count(), 1);
        assert!(!registry.contains("b"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_bounded_inserts_never_exceed_capacity() {
        let registry = Arc::new(SessionRegistry::new());
        let mut held = Vec::new();
        let mut tasks = Vec::new();
        for i in 0..16 {
            let (s, t) = session(&format!("s-{}", i));
            let handle = s.handle();
            held.push((s, t));
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.insert_within(format!("s-{}", i), handle, 3)
            }));
        }

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);
        assert_eq!(registry.count(), 3);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = SessionRegistry::new();
        let (a, _ta) = session("a");
        let (b, _tb) = session("b");
        registry.insert("a".to_string(), a.handle());
        registry.insert("b".to_string(), b.handle());

        assert!(registry.remove("a"));
        let after_first = registry.count();
        assert!(!registry.remove("a"));
        assert_eq!(registry.count(), after_first);
        assert!(!registry.contains("a"));
        assert!(registry.contains("b"));

        // Never-registered ids are a no-op too
        assert!(!registry.remove("zzz"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_inserts_are_each_visited_once() {
        let registry = Arc::new(SessionRegistry::new());
        let (a, _ta) = session("a");
        let (b, _tb) = session("b");
        let (ha, hb) = (a.handle(), b.handle());

        let r1 = registry.clone();
        let r2 = registry.clone();
        let t1 = tokio::spawn(async move { r1.insert("a".to_string(), ha) });
        let t2 = tokio::spawn(async move { r2.insert("b".to_string(), hb) });
        assert!(t1.await.unwrap());
        assert!(t2.await.unwrap());

        let mut seen = Vec::new();
        registry.for_each(|s| seen.push(s.id().clone()));
        assert_eq!(seen.len(), 2);
        let unique: HashSet<_> = seen.into_iter().collect();
        assert_eq!(unique, HashSet::from(["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn test_for_each_can_drain_sessions() {
        let registry = SessionRegistry::new();
        let (a, _ta) = session("a");
        let (b, _tb) = session("b");
        registry.insert("a".to_string(), a.handle());
        registry.insert("b".to_string(), b.handle());

        registry.for_each(|s| {
            s.begin_drain(DrainReason::ServerShutdown);
        });
        assert_eq!(a.state(), SessionState::Draining);
        assert_eq!(b.state(), SessionState::Draining);
    }

    #[tokio::test]
    async fn test_wait_until_empty() {
        let registry = Arc::new(SessionRegistry::new());
        // Empty registry resolves immediately
        registry.wait_until_empty().await;

        let (a, _ta) = session("a");
        registry.insert("a".to_string(), a.handle());

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait_until_empty().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        registry.remove("a");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }
}
