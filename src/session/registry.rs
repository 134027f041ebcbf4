//! # Session Registry
//!
//! The process-wide map from session id to live [`Session`].
//!
//! ## Locking:
//! The map lock is a plain `std::sync::RwLock` held only for the map
//! operation itself, never across an `.await`. All per-session work
//! (writes, finalize, playback) happens on the `Arc<Session>` after the
//! lock has been released, so one slow finalize never blocks other
//! connections from being created or looked up.

use super::{Session, SessionError, TeardownOutcome, TeardownTrigger};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    max_sessions: AtomicUsize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions: AtomicUsize::new(max_sessions),
        }
    }

    /// Return the session for `id`, creating it with `create` if absent.
    ///
    /// Creation is refused with [`SessionError::LimitReached`] once the
    /// registry holds `max_sessions` sessions. Looking up an existing id
    /// is never refused.
    pub fn get_or_create<F>(&self, id: &str, create: F) -> Result<Arc<Session>, SessionError>
    where
        F: FnOnce() -> Session,
    {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = sessions.get(id) {
            return Ok(existing.clone());
        }

        let max = self.max_sessions.load(Ordering::Relaxed);
        if sessions.len() >= max {
            return Err(SessionError::LimitReached(max));
        }

        let session = Arc::new(create());
        sessions.insert(id.to_string(), session.clone());
        debug!(session_id = %id, active = sessions.len(), "Session registered");
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions.load(Ordering::Relaxed)
    }

    /// Takes effect for the next creation; live sessions are untouched.
    pub fn set_max_sessions(&self, max: usize) {
        self.max_sessions.store(max, Ordering::Relaxed);
    }

    /// Tear down the session `id` and drop it from the registry once CLOSED.
    ///
    /// Returns `None` when no such session is registered, which is also what
    /// a late trigger sees after the winning teardown removed the session.
    pub async fn teardown(&self, id: &str, trigger: TeardownTrigger) -> Option<TeardownOutcome> {
        let session = self.get(id)?;
        let outcome = session.teardown(trigger).await;

        if let TeardownOutcome::Closed(_) = &outcome {
            self.remove(id);
        }
        Some(outcome)
    }

    /// Tear down every registered session concurrently.
    ///
    /// Sessions already FINALIZING under another trigger are waited on until
    /// they reach CLOSED, so nothing is left half-written when this returns.
    /// The count covers only the sessions this call closed itself.
    pub async fn teardown_all(&self, trigger: TeardownTrigger) -> usize {
        let ids = self.ids();
        if ids.is_empty() {
            return 0;
        }
        info!(count = ids.len(), %trigger, "Tearing down all sessions");

        let closed = join_all(ids.iter().map(|id| self.teardown_or_wait(id, trigger))).await;
        closed.into_iter().filter(|closed| *closed).count()
    }

    async fn teardown_or_wait(&self, id: &str, trigger: TeardownTrigger) -> bool {
        let Some(session) = self.get(id) else {
            return false;
        };

        let closed_here = match session.teardown(trigger).await {
            TeardownOutcome::Closed(_) => true,
            TeardownOutcome::Absorbed => {
                debug!(session_id = %id, "Waiting for in-flight teardown");
                session.wait_closed().await;
                false
            }
        };
        self.remove(id);
        closed_here
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::mock::MockCodecBridge;
    use crate::protocol::MediaSourceType;
    use crate::session::tests::test_settings;
    use crate::session::SessionStage;
    use std::path::Path;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn make_session(root: &Path, id: &str, bridge: Arc<MockCodecBridge>) -> Session {
        let (tx, _rx) = mpsc::unbounded_channel();
        Session::new(id.to_string(), test_settings(root), bridge, tx)
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_existing() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Arc::new(MockCodecBridge::new());
        let registry = SessionRegistry::new(4);

        let first = registry
            .get_or_create("a", || make_session(dir.path(), "a", bridge.clone()))
            .unwrap();
        let second = registry
            .get_or_create("a", || panic!("must not create twice"))
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_limit_refuses_new_sessions_only() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Arc::new(MockCodecBridge::new());
        let registry = SessionRegistry::new(1);

        registry
            .get_or_create("a", || make_session(dir.path(), "a", bridge.clone()))
            .unwrap();
        let refused = registry.get_or_create("b", || make_session(dir.path(), "b", bridge.clone()));
        assert!(matches!(refused, Err(SessionError::LimitReached(1))));
        assert!(registry.get_or_create("a", || unreachable!()).is_ok());

        registry.set_max_sessions(2);
        assert!(registry
            .get_or_create("b", || make_session(dir.path(), "b", bridge.clone()))
            .is_ok());
        assert_eq!(registry.ids(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_teardown_removes_closed_session() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Arc::new(MockCodecBridge::new());
        let registry = SessionRegistry::new(4);

        let session = registry
            .get_or_create("a", || make_session(dir.path(), "a", bridge.clone()))
            .unwrap();
        session.write_chunk(MediaSourceType::Audio, &[1, 2]).await.unwrap();

        let outcome = registry.teardown("a", TeardownTrigger::CloseEvent).await;
        assert!(matches!(outcome, Some(TeardownOutcome::Closed(_))));
        assert!(registry.get("a").is_none());
        assert_eq!(session.stage(), SessionStage::Closed);

        assert!(registry.teardown("a", TeardownTrigger::TransportClosed).await.is_none());
    }

    #[tokio::test]
    async fn test_teardown_all_closes_every_session() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Arc::new(MockCodecBridge::new());
        let registry = SessionRegistry::new(8);

        for id in ["a", "b", "c"] {
            let session = registry
                .get_or_create(id, || make_session(dir.path(), id, bridge.clone()))
                .unwrap();
            session.write_chunk(MediaSourceType::Video, b"frame").await.unwrap();
        }

        let closed = registry.teardown_all(TeardownTrigger::ServerShutdown).await;
        assert_eq!(closed, 3);
        assert!(registry.is_empty());
        assert_eq!(bridge.encodes().len(), 3);
    }

    #[tokio::test]
    async fn test_teardown_all_waits_for_inflight_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Arc::new(MockCodecBridge::new().with_encode_delay(Duration::from_millis(200)));
        let registry = Arc::new(SessionRegistry::new(8));

        let session = registry
            .get_or_create("slow", || make_session(dir.path(), "slow", bridge.clone()))
            .unwrap();
        session.write_chunk(MediaSourceType::Video, b"frame").await.unwrap();

        let first = tokio::spawn({
            let registry = registry.clone();
            async move { registry.teardown("slow", TeardownTrigger::TransportClosed).await }
        });
        while session.stage() != SessionStage::Finalizing {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let closed = registry.teardown_all(TeardownTrigger::ServerShutdown).await;
        assert_eq!(closed, 0);
        assert_eq!(session.stage(), SessionStage::Closed);
        assert!(registry.is_empty());
        assert_eq!(bridge.encodes().len(), 1);

        assert!(matches!(first.await.unwrap(), Some(TeardownOutcome::Closed(_))));
    }
}
