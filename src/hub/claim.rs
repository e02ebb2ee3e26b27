//! Session execution claims
//!
//! At most one execution runs per session, whichever surface started it.
//! A claim is taken before an execution is spawned and released when the
//! [`SessionClaim`] guard is dropped, i.e. when the execution task ends.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Clone, Default)]
pub struct ActiveSessions {
    inner: Arc<Mutex<HashSet<Uuid>>>,
}

impl ActiveSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the session, or `None` if an execution already holds it.
    pub fn try_claim(&self, session_id: Uuid) -> Option<SessionClaim> {
        let mut active = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(session_id) {
            return None;
        }
        Some(SessionClaim {
            session_id,
            sessions: self.clone(),
        })
    }
}

/// Guard for a claimed session.
pub struct SessionClaim {
    session_id: Uuid,
    sessions: ActiveSessions,
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        self.sessions
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_exclusive_until_dropped() {
        let sessions = ActiveSessions::new();
        let session_id = Uuid::new_v4();

        let claim = sessions.try_claim(session_id).expect("first claim");
        assert!(sessions.try_claim(session_id).is_none());
        assert!(sessions.try_claim(Uuid::new_v4()).is_some());

        drop(claim);
        assert!(sessions.try_claim(session_id).is_some());
    }
}
