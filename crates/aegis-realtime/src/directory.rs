//! The participant → sessions directory.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use aegis_types::RealtimeEnvelope;

/// One live session's send half. The receiving half lives in the
/// session's own send-loop task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: Uuid,
    pub tx: mpsc::UnboundedSender<RealtimeEnvelope>,
}

/// In-process session registry. A participant may hold several sessions;
/// each receives every envelope routed to the participant, at most once.
#[derive(Default)]
pub struct SessionDirectory {
    sessions: Mutex<HashMap<Uuid, Vec<SessionHandle>>>,
    /// Platform admins subscribe explicitly per firm.
    admin_subscriptions: Mutex<HashMap<Uuid, HashSet<Uuid>>>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session; returns the channel the session's send-loop
    /// drains.
    pub fn register(&self, participant_id: Uuid) -> (SessionHandle, mpsc::UnboundedReceiver<RealtimeEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            session_id: Uuid::new_v4(),
            tx,
        };
        self.sessions
            .lock()
            .expect("poisoned")
            .entry(participant_id)
            .or_default()
            .push(handle.clone());
        debug!(%participant_id, session = %handle.session_id, "session registered");
        (handle, rx)
    }

    pub fn unregister(&self, participant_id: Uuid, session_id: Uuid) {
        let mut sessions = self.sessions.lock().expect("poisoned");
        if let Some(list) = sessions.get_mut(&participant_id) {
            list.retain(|h| h.session_id != session_id);
            if list.is_empty() {
                sessions.remove(&participant_id);
            }
        }
    }

    pub fn session_count(&self, participant_id: Uuid) -> usize {
        self.sessions
            .lock()
            .expect("poisoned")
            .get(&participant_id)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// Send to every session of each participant. A closed session is
    /// dropped from the directory; nothing is buffered or retried.
    pub fn send_to(&self, participants: &[Uuid], envelope: &RealtimeEnvelope) {
        let mut sessions = self.sessions.lock().expect("poisoned");
        for pid in participants {
            if let Some(list) = sessions.get_mut(pid) {
                list.retain(|h| h.tx.send(envelope.clone()).is_ok());
                if list.is_empty() {
                    sessions.remove(pid);
                }
            }
        }
    }

    // -- platform-admin firm subscriptions --

    pub fn subscribe_admin(&self, firm_id: Uuid, admin_id: Uuid) {
        self.admin_subscriptions
            .lock()
            .expect("poisoned")
            .entry(firm_id)
            .or_default()
            .insert(admin_id);
    }

    pub fn unsubscribe_admin(&self, firm_id: Uuid, admin_id: Uuid) {
        if let Some(set) = self
            .admin_subscriptions
            .lock()
            .expect("poisoned")
            .get_mut(&firm_id)
        {
            set.remove(&admin_id);
        }
    }

    pub fn admins_watching(&self, firm_id: Uuid) -> Vec<Uuid> {
        self.admin_subscriptions
            .lock()
            .expect("poisoned")
            .get(&firm_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_types::{EnvelopeKind, RealtimeEnvelope};
    use serde_json::json;

    #[tokio::test]
    async fn multiple_sessions_each_receive_once() {
        let dir = SessionDirectory::new();
        let user = Uuid::new_v4();
        let (_h1, mut rx1) = dir.register(user);
        let (_h2, mut rx2) = dir.register(user);

        let env = RealtimeEnvelope::new(EnvelopeKind::RequestCreated, Uuid::new_v4(), json!({}));
        dir.send_to(&[user], &env);

        assert!(rx1.try_recv().is_ok());
        assert!(rx1.try_recv().is_err(), "at most once per session");
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn closed_sessions_are_pruned() {
        let dir = SessionDirectory::new();
        let user = Uuid::new_v4();
        let (_h, rx) = dir.register(user);
        drop(rx);

        let env = RealtimeEnvelope::server_ping();
        dir.send_to(&[user], &env);
        assert_eq!(dir.session_count(user), 0);
    }

    #[tokio::test]
    async fn unregister_removes_only_that_session() {
        let dir = SessionDirectory::new();
        let user = Uuid::new_v4();
        let (h1, _rx1) = dir.register(user);
        let (_h2, _rx2) = dir.register(user);
        dir.unregister(user, h1.session_id);
        assert_eq!(dir.session_count(user), 1);
    }

    #[test]
    fn admin_subscriptions_round_trip() {
        let dir = SessionDirectory::new();
        let firm = Uuid::new_v4();
        let admin = Uuid::new_v4();
        dir.subscribe_admin(firm, admin);
        assert_eq!(dir.admins_watching(firm), vec![admin]);
        dir.unsubscribe_admin(firm, admin);
        assert!(dir.admins_watching(firm).is_empty());
    }
}
