use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use enclose::enc;
use tokio::sync::Mutex;

use crate::{config::Config, session::LocalSession};

/// Hands out the session for a given id. Splitting this from [`SFU`] lets
/// embedding servers wrap session management with their own policy.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn get_session(&self, session_id: &str) -> Arc<LocalSession>;
}

/// Top level unit: the registry of sessions. A session is created on the
/// first join for its id and dropped again once its last peer leaves.
#[derive(Debug)]
pub struct SFU {
    config: Config,
    sessions: Arc<Mutex<HashMap<String, Arc<LocalSession>>>>,
}

impl SFU {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[async_trait]
impl SessionProvider for SFU {
    async fn get_session(&self, session_id: &str) -> Arc<LocalSession> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(session_id) {
            return session.clone();
        }

        let session = LocalSession::new(session_id.to_owned(), &self.config.router);
        let registry = self.sessions.clone();
        let id = session_id.to_owned();
        session.on_empty(Box::new(move || {
            tokio::spawn(enc!((registry, id) async move {
                registry.lock().await.remove(&id);
                tracing::debug!("Session {} is removed", id);
            }));
        }));

        sessions.insert(session_id.to_owned(), session.clone());
        tracing::debug!("Session {} is created", session_id);
        session
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::session::Session;

    #[tokio::test]
    async fn sessions_are_created_on_first_join_and_shared_afterwards() {
        let sfu = SFU::new(Config::default());

        let first = sfu.get_session("room0").await;
        let second = sfu.get_session("room0").await;
        let other = sfu.get_session("room1").await;

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(sfu.session_count().await, 2);
    }

    #[tokio::test]
    async fn empty_sessions_are_dropped_from_the_registry() {
        let sfu = SFU::new(Config::default());
        let session = sfu.get_session("room0").await;

        // A peer joins and leaves again.
        session.remove_peer("nobody").await;

        for _ in 0..100 {
            if sfu.session_count().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("empty session was not removed");
    }
}
