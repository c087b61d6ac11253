//! Client-side view of a negotiated session

use crate::protocol::{SessionId, SessionKeys, SESSION_POOL};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Negotiated keys plus the ids not yet spent
///
/// Ids are handed out oldest first and one is minted for each one taken,
/// which keeps the pool in step with the server's registered window.
pub struct ClientSession {
    keys: SessionKeys,
    pool: Mutex<VecDeque<SessionId>>,
    established: Instant,
    last_used: Mutex<Instant>,
}

impl ClientSession {
    pub fn new(keys: SessionKeys) -> Self {
        Self::with_pool_size(keys, SESSION_POOL)
    }

    pub fn with_pool_size(keys: SessionKeys, pool_size: usize) -> Self {
        let pool = (0..pool_size.max(1)).map(|_| keys.mint()).collect();
        Self {
            keys,
            pool: Mutex::new(pool),
            established: Instant::now(),
            last_used: Mutex::new(Instant::now()),
        }
    }

    pub fn keys(&self) -> &SessionKeys {
        &self.keys
    }

    /// Take the next unused id
    pub fn next_id(&self) -> SessionId {
        *self.last_used.lock() = Instant::now();
        let mut pool = self.pool.lock();
        let id = pool.pop_front().unwrap_or_else(|| self.keys.mint());
        pool.push_back(self.keys.mint());
        id
    }

    pub fn available(&self) -> usize {
        self.pool.lock().len()
    }

    pub fn age(&self) -> Duration {
        self.established.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("available", &self.available())
            .field("age", &self.age())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::test_material;
    use crate::session::SessionStore;

    #[test]
    fn test_ids_in_order() {
        let session = ClientSession::with_pool_size(SessionKeys::new(test_material()), 3);
        let indices: Vec<u64> = (0..5).map(|_| session.next_id().index()).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(session.available(), 3);
    }

    #[test]
    fn test_stays_in_step_with_store() {
        let material = test_material();
        let store = SessionStore::with_pool_size(8);
        store.put(SessionKeys::new(material.clone()), None);
        let session = ClientSession::with_pool_size(SessionKeys::new(material), 8);

        for _ in 0..50 {
            let id = session.next_id();
            assert!(store.take(&id.opener()).is_ok());
        }
    }
}
