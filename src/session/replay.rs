//! Bounded replay defense
//!
//! Tag ids are remembered in insertion order up to a fixed capacity; the
//! oldest id is forgotten when a new one arrives at capacity. A replay older
//! than the window therefore goes unnoticed, which bounds memory.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};

/// Capacity of the process-wide handshake replay guard
pub const GLOBAL_REPLAY_CAPACITY: usize = 65_536;

/// Capacity of each session's replay window
pub const SESSION_REPLAY_CAPACITY: usize = 1_024;

/// FIFO-bounded set of recently seen tag ids
#[derive(Debug)]
pub struct ReplayWindow {
    capacity: usize,
    seen: HashSet<u64>,
    order: VecDeque<u64>,
}

impl ReplayWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Record `id`; returns false if it is already in the window
    pub fn insert(&mut self, id: u64) -> bool {
        if self.seen.contains(&id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(id);
        self.order.push_back(id);
        true
    }

    pub fn contains(&self, id: u64) -> bool {
        self.seen.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new(SESSION_REPLAY_CAPACITY)
    }
}

/// Process-wide set of message-1 tag ids, shared by all connections
#[derive(Debug)]
pub struct ReplayGuard {
    window: Mutex<ReplayWindow>,
}

impl ReplayGuard {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: Mutex::new(ReplayWindow::new(capacity)),
        }
    }

    /// Record `id`; returns false on a replay
    pub fn check_and_insert(&self, id: u64) -> bool {
        self.window.lock().insert(id)
    }

    pub fn len(&self) -> usize {
        self.window.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.lock().is_empty()
    }
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::new(GLOBAL_REPLAY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_rejected() {
        let mut window = ReplayWindow::new(4);
        assert!(window.insert(1));
        assert!(!window.insert(1));
        assert!(window.contains(1));
    }

    #[test]
    fn test_oldest_evicted_at_capacity() {
        let mut window = ReplayWindow::new(3);
        for id in 1..=3 {
            assert!(window.insert(id));
        }
        assert!(window.insert(4));
        assert_eq!(window.len(), 3);
        assert!(!window.contains(1));
        // Forgotten ids are accepted again
        assert!(window.insert(1));
        assert!(!window.contains(2));
    }

    #[test]
    fn test_guard_is_shared() {
        let guard = std::sync::Arc::new(ReplayGuard::new(16));
        let other = guard.clone();
        assert!(guard.check_and_insert(7));
        assert!(!other.check_and_insert(7));
        assert_eq!(guard.len(), 1);
    }
}
