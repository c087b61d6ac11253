//! Server-side session store
//!
//! Sessions are kept by serial number; their outstanding ids are kept in a
//! separate token index. A resumption lookup removes the matching id, so
//! each id is accepted once, and mints a replacement to keep the window of
//! registered ids `POOL` ahead of the highest consumed index.
//!
//! Lock order: the two maps are never held together. Usage counting happens
//! under the session map's read lock and eviction under its write lock, so a
//! session cannot be evicted between lookup and acquisition.

use super::{ReplayWindow, SessionError, SESSION_REPLAY_CAPACITY};
use crate::crypto::tag_id;
use crate::protocol::{ClientId, SessionId, SessionKeys, OPENER_LEN, SESSION_POOL, TOKEN_LEN};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Default idle time before an unused session is evicted
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

/// A negotiated session as held by the server
pub struct Session {
    serial: u64,
    keys: SessionKeys,
    client: Option<ClientId>,
    created: Instant,
    last_access: Mutex<Instant>,
    usage: AtomicUsize,
    replay: Mutex<ReplayWindow>,
    highest_consumed: Mutex<Option<u64>>,
}

impl Session {
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn keys(&self) -> &SessionKeys {
        &self.keys
    }

    /// Client that negotiated this session
    pub fn client(&self) -> Option<&ClientId> {
        self.client.as_ref()
    }

    /// Open connections currently using the session
    pub fn usage(&self) -> usize {
        self.usage.load(Ordering::Acquire)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_access.lock().elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    /// Count one more connection on this session
    pub fn acquire(self: &Arc<Self>) -> UsageGuard {
        self.usage.fetch_add(1, Ordering::AcqRel);
        self.touch();
        UsageGuard {
            session: Arc::clone(self),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("serial", &self.serial)
            .field("usage", &self.usage())
            .finish_non_exhaustive()
    }
}

/// Keeps a session's usage count raised while alive
pub struct UsageGuard {
    session: Arc<Session>,
}

impl UsageGuard {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for UsageGuard {
    fn drop(&mut self) {
        self.session.touch();
        self.session.usage.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A successful resumption
pub struct Resumed {
    /// The consumed id, whose IVs and auth key protect this connection
    pub id: SessionId,
    pub guard: UsageGuard,
}

impl Resumed {
    pub fn session(&self) -> &Arc<Session> {
        self.guard.session()
    }
}

struct Registered {
    serial: u64,
    id: SessionId,
}

/// Concurrent map of live sessions and their outstanding ids
pub struct SessionStore {
    sessions: RwLock<HashMap<u64, Arc<Session>>>,
    tokens: Mutex<HashMap<[u8; TOKEN_LEN], Registered>>,
    next_serial: AtomicU64,
    pool_size: usize,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::with_pool_size(SESSION_POOL)
    }

    /// Store keeping `pool_size` ids registered ahead of consumption
    pub fn with_pool_size(pool_size: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
            next_serial: AtomicU64::new(1),
            pool_size: pool_size.max(1),
        }
    }

    /// Register a freshly negotiated session and its first ids
    pub fn put(&self, keys: SessionKeys, client: Option<ClientId>) -> Arc<Session> {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let fresh: Vec<SessionId> = (0..self.pool_size).map(|_| keys.mint()).collect();

        let session = Arc::new(Session {
            serial,
            keys,
            client,
            created: Instant::now(),
            last_access: Mutex::new(Instant::now()),
            usage: AtomicUsize::new(0),
            replay: Mutex::new(ReplayWindow::new(SESSION_REPLAY_CAPACITY)),
            highest_consumed: Mutex::new(None),
        });

        self.sessions.write().insert(serial, Arc::clone(&session));
        self.register(serial, fresh);
        debug!("Session {} stored with {} ids", serial, self.pool_size);
        session
    }

    fn register(&self, serial: u64, ids: Vec<SessionId>) {
        let mut tokens = self.tokens.lock();
        for id in ids {
            tokens.insert(*id.token(), Registered { serial, id });
        }
    }

    /// Resolve an opener (`token || tag`), consuming the id on success
    pub fn take(&self, opener: &[u8]) -> Result<Resumed, SessionError> {
        if opener.len() != OPENER_LEN {
            return Err(SessionError::Malformed);
        }
        let (token, tag) = opener.split_at(TOKEN_LEN);
        let token: [u8; TOKEN_LEN] = token.try_into().map_err(|_| SessionError::Malformed)?;

        let registered = {
            let mut tokens = self.tokens.lock();
            match tokens.get(&token) {
                Some(r) if r.id.verify_opener(tag) => tokens.remove(&token),
                Some(_) => return Err(SessionError::TagMismatch),
                None => None,
            }
        }
        .ok_or(SessionError::NotFound)?;

        let guard = {
            let sessions = self.sessions.read();
            let session = sessions
                .get(&registered.serial)
                .ok_or(SessionError::Expired)?;
            session.acquire()
        };
        let session = Arc::clone(guard.session());

        if !session.replay.lock().insert(tag_id(tag)) {
            return Err(SessionError::ReplayDetected);
        }

        self.replenish(&session, registered.id.index());
        Ok(Resumed {
            id: registered.id,
            guard,
        })
    }

    /// Mint ids up to `POOL` past the highest consumed index and forget ids
    /// more than `POOL` behind it
    fn replenish(&self, session: &Session, consumed: u64) {
        let pool = self.pool_size as u64;
        let (fresh, floor) = {
            let mut highest = session.highest_consumed.lock();
            let high = highest.map_or(consumed, |h| h.max(consumed));
            *highest = Some(high);

            let mut fresh = Vec::new();
            while session.keys.minted() <= high + pool {
                fresh.push(session.keys.mint());
            }
            (fresh, high.saturating_sub(pool))
        };

        self.register(session.serial, fresh);
        self.tokens
            .lock()
            .retain(|_, r| r.serial != session.serial || r.id.index() >= floor);
    }

    /// Remove sessions with no open connection that have been idle longer
    /// than `max_idle` or, when `max_age` is set, have outlived it
    pub fn evict(&self, max_idle: Duration, max_age: Option<Duration>) -> usize {
        let mut removed = Vec::new();
        self.sessions.write().retain(|serial, session| {
            let expired = session.idle_for() > max_idle || max_age.is_some_and(|age| session.age() > age);
            let keep = session.usage() > 0 || !expired;
            if !keep {
                removed.push(*serial);
            }
            keep
        });

        if !removed.is_empty() {
            self.tokens.lock().retain(|_, r| !removed.contains(&r.serial));
            info!("Evicted {} idle session(s)", removed.len());
        }
        removed.len()
    }

    /// Live sessions
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Outstanding ids across all sessions
    pub fn registered_ids(&self) -> usize {
        self.tokens.lock().len()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
