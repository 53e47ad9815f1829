use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

use shared::domain::{RequestToken, SessionId};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("request {holder} is still in flight")]
pub struct LockBusy {
    pub holder: RequestToken,
}

#[derive(Debug, Clone, Copy)]
struct Holder {
    token: RequestToken,
    acquired_at: Instant,
}

/// Session-wide in-flight guard. At most one request holds it; a holder
/// older than `timeout` is force-released on the next acquisition attempt.
pub struct SessionLock {
    session: SessionId,
    timeout: Duration,
    next_token: AtomicU64,
    holder: Arc<Mutex<Option<Holder>>>,
}

impl SessionLock {
    pub fn new(session: SessionId, timeout: Duration) -> Self {
        Self {
            session,
            timeout,
            next_token: AtomicU64::new(1),
            holder: Arc::new(Mutex::new(None)),
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn try_acquire(&self) -> Result<SessionLockGuard, LockBusy> {
        let mut holder = self.holder.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = *holder {
            let held_for = current.acquired_at.elapsed();
            if held_for < self.timeout {
                return Err(LockBusy {
                    holder: current.token,
                });
            }
            warn!(
                session = %self.session,
                token = %current.token,
                held_ms = held_for.as_millis() as u64,
                "session lock: force-releasing stuck request"
            );
        }

        let token = RequestToken(self.next_token.fetch_add(1, Ordering::SeqCst));
        *holder = Some(Holder {
            token,
            acquired_at: Instant::now(),
        });
        debug!(session = %self.session, %token, "session lock: acquired");
        Ok(SessionLockGuard {
            token,
            session: self.session,
            holder: Arc::clone(&self.holder),
            released: false,
        })
    }

    pub fn holder(&self) -> Option<RequestToken> {
        self.holder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|holder| holder.token)
    }

    pub fn is_held(&self) -> bool {
        self.holder().is_some()
    }
}

/// Releases the lock when dropped, unless it was force-released and taken
/// over by a newer request in the meantime.
pub struct SessionLockGuard {
    token: RequestToken,
    session: SessionId,
    holder: Arc<Mutex<Option<Holder>>>,
    released: bool,
}

impl SessionLockGuard {
    pub fn token(&self) -> RequestToken {
        self.token
    }

    /// Returns `false` if the lock had already passed to another request.
    pub fn release(mut self) -> bool {
        self.release_inner()
    }

    fn release_inner(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        let mut holder = self.holder.lock().unwrap_or_else(PoisonError::into_inner);
        match *holder {
            Some(current) if current.token == self.token => {
                *holder = None;
                debug!(session = %self.session, token = %self.token, "session lock: released");
                true
            }
            _ => {
                debug!(
                    session = %self.session,
                    token = %self.token,
                    "session lock: already taken over"
                );
                false
            }
        }
    }
}

impl Drop for SessionLockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
#[path = "tests/session_lock_tests.rs"]
mod tests;
