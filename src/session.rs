//! The single live session: mode, key, and the inactivity watcher.
//!
//! When the session goes idle for longer than its timeout, a background
//! thread wipes the key. Ending the session cancels and joins that thread
//! before the key is wiped, so it can never fire afterwards.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::decoy::DecoyProvider;
use crate::error::{VaultError, VaultResult};
use crate::keys::{SessionKey, VaultMode};

struct Clock {
    last_activity: Instant,
    cancelled: bool,
}

struct Shared {
    key: RwLock<Option<SessionKey>>,
    decoy: RwLock<Option<DecoyProvider>>,
    clock: Mutex<Clock>,
    wake: Condvar,
}

impl Shared {
    fn wipe(&self) {
        // dropping the key zeroizes it
        self.key.write().take();
        self.decoy.write().take();
    }

    fn is_live(&self) -> bool {
        self.key.read().is_some()
    }
}

pub struct VaultSession {
    mode: VaultMode,
    started_at: DateTime<Utc>,
    timeout: Duration,
    shared: Arc<Shared>,
    watcher: Option<JoinHandle<()>>,
}

impl VaultSession {
    /// Starts a session holding `key`. A zero `timeout` disables the
    /// inactivity watcher.
    pub fn start(mode: VaultMode, key: SessionKey, timeout: Duration) -> Self {
        let decoy = match mode {
            VaultMode::Decoy => Some(DecoyProvider::new(&key)),
            VaultMode::Master => None,
        };
        let shared = Arc::new(Shared {
            key: RwLock::new(Some(key)),
            decoy: RwLock::new(decoy),
            clock: Mutex::new(Clock {
                last_activity: Instant::now(),
                cancelled: false,
            }),
            wake: Condvar::new(),
        });

        let watcher = if timeout.is_zero() {
            None
        } else {
            let shared = Arc::clone(&shared);
            let spawned = std::thread::Builder::new()
                .name("duressvault-session".into())
                .spawn(move || watch(&shared, timeout));
            match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    // with_key still enforces the timeout on every access
                    warn!(error = %e, "could not start session watcher");
                    None
                }
            }
        };

        info!(%mode, "session started");
        Self {
            mode,
            started_at: Utc::now(),
            timeout,
            shared,
            watcher,
        }
    }

    pub fn mode(&self) -> VaultMode {
        self.mode
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_active(&self) -> bool {
        !self.expired() && self.shared.is_live()
    }

    pub fn last_activity(&self) -> Instant {
        self.shared.clock.lock().last_activity
    }

    /// Time left before the watcher wipes the key, `None` without a timeout.
    pub fn idle_remaining(&self) -> Option<Duration> {
        if self.timeout.is_zero() {
            return None;
        }
        Some(self.timeout.saturating_sub(self.last_activity().elapsed()))
    }

    pub fn touch(&self) {
        let mut clock = self.shared.clock.lock();
        clock.last_activity = Instant::now();
        self.shared.wake.notify_all();
    }

    /// Runs `f` with the session key and records activity.
    pub fn with_key<R>(&self, f: impl FnOnce(&SessionKey) -> VaultResult<R>) -> VaultResult<R> {
        self.check_expiry()?;
        let guard = self.shared.key.read();
        let key = guard.as_ref().ok_or(VaultError::NoSession)?;
        let out = f(key);
        drop(guard);
        self.touch();
        out
    }

    /// Runs `f` against the decoy view of a decoy session.
    pub fn with_decoy<R>(&self, f: impl FnOnce(&DecoyProvider) -> VaultResult<R>) -> VaultResult<R> {
        self.check_expiry()?;
        let guard = self.shared.decoy.read();
        let decoy = guard.as_ref().ok_or(VaultError::NoSession)?;
        let out = f(decoy);
        drop(guard);
        self.touch();
        out
    }

    /// Drops the key without waiting for the watcher. Safe from any thread.
    pub fn wipe(&self) {
        self.shared.wipe();
    }

    /// Cancels the watcher, joins it, then wipes the key.
    pub fn end(&mut self) {
        {
            let mut clock = self.shared.clock.lock();
            clock.cancelled = true;
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self.watcher.take() {
            if handle.join().is_err() {
                warn!("session watcher panicked");
            }
        }
        self.shared.wipe();
        debug!(mode = %self.mode, "session ended");
    }

    fn expired(&self) -> bool {
        !self.timeout.is_zero() && self.last_activity().elapsed() >= self.timeout
    }

    fn check_expiry(&self) -> VaultResult<()> {
        if self.expired() {
            self.shared.wipe();
            return Err(VaultError::NoSession);
        }
        Ok(())
    }
}

impl Drop for VaultSession {
    fn drop(&mut self) {
        self.end();
    }
}

fn watch(shared: &Shared, timeout: Duration) {
    let mut clock = shared.clock.lock();
    loop {
        if clock.cancelled {
            return;
        }
        let deadline = clock.last_activity + timeout;
        if Instant::now() >= deadline {
            drop(clock);
            shared.wipe();
            info!("session expired after inactivity");
            return;
        }
        shared.wake.wait_until(&mut clock, deadline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_available_until_end() {
        let key = SessionKey::generate().unwrap();
        let mut session = VaultSession::start(VaultMode::Master, key.clone(), Duration::from_secs(60));

        assert!(session.is_active());
        let seen = session.with_key(|k| Ok(k.clone())).unwrap();
        assert_eq!(seen, key);

        session.end();
        assert!(!session.is_active());
        assert!(matches!(
            session.with_key(|_| Ok(())),
            Err(VaultError::NoSession)
        ));
    }

    #[test]
    fn idle_session_is_wiped_by_watcher() {
        let key = SessionKey::generate().unwrap();
        let session = VaultSession::start(VaultMode::Master, key, Duration::from_millis(50));

        std::thread::sleep(Duration::from_millis(300));

        assert!(!session.shared.is_live());
        assert!(matches!(
            session.with_key(|_| Ok(())),
            Err(VaultError::NoSession)
        ));
    }

    #[test]
    fn activity_postpones_expiry() {
        let key = SessionKey::generate().unwrap();
        let session = VaultSession::start(VaultMode::Master, key, Duration::from_millis(400));

        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(150));
            session.with_key(|_| Ok(())).unwrap();
        }
        assert!(session.is_active());
    }

    #[test]
    fn end_returns_promptly_with_long_timeout() {
        let key = SessionKey::generate().unwrap();
        let mut session = VaultSession::start(VaultMode::Master, key, Duration::from_secs(3600));

        let started = Instant::now();
        session.end();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(session.watcher.is_none());
    }

    #[test]
    fn zero_timeout_never_expires() {
        let key = SessionKey::generate().unwrap();
        let session = VaultSession::start(VaultMode::Master, key, Duration::ZERO);
        assert!(session.watcher.is_none());
        assert!(session.idle_remaining().is_none());
        assert!(session.is_active());
    }

    #[test]
    fn decoy_session_serves_catalogue() {
        let key = SessionKey::generate().unwrap();
        let session = VaultSession::start(VaultMode::Decoy, key, Duration::from_secs(60));
        let names = session.with_decoy(|d| Ok(d.list())).unwrap();
        assert_eq!(names.len(), 8);

        session.wipe();
        assert!(matches!(
            session.with_decoy(|_| Ok(())),
            Err(VaultError::NoSession)
        ));
    }

    #[test]
    fn master_session_has_no_decoy_view() {
        let key = SessionKey::generate().unwrap();
        let session = VaultSession::start(VaultMode::Master, key, Duration::from_secs(60));
        assert!(matches!(
            session.with_decoy(|_| Ok(())),
            Err(VaultError::NoSession)
        ));
    }
}
