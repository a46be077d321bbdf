//! Session admission for the gateway.
//!
//! The [`SessionManager`] is a single-flight guard: a session id may have at
//! most one call in flight. Admission is a non-blocking compare-and-insert;
//! a second caller with the same id is rejected immediately, never queued.
//!
//! # Expiry
//!
//! Each admitted entry records `now + ttl`. Entries are normally removed when
//! their [`SessionGuard`] is dropped. A background sweeper evicts entries
//! whose expiry has passed, which only matters when a holder never releases.
//!
//! # Example
//!
//! ```
//! use luagate_server::session::{SessionConfig, SessionManager};
//!
//! let sessions = SessionManager::new(SessionConfig::default());
//! let guard = sessions.try_admit("abc").expect("first caller is admitted");
//! assert!(sessions.try_admit("abc").is_none());
//! drop(guard);
//! assert!(sessions.try_admit("abc").is_some());
//! ```

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Timing configuration for session admission.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    /// How long an admitted entry may live before the sweeper evicts it
    pub ttl: Duration,
    /// How often the sweeper runs
    pub sweep_interval: Duration,
}

impl SessionConfig {
    pub fn new(ttl: Duration, sweep_interval: Duration) -> Self {
        Self { ttl, sweep_interval }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// Concurrent registry of in-flight session ids.
///
/// Cloning is cheap and yields a handle to the same registry.
#[derive(Clone)]
pub struct SessionManager {
    pub config: SessionConfig,
    entries: Arc<DashMap<String, Instant>>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Inserts `id` with expiry `now + ttl` if it is absent.
    ///
    /// Returns `false` when the id is already admitted.
    pub fn admit(&self, id: &str) -> bool {
        match self.entries.entry(id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Instant::now() + self.config.ttl);
                true
            }
        }
    }

    /// Removes `id` unconditionally.
    pub fn release(&self, id: &str) {
        self.entries.remove(id);
    }

    /// Admits `id` and returns a guard that releases it on drop.
    pub fn try_admit(&self, id: &str) -> Option<SessionGuard> {
        self.admit(id).then(|| SessionGuard {
            manager: self.clone(),
            id: id.to_string(),
        })
    }

    pub fn is_busy(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evicts every entry whose expiry has passed. Returns the number evicted.
    pub fn sweep(&self) -> usize {
        sweep_expired(&self.entries, Instant::now())
    }

    /// Starts the periodic sweeper on the current tokio runtime.
    ///
    /// The task stops on its own once every handle to the registry is gone.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let entries: Weak<DashMap<String, Instant>> = Arc::downgrade(&self.entries);
        let period = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(entries) = entries.upgrade() else {
                    break;
                };
                let evicted = sweep_expired(&entries, Instant::now());
                if evicted > 0 {
                    tracing::debug!(evicted, remaining = entries.len(), "swept expired sessions");
                }
            }
        })
    }
}

fn sweep_expired(entries: &DashMap<String, Instant>, now: Instant) -> usize {
    let before = entries.len();
    entries.retain(|_, expires_at| *expires_at > now);
    before.saturating_sub(entries.len())
}

/// Releases its session id when dropped, including during unwinding.
pub struct SessionGuard {
    manager: SessionManager,
    id: String,
}

impl SessionGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.manager.release(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn short_lived() -> SessionManager {
        SessionManager::new(SessionConfig::new(
            Duration::from_millis(20),
            Duration::from_millis(10),
        ))
    }

    #[test]
    fn test_admit_then_busy() {
        let sessions = SessionManager::new(SessionConfig::default());
        assert!(sessions.admit("a"));
        assert!(!sessions.admit("a"));
        assert!(sessions.admit("b"));
        assert_eq!(sessions.len(), 2);
    }

    #[test]
    fn test_release_allows_readmission() {
        let sessions = SessionManager::new(SessionConfig::default());
        assert!(sessions.admit("a"));
        sessions.release("a");
        assert!(!sessions.is_busy("a"));
        assert!(sessions.admit("a"));
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let sessions = SessionManager::new(SessionConfig::default());
        sessions.release("missing");
        assert!(sessions.is_empty());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let sessions = SessionManager::new(SessionConfig::default());
        {
            let guard = sessions.try_admit("a").unwrap();
            assert_eq!(guard.id(), "a");
            assert!(sessions.is_busy("a"));
        }
        assert!(!sessions.is_busy("a"));
    }

    #[test]
    fn test_guard_releases_on_panic() {
        let sessions = SessionManager::new(SessionConfig::default());
        let cloned = sessions.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = cloned.try_admit("a").unwrap();
            panic!("boom");
        }));
        assert!(result.is_err());
        assert!(!sessions.is_busy("a"));
    }

    #[test]
    fn test_sweep_evicts_only_expired() {
        let sessions = short_lived();
        assert!(sessions.admit("old"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(sessions.admit("fresh"));

        assert_eq!(sessions.sweep(), 1);
        assert!(!sessions.is_busy("old"));
        assert!(sessions.is_busy("fresh"));
    }

    #[test]
    fn test_concurrent_admission_is_exclusive() {
        let sessions = SessionManager::new(SessionConfig::default());
        let admitted = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let sessions = sessions.clone();
                let admitted = admitted.clone();
                std::thread::spawn(move || {
                    if sessions.admit("shared") {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(admitted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_background_sweeper_evicts() {
        let sessions = short_lived();
        let sweeper = sessions.spawn_sweeper();
        assert!(sessions.admit("stale"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!sessions.is_busy("stale"));
        sweeper.abort();
    }

    #[tokio::test]
    async fn test_sweeper_stops_when_manager_dropped() {
        let sessions = short_lived();
        let sweeper = sessions.spawn_sweeper();
        drop(sessions);

        tokio::time::timeout(Duration::from_secs(1), sweeper)
            .await
            .expect("sweeper should exit")
            .unwrap();
    }
}
