//! Suppression of duplicate low-level notifications
//!
//! Each (action, path) pair may hold one open window. While the window is
//! open, further requests for the same pair are suppressed and counted.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::trace;

/// Kind of work being throttled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThrottleAction {
    /// Initial `add` of a path
    Add,
    /// `change` emission
    Change,
    /// Removal cascade
    Remove,
    /// Directory re-enumeration
    ReadDir,
}

impl ThrottleAction {
    /// Default window for this action
    pub fn window(&self) -> Duration {
        match self {
            Self::Add => Duration::ZERO,
            Self::Change => Duration::from_millis(50),
            Self::Remove => Duration::from_millis(100),
            Self::ReadDir => Duration::from_millis(1000),
        }
    }
}

type SlotKey = (ThrottleAction, PathBuf);

#[derive(Debug)]
struct Slot {
    id: u64,
    suppressed: u32,
    timer: Option<AbortHandle>,
}

/// Registry of open suppression windows
#[derive(Debug, Default)]
pub struct Throttler {
    slots: Arc<DashMap<SlotKey, Slot>>,
    next_id: AtomicU64,
}

impl Throttler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a window for `(action, path)` unless one is already open
    ///
    /// Returns `None` (and counts the suppression) when a window exists.
    /// Must be called from within a tokio runtime.
    pub fn throttle(&self, action: ThrottleAction, path: &Path, window: Duration) -> Option<ThrottleGuard> {
        let key: SlotKey = (action, path.to_path_buf());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        match self.slots.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().suppressed += 1;
                trace!("Throttled {:?} for {:?}", action, path);
                return None;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    id,
                    suppressed: 0,
                    timer: None,
                });
            }
        }

        let slots = Arc::clone(&self.slots);
        let expiry_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            slots.remove_if(&expiry_key, |_, slot| slot.id == id);
        });
        if let Some(mut slot) = self.slots.get_mut(&key) {
            if slot.id == id {
                slot.timer = Some(timer.abort_handle());
            }
        }

        Some(ThrottleGuard {
            slots: Arc::clone(&self.slots),
            key,
            id,
        })
    }

    #[cfg(test)]
    /// Whether a window is open for `(action, path)`
    pub fn is_open(&self, action: ThrottleAction, path: &Path) -> bool {
        self.slots.contains_key(&(action, path.to_path_buf()))
    }

    /// Close every window and abort its timer
    pub fn clear(&self) {
        for entry in self.slots.iter() {
            if let Some(timer) = &entry.value().timer {
                timer.abort();
            }
        }
        self.slots.clear();
    }
}

/// Handle on an open window
///
/// Dropping the guard leaves the window open until it expires.
#[derive(Debug)]
pub struct ThrottleGuard {
    slots: Arc<DashMap<SlotKey, Slot>>,
    key: SlotKey,
    id: u64,
}

impl ThrottleGuard {
    /// Close the window now, returning how many requests it suppressed
    pub fn clear(self) -> u32 {
        match self.slots.remove_if(&self.key, |_, slot| slot.id == self.id) {
            Some((_, slot)) => {
                if let Some(timer) = slot.timer {
                    timer.abort();
                }
                slot.suppressed
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_suppressed_within_window() {
        let throttler = Throttler::new();
        let path = Path::new("/r/a.txt");
        let window = ThrottleAction::Change.window();

        let guard = throttler.throttle(ThrottleAction::Change, path, window);
        assert!(guard.is_some());
        assert!(throttler.throttle(ThrottleAction::Change, path, window).is_none());
        assert!(throttler.throttle(ThrottleAction::Change, path, window).is_none());

        // Different action on the same path is independent
        assert!(throttler.throttle(ThrottleAction::Remove, path, window).is_some());

        sleep(Duration::from_millis(60)).await;
        assert!(!throttler.is_open(ThrottleAction::Change, path));
        assert!(throttler.throttle(ThrottleAction::Change, path, window).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_returns_suppressed_count() {
        let throttler = Throttler::new();
        let path = Path::new("/r/dir");
        let window = ThrottleAction::ReadDir.window();

        let guard = throttler
            .throttle(ThrottleAction::ReadDir, path, window)
            .expect("window opens");
        assert!(throttler.throttle(ThrottleAction::ReadDir, path, window).is_none());
        assert!(throttler.throttle(ThrottleAction::ReadDir, path, window).is_none());

        assert_eq!(guard.clear(), 2);
        assert!(!throttler.is_open(ThrottleAction::ReadDir, path));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_guard_does_not_clear_new_window() {
        let throttler = Throttler::new();
        let path = Path::new("/r/b.txt");

        let stale = throttler
            .throttle(ThrottleAction::Remove, path, Duration::from_millis(10))
            .expect("window opens");
        sleep(Duration::from_millis(20)).await;

        let fresh = throttler
            .throttle(ThrottleAction::Remove, path, Duration::from_millis(100))
            .expect("window reopens");
        assert_eq!(stale.clear(), 0);
        assert!(throttler.is_open(ThrottleAction::Remove, path));
        assert_eq!(fresh.clear(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_all() {
        let throttler = Throttler::new();
        let window = Duration::from_secs(10);
        throttler.throttle(ThrottleAction::Change, Path::new("/a"), window);
        throttler.throttle(ThrottleAction::Change, Path::new("/b"), window);

        throttler.clear();
        assert!(!throttler.is_open(ThrottleAction::Change, Path::new("/a")));
        assert!(throttler.throttle(ThrottleAction::Change, Path::new("/b"), window).is_some());
    }
}
