//! Readiness protocol
//!
//! Every `add()` arms an epoch with one unit per root. Resolution work holds
//! a [`ReadyToken`]; forking a token adds a unit to the same epoch and
//! dropping one completes it. When every unit of the epoch has completed,
//! the hook fires exactly once and the coordinator disarms.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Called with the epoch id when an epoch completes
pub type ReadyHook = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Debug, Default)]
struct Epoch {
    id: u64,
    expected: usize,
    completed: usize,
    armed: bool,
}

struct Shared {
    epoch: Mutex<Epoch>,
    emitted: AtomicBool,
    hook: ReadyHook,
}

impl Shared {
    fn complete(&self, epoch_id: u64) {
        let fired = {
            let mut epoch = self.epoch.lock();
            if !epoch.armed || epoch.id != epoch_id {
                return;
            }
            epoch.completed += 1;
            trace!("Ready unit {}/{} of epoch {}", epoch.completed, epoch.expected, epoch.id);
            if epoch.completed >= epoch.expected {
                epoch.armed = false;
                true
            } else {
                false
            }
        };
        if fired {
            debug!("Epoch {} complete", epoch_id);
            self.emitted.store(true, Ordering::SeqCst);
            (self.hook)(epoch_id);
        }
    }
}

/// Counts outstanding resolution units per epoch
#[derive(Clone)]
pub struct ReadyCoordinator {
    shared: Arc<Shared>,
}

impl fmt::Debug for ReadyCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadyCoordinator")
            .field("epoch", &*self.shared.epoch.lock())
            .field("emitted", &self.shared.emitted.load(Ordering::SeqCst))
            .finish()
    }
}

impl ReadyCoordinator {
    pub fn new(hook: ReadyHook) -> Self {
        Self {
            shared: Arc::new(Shared {
                epoch: Mutex::new(Epoch::default()),
                emitted: AtomicBool::new(false),
                hook,
            }),
        }
    }

    /// Add `units` to the open epoch, opening a fresh one if none is armed
    pub fn arm(&self, units: usize) -> Vec<ReadyToken> {
        if units == 0 {
            return Vec::new();
        }
        let epoch_id = {
            let mut epoch = self.shared.epoch.lock();
            if !epoch.armed {
                epoch.id += 1;
                epoch.expected = 0;
                epoch.completed = 0;
                epoch.armed = true;
                debug!("Opened ready epoch {}", epoch.id);
            }
            epoch.expected += units;
            epoch.id
        };
        (0..units)
            .map(|_| ReadyToken {
                shared: Some(Arc::clone(&self.shared)),
                epoch: epoch_id,
                done: false,
            })
            .collect()
    }

    #[cfg(test)]
    /// A token that belongs to no epoch
    pub fn detached(&self) -> ReadyToken {
        ReadyToken::detached()
    }

    /// Whether the first `ready` has already fired
    pub fn is_emitted(&self) -> bool {
        self.shared.emitted.load(Ordering::SeqCst)
    }

    /// Disarm without firing
    pub fn reset(&self) {
        let mut epoch = self.shared.epoch.lock();
        epoch.armed = false;
        epoch.expected = 0;
        epoch.completed = 0;
    }
}

/// One outstanding unit of resolution work
///
/// Completes when dropped, whatever the outcome of the work.
pub struct ReadyToken {
    shared: Option<Arc<Shared>>,
    epoch: u64,
    done: bool,
}

impl fmt::Debug for ReadyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadyToken")
            .field("epoch", &self.epoch)
            .field("detached", &self.shared.is_none())
            .finish()
    }
}

impl ReadyToken {
    pub fn detached() -> Self {
        Self {
            shared: None,
            epoch: 0,
            done: true,
        }
    }

    /// A new unit in the same epoch, completed independently
    pub fn fork(&self) -> ReadyToken {
        let Some(shared) = &self.shared else {
            return Self::detached();
        };
        {
            let mut epoch = shared.epoch.lock();
            if !epoch.armed || epoch.id != self.epoch {
                return Self::detached();
            }
            epoch.expected += 1;
        }
        ReadyToken {
            shared: Some(Arc::clone(shared)),
            epoch: self.epoch,
            done: false,
        }
    }

    #[cfg(test)]
    pub fn is_detached(&self) -> bool {
        self.shared.is_none()
    }
}

impl Drop for ReadyToken {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if let Some(shared) = self.shared.take() {
            shared.complete(self.epoch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting() -> (ReadyCoordinator, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let coordinator = ReadyCoordinator::new(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        (coordinator, fired)
    }

    #[test]
    fn test_fires_once_when_all_units_complete() {
        let (coordinator, fired) = counting();
        let mut tokens = coordinator.arm(2);
        let child = tokens[0].fork();

        drop(tokens.pop());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        drop(tokens);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        drop(child);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(coordinator.is_emitted());
    }

    #[test]
    fn test_late_fork_is_detached() {
        let (coordinator, fired) = counting();
        let token = coordinator.arm(1).pop().expect("one token");
        let keep = token.fork();
        drop(token);
        drop(keep);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Work continuing after ready never counts
        let straggler = ReadyToken {
            shared: Some(Arc::clone(&coordinator.shared)),
            epoch: 1,
            done: false,
        };
        assert!(straggler.fork().is_detached());
        drop(straggler);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_new_epoch_after_ready() {
        let (coordinator, fired) = counting();
        drop(coordinator.arm(1));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let tokens = coordinator.arm(3);
        drop(tokens);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_adds_join_open_epoch() {
        let (coordinator, fired) = counting();
        let first = coordinator.arm(1);
        let second = coordinator.arm(1);
        drop(first);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        drop(second);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_detached_tokens_never_count() {
        let (coordinator, fired) = counting();
        let token = coordinator.arm(1).pop().expect("one token");
        drop(coordinator.detached());
        drop(coordinator.detached().fork());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        drop(token);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reset_disarms() {
        let (coordinator, fired) = counting();
        let token = coordinator.arm(1).pop().expect("one token");
        coordinator.reset();
        drop(token);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.arm(0).len(), 0);
    }
}
