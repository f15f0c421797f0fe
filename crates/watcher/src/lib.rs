#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

//! File system watching with normalized events
//!
//! This crate turns the noisy output of native file notification APIs into
//! a clean stream of `add`, `addDir`, `change`, `unlink` and `unlinkDir`
//! events:
//! - Duplicate and racy notifications are throttled
//! - Editor save patterns (atomic rename, swap files) collapse into `change`
//! - Optional write-stability gating holds events until a file stops growing
//! - Symlinks are followed with cycle detection
//! - A `ready` signal fires once the initial scan of each `add` call is done
//!
//! # Example
//!
//! ```no_run
//! use tidewatch_watcher::{EventKind, FsWatcher, WatcherConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = WatcherConfig::builder().ignore_initial(true).build();
//! let watcher = FsWatcher::new(config)?;
//!
//! watcher.on(EventKind::Change, |event| println!("changed: {:?}", event.path));
//! watcher.on_error(|error| eprintln!("watch error: {error}"));
//! watcher.add(["/path/to/project", "/path/to/logs/*.log"])?;
//!
//! // ...
//! watcher.close().await?;
//! # Ok(())
//! # }
//! ```

// Private implementation modules
mod emit;
mod orchestrator;
mod ready;
mod symlinks;
mod throttle;
mod tree;
mod watcher;
mod write_stability;

// Collaborators with public surfaces
pub mod backend;
pub mod config;
pub mod emitter;
pub mod enumerate;
pub mod events;
pub mod ignore;
pub mod paths;

#[cfg(test)]
mod testing;

pub use backend::{Backend, Closer, NotifyBackend, RawEvent, RawKind, RawNotice, RawSink, SubscribeOptions};
pub use config::{AwaitWriteFinish, Toggle, WatcherConfig};
pub use emitter::ListenerId;
pub use enumerate::{read_entries, DirEntryInfo, EntryFilter, EntryPredicate};
pub use events::{EntryKind, EventKind, FileStats, FsEvent, Notification};
pub use ignore::{Matcher, PathPredicate};
pub use tidewatch_core::{Error, Result};
pub use watcher::FsWatcher;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::WatcherConfig;
    pub use crate::events::{EventKind, FsEvent, Notification};
    pub use crate::watcher::FsWatcher;
}
