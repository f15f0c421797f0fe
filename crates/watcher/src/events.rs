//! Public event types and file metadata
//!
//! This module defines the event vocabulary surfaced to callers
//! (`add`, `addDir`, `change`, `unlink`, `unlinkDir`) together with the
//! stat snapshot attached to events.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::Metadata;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tidewatch_core::Error;

/// Kind of public file system event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    /// File appeared
    Add,
    /// Directory appeared
    AddDir,
    /// File contents or metadata changed
    Change,
    /// File disappeared
    Unlink,
    /// Directory disappeared
    UnlinkDir,
}

impl EventKind {
    /// Event name as used in the `all` stream
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::AddDir => "addDir",
            Self::Change => "change",
            Self::Unlink => "unlink",
            Self::UnlinkDir => "unlinkDir",
        }
    }

    /// Whether stats may be fetched for this event
    pub fn carries_stats(&self) -> bool {
        matches!(self, Self::Add | Self::AddDir | Self::Change)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged classification of a resolved path, produced once per resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

impl EntryKind {
    /// Classify from metadata (as returned by `stat` or `lstat`)
    pub fn of(metadata: &Metadata) -> Self {
        let file_type = metadata.file_type();
        if file_type.is_symlink() {
            Self::Symlink
        } else if file_type.is_dir() {
            Self::Directory
        } else {
            Self::File
        }
    }
}

/// Immutable snapshot of file metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStats {
    /// What the path is
    pub kind: EntryKind,
    /// File size in bytes
    pub size: u64,
    /// Last modified time
    pub modified: Option<SystemTime>,
    /// Last access time
    pub accessed: Option<SystemTime>,
    /// File permissions (Unix-style)
    pub permissions: u32,
    /// Whether the file is read-only
    pub readonly: bool,
    /// Inode number (0 where the platform has none)
    pub ino: u64,
}

impl FileStats {
    /// Whether the owner may read the entry
    pub fn is_readable(&self) -> bool {
        self.permissions & 0o400 != 0
    }

    /// Whether the content-relevant parts of two snapshots differ
    ///
    /// Access-time-only touches do not count.
    pub fn differs_from(&self, other: &FileStats) -> bool {
        self.size != other.size || self.modified != other.modified
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == EntryKind::Symlink
    }
}

impl From<&Metadata> for FileStats {
    fn from(metadata: &Metadata) -> Self {
        #[cfg(unix)]
        let (permissions, ino) = {
            use std::os::unix::fs::MetadataExt;
            (metadata.mode() & 0o7777, metadata.ino())
        };
        #[cfg(not(unix))]
        let (permissions, ino) = (
            if metadata.permissions().readonly() {
                0o444
            } else {
                0o644
            },
            0,
        );

        Self {
            kind: EntryKind::of(metadata),
            size: metadata.len(),
            modified: metadata.modified().ok(),
            accessed: metadata.accessed().ok(),
            permissions,
            readonly: metadata.permissions().readonly(),
            ino,
        }
    }
}

impl From<Metadata> for FileStats {
    fn from(metadata: Metadata) -> Self {
        Self::from(&metadata)
    }
}

/// A public file system event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    /// What happened
    pub kind: EventKind,
    /// Path, relative to `cwd` when one is configured
    pub path: PathBuf,
    /// Stats, when known
    pub stats: Option<FileStats>,
}

impl FsEvent {
    pub fn new(kind: EventKind, path: impl Into<PathBuf>, stats: Option<FileStats>) -> Self {
        Self {
            kind,
            path: path.into(),
            stats,
        }
    }
}

/// Everything a watcher can report, as delivered by
/// [`FsWatcher::notifications`](crate::FsWatcher::notifications)
#[derive(Debug, Clone)]
pub enum Notification {
    /// A file system event
    Event(FsEvent),
    /// A surfaced error
    Error(Arc<Error>),
    /// All paths of the current `add` epoch finished their initial scan
    Ready,
}

impl Notification {
    /// The event, if this is one
    pub fn as_event(&self) -> Option<&FsEvent> {
        match self {
            Self::Event(event) => Some(event),
            _ => None,
        }
    }
}
