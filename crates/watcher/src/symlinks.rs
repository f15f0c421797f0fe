//! Symlink bookkeeping and cycle avoidance

use dashmap::DashMap;
use std::path::{Path, PathBuf};

/// What is known about a symbolic link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymlinkTarget {
    /// The link resolved to this path (opaque links and followed roots)
    Path(PathBuf),
    /// The link was already followed during a read; do not follow again
    Followed,
}

/// Tracks symlinks and the real directories already being descended
#[derive(Debug, Default)]
pub struct SymlinkTracker {
    links: DashMap<PathBuf, SymlinkTarget>,
    /// Watched directory path -> the real directory it descends
    descents: DashMap<PathBuf, PathBuf>,
}

impl SymlinkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, link: &Path) -> Option<SymlinkTarget> {
        self.links.get(link).map(|entry| entry.value().clone())
    }

    pub fn set(&self, link: &Path, target: SymlinkTarget) -> Option<SymlinkTarget> {
        self.links.insert(link.to_path_buf(), target)
    }

    pub fn contains(&self, link: &Path) -> bool {
        self.links.contains_key(link)
    }

    pub fn remove(&self, link: &Path) -> Option<SymlinkTarget> {
        self.links.remove(link).map(|(_, target)| target)
    }

    /// Drop every record at or below `root`
    pub fn remove_subtree(&self, root: &Path) {
        self.links.retain(|link, _| !link.starts_with(root));
        self.descents.retain(|owner, _| !owner.starts_with(root));
    }

    /// Record that `owner` descends into the real directory `real`
    ///
    /// Returns false when one of `owner`'s ancestors already descends the
    /// same real directory, in which case reading it again would cycle.
    pub fn claim_descent(&self, real: &Path, owner: &Path) -> bool {
        let cycles = owner.ancestors().skip(1).any(|ancestor| {
            self.descents
                .get(ancestor)
                .is_some_and(|entry| entry.value() == real)
        });
        if cycles {
            return false;
        }
        self.descents.insert(owner.to_path_buf(), real.to_path_buf());
        true
    }

    /// Release the descents owned by `owner` and everything below it
    pub fn release_descent(&self, owner: &Path) {
        self.descents.retain(|claimed_by, _| !claimed_by.starts_with(owner));
    }

    pub fn clear(&self) {
        self.links.clear();
        self.descents.clear();
    }
}
