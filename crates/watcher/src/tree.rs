//! Registry of watched directories and their known children

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

/// Outcome of removing a child name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removal {
    /// The name was tracked before the call
    pub was_present: bool,
    /// The directory has no tracked children left
    pub now_empty: bool,
}

/// Per resolved directory, the set of child basenames believed present
#[derive(Debug, Default)]
pub struct WatchedTree {
    dirs: Mutex<HashMap<PathBuf, BTreeSet<OsString>>>,
}

impl WatchedTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the entry for `dir` if it does not exist yet
    pub fn ensure(&self, dir: &Path) {
        self.dirs.lock().entry(dir.to_path_buf()).or_default();
    }

    /// Track `name` under `dir`, returning whether it was newly inserted
    pub fn add(&self, dir: &Path, name: &OsStr) -> bool {
        if name.is_empty() || name == "." || name == ".." {
            self.ensure(dir);
            return false;
        }
        self.dirs
            .lock()
            .entry(dir.to_path_buf())
            .or_default()
            .insert(name.to_os_string())
    }

    /// Untrack `name` under `dir`
    pub fn remove(&self, dir: &Path, name: &OsStr) -> Removal {
        let mut dirs = self.dirs.lock();
        match dirs.get_mut(dir) {
            Some(children) => {
                let was_present = children.remove(name);
                Removal {
                    was_present,
                    now_empty: children.is_empty(),
                }
            }
            None => Removal {
                was_present: false,
                now_empty: false,
            },
        }
    }

    /// Whether `name` is tracked under `dir`
    pub fn has(&self, dir: &Path, name: &OsStr) -> bool {
        self.dirs
            .lock()
            .get(dir)
            .is_some_and(|children| children.contains(name))
    }

    /// Known children of `dir`, sorted
    pub fn children(&self, dir: &Path) -> Vec<OsString> {
        self.dirs
            .lock()
            .get(dir)
            .map(|children| children.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `dir` has an entry
    pub fn contains_dir(&self, dir: &Path) -> bool {
        self.dirs.lock().contains_key(dir)
    }

    /// Release the entry for `dir`
    pub fn drop_dir(&self, dir: &Path) -> bool {
        self.dirs.lock().remove(dir).is_some()
    }

    /// Release every entry at or below `root`
    pub fn drop_subtree(&self, root: &Path) -> usize {
        let mut dirs = self.dirs.lock();
        let before = dirs.len();
        dirs.retain(|dir, _| !dir.starts_with(root));
        before - dirs.len()
    }

    pub fn dir_count(&self) -> usize {
        self.dirs.lock().len()
    }

    /// Copy of the whole registry
    pub fn snapshot(&self) -> BTreeMap<PathBuf, Vec<OsString>> {
        self.dirs
            .lock()
            .iter()
            .map(|(dir, children)| (dir.clone(), children.iter().cloned().collect()))
            .collect()
    }

    pub fn clear(&self) {
        self.dirs.lock().clear();
    }
}
