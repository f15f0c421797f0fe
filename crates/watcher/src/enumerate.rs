//! Lazy, single-level directory enumeration

use crate::events::FileStats;
use futures::stream::{self, Stream};
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::ReadDir;
use tracing::trace;

/// Decides whether one listed entry is yielded
pub type EntryPredicate = Arc<dyn Fn(&DirEntryInfo) -> bool + Send + Sync>;

/// Which entries a listing yields
///
/// Files (anything that is not a directory) and directories are tested by
/// separate predicates. The default accepts every entry.
#[derive(Clone)]
pub struct EntryFilter {
    files: EntryPredicate,
    directories: EntryPredicate,
}

impl EntryFilter {
    pub fn all() -> Self {
        Self {
            files: Arc::new(|_| true),
            directories: Arc::new(|_| true),
        }
    }

    /// Everything except directories
    pub fn files() -> Self {
        Self::all().with_directory_filter(|_| false)
    }

    pub fn directories() -> Self {
        Self::all().with_file_filter(|_| false)
    }

    /// Replace the predicate applied to non-directory entries
    pub fn with_file_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&DirEntryInfo) -> bool + Send + Sync + 'static,
    {
        self.files = Arc::new(filter);
        self
    }

    /// Replace the predicate applied to directory entries
    pub fn with_directory_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&DirEntryInfo) -> bool + Send + Sync + 'static,
    {
        self.directories = Arc::new(filter);
        self
    }

    pub fn accepts(&self, entry: &DirEntryInfo) -> bool {
        if entry.stats.is_dir() {
            (self.directories)(entry)
        } else {
            (self.files)(entry)
        }
    }
}

impl Default for EntryFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Debug for EntryFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryFilter").finish_non_exhaustive()
    }
}

/// One directory entry with `lstat` metadata
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub name: OsString,
    pub full_path: PathBuf,
    pub stats: FileStats,
}

enum State {
    Start(PathBuf),
    Reading(ReadDir),
    Done,
}

/// List the direct children of `dir`
///
/// Opening the directory is deferred until the stream is first polled. An
/// error opening it is yielded once and ends the stream. Entries that
/// vanish between listing and `lstat` are skipped.
pub fn read_entries(dir: &Path, filter: EntryFilter) -> impl Stream<Item = io::Result<DirEntryInfo>> + Send + 'static {
    stream::unfold(State::Start(dir.to_path_buf()), move |state| {
        let filter = filter.clone();
        async move {
            let mut read_dir = match state {
                State::Start(dir) => match tokio::fs::read_dir(&dir).await {
                    Ok(read_dir) => read_dir,
                    Err(e) => return Some((Err(e), State::Done)),
                },
                State::Reading(read_dir) => read_dir,
                State::Done => return None,
            };

            loop {
                match read_dir.next_entry().await {
                    Ok(Some(entry)) => {
                        let metadata = match entry.metadata().await {
                            Ok(metadata) => metadata,
                            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                                trace!("Entry vanished during listing: {:?}", entry.path());
                                continue;
                            }
                            Err(e) => return Some((Err(e), State::Reading(read_dir))),
                        };
                        let info = DirEntryInfo {
                            name: entry.file_name(),
                            full_path: entry.path(),
                            stats: FileStats::from(&metadata),
                        };
                        if !filter.accepts(&info) {
                            continue;
                        }
                        return Some((Ok(info), State::Reading(read_dir)));
                    }
                    Ok(None) => return None,
                    Err(e) => return Some((Err(e), State::Done)),
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;

    async fn names(dir: &Path, filter: EntryFilter) -> Vec<String> {
        let mut names: Vec<String> = read_entries(dir, filter)
            .filter_map(|entry| async move { entry.ok() })
            .map(|entry| entry.name.to_string_lossy().into_owned())
            .collect()
            .await;
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_lists_direct_children_only() {
        let dir = tempfile::tempdir().expect("test setup failed");
        std::fs::write(dir.path().join("a.txt"), b"a").expect("test setup failed");
        std::fs::create_dir_all(dir.path().join("sub/deep")).expect("test setup failed");
        std::fs::write(dir.path().join("sub/b.txt"), b"b").expect("test setup failed");

        assert_eq!(names(dir.path(), EntryFilter::all()).await, vec!["a.txt", "sub"]);
        assert_eq!(names(dir.path(), EntryFilter::files()).await, vec!["a.txt"]);
        assert_eq!(names(dir.path(), EntryFilter::directories()).await, vec!["sub"]);
    }

    #[tokio::test]
    async fn test_predicates_narrow_each_entry_kind() {
        let dir = tempfile::tempdir().expect("test setup failed");
        std::fs::write(dir.path().join("lib.rs"), b"a").expect("test setup failed");
        std::fs::write(dir.path().join("notes.md"), b"b").expect("test setup failed");
        std::fs::create_dir(dir.path().join("src")).expect("test setup failed");
        std::fs::create_dir(dir.path().join("target")).expect("test setup failed");

        let filter = EntryFilter::all()
            .with_file_filter(|entry| entry.full_path.extension().is_some_and(|ext| ext == "rs"))
            .with_directory_filter(|entry| entry.name != "target");
        assert_eq!(names(dir.path(), filter).await, vec!["lib.rs", "src"]);

        let small = EntryFilter::files().with_file_filter(|entry| entry.stats.size == 0);
        assert!(names(dir.path(), small).await.is_empty());
    }

    #[tokio::test]
    async fn test_entries_carry_lstat_stats() {
        let dir = tempfile::tempdir().expect("test setup failed");
        std::fs::write(dir.path().join("a.txt"), b"abc").expect("test setup failed");

        let entries: Vec<_> = read_entries(dir.path(), EntryFilter::all()).collect().await;
        assert_eq!(entries.len(), 1);
        let entry = entries[0].as_ref().expect("entry readable");
        assert_eq!(entry.stats.size, 3);
        assert_eq!(entry.full_path, dir.path().join("a.txt"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_are_not_followed() {
        let dir = tempfile::tempdir().expect("test setup failed");
        std::fs::create_dir(dir.path().join("target")).expect("test setup failed");
        std::os::unix::fs::symlink(dir.path().join("target"), dir.path().join("link"))
            .expect("test setup failed");

        let entries: Vec<_> = read_entries(dir.path(), EntryFilter::all())
            .filter_map(|entry| async move { entry.ok() })
            .collect()
            .await;
        let link = entries
            .iter()
            .find(|entry| entry.name == "link")
            .expect("link listed");
        assert!(link.stats.is_symlink());
    }

    #[tokio::test]
    async fn test_missing_directory_yields_one_error() {
        let dir = tempfile::tempdir().expect("test setup failed");
        let entries: Vec<_> = read_entries(&dir.path().join("missing"), EntryFilter::all())
            .collect()
            .await;
        assert_eq!(entries.len(), 1);
        let err = entries[0].as_ref().expect_err("listing fails");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
