//! File ignore pattern matching
//!
//! This module provides the path predicate collaborator ([`Matcher`]) and the
//! ignore engine that combines caller-supplied matchers with the subtree
//! exclusions added by `unwatch`.

use crate::events::FileStats;
use crate::paths;
use glob::Pattern;
use parking_lot::RwLock;
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tidewatch_core::{Error, Result};
use tracing::{debug, trace};

/// Editor swap and backup files, rejected outright in atomic mode
const EDITOR_SWAP_PATTERN: &str = r"\..*\.(sw[px])$|~$|\.subl.*\.tmp";

/// Caller-supplied predicate over a path and its stats, when known
pub type PathPredicate = Arc<dyn Fn(&Path, Option<&FileStats>) -> bool + Send + Sync>;

/// A single ignore rule
#[derive(Clone)]
pub enum Matcher {
    /// A path and everything below it
    Literal(PathBuf),
    /// A glob pattern
    Glob(Pattern),
    /// A regular expression over the path string
    Regex(Regex),
    /// An arbitrary predicate
    Predicate(PathPredicate),
    /// A path, and its descendants when `recursive`
    Subtree { path: PathBuf, recursive: bool },
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(path) => f.debug_tuple("Literal").field(path).finish(),
            Self::Glob(pattern) => f.debug_tuple("Glob").field(&pattern.as_str()).finish(),
            Self::Regex(regex) => f.debug_tuple("Regex").field(&regex.as_str()).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
            Self::Subtree { path, recursive } => f
                .debug_struct("Subtree")
                .field("path", path)
                .field("recursive", recursive)
                .finish(),
        }
    }
}

impl Matcher {
    /// Parse a string pattern: glob when it has metacharacters, literal otherwise
    pub fn parse(pattern: &str) -> Result<Self> {
        if paths::is_glob(Path::new(pattern)) {
            Pattern::new(pattern)
                .map(Self::Glob)
                .map_err(|e| Error::pattern(pattern, e.to_string()))
        } else {
            Ok(Self::Literal(PathBuf::from(pattern)))
        }
    }

    /// Build a regular expression matcher
    pub fn regex(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(Self::Regex)
            .map_err(|e| Error::pattern(pattern, e.to_string()))
    }

    /// Build a predicate matcher
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&Path, Option<&FileStats>) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    /// Build a subtree matcher
    pub fn subtree(path: impl Into<PathBuf>, recursive: bool) -> Self {
        Self::Subtree {
            path: path.into(),
            recursive,
        }
    }

    /// Anchor relative path-like matchers at `cwd`, then resolve them
    fn anchored(self, cwd: Option<&Path>) -> Result<Self> {
        Ok(match self {
            Self::Literal(path) => Self::Literal(paths::resolve(&paths::absolutize(&path, cwd))),
            Self::Subtree { path, recursive } => Self::Subtree {
                path: paths::resolve(&paths::absolutize(&path, cwd)),
                recursive,
            },
            Self::Glob(pattern) => match cwd {
                Some(cwd) if !Path::new(pattern.as_str()).is_absolute() => {
                    let joined = cwd.join(pattern.as_str());
                    let joined = joined.to_string_lossy();
                    Self::Glob(
                        Pattern::new(&joined).map_err(|e| Error::pattern(joined.as_ref(), e.to_string()))?,
                    )
                }
                _ => Self::Glob(pattern),
            },
            other => other,
        })
    }

    /// Evaluate against a path as given and its resolved absolute form
    pub fn matches(&self, path: &Path, absolute: &Path, stats: Option<&FileStats>) -> bool {
        match self {
            Self::Literal(literal) => absolute.starts_with(literal),
            Self::Glob(pattern) => pattern.matches_path(path) || pattern.matches_path(absolute),
            Self::Regex(regex) => {
                regex.is_match(&path.to_string_lossy()) || regex.is_match(&absolute.to_string_lossy())
            }
            Self::Predicate(predicate) => predicate(path, stats),
            Self::Subtree { path: root, recursive } => {
                if *recursive {
                    absolute.starts_with(root)
                } else {
                    absolute == root
                }
            }
        }
    }

    /// Structural equality for unwatch exclusions, used for deduplication
    fn same_exclusion(&self, other: &Matcher) -> bool {
        match (self, other) {
            (
                Self::Subtree { path: a, recursive: ra },
                Self::Subtree { path: b, recursive: rb },
            ) => a == b && ra == rb,
            (Self::Glob(a), Self::Glob(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }

    /// Whether this exclusion was created for `path`
    fn excludes_root(&self, path: &Path) -> bool {
        match self {
            Self::Subtree { path: root, .. } => root == path,
            Self::Glob(pattern) => Path::new(pattern.as_str()) == path,
            _ => false,
        }
    }
}

/// Evaluator compiled from the active rule set
#[derive(Debug)]
struct CompiledIgnore {
    matchers: Vec<Matcher>,
}

impl CompiledIgnore {
    fn matches(&self, path: &Path, absolute: &Path, stats: Option<&FileStats>) -> bool {
        self.matchers
            .iter()
            .any(|matcher| matcher.matches(path, absolute, stats))
    }
}

/// Decides whether paths are excluded from watching
///
/// By default, ignores nothing. Only excludes paths that match a caller
/// matcher, an unwatched subtree, an editor swap name in atomic mode, or
/// (unless permission errors are ignored) entries the owner cannot read.
pub struct IgnoreEngine {
    editor_swap: Option<Regex>,
    ignore_permission_errors: bool,
    /// Caller-supplied matchers, already anchored
    user: Vec<Matcher>,
    /// Subtrees excluded by `unwatch`
    unwatched: RwLock<Vec<Matcher>>,
    /// Lazily compiled evaluator, dropped whenever the rule set changes
    compiled: RwLock<Option<Arc<CompiledIgnore>>>,
}

impl fmt::Debug for IgnoreEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IgnoreEngine")
            .field("user", &self.user)
            .field("unwatched", &*self.unwatched.read())
            .finish()
    }
}

impl IgnoreEngine {
    /// Create with builder pattern
    pub fn builder() -> IgnoreEngineBuilder {
        IgnoreEngineBuilder::default()
    }

    /// Check if a path should be ignored
    pub fn is_ignored(&self, path: &Path, stats: Option<&FileStats>) -> bool {
        if let Some(swap) = &self.editor_swap {
            if swap.is_match(&path.to_string_lossy()) {
                trace!("Ignoring editor swap file: {:?}", path);
                return true;
            }
        }

        if let Some(stats) = stats {
            if !self.ignore_permission_errors && !stats.is_readable() {
                debug!("Ignoring unreadable path: {:?}", path);
                return true;
            }
        }

        let absolute = paths::resolve(path);
        self.evaluator().matches(path, &absolute, stats)
    }

    /// Exclude a path (and its descendants when `recursive`) after `unwatch`
    pub fn add_unwatched(&self, path: &Path, recursive: bool) {
        self.add_exclusion(Matcher::subtree(paths::resolve(path), recursive));
    }

    /// Exclude everything matching an absolute glob after `unwatch`
    pub fn add_unwatched_glob(&self, pattern: &Path) -> Result<()> {
        let text = pattern.to_string_lossy();
        let glob = Pattern::new(&text).map_err(|e| Error::pattern(text.as_ref(), e.to_string()))?;
        self.add_exclusion(Matcher::Glob(glob));
        Ok(())
    }

    fn add_exclusion(&self, matcher: Matcher) {
        {
            let mut unwatched = self.unwatched.write();
            if unwatched.iter().any(|existing| existing.same_exclusion(&matcher)) {
                return;
            }
            debug!("Excluding unwatched path: {:?}", matcher);
            unwatched.push(matcher);
        }
        self.invalidate();
    }

    /// Lift `unwatch` exclusions for a path that is being added again
    pub fn remove_unwatched(&self, path: &Path) {
        let resolved = if paths::is_glob(path) {
            path.to_path_buf()
        } else {
            paths::resolve(path)
        };
        let removed = {
            let mut unwatched = self.unwatched.write();
            let before = unwatched.len();
            unwatched.retain(|matcher| !matcher.excludes_root(&resolved));
            before != unwatched.len()
        };
        if removed {
            self.invalidate();
        }
    }

    /// Number of active unwatch exclusions
    pub fn unwatched_len(&self) -> usize {
        self.unwatched.read().len()
    }

    /// Drop the compiled evaluator
    pub fn invalidate(&self) {
        *self.compiled.write() = None;
    }

    fn evaluator(&self) -> Arc<CompiledIgnore> {
        if let Some(compiled) = self.compiled.read().as_ref() {
            return Arc::clone(compiled);
        }

        let mut slot = self.compiled.write();
        if let Some(compiled) = slot.as_ref() {
            return Arc::clone(compiled);
        }
        let matchers = self
            .user
            .iter()
            .cloned()
            .chain(self.unwatched.read().iter().cloned())
            .collect();
        let compiled = Arc::new(CompiledIgnore { matchers });
        trace!("Compiled ignore evaluator with {} matchers", compiled.matchers.len());
        *slot = Some(Arc::clone(&compiled));
        compiled
    }
}

/// Builder for IgnoreEngine
#[derive(Default)]
pub struct IgnoreEngineBuilder {
    patterns: Vec<String>,
    matchers: Vec<Matcher>,
    cwd: Option<PathBuf>,
    atomic: bool,
    ignore_permission_errors: bool,
}

impl IgnoreEngineBuilder {
    /// Add a string pattern (glob or literal path)
    pub fn add_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    /// Add multiple string patterns
    pub fn patterns(mut self, patterns: Vec<String>) -> Self {
        self.patterns.extend(patterns);
        self
    }

    /// Add prebuilt matchers
    pub fn matchers(mut self, matchers: Vec<Matcher>) -> Self {
        self.matchers.extend(matchers);
        self
    }

    /// Anchor relative patterns at `cwd`
    pub fn cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }

    /// Reject editor swap files
    pub fn atomic(mut self, atomic: bool) -> Self {
        self.atomic = atomic;
        self
    }

    /// Do not exclude unreadable entries
    pub fn ignore_permission_errors(mut self, ignore: bool) -> Self {
        self.ignore_permission_errors = ignore;
        self
    }

    /// Build the ignore engine
    pub fn build(self) -> Result<IgnoreEngine> {
        let cwd = self.cwd;
        let user = self
            .patterns
            .iter()
            .map(|p| Matcher::parse(p))
            .chain(self.matchers.into_iter().map(Ok))
            .map(|m| m.and_then(|m| m.anchored(cwd.as_deref())))
            .collect::<Result<Vec<_>>>()?;

        let editor_swap = if self.atomic {
            Some(
                Regex::new(EDITOR_SWAP_PATTERN)
                    .map_err(|e| Error::pattern(EDITOR_SWAP_PATTERN, e.to_string()))?,
            )
        } else {
            None
        };

        Ok(IgnoreEngine {
            editor_swap,
            ignore_permission_errors: self.ignore_permission_errors,
            user,
            unwatched: RwLock::new(Vec::new()),
            compiled: RwLock::new(None),
        })
    }
}
