use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type for tidewatch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tidewatch operations
#[derive(Error, Debug)]
pub enum Error {
    /// I/O related errors without a known path
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Filesystem errors tied to a specific path
    #[error("I/O error at {}: {source}", path.display())]
    Fs {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Ignore or glob pattern that failed to compile
    #[error("Invalid pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },

    /// Native notification backend errors
    #[error("Backend error on {}: {message}", path.display())]
    Backend { path: PathBuf, message: String },

    /// File watching errors
    #[error("Watcher error: {0}")]
    Watcher(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// How the watcher treats an error when deciding whether to surface it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Path vanished or is not a directory; never surfaced
    BenignAbsence,
    /// Permission denied; surfaced unless permission errors are ignored
    Permission,
    /// Everything else; always surfaced
    Other,
}

impl Error {
    /// Creates a filesystem error for `path`
    pub fn fs(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Fs {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Creates a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a pattern error
    pub fn pattern(pattern: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Pattern {
            pattern: pattern.into(),
            message: message.into(),
        }
    }

    /// Creates a backend error
    pub fn backend(path: impl AsRef<Path>, message: impl Into<String>) -> Self {
        Self::Backend {
            path: path.as_ref().to_path_buf(),
            message: message.into(),
        }
    }

    /// Creates a watcher error
    pub fn watcher(msg: impl Into<String>) -> Self {
        Self::Watcher(msg.into())
    }

    /// Creates an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Adds context to any error
    pub fn with_context<E>(context: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::WithContext {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// The underlying I/O error kind, if this error wraps one
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Io(e) | Self::Fs { source: e, .. } => Some(e.kind()),
            Self::WithContext { source, .. } => {
                source.downcast_ref::<io::Error>().map(io::Error::kind)
            }
            _ => None,
        }
    }

    /// Classifies the error for surfacing decisions
    pub fn class(&self) -> ErrorClass {
        match self.io_kind() {
            Some(io::ErrorKind::NotFound) | Some(io::ErrorKind::NotADirectory) => {
                ErrorClass::BenignAbsence
            }
            Some(io::ErrorKind::PermissionDenied) => ErrorClass::Permission,
            _ => ErrorClass::Other,
        }
    }

    /// Whether this error only signals that there is nothing to watch
    pub fn is_benign_absence(&self) -> bool {
        self.class() == ErrorClass::BenignAbsence
    }

    /// Whether this error is a permission failure
    pub fn is_permission(&self) -> bool {
        self.class() == ErrorClass::Permission
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::with_context(context, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_absence_is_benign() {
        let err = Error::fs("/nope", io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(err.class(), ErrorClass::BenignAbsence);
        assert!(err.is_benign_absence());

        let err = Error::fs("/file/child", io::Error::from(io::ErrorKind::NotADirectory));
        assert!(err.is_benign_absence());
    }

    #[test]
    fn test_permission_class() {
        let err = Error::from(io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(err.class(), ErrorClass::Permission);
        assert!(err.is_permission());
        assert!(!err.is_benign_absence());
    }

    #[test]
    fn test_non_io_errors_are_other() {
        assert_eq!(Error::watcher("boom").class(), ErrorClass::Other);
        assert_eq!(Error::invalid_input("empty").class(), ErrorClass::Other);
    }

    #[test]
    fn test_context_keeps_io_kind() {
        let res: std::result::Result<(), io::Error> =
            Err(io::Error::from(io::ErrorKind::NotFound));
        let err = res.context("reading directory").unwrap_err();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::NotFound));
        assert!(err.to_string().starts_with("reading directory"));
    }

    #[test]
    fn test_fs_error_reports_path() {
        let err = Error::fs("/tmp/x", io::Error::from(io::ErrorKind::Other));
        assert!(matches!(&err, Error::Fs { path, .. } if path == Path::new("/tmp/x")));
        assert!(err.to_string().contains("/tmp/x"));
    }
}
