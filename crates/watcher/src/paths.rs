//! Path helpers: lexical normalization, relativization and glob detection

use std::ffi::{OsStr, OsString};
use std::path::{Component, Path, PathBuf};

/// Lexically normalize a path, folding `.` and `..` without touching the disk
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(out.components().next_back(), Some(Component::Normal(_)))
                    && out.pop();
                if !popped && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() && !path.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Absolute, normalized form of `path` (symlinks are not resolved)
pub fn resolve(path: &Path) -> PathBuf {
    match std::path::absolute(path) {
        Ok(abs) => normalize(&abs),
        Err(_) => normalize(path),
    }
}

/// Join `path` onto `base` unless it is already absolute
pub fn absolutize(path: &Path, base: Option<&Path>) -> PathBuf {
    match base {
        Some(base) if !path.is_absolute() => normalize(&base.join(path)),
        _ => path.to_path_buf(),
    }
}

/// Express `path` relative to `base`; both are resolved first
///
/// Returns an empty path when they are equal.
pub fn relative_to(base: &Path, path: &Path) -> PathBuf {
    let base = resolve(base);
    let path = resolve(path);

    let base_parts: Vec<Component<'_>> = base.components().collect();
    let path_parts: Vec<Component<'_>> = path.components().collect();
    let common = base_parts
        .iter()
        .zip(path_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = PathBuf::new();
    for _ in common..base_parts.len() {
        out.push("..");
    }
    for part in &path_parts[common..] {
        out.push(part.as_os_str());
    }
    out
}

/// Split a path into its parent directory and final name
pub fn split(path: &Path) -> (PathBuf, OsString) {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        Some(_) => PathBuf::from("."),
        None => path.to_path_buf(),
    };
    let name = path
        .file_name()
        .map(OsStr::to_os_string)
        .unwrap_or_default();
    (parent, name)
}

const GLOB_CHARS: [char; 3] = ['*', '?', '['];

/// Whether a path contains glob metacharacters
pub fn is_glob(path: &Path) -> bool {
    path.to_string_lossy().contains(GLOB_CHARS)
}

/// The longest leading part of a glob path without metacharacters
pub fn glob_parent(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        if component.as_os_str().to_string_lossy().contains(GLOB_CHARS) {
            break;
        }
        out.push(component.as_os_str());
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Helper to check if a path is likely a binary file
///
/// Polling watchers use a longer interval for these.
pub fn is_binary_path(path: &Path) -> bool {
    if let Some(ext) = path.extension() {
        let ext_str = ext.to_string_lossy().to_lowercase();
        matches!(
            ext_str.as_str(),
            "exe"
                | "dll"
                | "so"
                | "dylib"
                | "a"
                | "o"
                | "obj"
                | "lib"
                | "pdb"
                | "class"
                | "jar"
                | "pyc"
                | "wasm"
                | "rlib"
                | "zip"
                | "gz"
                | "tar"
                | "xz"
                | "7z"
                | "png"
                | "jpg"
                | "jpeg"
                | "gif"
                | "ico"
                | "pdf"
                | "mp3"
                | "mp4"
                | "mov"
                | "wav"
                | "woff"
                | "woff2"
                | "ttf"
        )
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(normalize(Path::new("a/b/..")), PathBuf::from("a"));
        assert_eq!(normalize(Path::new("../x")), PathBuf::from("../x"));
        assert_eq!(normalize(Path::new("./")), PathBuf::from("."));
        assert_eq!(normalize(Path::new("/..")), PathBuf::from("/"));
    }

    #[test]
    fn test_relative_to() {
        assert_eq!(
            relative_to(Path::new("/a/b"), Path::new("/a/b/c/d.txt")),
            PathBuf::from("c/d.txt")
        );
        assert_eq!(
            relative_to(Path::new("/a/b"), Path::new("/a/x")),
            PathBuf::from("../x")
        );
        assert_eq!(
            relative_to(Path::new("/a/b"), Path::new("/a/b")),
            PathBuf::new()
        );
    }

    #[test]
    fn test_split() {
        let (dir, name) = split(Path::new("/root/file.txt"));
        assert_eq!(dir, PathBuf::from("/root"));
        assert_eq!(name, OsString::from("file.txt"));

        let (dir, name) = split(Path::new("file.txt"));
        assert_eq!(dir, PathBuf::from("."));
        assert_eq!(name, OsString::from("file.txt"));
    }

    #[test]
    fn test_glob_parent() {
        assert!(is_glob(Path::new("src/**/*.rs")));
        assert!(!is_glob(Path::new("src/main.rs")));
        assert_eq!(glob_parent(Path::new("/x/src/**/*.rs")), PathBuf::from("/x/src"));
        assert_eq!(glob_parent(Path::new("*.rs")), PathBuf::from("."));
    }

    #[test]
    fn test_is_binary_path() {
        assert!(is_binary_path(Path::new("app.exe")));
        assert!(is_binary_path(Path::new("photo.PNG")));
        assert!(!is_binary_path(Path::new("main.rs")));
        assert!(!is_binary_path(Path::new("Makefile")));
    }
}
