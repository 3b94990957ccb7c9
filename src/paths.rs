//! Untrusted path handling for staged files.
//!
//! Client-supplied relative paths are normalized segment by segment before
//! any disk write, and the joined result is re-checked for containment in
//! the session's output directory. A path that tries to climb above its
//! origin is rejected, not re-rooted: silently stripping the traversal would
//! hide the attempt from the audit log and materialize the file somewhere
//! the client did not name.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Upper bound on a sanitized relative path, in characters.
pub const MAX_RELATIVE_PATH_LEN: usize = 255;

/// Why a client-supplied path was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathRejection {
    #[error("empty path")]
    Empty,

    #[error("absolute path")]
    Absolute,

    #[error("path contains a NUL byte")]
    NulByte,

    #[error("path contains control characters")]
    ControlChars,

    #[error("path escapes its base directory")]
    Traversal,

    #[error("path longer than {MAX_RELATIVE_PATH_LEN} characters")]
    TooLong,

    #[error("file extension is not allowed")]
    DisallowedExtension,
}

/// Normalize an untrusted relative path.
///
/// Separators are canonicalized to `/`, empty and `.` segments dropped, and
/// `..` segments resolved against the segments before them. Rejected shapes:
/// absolute paths, paths containing NUL or other control characters, paths
/// that normalize to nothing, paths whose `..` segments climb above their
/// origin (a traversal attempt), and results longer than
/// [`MAX_RELATIVE_PATH_LEN`].
pub fn sanitize_relative_path(raw: &str) -> Result<PathBuf, PathRejection> {
    if raw.contains('\0') {
        return Err(PathRejection::NulByte);
    }

    let normalized = raw.replace('\\', "/");
    if normalized.starts_with('/') {
        return Err(PathRejection::Absolute);
    }

    let mut stack: Vec<&str> = Vec::new();
    for segment in normalized.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                if stack.pop().is_none() {
                    return Err(PathRejection::Traversal);
                }
            }
            seg => {
                if seg.chars().any(|c| c.is_control()) {
                    return Err(PathRejection::ControlChars);
                }
                stack.push(seg);
            }
        }
    }

    if stack.is_empty() {
        return Err(PathRejection::Empty);
    }

    let joined = stack.join("/");
    if joined.chars().count() > MAX_RELATIVE_PATH_LEN {
        return Err(PathRejection::TooLong);
    }

    Ok(PathBuf::from(joined))
}

/// Join a sanitized relative path onto a base directory and confirm the
/// result stays inside it.
pub fn safe_join(base: &Path, relative: &Path) -> Result<PathBuf, PathRejection> {
    let full = base.join(relative);
    if is_contained(base, &full) {
        Ok(full)
    } else {
        Err(PathRejection::Traversal)
    }
}

/// Component-wise containment check: `candidate` must resolve under `base`.
///
/// Both sides are normalized lexically (candidates usually do not exist on
/// disk yet), and the prefix comparison works on whole path segments, so
/// `/base-evil` never passes against a base of `/base`.
pub fn is_contained(base: &Path, candidate: &Path) -> bool {
    normalize_lexically(candidate).starts_with(normalize_lexically(base))
}

/// Final-extension gate against a closed allow-list (lowercase, no dot).
/// Extensionless paths are refused.
pub fn is_allowed_extension(path: &Path, allowed: &[String]) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => {
            let ext = ext.to_lowercase();
            allowed.iter().any(|a| *a == ext)
        }
        None => false,
    }
}

/// Resolve `.` and `..` components without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::Prefix(_) => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(seg) => out.push(seg),
        }
    }
    out
}
