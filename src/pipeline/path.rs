use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

use crate::error::{Error, Result};

fn has_traversal(path: &Path) -> bool {
    path.components().any(|c| matches!(c, Component::ParentDir))
}

fn is_under(path: &Path, allowed: &[PathBuf]) -> bool {
    allowed.iter().any(|dir| {
        path.starts_with(dir)
            || dir
                .canonicalize()
                .map(|d| path.starts_with(d))
                .unwrap_or(false)
    })
}

/// Resolves `path` and checks it lies under one of `allowed`. Relative paths
/// and any `..` segment are refused before the filesystem is touched; the
/// canonical form is checked again so symlinks cannot escape the allow-list.
pub fn validate_video_path(path: &Path, allowed: &[PathBuf]) -> Result<PathBuf> {
    if !path.is_absolute() || has_traversal(path) {
        warn!(path = %path.display(), "rejected video path");
        return Err(Error::InvalidPath(path.to_path_buf()));
    }

    let resolved = match path.canonicalize() {
        Ok(p) => p,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(if is_under(path, allowed) {
                Error::VideoNotFound(path.to_path_buf())
            } else {
                Error::PathNotAllowed(path.to_path_buf())
            });
        }
        Err(e) => return Err(e.into()),
    };

    if !is_under(&resolved, allowed) {
        warn!(
            path = %path.display(),
            resolved = %resolved.display(),
            "video path outside allow-list"
        );
        return Err(Error::PathNotAllowed(path.to_path_buf()));
    }

    if !resolved.is_file() {
        return Err(Error::VideoNotFound(path.to_path_buf()));
    }

    Ok(resolved)
}
