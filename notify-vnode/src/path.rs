//! Path resolution and watch admission

use std::env;
use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Component, Path, PathBuf};

/// What to do with a path that was asked to be watched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Nothing to watch: a socket, a named pipe, or a symlink that can't be resolved.
    Decline,
    /// Watch `path`, the resolved location of the requested path.
    Watch { path: PathBuf, is_dir: bool },
}

/// Lexically normalizes `path`: drops `.` components, resolves `..` against the preceding
/// component and collapses repeated separators. Symlinks are not consulted.
pub(crate) fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    // number of leading `..` kept in a relative path
    let mut parents = 0;
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => cleaned.push(component),
            Component::CurDir => {}
            Component::ParentDir => {
                if cleaned.has_root() && cleaned.parent().is_none() {
                    // `/..` is `/`
                } else if cleaned.components().count() > parents {
                    cleaned.pop();
                } else {
                    cleaned.push("..");
                    parents += 1;
                }
            }
            Component::Normal(name) => cleaned.push(name),
        }
    }
    if cleaned.as_os_str().is_empty() {
        cleaned.push(".");
    }
    cleaned
}

/// Joins a relative `path` onto the current directory, then cleans it.
pub(crate) fn absolutize(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(clean_path(path))
    } else {
        Ok(clean_path(&env::current_dir()?.join(path)))
    }
}

/// Classifies a cleaned, absolute path before a kernel handle is opened for it.
///
/// The final component is not followed by the first `lstat`: a symlink is resolved on its own,
/// and a resolution failure (a dangling link, a loop) declines the watch instead of failing.
pub(crate) fn admit(path: &Path) -> io::Result<Admission> {
    let metadata = fs::symlink_metadata(path)?;
    let file_type = metadata.file_type();
    if file_type.is_socket() || file_type.is_fifo() {
        log::trace!("not watching special file: {}", path.display());
        return Ok(Admission::Decline);
    }
    if !file_type.is_symlink() {
        return Ok(Admission::Watch {
            path: path.to_path_buf(),
            is_dir: file_type.is_dir(),
        });
    }

    let target = match fs::canonicalize(path) {
        Ok(target) => target,
        Err(err) => {
            log::debug!("not watching unresolvable symlink {}: {err}", path.display());
            return Ok(Admission::Decline);
        }
    };
    let metadata = match fs::metadata(&target) {
        Ok(metadata) => metadata,
        Err(err) => {
            log::debug!("not watching unresolvable symlink {}: {err}", path.display());
            return Ok(Admission::Decline);
        }
    };
    let file_type = metadata.file_type();
    if file_type.is_socket() || file_type.is_fifo() {
        return Ok(Admission::Decline);
    }
    Ok(Admission::Watch {
        path: target,
        is_dir: file_type.is_dir(),
    })
}
