use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("file name is empty")]
    Empty,
    #[error("file name has no usable final component")]
    UnsupportedComponent,
}

/// Replaces every character outside `[A-Za-z0-9_.-]` with `_`.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Local name for a remote file. The id prefix keeps names unique across
/// remote files that sanitize to the same string.
pub fn local_name_for(remote_id: &str, remote_name: &str) -> String {
    format!(
        "{}_{}",
        sanitize_file_name(remote_id),
        sanitize_file_name(remote_name)
    )
}

/// Final component of `name` with both `/` and `\` treated as separators.
pub fn base_name(name: &str) -> Result<&str, PathError> {
    if name.is_empty() {
        return Err(PathError::Empty);
    }
    let base = name.rsplit(&['/', '\\'][..]).next().unwrap_or_default();
    if base.is_empty() || base == "." || base == ".." {
        return Err(PathError::UnsupportedComponent);
    }
    Ok(base)
}

/// Joins the base component of `name` onto `media_root`.
pub fn media_path_for(media_root: &Path, name: &str) -> Result<PathBuf, PathError> {
    Ok(media_root.join(base_name(name)?))
}
