//! Materialized-path helpers.
//!
//! Paths are absolute and `/`-delimited. `/` is the root; every other path has
//! a separable parent and final name.

use crate::error::StorageError;

/// Validate and canonicalize an absolute path (a single trailing `/` is dropped).
pub fn normalize(path: &str) -> Result<String, StorageError> {
    if !path.starts_with('/') {
        return Err(StorageError::InvalidPath(format!("`{path}` is not absolute")));
    }
    if path == "/" {
        return Ok("/".to_string());
    }
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    for segment in trimmed[1..].split('/') {
        validate_name(segment).map_err(|_| {
            StorageError::InvalidPath(format!("`{path}` contains an invalid segment"))
        })?;
    }
    Ok(trimmed.to_string())
}

/// Validate a single path segment.
pub fn validate_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(StorageError::InvalidPath(format!("invalid name `{name}`")));
    }
    if name.contains('/') || name.contains('\u{0000}') {
        return Err(StorageError::InvalidPath(format!("invalid name `{name}`")));
    }
    Ok(())
}

/// Split a normalized path into `(parent, name)`.
pub fn split(path: &str) -> Result<(String, String), StorageError> {
    let path = normalize(path)?;
    match path.rsplit_once('/') {
        Some((_, "")) | None => Err(StorageError::InvalidPath(format!(
            "`{path}` has no separable parent"
        ))),
        Some(("", name)) => Ok(("/".to_string(), name.to_string())),
        Some((parent, name)) => Ok((parent.to_string(), name.to_string())),
    }
}

pub fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// True when `path` equals `ancestor` or lies somewhere below it.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return true;
    }
    path == ancestor
        || (path.len() > ancestor.len()
            && path.starts_with(ancestor)
            && path.as_bytes()[ancestor.len()] == b'/')
}

/// Prefix used to match strict descendants of `path` in SQL (`substr(path, 1, len) = prefix`).
pub fn descendant_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{path}/")
    }
}
