//! Shell paths and object references
//!
//! The visible namespace is flat: `/` lists the views, `/<view>` lists the
//! objects of one view and `/<view>/<name>` names a single object through a
//! link file.

use super::object::ObjectId;
use super::view::VIEW_NAME_MAX;
use super::MetaFsError;
use alloc::string::String;
use alloc::vec::Vec;

/// Deepest normalized path: view plus object name
pub const MAX_DEPTH: usize = 2;

/// How a user-supplied string refers to an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference<'a> {
    /// Exactly 16 hex digits, taken as a raw identity
    ById(ObjectId),
    /// Anything else, looked up by name attribute
    ByName(&'a str),
}

impl<'a> Reference<'a> {
    pub fn parse(text: &'a str) -> Self {
        match ObjectId::parse_hex(text) {
            Some(id) => Reference::ById(id),
            None => Reference::ByName(text),
        }
    }
}

/// Resolves `path` against `current_dir`, folding `.` and `..`. Fails if
/// the result is deeper than `/<view>/<name>`.
pub fn normalize_path(current_dir: &str, path: &str) -> Result<String, MetaFsError> {
    let mut joined = String::new();
    if !path.starts_with('/') {
        joined.push_str(current_dir);
        joined.push('/');
    }
    joined.push_str(path);

    let mut components: Vec<&str> = Vec::new();
    for component in joined.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            other => components.push(other),
        }
    }

    if components.len() > MAX_DEPTH {
        return Err(MetaFsError::InvalidPath);
    }
    let mut normalized = String::from("/");
    normalized.push_str(&components.join("/"));
    Ok(normalized)
}

/// View component of `path`, or `""` for the root.
pub fn path_get_view(path: &str) -> Result<&str, MetaFsError> {
    let rest = path.strip_prefix('/').unwrap_or(path);
    let view = rest.split('/').next().unwrap_or("");
    if view.len() > VIEW_NAME_MAX {
        return Err(MetaFsError::InvalidPath);
    }
    Ok(view)
}

/// Splits `/<view>/<name>`. Both parts must be non-empty.
pub fn split_object_path(path: &str) -> Result<(&str, &str), MetaFsError> {
    let rest = path.strip_prefix('/').unwrap_or(path);
    match rest.split_once('/') {
        Some((view, name)) if !view.is_empty() && !name.is_empty() && view.len() <= VIEW_NAME_MAX => {
            Ok((view, name))
        }
        _ => Err(MetaFsError::InvalidPath),
    }
}

/// Whether `path` normalizes to a legal shell path.
pub fn shell_path_is_valid(current_dir: &str, path: &str) -> bool {
    normalize_path(current_dir, path).is_ok()
}
