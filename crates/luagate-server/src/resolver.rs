//! Method name to script path resolution.
//!
//! `users.create` resolves to `<root>/users/create.lua`. Names are checked
//! against an allow-list before any path is built, so traversal sequences
//! never reach the filesystem.

use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

/// Segment separator inside method names.
pub const METHOD_SEPARATOR: char = '.';
/// Extension appended to the last segment.
pub const SCRIPT_EXTENSION: &str = "lua";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("method name is empty")]
    Missing,

    #[error("invalid method format: {0}")]
    InvalidFormat(String),

    #[error("method not found: {0}")]
    NotFound(String),
}

fn method_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9]+(\.[a-zA-Z0-9]+)*$").unwrap_or_else(|e| {
            unreachable!("method pattern is a valid literal: {e}")
        })
    })
}

/// Resolves dotted method names to script files under a fixed root.
#[derive(Debug, Clone)]
pub struct MethodResolver {
    root: PathBuf,
}

impl MethodResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Checks the name shape without touching the filesystem.
    pub fn validate(method: &str) -> Result<(), ResolveError> {
        if method.is_empty() {
            return Err(ResolveError::Missing);
        }
        if !method_pattern().is_match(method) {
            return Err(ResolveError::InvalidFormat(method.to_string()));
        }
        Ok(())
    }

    /// Builds the candidate path for a validated name.
    pub fn script_path(&self, method: &str) -> Result<PathBuf, ResolveError> {
        Self::validate(method)?;

        let mut path = self.root.clone();
        path.extend(method.split(METHOD_SEPARATOR));
        path.set_extension(SCRIPT_EXTENSION);

        let relative = path
            .strip_prefix(&self.root)
            .map_err(|_| ResolveError::NotFound(method.to_string()))?;
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(ResolveError::NotFound(method.to_string()));
        }
        Ok(path)
    }

    /// Resolves `method` to an existing regular file.
    ///
    /// Every component below the root must be a real directory or, last, a
    /// regular file. A symlink anywhere on the way is reported as not found,
    /// the same as a missing file.
    pub fn resolve(&self, method: &str) -> Result<PathBuf, ResolveError> {
        let path = self.script_path(method)?;
        let not_found = || ResolveError::NotFound(method.to_string());
        let relative = path.strip_prefix(&self.root).map_err(|_| not_found())?;

        let mut current = self.root.clone();
        let mut components = relative.components().peekable();
        while let Some(component) = components.next() {
            current.push(component);
            let meta = std::fs::symlink_metadata(&current).map_err(|_| not_found())?;
            let expected = if components.peek().is_some() {
                meta.is_dir()
            } else {
                meta.is_file()
            };
            if !expected {
                return Err(not_found());
            }
        }
        Ok(path)
    }
}
