//! Done file naming
//!
//! A done file is a companion artifact living next to the file it gates.
//! Its name is a pattern that may reference the target's name through
//! `${file:name}` or `${file:name.noext}` only, e.g. `${file:name}.done` or
//! `ready-${file:name.noext}`. A pattern without placeholders names a single
//! fixed marker shared by the whole directory.

use crate::file::strip_ext;
use std::path::{Path, PathBuf};
use thiserror::Error;

const NAME: &str = "${file:name}";
const NAME_NOEXT: &str = "${file:name.noext}";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DoneFileError {
    #[error("done file name '{0}' may only use ${{file:name}} or ${{file:name.noext}}")]
    UnsupportedPlaceholder(String),

    #[error("done file name must not be empty")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoneFileName {
    pattern: String,
}

impl DoneFileName {
    pub fn new(pattern: impl Into<String>) -> Result<Self, DoneFileError> {
        let pattern = pattern.into();
        if pattern.trim().is_empty() {
            return Err(DoneFileError::Empty);
        }
        let stripped = pattern.replace(NAME_NOEXT, "").replace(NAME, "");
        if stripped.contains("${") {
            return Err(DoneFileError::UnsupportedPlaceholder(pattern));
        }
        Ok(Self { pattern })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Done file name for a target file name (no directories).
    pub fn for_name(&self, file_name: &str) -> String {
        self.pattern
            .replace(NAME_NOEXT, strip_ext(file_name))
            .replace(NAME, file_name)
    }

    /// Done file path for a target; always in the target's directory.
    pub fn for_path(&self, target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let done = self.for_name(&name);
        match target.parent() {
            Some(parent) => parent.join(done),
            None => PathBuf::from(done),
        }
    }

    /// Whether `file_name` is itself a done file for this pattern.
    ///
    /// The static part of the pattern is matched as a prefix when the
    /// placeholder is not at the start, otherwise as a suffix.
    pub fn is_done_file(&self, file_name: &str) -> bool {
        let Some(start) = self.pattern.find("${") else {
            return self.pattern == file_name;
        };
        let static_part = self.pattern.replace(NAME_NOEXT, "").replace(NAME, "");
        if start > 0 {
            file_name.starts_with(&static_part) && file_name.len() > static_part.len()
        } else {
            file_name.ends_with(&static_part) && file_name.len() > static_part.len()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffix_pattern() {
        let done = DoneFileName::new("${file:name}.done").unwrap();
        assert_eq!(done.for_name("hello.txt"), "hello.txt.done");
        assert!(done.is_done_file("hello.txt.done"));
        assert!(!done.is_done_file("hello.txt"));
        assert!(!done.is_done_file(".done"));
    }

    #[test]
    fn test_prefix_noext_pattern() {
        let done = DoneFileName::new("ready-${file:name.noext}").unwrap();
        assert_eq!(done.for_name("orders.csv"), "ready-orders");
        assert_eq!(
            done.for_path(Path::new("/in/orders.csv")),
            PathBuf::from("/in/ready-orders")
        );
        assert!(done.is_done_file("ready-orders"));
        assert!(!done.is_done_file("orders.csv"));
    }

    #[test]
    fn test_fixed_pattern() {
        let done = DoneFileName::new("batch.ready").unwrap();
        assert_eq!(done.for_name("a.txt"), "batch.ready");
        assert!(done.is_done_file("batch.ready"));
        assert!(!done.is_done_file("a.txt"));
    }

    #[test]
    fn test_rejects_other_placeholders() {
        assert_eq!(
            DoneFileName::new("${date:now:yyyy}.done").unwrap_err(),
            DoneFileError::UnsupportedPlaceholder("${date:now:yyyy}.done".to_string())
        );
        assert_eq!(DoneFileName::new(" ").unwrap_err(), DoneFileError::Empty);
    }
}
