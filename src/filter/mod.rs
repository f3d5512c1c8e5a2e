//! Candidate selection
//!
//! Every discovered file runs through a fixed, short-circuiting chain:
//!
//! 1. hidden files and internal artifacts (lock markers, in-progress files)
//! 2. `exclude` / `excludeExt` / `include` / `includeExt`, then the Ant path
//!    patterns (`antExclude` wins over `antInclude`)
//! 3. the custom predicate
//! 4. the done file gate
//! 5. idempotent repository membership
//!
//! Survivors are then ordered with [`SortBy`] (or shuffled) and truncated
//! to the per-poll maximum.

pub mod ant;
pub mod sort;

use regex::Regex;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

use crate::done::DoneFileName;
use crate::expression::{Context, Expression, ExpressionError};
use crate::file::WatchedFile;
use crate::idempotent::{IdempotentRepository, RepositoryError};
use crate::lock::is_lock_artifact;

pub use sort::SortBy;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Empty Ant pattern list '{0}'")]
    InvalidAnt(String),

    #[error("Invalid sortBy group: {0}")]
    InvalidSort(String),

    #[error("Idempotent key evaluation failed: {0}")]
    Key(#[from] ExpressionError),

    #[error("Idempotent repository error: {0}")]
    Repository(#[from] RepositoryError),
}

pub type Result<T> = std::result::Result<T, FilterError>;

/// User supplied predicate over discovered files.
pub type FilePredicate = Arc<dyn Fn(&WatchedFile) -> bool + Send + Sync>;

/// Why a file was or was not selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Hidden,
    Internal,
    Excluded,
    NotIncluded,
    Rejected,
    DoneFile,
    AwaitingDoneFile,
    AlreadyProcessed,
}

/// Compile `pattern` so it must match the whole file name.
pub fn full_match_regex(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{})$", pattern)).map_err(|source| FilterError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Split `"txt, CSV,tar.gz"` into lowercase extensions.
pub fn parse_extensions(list: &str) -> Vec<String> {
    list.split(',')
        .map(|e| e.trim().trim_start_matches('.').to_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

fn has_extension(name: &str, extensions: &[String]) -> bool {
    let lower = name.to_lowercase();
    extensions.iter().any(|ext| lower.ends_with(&format!(".{}", ext)))
}

#[derive(Clone, Default)]
pub struct FilterChain {
    include: Option<Regex>,
    exclude: Option<Regex>,
    include_ext: Vec<String>,
    exclude_ext: Vec<String>,
    ant_include: Option<Regex>,
    ant_exclude: Option<Regex>,
    predicate: Option<FilePredicate>,
    done_file: Option<DoneFileName>,
    repository: Option<Arc<dyn IdempotentRepository>>,
    key: Option<Expression>,
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("include", &self.include)
            .field("exclude", &self.exclude)
            .field("include_ext", &self.include_ext)
            .field("exclude_ext", &self.exclude_ext)
            .field("ant_include", &self.ant_include)
            .field("ant_exclude", &self.ant_exclude)
            .field("predicate", &self.predicate.is_some())
            .field("done_file", &self.done_file)
            .field("idempotent", &self.repository.is_some())
            .field("key", &self.key)
            .finish()
    }
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include(mut self, pattern: &str) -> Result<Self> {
        self.include = Some(full_match_regex(pattern)?);
        Ok(self)
    }

    pub fn exclude(mut self, pattern: &str) -> Result<Self> {
        self.exclude = Some(full_match_regex(pattern)?);
        Ok(self)
    }

    pub fn include_ext(mut self, list: &str) -> Self {
        self.include_ext = parse_extensions(list);
        self
    }

    pub fn exclude_ext(mut self, list: &str) -> Self {
        self.exclude_ext = parse_extensions(list);
        self
    }

    /// Comma separated Ant patterns over the relative path.
    pub fn ant_include(mut self, list: &str, case_sensitive: bool) -> Result<Self> {
        self.ant_include = Some(ant::ant_regex(list, case_sensitive)?);
        Ok(self)
    }

    pub fn ant_exclude(mut self, list: &str, case_sensitive: bool) -> Result<Self> {
        self.ant_exclude = Some(ant::ant_regex(list, case_sensitive)?);
        Ok(self)
    }

    pub fn predicate(mut self, predicate: FilePredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn done_file(mut self, done: DoneFileName) -> Self {
        self.done_file = Some(done);
        self
    }

    /// Skip files whose key (default: relative path) is already recorded.
    pub fn idempotent(mut self, repository: Arc<dyn IdempotentRepository>, key: Option<Expression>) -> Self {
        self.repository = Some(repository);
        self.key = key;
        self
    }

    pub fn done_file_name(&self) -> Option<&DoneFileName> {
        self.done_file.as_ref()
    }

    pub fn repository(&self) -> Option<&Arc<dyn IdempotentRepository>> {
        self.repository.as_ref()
    }

    /// Idempotent key for `file`.
    pub fn key_for(&self, file: &WatchedFile) -> Result<String> {
        match &self.key {
            Some(expr) => Ok(expr.evaluate(&Context::for_file(file))?),
            None => Ok(file.relative_name()),
        }
    }

    /// Name-only checks (steps 1-3). Used for eager limiting as well.
    fn matches_name(&self, file: &WatchedFile) -> Verdict {
        let name = file.name();

        if name.starts_with('.') {
            return Verdict::Hidden;
        }
        if is_lock_artifact(&name) {
            return Verdict::Internal;
        }

        if self.exclude.as_ref().is_some_and(|re| re.is_match(&name)) {
            return Verdict::Excluded;
        }
        if !self.exclude_ext.is_empty() && has_extension(&name, &self.exclude_ext) {
            return Verdict::Excluded;
        }
        if self.include.as_ref().is_some_and(|re| !re.is_match(&name)) {
            return Verdict::NotIncluded;
        }
        if !self.include_ext.is_empty() && !has_extension(&name, &self.include_ext) {
            return Verdict::NotIncluded;
        }

        if self.ant_include.is_some() || self.ant_exclude.is_some() {
            let path = file.relative_name();
            if self.ant_exclude.as_ref().is_some_and(|re| re.is_match(&path)) {
                return Verdict::Excluded;
            }
            if self.ant_include.as_ref().is_some_and(|re| !re.is_match(&path)) {
                return Verdict::NotIncluded;
            }
        }

        if let Some(predicate) = &self.predicate {
            if !predicate(file) {
                return Verdict::Rejected;
            }
        }

        Verdict::Accept
    }

    pub fn evaluate(&self, file: &WatchedFile) -> Result<Verdict> {
        let verdict = self.matches_name(file);
        if verdict != Verdict::Accept {
            trace!(file = %file.relative_name(), ?verdict, "Filtered out");
            return Ok(verdict);
        }

        if let Some(done) = &self.done_file {
            if done.is_done_file(&file.name()) {
                return Ok(Verdict::DoneFile);
            }
            if !done.for_path(file.absolute_path()).exists() {
                trace!(file = %file.relative_name(), "Waiting for done file");
                return Ok(Verdict::AwaitingDoneFile);
            }
        }

        if let Some(repository) = &self.repository {
            let key = self.key_for(file)?;
            if repository.contains(&key)? {
                trace!(file = %file.relative_name(), key, "Already processed");
                return Ok(Verdict::AlreadyProcessed);
            }
        }

        Ok(Verdict::Accept)
    }

    pub fn accepts(&self, file: &WatchedFile) -> Result<bool> {
        Ok(self.evaluate(file)? == Verdict::Accept)
    }
}
