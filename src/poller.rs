//! Directory scanning
//!
//! One scan walks the watched root (depth bounded), re-stats every regular
//! file and yields [`WatchedFile`] snapshots in discovery order.
//! [`Poller::collect`] then runs the filter chain, orders the survivors and
//! applies the per-poll limit.

use rand::seq::SliceRandom;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, trace};
use walkdir::WalkDir;

use crate::file::WatchedFile;
use crate::filter::{FilterChain, FilterError, SortBy, Verdict};

#[derive(Debug, Error)]
pub enum PollError {
    #[error("Watched directory does not exist: {0}")]
    MissingDirectory(PathBuf),

    #[error("Watched path is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Failed to create watched directory {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to list {path}: {source}")]
    Listing {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),
}

impl PollError {
    /// Configuration problems, as opposed to transient I/O.
    pub fn is_configuration(&self) -> bool {
        matches!(self, PollError::MissingDirectory(_) | PollError::NotADirectory(_))
    }
}

pub type Result<T> = std::result::Result<T, PollError>;

#[derive(Debug, Clone)]
pub struct PollerOptions {
    pub recursive: bool,
    pub min_depth: Option<usize>,
    pub max_depth: Option<usize>,
    pub auto_create: bool,
    pub directory_must_exist: bool,
    pub sort_by: Option<SortBy>,
    pub shuffle: bool,
    pub max_messages_per_poll: Option<usize>,
    pub eager_max_messages_per_poll: bool,
}

impl Default for PollerOptions {
    fn default() -> Self {
        Self {
            recursive: false,
            min_depth: None,
            max_depth: None,
            auto_create: true,
            directory_must_exist: false,
            sort_by: None,
            shuffle: false,
            max_messages_per_poll: None,
            eager_max_messages_per_poll: true,
        }
    }
}

/// Result of one filtered scan.
#[derive(Debug, Default)]
pub struct Candidates {
    pub files: Vec<WatchedFile>,
    /// Files seen but rejected by the filter chain.
    pub filtered: usize,
    /// Whether the per-poll limit cut the list short.
    pub limited: bool,
}

#[derive(Debug, Clone)]
pub struct Poller {
    root: PathBuf,
    options: PollerOptions,
}

impl Poller {
    pub fn new(root: impl Into<PathBuf>, options: PollerOptions) -> Self {
        Self {
            root: root.into(),
            options,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn options(&self) -> &PollerOptions {
        &self.options
    }

    /// Check (and with `auto_create`, create) the watched root.
    /// Returns `false` when the root is absent and that is tolerated.
    pub fn prepare(&self) -> Result<bool> {
        match fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => Ok(true),
            Ok(_) => Err(PollError::NotADirectory(self.root.clone())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if self.options.directory_must_exist {
                    Err(PollError::MissingDirectory(self.root.clone()))
                } else if self.options.auto_create {
                    fs::create_dir_all(&self.root).map_err(|source| PollError::Create {
                        path: self.root.clone(),
                        source,
                    })?;
                    info!(root = %self.root.display(), "Created watched directory");
                    Ok(true)
                } else {
                    debug!(root = %self.root.display(), "Watched directory absent");
                    Ok(false)
                }
            }
            Err(source) => Err(PollError::Listing {
                path: self.root.clone(),
                source,
            }),
        }
    }

    fn depth_bounds(&self) -> (usize, usize) {
        let min = self.options.min_depth.unwrap_or(1).max(1);
        let max = if self.options.recursive {
            self.options.max_depth.unwrap_or(usize::MAX)
        } else {
            1
        };
        (min, max.max(min))
    }

    /// Walk the root, calling `visit` for every re-stat'd regular file.
    /// `visit` returns `false` to stop early.
    fn walk<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(WatchedFile) -> Result<bool>,
    {
        if !self.prepare()? {
            return Ok(());
        }

        let (min_depth, max_depth) = self.depth_bounds();
        let walker = WalkDir::new(&self.root)
            .min_depth(min_depth)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0 || !(e.file_type().is_dir() && e.file_name().to_string_lossy().starts_with('.'))
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
                    let source = io::Error::from(e);
                    if source.kind() == io::ErrorKind::NotFound {
                        trace!(path = %path.display(), "Entry vanished during listing");
                        continue;
                    }
                    return Err(PollError::Listing { path, source });
                }
            };

            if entry.file_type().is_dir() {
                continue;
            }

            let file = match WatchedFile::stat(&self.root, entry.path()) {
                Ok(file) => file,
                Err(e) => {
                    trace!(path = %entry.path().display(), error = %e, "Skipping entry");
                    continue;
                }
            };

            if !visit(file)? {
                break;
            }
        }
        Ok(())
    }

    /// Every regular file under the root, in discovery order.
    pub fn scan(&self) -> Result<Vec<WatchedFile>> {
        let mut files = Vec::new();
        self.walk(|file| {
            files.push(file);
            Ok(true)
        })?;
        debug!(root = %self.root.display(), count = files.len(), "Scanned directory");
        Ok(files)
    }

    /// Filter, order and limit one scan.
    pub fn collect(&self, chain: &FilterChain) -> Result<Candidates> {
        let limit = self.options.max_messages_per_poll.filter(|n| *n > 0);
        let eager = self.options.eager_max_messages_per_poll
            && self.options.sort_by.is_none()
            && !self.options.shuffle;

        let mut candidates = Candidates::default();
        self.walk(|file| {
            if chain.evaluate(&file)? != Verdict::Accept {
                candidates.filtered += 1;
                return Ok(true);
            }
            candidates.files.push(file);
            match limit {
                Some(max) if eager && candidates.files.len() >= max => {
                    candidates.limited = true;
                    Ok(false)
                }
                _ => Ok(true),
            }
        })?;

        if let Some(sort_by) = &self.options.sort_by {
            sort_by.sort(&mut candidates.files);
        }
        if self.options.shuffle {
            candidates.files.shuffle(&mut rand::thread_rng());
        }
        if let Some(max) = limit {
            if candidates.files.len() > max {
                candidates.files.truncate(max);
                candidates.limited = true;
            }
        }

        if candidates.limited {
            debug!(root = %self.root.display(), limit, "Limited files picked up in this poll");
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(root: &Path, relative: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, relative).unwrap();
    }

    fn relative_names(files: &[WatchedFile]) -> Vec<String> {
        files.iter().map(WatchedFile::relative_name).collect()
    }

    #[test]
    fn test_scan_non_recursive() {
        let temp_dir = TempDir::new().unwrap();
        touch(temp_dir.path(), "a.txt");
        touch(temp_dir.path(), "sub/b.txt");

        let poller = Poller::new(temp_dir.path(), PollerOptions::default());
        assert_eq!(relative_names(&poller.scan().unwrap()), vec!["a.txt"]);
    }

    #[test]
    fn test_scan_recursive_with_depth_bounds() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        touch(root, "a.txt");
        touch(root, "one/b.txt");
        touch(root, "one/two/c.txt");
        touch(root, ".hidden/d.txt");

        let recursive = PollerOptions {
            recursive: true,
            ..Default::default()
        };
        let files = Poller::new(root, recursive.clone()).scan().unwrap();
        assert_eq!(relative_names(&files), vec!["a.txt", "one/b.txt", "one/two/c.txt"]);

        let bounded = PollerOptions {
            min_depth: Some(2),
            max_depth: Some(2),
            ..recursive
        };
        let files = Poller::new(root, bounded).scan().unwrap();
        assert_eq!(relative_names(&files), vec!["one/b.txt"]);
    }

    #[test]
    fn test_missing_root_handling() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("inbox");

        let lenient = PollerOptions {
            auto_create: false,
            ..Default::default()
        };
        assert!(Poller::new(&missing, lenient).scan().unwrap().is_empty());
        assert!(!missing.exists());

        let strict = PollerOptions {
            directory_must_exist: true,
            ..Default::default()
        };
        let err = Poller::new(&missing, strict).scan().unwrap_err();
        assert!(err.is_configuration());

        assert!(Poller::new(&missing, PollerOptions::default()).scan().unwrap().is_empty());
        assert!(missing.is_dir());
    }

    #[test]
    fn test_collect_sorts_and_limits() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        for name in ["d.txt", "b.txt", "a.txt", "c.txt", ".hidden"] {
            touch(root, name);
        }

        let options = PollerOptions {
            sort_by: Some("reverse:file:name".parse().unwrap()),
            max_messages_per_poll: Some(2),
            ..Default::default()
        };
        let candidates = Poller::new(root, options).collect(&FilterChain::new()).unwrap();
        assert_eq!(relative_names(&candidates.files), vec!["d.txt", "c.txt"]);
        assert_eq!(candidates.filtered, 1);
        assert!(candidates.limited);
    }

    #[test]
    fn test_collect_eager_limit_stops_early() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        for name in ["a.txt", "b.txt", "c.txt"] {
            touch(root, name);
        }

        let options = PollerOptions {
            max_messages_per_poll: Some(1),
            ..Default::default()
        };
        let candidates = Poller::new(root, options).collect(&FilterChain::new()).unwrap();
        assert_eq!(relative_names(&candidates.files), vec!["a.txt"]);
        assert!(candidates.limited);
    }

    #[test]
    fn test_collect_shuffle_keeps_all_files() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        for i in 0..10 {
            touch(root, &format!("f{}.txt", i));
        }

        let options = PollerOptions {
            shuffle: true,
            ..Default::default()
        };
        let mut names = relative_names(&Poller::new(root, options).collect(&FilterChain::new()).unwrap().files);
        names.sort();
        assert_eq!(names.len(), 10);
        assert_eq!(names[0], "f0.txt");
    }
}
