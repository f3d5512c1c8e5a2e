//! Exclusive file claims
//!
//! A claim is the right to process one file. It is represented on disk so
//! that independent processes sharing the directory agree on ownership:
//!
//! - [`LockStrategy::Marker`] creates a sibling `<name>.spoollock` with
//!   create-new semantics. Whoever creates it owns the file.
//! - [`LockStrategy::Rename`] renames the file to
//!   `<name>.<millis>.inprogress`. Only one rename of the source can succeed.
//! - [`LockStrategy::None`] records nothing; only safe for a single consumer
//!   that relies on its idempotent repository.
//!
//! Markers left behind by a crash are released by [`LockManager::release_orphans`]
//! on startup, or lazily when a stale marker blocks a claim.
//!
//! [`ChangedCheck`] is an optional gate in front of any strategy: a file is
//! only claimed once its size and modification time stop changing.

pub mod changed;
pub mod marker;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::file::WatchedFile;
use marker::{MarkerRecord, MarkerState};

pub use changed::ChangedCheck;
pub use marker::{IN_PROGRESS_SUFFIX, LOCK_SUFFIX, is_lock_artifact, marker_path};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("I/O error on lock artifact {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Timed out after {waited:?} waiting for lock on {path}")]
    Timeout { path: PathBuf, waited: Duration },
}

pub type Result<T> = std::result::Result<T, LockError>;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> LockError + '_ {
    move |source| LockError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStrategy {
    #[default]
    Marker,
    Rename,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Artifact {
    Marker(PathBuf),
    InProgress(PathBuf),
    Nothing,
}

/// Exclusive right to process one file.
///
/// Must be ended with [`LockManager::release`] or [`LockManager::fence`].
#[derive(Debug)]
#[must_use = "a claim must be released or fenced"]
pub struct Claim {
    file: WatchedFile,
    artifact: Artifact,
    working_path: PathBuf,
    acquired_at: DateTime<Utc>,
    owner: Uuid,
}

impl Claim {
    /// The file as discovered.
    pub fn file(&self) -> &WatchedFile {
        &self.file
    }

    /// Where the claimed content currently lives. Differs from the
    /// discovered path under the rename strategy or after a pre-move.
    pub fn working_path(&self) -> &Path {
        &self.working_path
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    /// Record that the content was moved (pre-move).
    pub fn relocate(&mut self, path: PathBuf) {
        self.working_path = path;
    }

    /// Replace the snapshot after re-validation.
    pub fn refresh_file(&mut self, file: WatchedFile) {
        self.file = file;
    }
}

/// Lock held on an arbitrary path, released on drop.
#[derive(Debug)]
pub struct PathLock {
    marker: PathBuf,
}

impl PathLock {
    pub fn marker(&self) -> &Path {
        &self.marker
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        if let Err(e) = marker::remove_if_exists(&self.marker) {
            warn!(marker = %self.marker.display(), error = %e, "Failed to remove lock marker");
        }
    }
}

/// Claims files on behalf of one consumer or producer instance.
#[derive(Debug)]
pub struct LockManager {
    strategy: LockStrategy,
    stale_after: Duration,
    owner: Uuid,
}

impl LockManager {
    pub fn new(strategy: LockStrategy, stale_after: Duration) -> Self {
        let owner = Uuid::now_v7();
        marker::register_owner(owner);
        debug!(%owner, ?strategy, "Lock manager created");
        Self {
            strategy,
            stale_after,
            owner,
        }
    }

    pub fn strategy(&self) -> LockStrategy {
        self.strategy
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    /// Try to claim `file`. `Ok(None)` means someone else holds it or it
    /// vanished; skip it this cycle.
    pub fn try_claim(&self, file: &WatchedFile) -> Result<Option<Claim>> {
        let now = Utc::now();
        let target = file.absolute_path();

        let artifact = match self.strategy {
            LockStrategy::Marker => {
                let marker = marker_path(target);
                if !self.create_or_reclaim(&marker, now)? {
                    debug!(file = %target.display(), "File already claimed");
                    return Ok(None);
                }
                Artifact::Marker(marker)
            }
            LockStrategy::Rename => {
                let in_progress = marker::in_progress_path(target, now);
                match fs::rename(target, &in_progress) {
                    Ok(()) => Artifact::InProgress(in_progress),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        debug!(file = %target.display(), "File renamed by another consumer");
                        return Ok(None);
                    }
                    Err(e) => return Err(io_err(target)(e)),
                }
            }
            LockStrategy::None => Artifact::Nothing,
        };

        let working_path = match &artifact {
            Artifact::InProgress(path) => path.clone(),
            _ => target.to_path_buf(),
        };

        debug!(file = %target.display(), owner = %self.owner, "Claimed file");
        Ok(Some(Claim {
            file: file.clone(),
            artifact,
            working_path,
            acquired_at: now,
            owner: self.owner,
        }))
    }

    /// Create the marker, reclaiming it once if the current one is abandoned.
    fn create_or_reclaim(&self, marker: &Path, now: DateTime<Utc>) -> Result<bool> {
        let record = MarkerRecord::new(self.owner, now);
        match marker::create_marker(marker, &record) {
            Ok(()) => return Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(io_err(marker)(e)),
        }

        if !self.reclaim_if_abandoned(marker, now)? {
            return Ok(false);
        }

        match marker::create_marker(marker, &record) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists || e.kind() == io::ErrorKind::NotFound => {
                Ok(false)
            }
            Err(e) => Err(io_err(marker)(e)),
        }
    }

    /// Remove `marker` if it is abandoned.
    ///
    /// Reclaimers in the same directory are serialized through a
    /// [`marker::ReclaimGuard`] and re-check the marker while holding it, so a
    /// marker created by another reclaimer is never removed.
    fn reclaim_if_abandoned(&self, marker: &Path, now: DateTime<Utc>) -> Result<bool> {
        match self.abandoned(marker, now)? {
            Some(false) => return Ok(false),
            None => return Ok(true),
            Some(true) => {}
        }

        let dir = marker.parent().unwrap_or(Path::new("."));
        let _guard = marker::ReclaimGuard::acquire(dir).map_err(io_err(dir))?;
        match self.abandoned(marker, now)? {
            Some(false) => return Ok(false),
            None => return Ok(true),
            Some(true) => {}
        }

        marker::remove_if_exists(marker).map_err(io_err(marker))?;
        info!(marker = %marker.display(), "Released abandoned claim");
        Ok(true)
    }

    /// `None` when the marker is gone.
    fn abandoned(&self, marker: &Path, now: DateTime<Utc>) -> Result<Option<bool>> {
        match MarkerState::read(marker) {
            Ok(state) => Ok(Some(state.is_abandoned(now, self.stale_after))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(marker)(e)),
        }
    }

    /// End a claim normally. Markers are deleted; an in-progress file that
    /// was not committed away is renamed back to its original name.
    pub fn release(&self, claim: Claim) -> Result<()> {
        match &claim.artifact {
            Artifact::Marker(marker) => {
                marker::remove_if_exists(marker).map_err(io_err(marker))?;
            }
            Artifact::InProgress(in_progress) => {
                if claim.working_path == *in_progress && in_progress.exists() {
                    fs::rename(in_progress, claim.file.absolute_path()).map_err(io_err(in_progress))?;
                }
            }
            Artifact::Nothing => {}
        }
        debug!(file = %claim.file.absolute_path().display(), "Released claim");
        Ok(())
    }

    /// End a claim but keep the file fenced from being claimed again until
    /// an operator intervenes. Fenced artifacts are never considered stale.
    pub fn fence(&self, claim: Claim) -> Result<()> {
        match &claim.artifact {
            Artifact::Marker(marker) => {
                let mut record = MarkerRecord::new(self.owner, claim.acquired_at);
                record.fenced = true;
                marker::overwrite_marker(marker, &record).map_err(io_err(marker))?;
            }
            Artifact::InProgress(in_progress) => {
                if claim.working_path == *in_progress && in_progress.exists() {
                    let fenced = marker::fenced_path(claim.file.absolute_path());
                    fs::rename(in_progress, &fenced).map_err(io_err(in_progress))?;
                }
            }
            Artifact::Nothing => {}
        }
        warn!(file = %claim.file.absolute_path().display(), "File fenced after failure");
        Ok(())
    }

    /// Lock an arbitrary path (which need not exist), waiting up to `timeout`.
    pub fn lock_path(&self, target: &Path, timeout: Duration) -> Result<PathLock> {
        let marker = marker_path(target);
        let started = Instant::now();
        loop {
            let now = Utc::now();
            let record = MarkerRecord::new(self.owner, now);
            match marker::create_marker(&marker, &record) {
                Ok(()) => return Ok(PathLock { marker }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if self.reclaim_if_abandoned(&marker, now)? {
                        continue;
                    }
                }
                Err(e) => return Err(io_err(&marker)(e)),
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(LockError::Timeout {
                    path: target.to_path_buf(),
                    waited,
                });
            }
            thread::sleep(Duration::from_millis(20).min(timeout - waited));
        }
    }

    /// Release every abandoned artifact under `root`. Returns how many were
    /// released.
    pub fn release_orphans(&self, root: &Path, recursive: bool) -> Result<usize> {
        if !root.is_dir() {
            return Ok(0);
        }
        let now = Utc::now();
        let mut walker = WalkDir::new(root).min_depth(1);
        if !recursive {
            walker = walker.max_depth(1);
        }

        let mut released = 0;
        for entry in walker.into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let name = entry.file_name().to_string_lossy();

            if name.ends_with(LOCK_SUFFIX) {
                if self.reclaim_if_abandoned(path, now)? {
                    released += 1;
                }
            } else if name.ends_with(IN_PROGRESS_SUFFIX) {
                let Some((original, acquired)) = marker::parse_in_progress(path) else {
                    continue;
                };
                let age = now.signed_duration_since(acquired).to_std().unwrap_or_default();
                if age > self.stale_after && !original.exists() {
                    fs::rename(path, &original).map_err(io_err(path))?;
                    info!(file = %original.display(), "Restored abandoned in-progress file");
                    released += 1;
                }
            }
        }

        if released > 0 {
            info!(root = %root.display(), released, "Released orphaned claims");
        }
        Ok(released)
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        marker::unregister_owner(self.owner);
    }
}
