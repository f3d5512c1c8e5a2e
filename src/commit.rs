//! What happens to a file once its exchange has an outcome
//!
//! The success branch deletes, moves or leaves the file untouched; the
//! failure branch moves it to `moveFailed` when configured and otherwise
//! leaves it for the next cycle. Moves resolve their destination through an
//! [`Expression`], create missing parents, and apply the configured
//! [`FileExist`] policy when the destination is occupied.

use chrono::Utc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::done::DoneFileName;
use crate::expression::{Context, Expression, ExpressionError};
use crate::file::WatchedFile;
use crate::relocate::{self, FileExist, RenameOptions};

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("Invalid destination: {0}")]
    Expression(#[from] ExpressionError),

    #[error("I/O error committing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Destination already exists: {0}")]
    Conflict(PathBuf),

    #[error("Existing file policy Move requires moveExisting")]
    MissingMoveExisting,

    #[error("Invalid commit options: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, CommitError>;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> CommitError + '_ {
    move |source| CommitError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Terminal action for one branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitPlan {
    Delete,
    MoveTo(Expression),
    NoOp,
}

/// What a commit actually did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Deleted,
    Moved(PathBuf),
    /// Destination was occupied and the policy was `Ignore`; source dropped.
    Discarded(PathBuf),
    Untouched,
    /// Failure without `moveFailed`: the claim decides between retry and fence.
    LeftInPlace,
}

#[derive(Debug, Clone)]
pub struct CommitStrategy {
    on_success: CommitPlan,
    move_failed: Option<Expression>,
    pre_move: Option<Expression>,
    existing: FileExist,
    move_existing: Option<Expression>,
    rename: RenameOptions,
    done_file: Option<DoneFileName>,
}

impl Default for CommitStrategy {
    fn default() -> Self {
        Self {
            on_success: CommitPlan::Delete,
            move_failed: None,
            pre_move: None,
            existing: FileExist::Override,
            move_existing: None,
            rename: RenameOptions::default(),
            done_file: None,
        }
    }
}

impl CommitStrategy {
    /// Build from the raw consumer options. `delete` and `move`, or `noop`
    /// with either, are contradictory.
    pub fn from_options(delete: bool, noop: bool, move_to: Option<&str>) -> Result<Self> {
        let on_success = match (delete, noop, move_to) {
            (true, _, Some(_)) => {
                return Err(CommitError::Invalid("delete and move are mutually exclusive".into()));
            }
            (_, true, Some(_)) | (true, true, None) => {
                return Err(CommitError::Invalid("noop excludes delete and move".into()));
            }
            (_, true, None) => CommitPlan::NoOp,
            (_, false, Some(dir)) => CommitPlan::MoveTo(Expression::directory_or_template(dir)?),
            (_, false, None) => CommitPlan::Delete,
        };
        Ok(Self {
            on_success,
            ..Default::default()
        })
    }

    pub fn on_success(mut self, plan: CommitPlan) -> Self {
        self.on_success = plan;
        self
    }

    pub fn move_failed(mut self, destination: Expression) -> Self {
        self.move_failed = Some(destination);
        self
    }

    pub fn pre_move(mut self, destination: Expression) -> Self {
        self.pre_move = Some(destination);
        self
    }

    pub fn existing(mut self, policy: FileExist, move_existing: Option<Expression>) -> Result<Self> {
        if policy == FileExist::Move && move_existing.is_none() {
            return Err(CommitError::MissingMoveExisting);
        }
        self.existing = policy;
        self.move_existing = move_existing;
        Ok(self)
    }

    pub fn rename_options(mut self, options: RenameOptions) -> Self {
        self.rename = options;
        self
    }

    pub fn done_file(mut self, done: Option<DoneFileName>) -> Self {
        self.done_file = done;
        self
    }

    pub fn plan(&self) -> &CommitPlan {
        &self.on_success
    }

    pub fn is_noop(&self) -> bool {
        self.on_success == CommitPlan::NoOp
    }

    /// Relocate the claimed content before processing. `file` is the
    /// logical snapshot expressions see; `source` is where the bytes are.
    pub fn apply_pre_move(&self, source: &Path, file: &WatchedFile) -> Result<Option<PathBuf>> {
        let Some(expr) = &self.pre_move else {
            return Ok(None);
        };
        let destination = self.resolve(expr, file)?;
        if destination == source {
            return Ok(None);
        }
        self.move_into_place(source, &destination)?;
        debug!(from = %source.display(), to = %destination.display(), "Pre-moved file");
        Ok(Some(destination))
    }

    pub fn commit_success(&self, source: &Path, file: &WatchedFile) -> Result<CommitOutcome> {
        let outcome = match &self.on_success {
            CommitPlan::Delete => {
                match fs::remove_file(source) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(io_err(source)(e)),
                }
                CommitOutcome::Deleted
            }
            CommitPlan::MoveTo(expr) => {
                let destination = self.resolve(expr, file)?;
                self.move_into_place(source, &destination)?
            }
            CommitPlan::NoOp => CommitOutcome::Untouched,
        };
        info!(file = %file.relative_name(), ?outcome, "Committed file");
        Ok(outcome)
    }

    pub fn commit_failure(&self, source: &Path, file: &WatchedFile) -> Result<CommitOutcome> {
        let Some(expr) = &self.move_failed else {
            return Ok(CommitOutcome::LeftInPlace);
        };
        let destination = self.resolve(expr, file)?;
        let outcome = self.move_into_place(source, &destination)?;
        info!(file = %file.relative_name(), ?outcome, "Moved failed file");
        Ok(outcome)
    }

    /// Delete the done file gating `original`, if configured.
    pub fn delete_done_file(&self, original: &Path) -> Result<bool> {
        let Some(done) = &self.done_file else {
            return Ok(false);
        };
        let path = done.for_path(original);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(done = %path.display(), "Deleted done file");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    fn resolve(&self, expr: &Expression, file: &WatchedFile) -> Result<PathBuf> {
        let ctx = Context {
            file: Some(file),
            headers: None,
            now: Utc::now(),
        };
        Ok(expr.evaluate_path(&ctx, file.root())?)
    }

    fn move_into_place(&self, source: &Path, destination: &Path) -> Result<CommitOutcome> {
        if source == destination {
            return Ok(CommitOutcome::Untouched);
        }
        relocate::create_parent(destination).map_err(io_err(destination))?;

        if destination.exists() {
            match self.existing {
                FileExist::Override => {}
                FileExist::Fail => return Err(CommitError::Conflict(destination.to_path_buf())),
                FileExist::Ignore => {
                    fs::remove_file(source).map_err(io_err(source))?;
                    return Ok(CommitOutcome::Discarded(destination.to_path_buf()));
                }
                FileExist::Append => {
                    relocate::append_file(source, destination, None).map_err(io_err(destination))?;
                    fs::remove_file(source).map_err(io_err(source))?;
                    return Ok(CommitOutcome::Moved(destination.to_path_buf()));
                }
                FileExist::TryRename => {
                    let placed = self.link_beside(source, destination)?;
                    return Ok(CommitOutcome::Moved(placed));
                }
                FileExist::Move => self.move_occupant(destination)?,
            }
        }

        relocate::rename_file(source, destination, self.rename).map_err(io_err(source))?;
        Ok(CommitOutcome::Moved(destination.to_path_buf()))
    }

    /// TryRename: place `source` under the first free suffixed name. Content
    /// from another device is staged next to the destination first.
    fn link_beside(&self, source: &Path, destination: &Path) -> Result<PathBuf> {
        match relocate::link_to_free_name(source, destination) {
            Ok(placed) => Ok(placed),
            Err(e) if self.rename.copy_and_delete_on_fail || self.rename.rename_using_copy => {
                debug!(error = %e, "Hard link failed, staging a copy");
                let mut name = std::ffi::OsString::from(".");
                name.push(destination.file_name().unwrap_or_default());
                name.push(format!(".{}.staging", uuid::Uuid::new_v4().simple()));
                let staging = destination.with_file_name(name);
                fs::copy(source, &staging).map_err(io_err(&staging))?;
                let placed = relocate::link_to_free_name(&staging, destination).map_err(|e| {
                    let _ = fs::remove_file(&staging);
                    io_err(destination)(e)
                })?;
                fs::remove_file(source).map_err(io_err(source))?;
                Ok(placed)
            }
            Err(e) => Err(io_err(destination)(e)),
        }
    }

    fn move_occupant(&self, occupant: &Path) -> Result<()> {
        let expr = self.move_existing.as_ref().ok_or(CommitError::MissingMoveExisting)?;
        let base = occupant.parent().unwrap_or(Path::new("."));
        let snapshot = WatchedFile::stat(base, occupant).map_err(io_err(occupant))?;
        let ctx = Context::for_file(&snapshot);
        let aside = expr.evaluate_path(&ctx, base)?;
        relocate::create_parent(&aside).map_err(io_err(&aside))?;
        relocate::rename_file(occupant, &aside, self.rename).map_err(io_err(occupant))?;
        debug!(occupant = %occupant.display(), to = %aside.display(), "Moved existing file aside");
        Ok(())
    }
}
