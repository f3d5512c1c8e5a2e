//! On-disk lock marker records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const LOCK_SUFFIX: &str = ".spoollock";
pub const IN_PROGRESS_SUFFIX: &str = ".inprogress";
pub const FENCED_TAG: &str = "fenced";
/// Per-directory file whose advisory lock serializes stale-marker reclaims.
pub const RECLAIM_GUARD: &str = ".spoolbox.reclaim";

/// Owners of lock managers alive in this process.
static LIVE_OWNERS: LazyLock<Mutex<HashSet<Uuid>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

pub(crate) fn register_owner(owner: Uuid) {
    if let Ok(mut owners) = LIVE_OWNERS.lock() {
        owners.insert(owner);
    }
}

pub(crate) fn unregister_owner(owner: Uuid) {
    if let Ok(mut owners) = LIVE_OWNERS.lock() {
        owners.remove(&owner);
    }
}

/// Content of a `.spoollock` marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerRecord {
    pub owner: Uuid,
    pub pid: u32,
    pub acquired_at_ms: i64,
    #[serde(default)]
    pub fenced: bool,
}

impl MarkerRecord {
    pub fn new(owner: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            owner,
            pid: std::process::id(),
            acquired_at_ms: now.timestamp_millis(),
            fenced: false,
        }
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.acquired_at_ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Whether the process holding this marker is still running.
    pub fn owner_alive(&self) -> bool {
        if self.pid == std::process::id() {
            return LIVE_OWNERS
                .lock()
                .map(|owners| owners.contains(&self.owner))
                .unwrap_or(true);
        }
        process_alive(self.pid)
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 only checks that the process exists
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // Liveness unknown; never reclaim from another process by age alone
    true
}

/// What is known about a marker found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerState {
    /// Readable record.
    Record(MarkerRecord),
    /// Empty or unparsable (possibly mid-write); age taken from mtime.
    Unreadable { modified: DateTime<Utc> },
}

impl MarkerState {
    pub fn read(path: &Path) -> io::Result<Self> {
        let content = fs::read(path)?;
        match serde_json::from_slice::<MarkerRecord>(&content) {
            Ok(record) => Ok(MarkerState::Record(record)),
            Err(_) => {
                let modified = fs::metadata(path)?
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                Ok(MarkerState::Unreadable { modified })
            }
        }
    }

    /// A marker is abandoned when it is older than `stale_after` and its
    /// owner is gone. Fenced markers are never abandoned.
    pub fn is_abandoned(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        let stale_after = chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX);
        match self {
            MarkerState::Record(record) => {
                !record.fenced
                    && now.signed_duration_since(record.acquired_at()) > stale_after
                    && !record.owner_alive()
            }
            MarkerState::Unreadable { modified } => now.signed_duration_since(*modified) > stale_after,
        }
    }
}

/// `/in/a.txt` -> `/in/a.txt.spoollock`
pub fn marker_path(target: &Path) -> PathBuf {
    append_to_name(target, LOCK_SUFFIX)
}

/// `/in/a.txt` -> `/in/a.txt.{millis}.inprogress`
pub fn in_progress_path(target: &Path, now: DateTime<Utc>) -> PathBuf {
    append_to_name(
        target,
        &format!(".{}{}", now.timestamp_millis(), IN_PROGRESS_SUFFIX),
    )
}

/// `/in/a.txt` -> `/in/a.txt.fenced.inprogress`
pub fn fenced_path(target: &Path) -> PathBuf {
    append_to_name(target, &format!(".{}{}", FENCED_TAG, IN_PROGRESS_SUFFIX))
}

/// Parse an in-progress name back into the original path and claim time.
///
/// Fenced names yield `None` since they are never restored automatically.
pub fn parse_in_progress(path: &Path) -> Option<(PathBuf, DateTime<Utc>)> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(IN_PROGRESS_SUFFIX)?;
    let (original, millis) = stem.rsplit_once('.')?;
    let millis: i64 = millis.parse().ok()?;
    let acquired = DateTime::<Utc>::from_timestamp_millis(millis)?;
    Some((path.with_file_name(original), acquired))
}

pub fn is_lock_artifact(name: &str) -> bool {
    name.ends_with(LOCK_SUFFIX) || name.ends_with(IN_PROGRESS_SUFFIX) || name == RECLAIM_GUARD
}

/// Exclusive advisory lock on a directory's reclaim guard, held until drop.
///
/// The guard file is never deleted, so every reclaimer locks the same inode.
/// The OS drops the lock when its holder exits.
#[derive(Debug)]
pub struct ReclaimGuard {
    _file: fs::File,
}

impl ReclaimGuard {
    pub fn acquire(dir: &Path) -> io::Result<Self> {
        use fs2::FileExt;

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(dir.join(RECLAIM_GUARD))?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

fn append_to_name(target: &Path, suffix: &str) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    target.with_file_name(name)
}

/// Atomically create the marker; fails with `AlreadyExists` if present.
pub fn create_marker(path: &Path, record: &MarkerRecord) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let body = serde_json::to_vec(record).map_err(io::Error::other)?;
    if let Err(e) = file.write_all(&body).and_then(|_| file.sync_data()) {
        let _ = fs::remove_file(path);
        return Err(e);
    }
    Ok(())
}

/// Rewrite a marker we already own.
pub fn overwrite_marker(path: &Path, record: &MarkerRecord) -> io::Result<()> {
    let body = serde_json::to_vec(record).map_err(io::Error::other)?;
    fs::write(path, body)
}

pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
