//! Read lock that waits for a file to stop changing

use chrono::{DateTime, Utc};
use std::io;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::file::WatchedFile;

/// Gate a candidate on its size and modification time holding still.
///
/// With `min_age` set, a file old enough (and at least `min_length` bytes)
/// is settled on the first look. Otherwise two consecutive observations
/// `check_interval` apart must agree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedCheck {
    pub check_interval: Duration,
    pub timeout: Duration,
    pub min_length: u64,
    pub min_age: Duration,
}

impl Default for ChangedCheck {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_millis(1000),
            timeout: Duration::from_secs(10),
            min_length: 1,
            min_age: Duration::ZERO,
        }
    }
}

impl ChangedCheck {
    /// Block until `file` settles. `Ok(None)` when it vanished or was still
    /// changing at the timeout; it is looked at again next cycle.
    pub fn await_settled(&self, file: &WatchedFile) -> io::Result<Option<WatchedFile>> {
        let started = Instant::now();
        let mut previous = None;
        loop {
            let Some(current) = file.refresh()? else {
                return Ok(None);
            };
            if self.is_settled(&current, previous, Utc::now()) {
                return Ok(Some(current));
            }
            previous = Some((current.size(), current.last_modified()));

            let waited = started.elapsed();
            if waited >= self.timeout {
                debug!(
                    file = %current.relative_name(),
                    size = current.size(),
                    ?waited,
                    "File not settled, skipping this cycle"
                );
                return Ok(None);
            }
            thread::sleep(self.check_interval.min(self.timeout - waited));
        }
    }

    fn is_settled(&self, current: &WatchedFile, previous: Option<(u64, DateTime<Utc>)>, now: DateTime<Utc>) -> bool {
        if current.size() < self.min_length {
            return false;
        }
        if !self.min_age.is_zero() {
            let age = now
                .signed_duration_since(current.last_modified())
                .to_std()
                .unwrap_or_default();
            return age >= self.min_age;
        }
        previous == Some((current.size(), current.last_modified()))
    }
}
