//! Consumer: poll, claim, deliver, commit
//!
//! One cycle scans the watched root, claims each candidate, re-validates it
//! under the claim, reads it, hands an [`Exchange`] to the [`Processor`] and
//! commits according to the outcome. Cycles never overlap: a tick that fires
//! while a cycle is running is skipped.
//!
//! ## Example
//!
//! ```rust,ignore
//! let consumer = Consumer::new(poller, filter, locks, commit, ConsumerOptions::default());
//! let report = consumer.poll_once(&LoggingProcessor).await?;
//! ```

pub mod exchange;
pub mod processor;

use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::commit::{CommitError, CommitOutcome, CommitStrategy};
use crate::file::WatchedFile;
use crate::filter::{FilterChain, FilterError};
use crate::humanize::ByteSize;
use crate::idempotent::RepositoryError;
use crate::lock::{ChangedCheck, Claim, LockError, LockManager, LockStrategy};
use crate::observability::Metrics;
use crate::poller::{PollError, Poller};
use crate::writer::Charset;

pub use exchange::Exchange;
pub use processor::{LoggingProcessor, ProcessError, Processor, RelayProcessor};

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Poll failed: {0}")]
    Poll(#[from] PollError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("Idempotent repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Commit failed: {0}")]
    Commit(#[from] CommitError),

    #[error("Processor failed on {file}: {source}")]
    Process {
        file: String,
        #[source]
        source: ProcessError,
    },

    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Background task failed: {0}")]
    Join(String),
}

pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Error classes reported on the error channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Configuration,
    Processing,
    Conflict,
}

impl ConsumerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConsumerError::Poll(e) if e.is_configuration() => ErrorKind::Configuration,
            ConsumerError::Filter(FilterError::InvalidPattern { .. } | FilterError::InvalidSort(_)) => {
                ErrorKind::Configuration
            }
            ConsumerError::Commit(CommitError::Conflict(_)) => ErrorKind::Conflict,
            ConsumerError::Commit(CommitError::MissingMoveExisting | CommitError::Invalid(_)) => {
                ErrorKind::Configuration
            }
            ConsumerError::Process { .. } => ErrorKind::Processing,
            _ => ErrorKind::Transient,
        }
    }
}

/// What the error channel receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub file: Option<PathBuf>,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub initial_delay: Duration,
    pub delay: Duration,
    pub charset: Charset,
    pub buffer_size: ByteSize,
    /// Release the claim after a failure without `moveFailed`; otherwise fence.
    pub release_on_failure: bool,
    /// Release abandoned claims under the root before the first cycle.
    pub delete_orphan_locks: bool,
    /// Only claim files whose size and modification time have settled.
    pub changed: Option<ChangedCheck>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            delay: Duration::from_millis(500),
            charset: Charset::Utf8,
            buffer_size: ByteSize::kib(128),
            release_on_failure: true,
            delete_orphan_locks: true,
            changed: None,
        }
    }
}

/// Summary of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    /// The cycle did not run because another was in progress.
    pub skipped: bool,
    pub candidates: usize,
    pub filtered: usize,
    pub committed: usize,
    pub failed: usize,
    /// Claimed elsewhere, vanished, or already processed.
    pub passed_over: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileOutcome {
    Committed,
    Failed,
    PassedOver,
}

struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Consumer {
    poller: Poller,
    stages: Arc<Stages>,
    options: ConsumerOptions,
    metrics: Arc<Metrics>,
    errors: Option<mpsc::Sender<ErrorReport>>,
    in_cycle: AtomicBool,
    started: AtomicBool,
}

impl Consumer {
    pub fn new(
        poller: Poller,
        filter: FilterChain,
        locks: LockManager,
        commit: CommitStrategy,
        options: ConsumerOptions,
    ) -> Self {
        let stages = Arc::new(Stages {
            filter,
            locks,
            commit,
            changed: options.changed.clone(),
            release_on_failure: options.release_on_failure,
        });
        Self {
            poller,
            stages,
            options,
            metrics: Arc::new(Metrics::new()),
            errors: None,
            in_cycle: AtomicBool::new(false),
            started: AtomicBool::new(false),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Route per-file and per-cycle errors to `sender`.
    pub fn with_error_channel(mut self, sender: mpsc::Sender<ErrorReport>) -> Self {
        self.errors = Some(sender);
        self
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    fn report(&self, file: Option<PathBuf>, err: &ConsumerError) {
        let kind = err.kind();
        match kind {
            ErrorKind::Processing => warn!(file = ?file, error = %err, "Processing failed"),
            _ => error!(file = ?file, ?kind, error = %err, "Consumer error"),
        }
        if let Some(sender) = &self.errors {
            let report = ErrorReport {
                file,
                kind,
                message: err.to_string(),
            };
            if let Err(e) = sender.try_send(report) {
                warn!(error = %e, "Error channel unavailable, report dropped");
            }
        }
    }

    /// Release claims abandoned by crashed consumers.
    pub fn release_orphans(&self) -> Result<usize> {
        self.stages
            .release_orphans(self.poller.root(), self.poller.options().recursive)
    }

    /// Run one cycle.
    pub async fn poll_once<P: Processor + ?Sized>(&self, processor: &P) -> Result<PollReport> {
        if self.in_cycle.swap(true, Ordering::AcqRel) {
            debug!(root = %self.poller.root().display(), "Cycle already running, skipping");
            return Ok(PollReport {
                skipped: true,
                ..Default::default()
            });
        }
        let _guard = CycleGuard(&self.in_cycle);

        if self.options.delete_orphan_locks && !self.started.swap(true, Ordering::AcqRel) {
            let root = self.poller.root().to_path_buf();
            let recursive = self.poller.options().recursive;
            if let Err(e) = self
                .blocking(move |stages| stages.release_orphans(&root, recursive))
                .await
            {
                self.report(Some(self.poller.root().to_path_buf()), &e);
            }
        }

        let poller = self.poller.clone();
        let filter = self.stages.filter.clone();
        let scanned = tokio::task::spawn_blocking(move || poller.collect(&filter))
            .await
            .map_err(|e| ConsumerError::Join(e.to_string()))?;
        let candidates = match scanned {
            Ok(candidates) => candidates,
            Err(e) => {
                let err = ConsumerError::from(e);
                self.report(Some(self.poller.root().to_path_buf()), &err);
                return Err(err);
            }
        };

        let mut report = PollReport {
            candidates: candidates.files.len(),
            filtered: candidates.filtered,
            ..Default::default()
        };
        self.metrics.file_polled(candidates.files.len() as u64);

        for file in candidates.files {
            let path = file.absolute_path().to_path_buf();
            match self.process_file(file, processor).await {
                Ok(FileOutcome::Committed) => report.committed += 1,
                Ok(FileOutcome::Failed) => report.failed += 1,
                Ok(FileOutcome::PassedOver) => {
                    self.metrics.file_skipped();
                    report.passed_over += 1;
                }
                Err(e) => {
                    self.report(Some(path), &e);
                    report.errors += 1;
                }
            }
        }

        if report.candidates > 0 {
            info!(
                root = %self.poller.root().display(),
                committed = report.committed,
                failed = report.failed,
                passed_over = report.passed_over,
                errors = report.errors,
                "Poll cycle finished"
            );
        }
        Ok(report)
    }

    /// Run `f` against the blocking stages on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Stages) -> Result<T> + Send + 'static,
    {
        let stages = Arc::clone(&self.stages);
        tokio::task::spawn_blocking(move || f(&stages))
            .await
            .map_err(|e| ConsumerError::Join(e.to_string()))?
    }

    async fn process_file<P: Processor + ?Sized>(&self, file: WatchedFile, processor: &P) -> Result<FileOutcome> {
        let (claim, delivery) = match self.blocking(move |stages| stages.prepare(file)).await? {
            Prepared::Ready(claim, delivery) => (claim, delivery),
            Prepared::Skip => return Ok(FileOutcome::PassedOver),
        };

        let body = match self
            .read_body(claim.working_path().to_path_buf(), delivery.current.size())
            .await
        {
            Ok(body) => body,
            Err(e) => {
                self.blocking(move |stages| {
                    stages.release_quietly(claim);
                    Ok(())
                })
                .await?;
                return Err(e);
            }
        };
        let exchange = Exchange::from_file(
            &delivery.current,
            &delivery.original.name(),
            body,
            self.options.charset,
        );
        self.metrics.file_delivered();

        let processed = match processor.process(&exchange).await {
            Ok(()) => true,
            Err(source) => {
                self.metrics.file_failed();
                self.report(
                    Some(delivery.original.absolute_path().to_path_buf()),
                    &ConsumerError::Process {
                        file: delivery.original.relative_name(),
                        source,
                    },
                );
                false
            }
        };

        let outcome = self
            .blocking(move |stages| stages.settle(claim, &delivery, processed))
            .await?;
        if outcome == FileOutcome::Committed {
            self.metrics.file_committed();
        }
        Ok(outcome)
    }

    async fn read_body(&self, path: PathBuf, size_hint: u64) -> Result<Bytes> {
        let io_err = |source| ConsumerError::Io {
            path: path.clone(),
            source,
        };
        let file = tokio::fs::File::open(&path).await.map_err(io_err)?;
        let mut reader = BufReader::with_capacity(self.options.buffer_size.as_buffer_len(), file);
        let mut body = Vec::with_capacity(usize::try_from(size_hint).unwrap_or(0));
        reader.read_to_end(&mut body).await.map_err(io_err)?;
        Ok(Bytes::from(body))
    }

    /// Run cycles until `shutdown` flips to `true`.
    pub async fn run<P: Processor + ?Sized>(&self, processor: &P, mut shutdown: watch::Receiver<bool>) {
        info!(
            root = %self.poller.root().display(),
            delay = ?self.options.delay,
            "Consumer started"
        );

        tokio::select! {
            _ = tokio::time::sleep(self.options.initial_delay) => {}
            _ = shutdown.changed() => {
                info!("Consumer stopped before first poll");
                return;
            }
        }

        let mut ticker = tokio::time::interval(self.options.delay.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once(processor).await {
                        debug!(error = %e, "Cycle aborted");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(root = %self.poller.root().display(), "Consumer stopped");
    }
}

/// How a claim ends.
enum Settle {
    Release(FileOutcome),
    Fence,
}

/// A claimed file as it is handed to the processor.
struct Delivery {
    /// As discovered; names the done file and the exchange.
    original: WatchedFile,
    /// After any pre-move.
    current: WatchedFile,
    key: Option<String>,
}

enum Prepared {
    Ready(Claim, Delivery),
    /// Claimed elsewhere, vanished, unsettled or already processed.
    Skip,
}

/// Filesystem work between discovery and release. Runs on the blocking pool.
struct Stages {
    filter: FilterChain,
    locks: LockManager,
    commit: CommitStrategy,
    changed: Option<ChangedCheck>,
    release_on_failure: bool,
}

impl Stages {
    fn release_orphans(&self, root: &Path, recursive: bool) -> Result<usize> {
        if self.locks.strategy() == LockStrategy::None {
            return Ok(0);
        }
        Ok(self.locks.release_orphans(root, recursive)?)
    }

    /// Claim `file` and re-validate it under the claim.
    fn prepare(&self, file: WatchedFile) -> Result<Prepared> {
        let file = match &self.changed {
            Some(check) => match check.await_settled(&file).map_err(|source| ConsumerError::Io {
                path: file.absolute_path().to_path_buf(),
                source,
            })? {
                Some(settled) => settled,
                None => return Ok(Prepared::Skip),
            },
            None => file,
        };

        let Some(mut claim) = self.locks.try_claim(&file)? else {
            return Ok(Prepared::Skip);
        };
        match self.validate(&mut claim) {
            Ok(Some(delivery)) => Ok(Prepared::Ready(claim, delivery)),
            Ok(None) => {
                self.locks.release(claim)?;
                Ok(Prepared::Skip)
            }
            Err(e) => {
                self.release_quietly(claim);
                Err(e)
            }
        }
    }

    fn validate(&self, claim: &mut Claim) -> Result<Option<Delivery>> {
        // The scan snapshot may be stale.
        if self.locks.strategy() == LockStrategy::Rename {
            if !claim.working_path().exists() {
                return Ok(None);
            }
        } else {
            match claim.file().refresh() {
                Ok(Some(fresh)) => claim.refresh_file(fresh),
                Ok(None) => {
                    debug!(file = %claim.file().relative_name(), "File vanished before processing");
                    return Ok(None);
                }
                Err(e) => {
                    return Err(ConsumerError::Io {
                        path: claim.file().absolute_path().to_path_buf(),
                        source: e,
                    });
                }
            }
        }

        let key = match self.filter.repository() {
            Some(repository) => {
                let key = self.filter.key_for(claim.file())?;
                if repository.contains(&key)? {
                    debug!(key, "Already processed, skipping");
                    return Ok(None);
                }
                Some(key)
            }
            None => None,
        };

        let original = claim.file().clone();
        let mut current = original.clone();
        if let Some(moved) = self.commit.apply_pre_move(claim.working_path(), &original)? {
            current = original.relocated(&moved).map_err(|source| ConsumerError::Io {
                path: moved.clone(),
                source,
            })?;
            claim.relocate(moved);
        }

        Ok(Some(Delivery { original, current, key }))
    }

    /// Commit by outcome, then end the claim.
    fn settle(&self, claim: Claim, delivery: &Delivery, processed: bool) -> Result<FileOutcome> {
        match self.commit_outcome(&claim, delivery, processed) {
            Ok(Settle::Release(outcome)) => {
                self.locks.release(claim)?;
                Ok(outcome)
            }
            Ok(Settle::Fence) => {
                self.locks.fence(claim)?;
                Ok(FileOutcome::Failed)
            }
            Err(e) => {
                self.release_quietly(claim);
                Err(e)
            }
        }
    }

    fn commit_outcome(&self, claim: &Claim, delivery: &Delivery, processed: bool) -> Result<Settle> {
        let repository = self.filter.repository();

        if processed {
            self.commit.commit_success(claim.working_path(), &delivery.current)?;
            if let (Some(repository), Some(key)) = (repository, &delivery.key) {
                repository.confirm(key)?;
            }
            self.delete_done_file(&delivery.original)?;
            return Ok(Settle::Release(FileOutcome::Committed));
        }

        if let (Some(repository), Some(key)) = (repository, &delivery.key) {
            repository.remove(key)?;
        }
        let outcome = self.commit.commit_failure(claim.working_path(), &delivery.current)?;
        // A file left in place waits for a fresh done file before retry
        self.delete_done_file(&delivery.original)?;
        if outcome == CommitOutcome::LeftInPlace && !self.release_on_failure {
            return Ok(Settle::Fence);
        }
        Ok(Settle::Release(FileOutcome::Failed))
    }

    /// Under noop the source stays put, and so does its done file.
    fn delete_done_file(&self, original: &WatchedFile) -> Result<()> {
        if !self.commit.is_noop() {
            self.commit.delete_done_file(original.absolute_path())?;
        }
        Ok(())
    }

    fn release_quietly(&self, claim: Claim) {
        if let Err(e) = self.locks.release(claim) {
            warn!(error = %e, "Failed to release claim after error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::CommitPlan;
    use crate::done::DoneFileName;
    use crate::expression::Expression;
    use crate::idempotent::{IdempotentRepository, MemoryRepository};
    use crate::poller::PollerOptions;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl Processor for Recorder {
        async fn process(&self, exchange: &Exchange) -> std::result::Result<(), ProcessError> {
            let name = exchange.header(exchange::FILE_NAME_ONLY).unwrap_or_default().to_string();
            let body = exchange.body_text().map_err(|e| ProcessError::Failed(e.to_string()))?;
            self.seen.lock().unwrap().push((name, body));
            if self.fail {
                return Err(ProcessError::Failed("boom".into()));
            }
            Ok(())
        }
    }

    fn consumer(root: &std::path::Path, commit: CommitStrategy, filter: FilterChain) -> Consumer {
        let poller = Poller::new(
            root,
            PollerOptions {
                sort_by: Some("file:name".parse().unwrap()),
                ..Default::default()
            },
        );
        let locks = LockManager::new(LockStrategy::Marker, Duration::from_secs(60));
        Consumer::new(poller, filter, locks, commit, ConsumerOptions::default())
    }

    #[tokio::test]
    async fn test_poll_once_delivers_and_deletes() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("hello.txt"), "Hello World").unwrap();
        fs::write(temp_dir.path().join("bye.txt"), "Bye World").unwrap();

        let consumer = consumer(temp_dir.path(), CommitStrategy::default(), FilterChain::new());
        let recorder = Recorder::default();
        let report = consumer.poll_once(&recorder).await.unwrap();

        assert_eq!(report.committed, 2);
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![
                ("bye.txt".to_string(), "Bye World".to_string()),
                ("hello.txt".to_string(), "Hello World".to_string())
            ]
        );
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 0);
        assert_eq!(consumer.metrics().snapshot().files_committed, 2);
    }

    #[tokio::test]
    async fn test_failure_leaves_file_and_reports() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("hello.txt");
        fs::write(&path, "Hello World").unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let consumer =
            consumer(temp_dir.path(), CommitStrategy::default(), FilterChain::new()).with_error_channel(tx);
        let recorder = Recorder {
            fail: true,
            ..Default::default()
        };

        let report = consumer.poll_once(&recorder).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(path.exists());
        assert!(!crate::lock::marker_path(&path).exists());

        let error = rx.try_recv().unwrap();
        assert_eq!(error.kind, ErrorKind::Processing);
        assert_eq!(error.file, Some(path));
    }

    #[tokio::test]
    async fn test_fence_on_failure() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("hello.txt");
        fs::write(&path, "Hello World").unwrap();

        let poller = Poller::new(temp_dir.path(), PollerOptions::default());
        let locks = LockManager::new(LockStrategy::Marker, Duration::from_secs(60));
        let options = ConsumerOptions {
            release_on_failure: false,
            ..Default::default()
        };
        let consumer = Consumer::new(poller, FilterChain::new(), locks, CommitStrategy::default(), options);
        let recorder = Recorder {
            fail: true,
            ..Default::default()
        };

        consumer.poll_once(&recorder).await.unwrap();
        assert!(crate::lock::marker_path(&path).exists());

        let report = consumer.poll_once(&recorder).await.unwrap();
        assert_eq!(report.passed_over, 1);
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_noop_with_idempotent_delivers_once() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a.txt"), "x").unwrap();

        let repository: Arc<dyn IdempotentRepository> = Arc::new(MemoryRepository::default());
        let filter = FilterChain::new().idempotent(Arc::clone(&repository), None);
        let commit = CommitStrategy::default().on_success(CommitPlan::NoOp);
        let consumer = consumer(temp_dir.path(), commit, filter);
        let recorder = Recorder::default();

        assert_eq!(consumer.poll_once(&recorder).await.unwrap().committed, 1);
        assert_eq!(consumer.poll_once(&recorder).await.unwrap().committed, 0);
        assert!(temp_dir.path().join("a.txt").exists());
        assert!(repository.contains("a.txt").unwrap());
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_noop_keeps_done_file() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("a.csv"), "x").unwrap();
        fs::write(root.join("a.csv.done"), "").unwrap();
        fs::write(root.join("b.csv"), "y").unwrap();
        fs::write(root.join("b.csv.done"), "").unwrap();

        let done = DoneFileName::new("${file:name}.done").unwrap();
        let noop_consumer = || {
            let repository: Arc<dyn IdempotentRepository> = Arc::new(MemoryRepository::default());
            let filter = FilterChain::new()
                .done_file(done.clone())
                .idempotent(repository, None);
            let commit = CommitStrategy::default()
                .on_success(CommitPlan::NoOp)
                .done_file(Some(done.clone()));
            consumer(root, commit, filter)
        };

        let consumer = noop_consumer();
        let recorder = Recorder::default();
        assert_eq!(consumer.poll_once(&recorder).await.unwrap().committed, 2);
        assert_eq!(consumer.poll_once(&recorder).await.unwrap().committed, 0);
        assert_eq!(recorder.seen.lock().unwrap().len(), 2);
        for name in ["a.csv", "a.csv.done", "b.csv", "b.csv.done"] {
            assert!(root.join(name).exists(), "{}", name);
        }

        // A failed noop delivery keeps its done file and is retried.
        let consumer = noop_consumer();
        let failing = Recorder {
            fail: true,
            ..Default::default()
        };
        assert_eq!(consumer.poll_once(&failing).await.unwrap().failed, 2);
        assert_eq!(consumer.poll_once(&failing).await.unwrap().failed, 2);
        assert!(root.join("a.csv.done").exists());
        assert!(root.join("b.csv.done").exists());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_file_handling_does_not_block_the_runtime() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a.txt"), "x").unwrap();

        let poller = Poller::new(temp_dir.path(), PollerOptions::default());
        let locks = LockManager::new(LockStrategy::Marker, Duration::from_secs(60));
        let options = ConsumerOptions {
            changed: Some(ChangedCheck {
                check_interval: Duration::from_millis(200),
                timeout: Duration::from_secs(2),
                ..Default::default()
            }),
            ..Default::default()
        };
        let consumer = Consumer::new(poller, FilterChain::new(), locks, CommitStrategy::default(), options);

        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let ticker = {
            let ticks = Arc::clone(&ticks);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, Ordering::Relaxed);
                }
            })
        };

        let report = consumer.poll_once(&LoggingProcessor).await.unwrap();
        ticker.abort();
        assert_eq!(report.committed, 1);
        // The settle wait sleeps on the blocking pool, so the runtime kept ticking.
        assert!(ticks.load(Ordering::Relaxed) >= 5);
    }

    #[tokio::test]
    async fn test_pre_move_and_rename_strategy() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("a.txt"), "payload").unwrap();

        let poller = Poller::new(root, PollerOptions::default());
        let locks = LockManager::new(LockStrategy::Rename, Duration::from_secs(60));
        let commit = CommitStrategy::default()
            .pre_move(Expression::directory_or_template("inflight").unwrap())
            .on_success(CommitPlan::MoveTo(Expression::parse("done/${file:onlyname}").unwrap()));
        let consumer = Consumer::new(poller, FilterChain::new(), locks, commit, ConsumerOptions::default());

        let recorder = Recorder::default();
        assert_eq!(consumer.poll_once(&recorder).await.unwrap().committed, 1);
        assert_eq!(fs::read_to_string(root.join("done/a.txt")).unwrap(), "payload");
        assert!(!root.join("a.txt").exists());
        assert!(!root.join("inflight/a.txt").exists());
    }

    #[tokio::test]
    async fn test_overlapping_cycle_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let consumer = consumer(temp_dir.path(), CommitStrategy::default(), FilterChain::new());
        consumer.in_cycle.store(true, Ordering::Release);
        assert!(consumer.poll_once(&LoggingProcessor).await.unwrap().skipped);
    }

    #[tokio::test]
    async fn test_missing_directory_is_reported_and_not_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("inbox");
        let poller = Poller::new(
            &root,
            PollerOptions {
                directory_must_exist: true,
                ..Default::default()
            },
        );
        let locks = LockManager::new(LockStrategy::Marker, Duration::from_secs(60));
        let (tx, mut rx) = mpsc::channel(8);
        let consumer = Consumer::new(
            poller,
            FilterChain::new(),
            locks,
            CommitStrategy::default(),
            ConsumerOptions::default(),
        )
        .with_error_channel(tx);

        let err = consumer.poll_once(&LoggingProcessor).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(rx.try_recv().unwrap().kind, ErrorKind::Configuration);

        fs::create_dir(&root).unwrap();
        fs::write(root.join("late.txt"), "x").unwrap();
        assert_eq!(consumer.poll_once(&LoggingProcessor).await.unwrap().committed, 1);
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a.txt"), "x").unwrap();
        let poller = Poller::new(temp_dir.path(), PollerOptions::default());
        let locks = LockManager::new(LockStrategy::Marker, Duration::from_secs(60));
        let options = ConsumerOptions {
            initial_delay: Duration::from_millis(0),
            delay: Duration::from_millis(20),
            ..Default::default()
        };
        let consumer = Arc::new(Consumer::new(
            poller,
            FilterChain::new(),
            locks,
            CommitStrategy::default(),
            options,
        ));

        let (tx, rx) = watch::channel(false);
        let task = {
            let consumer = Arc::clone(&consumer);
            tokio::spawn(async move { consumer.run(&LoggingProcessor, rx).await })
        };

        for _ in 0..100 {
            if !temp_dir.path().join("a.txt").exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        task.await.unwrap();
        assert!(!temp_dir.path().join("a.txt").exists());
    }
}
