//! Producer side: atomic writes into a directory
//!
//! Content is staged in a hidden temp file next to the destination, flushed
//! and fsynced, then renamed into place, so consumers polling the same
//! directory never observe a partial file. The existing-file policy is
//! decided while holding a lock on the destination.

pub mod charset;

use bytes::Bytes;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::done::DoneFileName;
use crate::expression::{Context, Expression, ExpressionError, HeadersMap};
use crate::humanize::ByteSize;
use crate::lock::{LockError, LockManager, LockStrategy};
use crate::observability::Metrics;
use crate::relocate::{self, FileExist, RenameOptions};

pub use charset::{Charset, CharsetError};

/// Header consulted for the file name when no expression is configured.
pub const FILE_NAME_HEADER: &str = "fileName";

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("Invalid file name: {0}")]
    Expression(#[from] ExpressionError),

    #[error("Encoding failed: {0}")]
    Charset(#[from] CharsetError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("I/O error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("File already exists: {0}")]
    Conflict(PathBuf),

    #[error("Directory does not exist: {0}")]
    MissingDirectory(PathBuf),

    #[error("File exist policy Move requires moveExisting")]
    MissingMoveExisting,
}

pub type Result<T> = std::result::Result<T, WriteError>;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> WriteError + '_ {
    move |source| WriteError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Content handed to the writer.
pub enum Payload {
    Bytes(Bytes),
    /// Encoded with the target's charset.
    Text(String),
    /// Copied through the bounded buffer without conversion.
    Stream(Box<dyn Read + Send>),
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Payload::Text(t) => f.debug_tuple("Text").field(&t.len()).finish(),
            Payload::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Payload::Bytes(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(value))
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

/// Where and how to write.
#[derive(Debug, Clone, bon::Builder)]
pub struct WriteTarget {
    /// Base directory for relative names.
    #[builder(into)]
    pub directory: PathBuf,
    /// Name expression; falls back to the `fileName` header, then a UUID.
    pub file_name: Option<Expression>,
    #[builder(default)]
    pub file_exist: FileExist,
    /// Where the occupant goes under [`FileExist::Move`]; relative to the
    /// destination's directory.
    pub move_existing: Option<Expression>,
    /// Sibling temp name pattern (`${file:name}` / `${file:name.noext}`).
    pub temp_file_name: Option<DoneFileName>,
    #[builder(default = true)]
    pub use_temp_file: bool,
    #[builder(default)]
    pub charset: Charset,
    #[builder(default = ByteSize::kib(128))]
    pub buffer_size: ByteSize,
    #[builder(default = true)]
    pub auto_create: bool,
    pub done_file_name: Option<DoneFileName>,
    /// Written after the content, e.g. a newline between appended records.
    pub append_chars: Option<String>,
    #[builder(default = Duration::from_secs(10))]
    pub lock_timeout: Duration,
    /// Unix permission bits applied to the written file.
    pub chmod: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    Overwritten,
    Appended,
    /// Placed under a suffixed name because the destination was taken.
    Renamed,
    /// Destination existed and the policy was `Ignore`; nothing written.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    pub path: PathBuf,
    pub bytes_written: u64,
    pub outcome: WriteOutcome,
}

pub struct Writer {
    locks: LockManager,
    metrics: Option<Arc<Metrics>>,
}

impl Writer {
    /// `stale_after` bounds how long a crashed producer's lock can block.
    pub fn new(stale_after: Duration) -> Self {
        Self {
            locks: LockManager::new(LockStrategy::Marker, stale_after),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Resolve the destination path for `headers`.
    pub fn resolve(&self, target: &WriteTarget, headers: &HeadersMap) -> Result<PathBuf> {
        let ctx = Context::for_headers(headers);
        let path = match &target.file_name {
            Some(expr) => expr.evaluate_path(&ctx, &target.directory)?,
            None => {
                let name = headers
                    .get(FILE_NAME_HEADER)
                    .cloned()
                    .unwrap_or_else(|| Uuid::now_v7().to_string());
                target.directory.join(name)
            }
        };
        Ok(path)
    }

    pub fn write(&self, target: &WriteTarget, payload: Payload, headers: &HeadersMap) -> Result<WriteResult> {
        if target.file_exist == FileExist::Move && target.move_existing.is_none() {
            return Err(WriteError::MissingMoveExisting);
        }

        let path = self.resolve(target, headers)?;
        let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
        if !parent.as_os_str().is_empty() && !parent.is_dir() {
            if !target.auto_create {
                return Err(WriteError::MissingDirectory(parent));
            }
            fs::create_dir_all(&parent).map_err(io_err(&parent))?;
        }

        let _lock = self.locks.lock_path(&path, target.lock_timeout)?;

        let exists = path.exists();

        // Only content that replaces `path` invalidates its done file
        let replaces = !exists
            || matches!(
                target.file_exist,
                FileExist::Override | FileExist::Append | FileExist::Move
            );
        if replaces {
            if let Some(done) = &target.done_file_name {
                remove_if_present(&done.for_path(&path))?;
            }
        }

        let result = if exists {
            self.write_existing(target, payload, &path)?
        } else if target.use_temp_file {
            let bytes_written = self.stage_and_rename(target, payload, &path)?;
            WriteResult {
                path,
                bytes_written,
                outcome: WriteOutcome::Created,
            }
        } else {
            let bytes_written = self.write_direct(target, payload, &path, false)?;
            WriteResult {
                path,
                bytes_written,
                outcome: WriteOutcome::Created,
            }
        };

        if result.outcome != WriteOutcome::Ignored {
            if let Some(done) = &target.done_file_name {
                let done = done.for_path(&result.path);
                File::create(&done).map_err(io_err(&done))?;
                debug!(done = %done.display(), "Created done file");
            }
            if let Some(metrics) = &self.metrics {
                metrics.file_written(result.bytes_written);
            }
        }

        info!(
            path = %result.path.display(),
            bytes = result.bytes_written,
            outcome = ?result.outcome,
            "Wrote file"
        );
        Ok(result)
    }

    fn write_existing(&self, target: &WriteTarget, payload: Payload, path: &Path) -> Result<WriteResult> {
        let (bytes_written, outcome, placed) = match target.file_exist {
            FileExist::Fail => return Err(WriteError::Conflict(path.to_path_buf())),
            FileExist::Ignore => {
                debug!(path = %path.display(), "Destination exists, ignoring write");
                (0, WriteOutcome::Ignored, path.to_path_buf())
            }
            FileExist::Append => {
                let written = self.write_direct(target, payload, path, true)?;
                (written, WriteOutcome::Appended, path.to_path_buf())
            }
            FileExist::TryRename => {
                let staged = self.temp_path(target, path);
                let written = self.stage(target, payload, &staged)?;
                let placed = relocate::link_to_free_name(&staged, path).map_err(|e| {
                    let _ = fs::remove_file(&staged);
                    io_err(path)(e)
                })?;
                (written, WriteOutcome::Renamed, placed)
            }
            FileExist::Move => {
                self.move_occupant(target, path)?;
                let written = self.stage_and_rename(target, payload, path)?;
                (written, WriteOutcome::Created, path.to_path_buf())
            }
            FileExist::Override => {
                let written = if target.use_temp_file {
                    self.stage_and_rename(target, payload, path)?
                } else {
                    self.write_direct(target, payload, path, false)?
                };
                (written, WriteOutcome::Overwritten, path.to_path_buf())
            }
        };
        Ok(WriteResult {
            path: placed,
            bytes_written,
            outcome,
        })
    }

    fn move_occupant(&self, target: &WriteTarget, path: &Path) -> Result<()> {
        let expr = target.move_existing.as_ref().ok_or(WriteError::MissingMoveExisting)?;
        let base = path.parent().unwrap_or(Path::new("."));
        let occupant = crate::file::WatchedFile::stat(base, path).map_err(io_err(path))?;
        let aside = expr.evaluate_path(&Context::for_file(&occupant), base)?;
        relocate::create_parent(&aside).map_err(io_err(&aside))?;
        relocate::rename_file(path, &aside, RenameOptions::default()).map_err(io_err(path))?;
        debug!(from = %path.display(), to = %aside.display(), "Moved existing file aside");
        Ok(())
    }

    fn temp_path(&self, target: &WriteTarget, path: &Path) -> PathBuf {
        match &target.temp_file_name {
            Some(pattern) => pattern.for_path(path),
            None => {
                let mut name = std::ffi::OsString::from(".");
                name.push(path.file_name().unwrap_or_default());
                name.push(format!(".{}.tmp", Uuid::new_v4().simple()));
                path.with_file_name(name)
            }
        }
    }

    fn stage_and_rename(&self, target: &WriteTarget, payload: Payload, path: &Path) -> Result<u64> {
        let staged = self.temp_path(target, path);
        let written = self.stage(target, payload, &staged)?;
        if let Err(e) = fs::rename(&staged, path) {
            let _ = fs::remove_file(&staged);
            return Err(io_err(path)(e));
        }
        Ok(written)
    }

    /// Write the payload into a fresh temp file; removed again on failure.
    fn stage(&self, target: &WriteTarget, payload: Payload, staged: &Path) -> Result<u64> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(staged)
            .map_err(io_err(staged))?;
        match self.fill(target, payload, file, staged) {
            Ok(written) => Ok(written),
            Err(e) => {
                let _ = fs::remove_file(staged);
                Err(e)
            }
        }
    }

    fn write_direct(&self, target: &WriteTarget, payload: Payload, path: &Path, append: bool) -> Result<u64> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .append(append)
            .truncate(!append)
            .open(path)
            .map_err(io_err(path))?;
        self.fill(target, payload, file, path)
    }

    fn fill(&self, target: &WriteTarget, payload: Payload, file: File, path: &Path) -> Result<u64> {
        let capacity = target.buffer_size.as_buffer_len();
        let mut out = BufWriter::with_capacity(capacity, file);
        let mut written = match payload {
            Payload::Bytes(bytes) => {
                out.write_all(&bytes).map_err(io_err(path))?;
                bytes.len() as u64
            }
            Payload::Text(text) => {
                let encoded = target.charset.encode(&text)?;
                out.write_all(&encoded).map_err(io_err(path))?;
                encoded.len() as u64
            }
            Payload::Stream(mut reader) => {
                let mut buf = vec![0u8; capacity];
                let mut total = 0u64;
                loop {
                    let n = match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(io_err(path)(e)),
                    };
                    out.write_all(&buf[..n]).map_err(io_err(path))?;
                    total += n as u64;
                }
                total
            }
        };

        if let Some(chars) = &target.append_chars {
            let encoded = target.charset.encode(chars)?;
            out.write_all(&encoded).map_err(io_err(path))?;
            written += encoded.len() as u64;
        }

        let file = out.into_inner().map_err(|e| io_err(path)(e.into_error()))?;
        file.sync_all().map_err(io_err(path))?;
        apply_chmod(path, target.chmod)?;
        Ok(written)
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(path)(e)),
    }
}

#[cfg(unix)]
fn apply_chmod(path: &Path, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(io_err(path))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_chmod(_path: &Path, _mode: Option<u32>) -> Result<()> {
    Ok(())
}

/// Parse an octal permission string such as `644` or `0o600`.
pub fn parse_chmod(value: &str) -> Option<u32> {
    let digits = value.trim().trim_start_matches("0o");
    u32::from_str_radix(digits, 8).ok().filter(|m| *m <= 0o7777)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn headers(name: &str) -> HeadersMap {
        let mut headers = HeadersMap::new();
        headers.insert(FILE_NAME_HEADER.to_string(), name.to_string());
        headers
    }

    fn writer() -> Writer {
        Writer::new(Duration::from_secs(60))
    }

    fn visible_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_write_creates_file_atomically() {
        let temp_dir = TempDir::new().unwrap();
        let target = WriteTarget::builder().directory(temp_dir.path().join("out")).build();

        let result = writer().write(&target, "Hello World".into(), &headers("hello.txt")).unwrap();
        assert_eq!(result.outcome, WriteOutcome::Created);
        assert_eq!(result.bytes_written, 11);
        assert_eq!(fs::read_to_string(&result.path).unwrap(), "Hello World");
        // No temp or lock leftovers.
        assert_eq!(visible_entries(&temp_dir.path().join("out")), vec!["hello.txt"]);
    }

    #[test]
    fn test_file_name_expression_uses_headers() {
        let temp_dir = TempDir::new().unwrap();
        let target = WriteTarget::builder()
            .directory(temp_dir.path())
            .file_name(Expression::parse("${header.customer}/${header.fileName}").unwrap())
            .build();

        let mut h = headers("order.json");
        h.insert("customer".to_string(), "acme".to_string());
        let result = writer().write(&target, "{}".into(), &h).unwrap();
        assert_eq!(result.path, temp_dir.path().join("acme/order.json"));

        let err = writer().write(&target, "{}".into(), &headers("x")).unwrap_err();
        assert!(matches!(err, WriteError::Expression(ExpressionError::MissingHeader(_))));
    }

    #[test]
    fn test_existing_file_policies() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        fs::write(dir.join("a.txt"), "old").unwrap();
        let w = writer();

        let fail = WriteTarget::builder().directory(dir).file_exist(FileExist::Fail).build();
        assert!(matches!(
            w.write(&fail, "new".into(), &headers("a.txt")),
            Err(WriteError::Conflict(_))
        ));

        let ignore = WriteTarget::builder().directory(dir).file_exist(FileExist::Ignore).build();
        let result = w.write(&ignore, "new".into(), &headers("a.txt")).unwrap();
        assert_eq!(result.outcome, WriteOutcome::Ignored);
        assert_eq!(fs::read_to_string(dir.join("a.txt")).unwrap(), "old");

        let append = WriteTarget::builder()
            .directory(dir)
            .file_exist(FileExist::Append)
            .append_chars("\n".to_string())
            .build();
        w.write(&append, "more".into(), &headers("a.txt")).unwrap();
        assert_eq!(fs::read_to_string(dir.join("a.txt")).unwrap(), "oldmore\n");

        let try_rename = WriteTarget::builder()
            .directory(dir)
            .file_exist(FileExist::TryRename)
            .build();
        let result = w.write(&try_rename, "other".into(), &headers("a.txt")).unwrap();
        assert_eq!(result.outcome, WriteOutcome::Renamed);
        assert_eq!(result.path, dir.join("a-1.txt"));

        let overwrite = WriteTarget::builder().directory(dir).build();
        let result = w.write(&overwrite, "fresh".into(), &headers("a.txt")).unwrap();
        assert_eq!(result.outcome, WriteOutcome::Overwritten);
        assert_eq!(fs::read_to_string(dir.join("a.txt")).unwrap(), "fresh");
    }

    #[test]
    fn test_move_existing() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        fs::write(dir.join("hello.txt"), "Hello World").unwrap();

        let missing = WriteTarget::builder().directory(dir).file_exist(FileExist::Move).build();
        assert!(matches!(
            writer().write(&missing, "Bye".into(), &headers("hello.txt")),
            Err(WriteError::MissingMoveExisting)
        ));

        let target = WriteTarget::builder()
            .directory(dir)
            .file_exist(FileExist::Move)
            .move_existing(Expression::parse("archive/${file:onlyname.noext}.old").unwrap())
            .build();
        writer().write(&target, "Bye World".into(), &headers("hello.txt")).unwrap();
        assert_eq!(fs::read_to_string(dir.join("hello.txt")).unwrap(), "Bye World");
        assert_eq!(fs::read_to_string(dir.join("archive/hello.old")).unwrap(), "Hello World");
    }

    #[test]
    fn test_stream_payload_and_charset() {
        let temp_dir = TempDir::new().unwrap();
        let target = WriteTarget::builder()
            .directory(temp_dir.path())
            .buffer_size(ByteSize(3))
            .build();
        let stream = Payload::Stream(Box::new(Cursor::new(vec![0u8, 159, 146, 150, 7])));
        let result = writer().write(&target, stream, &headers("blob.bin")).unwrap();
        assert_eq!(fs::read(result.path).unwrap(), vec![0u8, 159, 146, 150, 7]);

        let latin = WriteTarget::builder()
            .directory(temp_dir.path())
            .charset(Charset::Iso8859_1)
            .build();
        let result = writer().write(&latin, "café".into(), &headers("menu.txt")).unwrap();
        assert_eq!(fs::read(result.path).unwrap(), vec![b'c', b'a', b'f', 0xe9]);
    }

    #[test]
    fn test_done_file_written_after_target() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        fs::write(dir.join("data.csv.done"), "stale").unwrap();
        let target = WriteTarget::builder()
            .directory(dir)
            .done_file_name(DoneFileName::new("${file:name}.done").unwrap())
            .build();

        writer().write(&target, "a,b".into(), &headers("data.csv")).unwrap();
        assert!(dir.join("data.csv").exists());
        assert_eq!(fs::read_to_string(dir.join("data.csv.done")).unwrap(), "");
    }

    #[test]
    fn test_done_file_kept_when_occupant_survives() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        fs::write(dir.join("data.csv"), "old").unwrap();
        fs::write(dir.join("data.csv.done"), "ready").unwrap();
        let done = DoneFileName::new("${file:name}.done").unwrap();
        let w = writer();

        let fail = WriteTarget::builder()
            .directory(dir)
            .file_exist(FileExist::Fail)
            .done_file_name(done.clone())
            .build();
        assert!(matches!(
            w.write(&fail, "new".into(), &headers("data.csv")),
            Err(WriteError::Conflict(_))
        ));
        assert_eq!(fs::read_to_string(dir.join("data.csv.done")).unwrap(), "ready");

        let ignore = WriteTarget::builder()
            .directory(dir)
            .file_exist(FileExist::Ignore)
            .done_file_name(done.clone())
            .build();
        let result = w.write(&ignore, "new".into(), &headers("data.csv")).unwrap();
        assert_eq!(result.outcome, WriteOutcome::Ignored);
        assert_eq!(fs::read_to_string(dir.join("data.csv.done")).unwrap(), "ready");

        let try_rename = WriteTarget::builder()
            .directory(dir)
            .file_exist(FileExist::TryRename)
            .done_file_name(done)
            .build();
        let result = w.write(&try_rename, "new".into(), &headers("data.csv")).unwrap();
        assert_eq!(result.path, dir.join("data-1.csv"));
        assert_eq!(fs::read_to_string(dir.join("data.csv")).unwrap(), "old");
        assert_eq!(fs::read_to_string(dir.join("data.csv.done")).unwrap(), "ready");
        assert!(dir.join("data-1.csv.done").exists());
    }

    #[test]
    fn test_move_existing_twice_keeps_every_generation() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        let target = WriteTarget::builder()
            .directory(dir)
            .file_exist(FileExist::Move)
            .move_existing(Expression::parse("old/${file:name}.${uuid}").unwrap())
            .build();
        let w = writer();

        for body in ["one", "two", "three"] {
            w.write(&target, body.into(), &headers("report.txt")).unwrap();
        }
        assert_eq!(fs::read_to_string(dir.join("report.txt")).unwrap(), "three");
        let mut aside: Vec<String> = fs::read_dir(dir.join("old"))
            .unwrap()
            .map(|e| fs::read_to_string(e.unwrap().path()).unwrap())
            .collect();
        aside.sort();
        assert_eq!(aside, vec!["one", "two"]);
    }

    #[test]
    fn test_missing_directory_without_auto_create() {
        let temp_dir = TempDir::new().unwrap();
        let target = WriteTarget::builder()
            .directory(temp_dir.path().join("nope"))
            .auto_create(false)
            .build();
        assert!(matches!(
            writer().write(&target, "x".into(), &headers("a.txt")),
            Err(WriteError::MissingDirectory(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_chmod() {
        use std::os::unix::fs::PermissionsExt;
        let temp_dir = TempDir::new().unwrap();
        let target = WriteTarget::builder()
            .directory(temp_dir.path())
            .chmod(parse_chmod("640").unwrap())
            .build();
        let result = writer().write(&target, "secret".into(), &headers("key.pem")).unwrap();
        let mode = fs::metadata(result.path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    #[test]
    fn test_concurrent_writers_same_target() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().to_path_buf();
        let handles: Vec<_> = (0..6)
            .map(|i| {
                let dir = dir.clone();
                std::thread::spawn(move || {
                    let target = WriteTarget::builder()
                        .directory(dir)
                        .file_exist(FileExist::TryRename)
                        .build();
                    writer().write(&target, format!("writer {}", i).into(), &headers("shared.txt"))
                })
            })
            .collect();

        let mut paths: Vec<PathBuf> = handles.into_iter().map(|h| h.join().unwrap().unwrap().path).collect();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 6);
        assert_eq!(visible_entries(&dir).len(), 6);
    }
}
