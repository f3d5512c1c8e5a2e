//! Snapshot of a file discovered under the watched root

use chrono::{DateTime, Utc};
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};

/// Immutable view of a file taken at discovery time.
///
/// The snapshot may go stale between the scan and the claim; the consumer
/// re-stats through [`WatchedFile::refresh`] after claiming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedFile {
    root: PathBuf,
    absolute_path: PathBuf,
    relative_path: PathBuf,
    last_modified: DateTime<Utc>,
    size: u64,
}

impl WatchedFile {
    /// Stat `path` and build a snapshot relative to `root`.
    pub fn stat(root: &Path, path: &Path) -> io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a regular file: {}", path.display()),
            ));
        }
        Ok(Self::from_metadata(root, path, &metadata))
    }

    pub fn from_metadata(root: &Path, path: &Path, metadata: &Metadata) -> Self {
        let relative_path = path
            .strip_prefix(root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| PathBuf::from(path.file_name().unwrap_or_default()));

        let last_modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        Self {
            root: root.to_path_buf(),
            absolute_path: path.to_path_buf(),
            relative_path,
            last_modified,
            size: metadata.len(),
        }
    }

    /// Re-stat the same path, returning `None` when it no longer exists.
    pub fn refresh(&self) -> io::Result<Option<Self>> {
        match Self::stat(&self.root, &self.absolute_path) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Snapshot of the same logical file after it was relocated to `path`.
    pub fn relocated(&self, path: &Path) -> io::Result<Self> {
        Self::stat(&self.root, path)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn absolute_path(&self) -> &Path {
        &self.absolute_path
    }

    pub fn relative_path(&self) -> &Path {
        &self.relative_path
    }

    /// Relative path using `/` separators regardless of platform.
    pub fn relative_name(&self) -> String {
        self.relative_path
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Directory containing the file.
    pub fn parent(&self) -> &Path {
        self.absolute_path.parent().unwrap_or(&self.root)
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// File name without any directory part.
    pub fn name(&self) -> String {
        self.absolute_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// File name without the last extension.
    pub fn name_no_ext(&self) -> String {
        strip_ext(&self.name()).to_string()
    }

    /// Last extension without the dot, empty if there is none.
    pub fn extension(&self) -> String {
        ext_of(&self.name()).to_string()
    }

    pub fn is_hidden(&self) -> bool {
        self.name().starts_with('.')
    }
}

/// `"report.tar.gz"` -> `"report.tar"`; dot files keep their name.
pub fn strip_ext(name: &str) -> &str {
    match name.rfind('.') {
        Some(0) | None => name,
        Some(pos) => &name[..pos],
    }
}

/// `"report.tar.gz"` -> `"gz"`.
pub fn ext_of(name: &str) -> &str {
    match name.rfind('.') {
        Some(0) | None => "",
        Some(pos) => &name[pos + 1..],
    }
}
