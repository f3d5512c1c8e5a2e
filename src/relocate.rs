//! Moving files around: rename with copy fallback and existing-file policies

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

use crate::file::{ext_of, strip_ext};

/// What to do when the destination already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileExist {
    #[default]
    Override,
    Append,
    Fail,
    Ignore,
    Move,
    TryRename,
}

impl FileExist {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileExist::Override => "Override",
            FileExist::Append => "Append",
            FileExist::Fail => "Fail",
            FileExist::Ignore => "Ignore",
            FileExist::Move => "Move",
            FileExist::TryRename => "TryRename",
        }
    }
}

impl FromStr for FileExist {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "override" => Ok(FileExist::Override),
            "append" => Ok(FileExist::Append),
            "fail" => Ok(FileExist::Fail),
            "ignore" => Ok(FileExist::Ignore),
            "move" => Ok(FileExist::Move),
            "tryrename" | "try_rename" => Ok(FileExist::TryRename),
            other => Err(format!("unknown file exist policy '{}'", other)),
        }
    }
}

impl fmt::Display for FileExist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FileExist {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FileExist {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// How a rename is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenameOptions {
    /// Fall back to copy-then-delete when the rename fails (e.g. across devices).
    pub copy_and_delete_on_fail: bool,
    /// Always copy-then-delete.
    pub rename_using_copy: bool,
}

impl Default for RenameOptions {
    fn default() -> Self {
        Self {
            copy_and_delete_on_fail: true,
            rename_using_copy: false,
        }
    }
}

pub fn create_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Move `from` to `to`, replacing `to` if present.
pub fn rename_file(from: &Path, to: &Path, options: RenameOptions) -> io::Result<()> {
    if options.rename_using_copy {
        return copy_then_delete(from, to);
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if options.copy_and_delete_on_fail && e.kind() != io::ErrorKind::NotFound => {
            debug!(from = %from.display(), to = %to.display(), error = %e, "Rename failed, copying instead");
            copy_then_delete(from, to)
        }
        Err(e) => Err(e),
    }
}

/// Copy through a sibling temp file so `to` never holds partial content.
pub fn copy_then_delete(from: &Path, to: &Path) -> io::Result<()> {
    let mut staging_name = std::ffi::OsString::from(".");
    staging_name.push(to.file_name().unwrap_or_default());
    staging_name.push(".copying");
    let staging = to.with_file_name(staging_name);

    if let Err(e) = fs::copy(from, &staging).and_then(|_| fs::rename(&staging, to)) {
        let _ = fs::remove_file(&staging);
        return Err(e);
    }
    fs::remove_file(from)
}

/// `dir/name.ext` -> `dir/name-N.ext`
pub fn suffixed_path(path: &Path, n: u32) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = ext_of(&name);
    let renamed = if ext.is_empty() {
        format!("{}-{}", name, n)
    } else {
        format!("{}-{}.{}", strip_ext(&name), n, ext)
    };
    path.with_file_name(renamed)
}

/// Link `from` under the first free `name-N.ext` next to `target` and drop
/// `from`. Never overwrites an existing file.
pub fn link_to_free_name(from: &Path, target: &Path) -> io::Result<PathBuf> {
    for n in 1..u32::MAX {
        let candidate = suffixed_path(target, n);
        match fs::hard_link(from, &candidate) {
            Ok(()) => {
                fs::remove_file(from)?;
                return Ok(candidate);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(io::ErrorKind::AlreadyExists, "no free suffixed name"))
}

/// Copy `from` onto the end of `to`, optionally after `separator`.
pub fn append_file(from: &Path, to: &Path, separator: Option<&str>) -> io::Result<u64> {
    let mut source = fs::File::open(from)?;
    let mut dest = OpenOptions::new().append(true).create(true).open(to)?;
    if let Some(sep) = separator {
        io::Write::write_all(&mut dest, sep.as_bytes())?;
    }
    let copied = io::copy(&mut source, &mut dest)?;
    dest.sync_data()?;
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_exist_parsing() {
        assert_eq!("TryRename".parse::<FileExist>().unwrap(), FileExist::TryRename);
        assert_eq!("override".parse::<FileExist>().unwrap(), FileExist::Override);
        assert!("Merge".parse::<FileExist>().is_err());
    }

    #[test]
    fn test_suffixed_path() {
        assert_eq!(suffixed_path(Path::new("/out/a.txt"), 2), PathBuf::from("/out/a-2.txt"));
        assert_eq!(suffixed_path(Path::new("/out/README"), 1), PathBuf::from("/out/README-1"));
    }

    #[test]
    fn test_link_to_free_name_skips_taken_names() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("a.txt");
        fs::write(&target, "first").unwrap();
        fs::write(temp_dir.path().join("a-1.txt"), "second").unwrap();
        let staged = temp_dir.path().join(".a.txt.tmp");
        fs::write(&staged, "third").unwrap();

        let placed = link_to_free_name(&staged, &target).unwrap();
        assert_eq!(placed, temp_dir.path().join("a-2.txt"));
        assert_eq!(fs::read_to_string(&placed).unwrap(), "third");
        assert!(!staged.exists());
    }

    #[test]
    fn test_rename_using_copy() {
        let temp_dir = TempDir::new().unwrap();
        let from = temp_dir.path().join("a.txt");
        let to = temp_dir.path().join("done/a.txt");
        fs::write(&from, "payload").unwrap();
        create_parent(&to).unwrap();

        let options = RenameOptions {
            rename_using_copy: true,
            ..Default::default()
        };
        rename_file(&from, &to, options).unwrap();
        assert!(!from.exists());
        assert_eq!(fs::read_to_string(&to).unwrap(), "payload");
    }

    #[test]
    fn test_append_file() {
        let temp_dir = TempDir::new().unwrap();
        let from = temp_dir.path().join("new.txt");
        let to = temp_dir.path().join("log.txt");
        fs::write(&from, "two").unwrap();
        fs::write(&to, "one").unwrap();

        append_file(&from, &to, Some("\n")).unwrap();
        assert_eq!(fs::read_to_string(&to).unwrap(), "one\ntwo");
    }
}
