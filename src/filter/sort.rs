//! `sortBy` comparators
//!
//! Grammar: groups separated by `;`, each `[reverse:][ignoreCase:]KEY` with
//! `KEY` one of `file:name`, `file:onlyname`, `file:modified`, `file:size`,
//! `file:ext`. Later groups break ties of earlier ones.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::file::WatchedFile;

use super::FilterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SortField {
    Name,
    OnlyName,
    Modified,
    Size,
    Ext,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SortGroup {
    field: SortField,
    reverse: bool,
    ignore_case: bool,
}

impl SortGroup {
    fn compare(&self, a: &WatchedFile, b: &WatchedFile) -> Ordering {
        let text = |f: &WatchedFile| -> String {
            let value = match self.field {
                SortField::Name => f.relative_name(),
                SortField::OnlyName => f.name(),
                SortField::Ext => f.extension(),
                SortField::Modified | SortField::Size => String::new(),
            };
            if self.ignore_case { value.to_lowercase() } else { value }
        };

        let ordering = match self.field {
            SortField::Modified => a.last_modified().cmp(&b.last_modified()),
            SortField::Size => a.size().cmp(&b.size()),
            _ => text(a).cmp(&text(b)),
        };
        if self.reverse { ordering.reverse() } else { ordering }
    }
}

/// Comparator selected by `sortBy`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortBy {
    source: String,
    groups: Vec<SortGroup>,
}

impl SortBy {
    pub fn compare(&self, a: &WatchedFile, b: &WatchedFile) -> Ordering {
        self.groups
            .iter()
            .map(|g| g.compare(a, b))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }

    /// Stable sort, so equal files keep discovery order.
    pub fn sort(&self, files: &mut [WatchedFile]) {
        files.sort_by(|a, b| self.compare(a, b));
    }
}

impl FromStr for SortBy {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut groups = Vec::new();
        for raw in s.split(';').map(str::trim).filter(|g| !g.is_empty()) {
            let mut rest = raw;
            let mut reverse = false;
            let mut ignore_case = false;
            loop {
                if let Some(r) = rest.strip_prefix("reverse:") {
                    reverse = true;
                    rest = r;
                } else if let Some(r) = rest.strip_prefix("ignoreCase:") {
                    ignore_case = true;
                    rest = r;
                } else {
                    break;
                }
            }
            let field = match rest {
                "file:name" | "name" => SortField::Name,
                "file:onlyname" | "onlyname" => SortField::OnlyName,
                "file:modified" | "modified" => SortField::Modified,
                "file:size" | "file:length" | "size" => SortField::Size,
                "file:ext" | "ext" => SortField::Ext,
                other => return Err(FilterError::InvalidSort(other.to_string())),
            };
            groups.push(SortGroup {
                field,
                reverse,
                ignore_case,
            });
        }
        if groups.is_empty() {
            return Err(FilterError::InvalidSort(s.to_string()));
        }
        Ok(Self {
            source: s.to_string(),
            groups,
        })
    }
}

impl fmt::Display for SortBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Serialize for SortBy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for SortBy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn files(temp_dir: &TempDir, entries: &[(&str, &str)]) -> Vec<WatchedFile> {
        entries
            .iter()
            .map(|(name, content)| {
                let path = temp_dir.path().join(name);
                fs::write(&path, content).unwrap();
                WatchedFile::stat(temp_dir.path(), &path).unwrap()
            })
            .collect()
    }

    fn names(files: &[WatchedFile]) -> Vec<String> {
        files.iter().map(WatchedFile::name).collect()
    }

    #[test]
    fn test_sort_by_name() {
        let temp_dir = TempDir::new().unwrap();
        let mut list = files(&temp_dir, &[("hello.txt", "Hello World"), ("bye.txt", "Bye World")]);

        "file:name".parse::<SortBy>().unwrap().sort(&mut list);
        assert_eq!(names(&list), vec!["bye.txt", "hello.txt"]);

        "reverse:file:name".parse::<SortBy>().unwrap().sort(&mut list);
        assert_eq!(names(&list), vec!["hello.txt", "bye.txt"]);
    }

    #[test]
    fn test_ignore_case_and_tiebreak() {
        let temp_dir = TempDir::new().unwrap();
        let mut list = files(
            &temp_dir,
            &[("b.txt", "xx"), ("A.txt", "xxx"), ("c.txt", "x"), ("d.txt", "xx")],
        );

        "ignoreCase:file:name".parse::<SortBy>().unwrap().sort(&mut list);
        assert_eq!(names(&list), vec!["A.txt", "b.txt", "c.txt", "d.txt"]);

        "file:size;reverse:file:name".parse::<SortBy>().unwrap().sort(&mut list);
        assert_eq!(names(&list), vec!["c.txt", "d.txt", "b.txt", "A.txt"]);
    }

    #[test]
    fn test_invalid_sort() {
        assert!(matches!(
            "file:color".parse::<SortBy>(),
            Err(FilterError::InvalidSort(field)) if field == "file:color"
        ));
        assert!("".parse::<SortBy>().is_err());
    }
}
