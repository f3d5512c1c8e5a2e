//! Ant-style path patterns
//!
//! Matched against the `/`-separated relative path:
//!
//! | Pattern | Matches |
//! |---------|---------|
//! | `?`     | one character other than `/` |
//! | `*`     | any run of characters other than `/` |
//! | `**`    | any number of whole directories |
//! | `dir/`  | shorthand for `dir/**` |

use regex::{Regex, RegexBuilder};

use super::{FilterError, Result};

/// Compile a comma separated pattern list into one anchored regex.
pub fn ant_regex(list: &str, case_sensitive: bool) -> Result<Regex> {
    let alternatives: Vec<String> = list
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(translate)
        .collect();
    if alternatives.is_empty() {
        return Err(FilterError::InvalidAnt(list.to_string()));
    }

    RegexBuilder::new(&format!("^(?:{})$", alternatives.join("|")))
        .case_insensitive(!case_sensitive)
        .build()
        .map_err(|source| FilterError::InvalidPattern {
            pattern: list.to_string(),
            source,
        })
}

fn translate(pattern: &str) -> String {
    let pattern = pattern.replace('\\', "/");
    let pattern = match pattern.strip_suffix('/') {
        Some(dir) => format!("{}/**", dir),
        None => pattern,
    };

    let mut out = String::new();
    let mut rest = pattern.as_str();
    while let Some(c) = rest.chars().next() {
        if let Some(after) = rest.strip_prefix("**/") {
            out.push_str("(?:.*/)?");
            rest = after;
        } else if let Some(after) = rest.strip_prefix("**") {
            out.push_str(".*");
            rest = after;
        } else {
            match c {
                '*' => out.push_str("[^/]*"),
                '?' => out.push_str("[^/]"),
                other => out.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
            }
            rest = &rest[c.len_utf8()..];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(list: &str, path: &str) -> bool {
        ant_regex(list, true).unwrap().is_match(path)
    }

    #[test]
    fn test_wildcards() {
        assert!(matches("*.txt", "a.txt"));
        assert!(!matches("*.txt", "sub/a.txt"));
        assert!(matches("**/*.txt", "a.txt"));
        assert!(matches("**/*.txt", "sub/deep/a.txt"));
        assert!(matches("report-?.csv", "report-1.csv"));
        assert!(!matches("report-?.csv", "report-10.csv"));
        assert!(matches("in/**/x.dat", "in/x.dat"));
        assert!(matches("in/**/x.dat", "in/a/b/x.dat"));
        assert!(!matches("in/**/x.dat", "out/x.dat"));
    }

    #[test]
    fn test_lists_and_directory_shorthand() {
        assert!(matches("*.csv, archive/", "archive/2024/old.bin"));
        assert!(matches("*.csv, archive/", "data.csv"));
        assert!(!matches("*.csv, archive/", "data.bin"));
        assert!(matches("a+b(1).txt", "a+b(1).txt"));
    }

    #[test]
    fn test_case_sensitivity() {
        assert!(!matches("*.TXT", "a.txt"));
        assert!(ant_regex("*.TXT", false).unwrap().is_match("a.txt"));
    }

    #[test]
    fn test_empty_list_is_rejected() {
        assert!(matches!(ant_regex(" , ", true), Err(FilterError::InvalidAnt(_))));
    }
}
