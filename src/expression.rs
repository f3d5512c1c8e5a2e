//! File name expressions
//!
//! A deliberately small template language used for move destinations,
//! idempotent keys, done file names and producer file names. An expression
//! is literal text with `${...}` placeholders:
//!
//! | Placeholder                          | Value                                   |
//! |--------------------------------------|-----------------------------------------|
//! | `${file:name}` / `${name}`           | relative path of the file               |
//! | `${file:name.noext}`                 | relative path without extension         |
//! | `${file:onlyname}`                   | file name without directories           |
//! | `${file:onlyname.noext}`             | file name without directories/extension |
//! | `${file:ext}` / `${ext}`             | extension without the dot               |
//! | `${file:parent}` / `${parent}`       | absolute parent directory               |
//! | `${file:path}`, `${file:absolute.path}` | absolute path of the file            |
//! | `${file:relative.path}`              | relative path (alias of `file:name`)    |
//! | `${file:size}`, `${file:length}`     | size in bytes                           |
//! | `${file:modified}`                   | last modified, unix millis              |
//! | `${date:now:FORMAT}`                 | current time                            |
//! | `${date:file:FORMAT}`                | file's last modified time               |
//! | `${header.NAME}` / `${header:NAME}`  | caller supplied header                  |
//! | `${uuid}`                            | random UUID                             |
//!
//! `FORMAT` is either a strftime pattern (`%Y%m%d`) or the common
//! `yyyyMMdd-HHmmss` style.

use crate::file::{WatchedFile, strip_ext};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub type HeadersMap = BTreeMap<String, String>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("unterminated placeholder in '{0}'")]
    Unterminated(String),

    #[error("unknown placeholder '${{{token}}}' in '{expression}'")]
    UnknownToken { token: String, expression: String },

    #[error("placeholder '${{{0}}}' needs a file but none is available")]
    MissingFile(String),

    #[error("header '{0}' is not set")]
    MissingHeader(String),

    #[error("expression '{0}' evaluated to an empty name")]
    Empty(String),
}

pub type Result<T> = std::result::Result<T, ExpressionError>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Name,
    NameNoExt,
    OnlyName,
    OnlyNameNoExt,
    Ext,
    Parent,
    AbsolutePath,
    Size,
    Modified,
    DateNow(String),
    DateFile(String),
    Header(String),
    Uuid,
}

impl Token {
    fn parse(raw: &str, expression: &str) -> Result<Self> {
        let token = match raw {
            "file:name" | "name" | "file:relative.path" => Token::Name,
            "file:name.noext" | "name.noext" => Token::NameNoExt,
            "file:onlyname" | "onlyname" => Token::OnlyName,
            "file:onlyname.noext" | "onlyname.noext" => Token::OnlyNameNoExt,
            "file:ext" | "file:name.ext" | "ext" => Token::Ext,
            "file:parent" | "parent" => Token::Parent,
            "file:path" | "file:absolute.path" => Token::AbsolutePath,
            "file:size" | "file:length" => Token::Size,
            "file:modified" => Token::Modified,
            "uuid" => Token::Uuid,
            other => {
                if let Some(format) = other.strip_prefix("date:now:") {
                    Token::DateNow(to_strftime(format))
                } else if let Some(format) = other.strip_prefix("date:file:") {
                    Token::DateFile(to_strftime(format))
                } else if let Some(name) = other
                    .strip_prefix("header.")
                    .or_else(|| other.strip_prefix("header:"))
                    .or_else(|| other.strip_prefix("in.header."))
                {
                    Token::Header(name.to_string())
                } else {
                    return Err(ExpressionError::UnknownToken {
                        token: other.to_string(),
                        expression: expression.to_string(),
                    });
                }
            }
        };
        Ok(token)
    }

    fn needs_file(&self) -> bool {
        !matches!(
            self,
            Token::DateNow(_) | Token::Header(_) | Token::Uuid
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Placeholder { raw: String, token: Token },
}

/// Values an expression is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    pub file: Option<&'a WatchedFile>,
    pub headers: Option<&'a HeadersMap>,
    pub now: DateTime<Utc>,
}

impl<'a> Context<'a> {
    pub fn for_file(file: &'a WatchedFile) -> Self {
        Self {
            file: Some(file),
            headers: None,
            now: Utc::now(),
        }
    }

    pub fn for_headers(headers: &'a HeadersMap) -> Self {
        Self {
            file: None,
            headers: Some(headers),
            now: Utc::now(),
        }
    }

    pub fn with_file(mut self, file: &'a WatchedFile) -> Self {
        self.file = Some(file);
        self
    }
}

/// A parsed file name expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    source: String,
    parts: Vec<Part>,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self> {
        let mut parts = Vec::new();
        let mut rest = source;

        while let Some(start) = rest.find("${") {
            if start > 0 {
                parts.push(Part::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or_else(|| ExpressionError::Unterminated(source.to_string()))?;
            let raw = after[..end].trim();
            let token = Token::parse(raw, source)?;
            parts.push(Part::Placeholder {
                raw: raw.to_string(),
                token,
            });
            rest = &after[end + 1..];
        }
        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            parts,
        })
    }

    /// Expression for a move-style option.
    ///
    /// A value without placeholders names a directory, relative to the
    /// file's parent unless absolute: `done` becomes
    /// `${file:parent}/done/${file:onlyname}`.
    pub fn directory_or_template(value: &str) -> Result<Self> {
        if value.contains("${") {
            return Self::parse(value);
        }
        let dir = value.trim_end_matches(['/', '\\']);
        if Path::new(dir).is_absolute() {
            Self::parse(&format!("{}/${{file:onlyname}}", dir))
        } else {
            Self::parse(&format!("${{file:parent}}/{}/${{file:onlyname}}", dir))
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when the expression contains no placeholders.
    pub fn is_constant(&self) -> bool {
        self.parts.iter().all(|p| matches!(p, Part::Literal(_)))
    }

    /// True when evaluation needs a file in the context.
    pub fn references_file(&self) -> bool {
        self.parts.iter().any(|p| match p {
            Part::Placeholder { token, .. } => token.needs_file(),
            Part::Literal(_) => false,
        })
    }

    pub fn evaluate(&self, ctx: &Context<'_>) -> Result<String> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Placeholder { raw, token } => {
                    out.push_str(&evaluate_token(raw, token, ctx)?);
                }
            }
        }
        if out.trim().is_empty() {
            return Err(ExpressionError::Empty(self.source.clone()));
        }
        Ok(out)
    }

    /// Evaluate and resolve against `base` when the result is relative.
    pub fn evaluate_path(&self, ctx: &Context<'_>, base: &Path) -> Result<PathBuf> {
        let value = self.evaluate(ctx)?;
        let path = PathBuf::from(value);
        if path.is_absolute() {
            Ok(path)
        } else {
            Ok(base.join(path))
        }
    }
}

impl FromStr for Expression {
    type Err = ExpressionError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn evaluate_token(raw: &str, token: &Token, ctx: &Context<'_>) -> Result<String> {
    let file = || ctx.file.ok_or_else(|| ExpressionError::MissingFile(raw.to_string()));

    let value = match token {
        Token::Header(name) => ctx
            .headers
            .and_then(|h| h.get(name))
            .cloned()
            .ok_or_else(|| ExpressionError::MissingHeader(name.clone()))?,
        Token::DateNow(format) => ctx.now.format(format).to_string(),
        Token::Uuid => uuid::Uuid::new_v4().to_string(),
        Token::Name => file()?.relative_name(),
        Token::NameNoExt => strip_ext(&file()?.relative_name()).to_string(),
        Token::OnlyName => file()?.name(),
        Token::OnlyNameNoExt => file()?.name_no_ext(),
        Token::Ext => file()?.extension(),
        Token::Parent => file()?.parent().to_string_lossy().into_owned(),
        Token::AbsolutePath => file()?.absolute_path().to_string_lossy().into_owned(),
        Token::Size => file()?.size().to_string(),
        Token::Modified => file()?.last_modified().timestamp_millis().to_string(),
        Token::DateFile(format) => file()?.last_modified().format(format).to_string(),
    };
    Ok(value)
}

/// Translate `yyyyMMdd-HHmmss` style patterns to strftime.
///
/// Patterns that already contain `%` are taken verbatim.
fn to_strftime(format: &str) -> String {
    if format.contains('%') {
        return format.to_string();
    }
    const TABLE: &[(&str, &str)] = &[
        ("yyyy", "%Y"),
        ("yy", "%y"),
        ("MM", "%m"),
        ("dd", "%d"),
        ("HH", "%H"),
        ("mm", "%M"),
        ("ss", "%S"),
        ("SSS", "%3f"),
    ];

    let mut out = String::new();
    let mut rest = format;
    'outer: while !rest.is_empty() {
        for (java, strftime) in TABLE {
            if let Some(stripped) = rest.strip_prefix(java) {
                out.push_str(strftime);
                rest = stripped;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;
    use tempfile::TempDir;

    fn sample(temp_dir: &TempDir, relative: &str, content: &str) -> WatchedFile {
        let path = temp_dir.path().join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        WatchedFile::stat(temp_dir.path(), &path).unwrap()
    }

    #[test]
    fn test_file_placeholders() {
        let temp_dir = TempDir::new().unwrap();
        let file = sample(&temp_dir, "sub/report.txt", "hello");
        let ctx = Context::for_file(&file);

        let eval = |s: &str| Expression::parse(s).unwrap().evaluate(&ctx).unwrap();
        assert_eq!(eval("done/${file:name}"), "done/sub/report.txt");
        assert_eq!(eval("done/${name}"), "done/sub/report.txt");
        assert_eq!(eval("${file:onlyname.noext}.bak"), "report.bak");
        assert_eq!(eval("${file:name.noext}"), "sub/report");
        assert_eq!(eval("${file:ext}"), "txt");
        assert_eq!(eval("${file:size}"), "5");
        assert_eq!(
            eval("${file:parent}"),
            temp_dir.path().join("sub").to_string_lossy()
        );
    }

    #[test]
    fn test_date_and_header_placeholders() {
        let mut headers = HeadersMap::new();
        headers.insert("file.name".to_string(), "out.csv".to_string());
        let ctx = Context {
            file: None,
            headers: Some(&headers),
            now: Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap(),
        };

        let expr = Expression::parse("${date:now:yyyyMMdd}/${header.file.name}").unwrap();
        assert_eq!(expr.evaluate(&ctx).unwrap(), "20240309/out.csv");

        let expr = Expression::parse("${date:now:%H-%M}").unwrap();
        assert_eq!(expr.evaluate(&ctx).unwrap(), "14-05");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            Expression::parse("done/${file:name").unwrap_err(),
            ExpressionError::Unterminated("done/${file:name".to_string())
        );
        assert!(matches!(
            Expression::parse("${bean:evil}").unwrap_err(),
            ExpressionError::UnknownToken { .. }
        ));
    }

    #[test]
    fn test_missing_inputs() {
        let headers = HeadersMap::new();
        let ctx = Context::for_headers(&headers);

        let err = Expression::parse("${file:name}").unwrap().evaluate(&ctx).unwrap_err();
        assert!(matches!(err, ExpressionError::MissingFile(_)));

        let err = Expression::parse("${header.target}").unwrap().evaluate(&ctx).unwrap_err();
        assert_eq!(err, ExpressionError::MissingHeader("target".to_string()));
    }

    #[test]
    fn test_every_file_placeholder_needs_a_file() {
        let headers = HeadersMap::new();
        let ctx = Context::for_headers(&headers);
        for token in [
            "file:name",
            "file:name.noext",
            "file:onlyname",
            "file:onlyname.noext",
            "file:ext",
            "file:parent",
            "file:absolute.path",
            "file:size",
            "file:modified",
            "date:file:yyyyMMdd",
        ] {
            let expr = Expression::parse(&format!("${{{}}}", token)).unwrap();
            assert_eq!(
                expr.evaluate(&ctx).unwrap_err(),
                ExpressionError::MissingFile(token.to_string()),
                "{}",
                token
            );
        }

        for token in ["uuid", "date:now:yyyy"] {
            let expr = Expression::parse(&format!("${{{}}}", token)).unwrap();
            assert!(!expr.evaluate(&ctx).unwrap().is_empty(), "{}", token);
        }
    }

    #[test]
    fn test_directory_shorthand() {
        let temp_dir = TempDir::new().unwrap();
        let file = sample(&temp_dir, "hello.txt", "hi");
        let ctx = Context::for_file(&file);

        let expr = Expression::directory_or_template("error/").unwrap();
        assert_eq!(expr.source(), "${file:parent}/error/${file:onlyname}");
        assert_eq!(
            expr.evaluate_path(&ctx, temp_dir.path()).unwrap(),
            temp_dir.path().join("error").join("hello.txt")
        );

        let expr = Expression::directory_or_template("archive/${file:onlyname.noext}.old").unwrap();
        assert_eq!(
            expr.evaluate_path(&ctx, temp_dir.path()).unwrap(),
            temp_dir.path().join("archive/hello.old")
        );
    }

    #[test]
    fn test_constant_detection() {
        assert!(Expression::parse("ready.done").unwrap().is_constant());
        let expr = Expression::parse("${date:now:yyyy}.log").unwrap();
        assert!(!expr.is_constant());
        assert!(!expr.references_file());
        assert!(Expression::parse("${file:name}.done").unwrap().references_file());
    }

    #[test]
    fn test_java_style_formats() {
        assert_eq!(to_strftime("yyyy-MM-dd HH:mm:ss.SSS"), "%Y-%m-%d %H:%M:%S.%3f");
        assert_eq!(to_strftime("%Y"), "%Y");
    }
}
