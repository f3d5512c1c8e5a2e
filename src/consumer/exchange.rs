//! Message handed to a [`Processor`](super::Processor)

use bytes::Bytes;
use mime::Mime;
use uuid::Uuid;

use crate::expression::HeadersMap;
use crate::file::WatchedFile;
use crate::writer::{Charset, CharsetError, FILE_NAME_HEADER};

pub const FILE_ABSOLUTE_PATH: &str = "fileAbsolutePath";
pub const FILE_RELATIVE_PATH: &str = "fileRelativePath";
pub const FILE_NAME_ONLY: &str = "fileNameOnly";
pub const FILE_NAME_CONSUMED: &str = "fileNameConsumed";
pub const FILE_PARENT: &str = "fileParent";
pub const FILE_LENGTH: &str = "fileLength";
pub const FILE_LAST_MODIFIED: &str = "fileLastModified";
pub const CONTENT_TYPE: &str = "contentType";
pub const CHARSET: &str = "charset";

/// Content type guessed from the file extension.
pub fn content_type_for(extension: &str) -> Option<Mime> {
    let mime = match extension.to_ascii_lowercase().as_str() {
        "txt" | "log" => mime::TEXT_PLAIN,
        "csv" => mime::TEXT_CSV,
        "xml" => mime::TEXT_XML,
        "html" | "htm" => mime::TEXT_HTML,
        "css" => mime::TEXT_CSS,
        "js" => mime::APPLICATION_JAVASCRIPT,
        "json" => mime::APPLICATION_JSON,
        "pdf" => mime::APPLICATION_PDF,
        "png" => mime::IMAGE_PNG,
        "jpg" | "jpeg" => mime::IMAGE_JPEG,
        "gif" => mime::IMAGE_GIF,
        "svg" => mime::IMAGE_SVG,
        "bin" => mime::APPLICATION_OCTET_STREAM,
        _ => return None,
    };
    Some(mime)
}

#[derive(Debug, Clone)]
pub struct Exchange {
    id: Uuid,
    body: Bytes,
    headers: HeadersMap,
    charset: Charset,
    content_type: Option<Mime>,
}

impl Exchange {
    /// `original_name` is the name the file was discovered under; `file`
    /// describes where it is now (after a pre-move it differs).
    pub fn from_file(file: &WatchedFile, original_name: &str, body: Bytes, charset: Charset) -> Self {
        let content_type = content_type_for(&file.extension());

        let mut headers = HeadersMap::new();
        headers.insert(FILE_NAME_HEADER.to_string(), file.relative_name());
        headers.insert(
            FILE_ABSOLUTE_PATH.to_string(),
            file.absolute_path().to_string_lossy().into_owned(),
        );
        headers.insert(FILE_RELATIVE_PATH.to_string(), file.relative_name());
        headers.insert(FILE_NAME_ONLY.to_string(), file.name());
        headers.insert(FILE_NAME_CONSUMED.to_string(), original_name.to_string());
        headers.insert(FILE_PARENT.to_string(), file.parent().to_string_lossy().into_owned());
        headers.insert(FILE_LENGTH.to_string(), file.size().to_string());
        headers.insert(
            FILE_LAST_MODIFIED.to_string(),
            file.last_modified().timestamp_millis().to_string(),
        );
        headers.insert(CHARSET.to_string(), charset.name().to_string());
        if let Some(mime) = &content_type {
            headers.insert(CONTENT_TYPE.to_string(), mime.to_string());
        }

        Self {
            id: Uuid::now_v7(),
            body,
            headers,
            charset,
            content_type,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body decoded with the consumer's charset.
    pub fn body_text(&self) -> Result<String, CharsetError> {
        self.charset.decode(&self.body)
    }

    pub fn headers(&self) -> &HeadersMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn content_type(&self) -> Option<&Mime> {
        self.content_type.as_ref()
    }

    pub fn charset(&self) -> Charset {
        self.charset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_exchange_headers() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("in")).unwrap();
        let path = temp_dir.path().join("in/report.csv");
        fs::write(&path, "a,b").unwrap();
        let file = WatchedFile::stat(temp_dir.path(), &path).unwrap();

        let exchange = Exchange::from_file(&file, "report.csv", Bytes::from_static(b"a,b"), Charset::Utf8);
        assert_eq!(exchange.header(FILE_RELATIVE_PATH), Some("in/report.csv"));
        assert_eq!(exchange.header(FILE_NAME_ONLY), Some("report.csv"));
        assert_eq!(exchange.header(FILE_LENGTH), Some("3"));
        assert_eq!(exchange.header(CONTENT_TYPE), Some("text/csv"));
        assert_eq!(exchange.content_type(), Some(&mime::TEXT_CSV));
        assert_eq!(exchange.body_text().unwrap(), "a,b");
    }

    #[test]
    fn test_body_text_uses_charset() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("menu.dat");
        fs::write(&path, [b'c', 0xe9]).unwrap();
        let file = WatchedFile::stat(temp_dir.path(), &path).unwrap();

        let exchange = Exchange::from_file(&file, "menu.dat", Bytes::from(vec![b'c', 0xe9]), Charset::Iso8859_1);
        assert_eq!(exchange.body_text().unwrap(), "cé");
        assert!(exchange.content_type().is_none());
    }
}
