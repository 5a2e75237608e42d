//! POST body description and its conversion to an upload body
//!
//! Callers describe a body either as an already url-encoded string or as an
//! ordered list of multipart fields. [`encode`] turns that description into
//! the [`Upload`] handed to the transport. In-memory field values are shared,
//! not copied: every part reader borrows the caller's [`Bytes`].

use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::utils::PostDataError;

/// Content type used for file fields without a file name
const OCTET_STREAM: &str = "application/octet-stream";

/// Content type used when a file's type cannot be guessed
const FALLBACK_MIME: &str = "text/plain";

/// Value of a multipart field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// In-memory value
    Text(Bytes),
    /// File-backed value: the name shown to the user and the file to send
    File { display: String, path: PathBuf },
}

/// One named multipart field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartField {
    pub name: String,
    pub value: FieldValue,
}

impl MultipartField {
    pub fn text(name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: FieldValue::Text(value.into()),
        }
    }

    pub fn file(name: impl Into<String>, display: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            value: FieldValue::File {
                display: display.into(),
                path: path.into(),
            },
        }
    }
}

/// POST body as described by the caller
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PostData {
    #[default]
    None,
    UrlEncoded(String),
    Multipart(Vec<MultipartField>),
}

impl PostData {
    /// Combine the two optional body forms; a url-encoded body wins
    pub fn from_parts(urlenc: Option<String>, multipart: Option<Vec<MultipartField>>) -> Self {
        match (urlenc, multipart) {
            (Some(body), _) => Self::UrlEncoded(body),
            (None, Some(fields)) => Self::Multipart(fields),
            (None, None) => Self::None,
        }
    }

    /// Whether a request body will be sent
    pub fn has_body(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Seekable reader over a shared in-memory buffer
#[derive(Debug, Clone)]
pub struct MemoryReader {
    data: Bytes,
    position: u64,
}

impl MemoryReader {
    pub fn new(data: Bytes) -> Self {
        Self { data, position: 0 }
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The shared buffer behind this reader
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }
}

impl Read for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let start = usize::try_from(self.position)
            .unwrap_or(usize::MAX)
            .min(self.data.len());
        let remaining = &self.data[start..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for MemoryReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(offset) => self.len().checked_add_signed(offset),
            SeekFrom::Current(offset) => self.position.checked_add_signed(offset),
        };
        match target {
            Some(position) => {
                self.position = position;
                Ok(position)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative position",
            )),
        }
    }
}

/// Where the bytes of one part come from
#[derive(Debug, Clone)]
pub enum PartSource {
    Memory(MemoryReader),
    File(PathBuf),
    Empty,
}

/// One part of an encoded multipart body
#[derive(Debug, Clone)]
pub struct MimePart {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub source: PartSource,
}

/// Encoded multipart body
#[derive(Debug, Clone, Default)]
pub struct MimeForm {
    parts: Vec<MimePart>,
}

impl MimeForm {
    pub fn parts(&self) -> &[MimePart] {
        &self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

/// Upload body ready for the transport
#[derive(Debug, Clone, Default)]
pub enum Upload {
    #[default]
    None,
    UrlEncoded(Bytes),
    Mime(MimeForm),
}

impl Upload {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Encode a POST body description.
///
/// Any failing field abandons the whole body.
pub fn encode(post: &PostData) -> Result<Upload, PostDataError> {
    match post {
        PostData::None => Ok(Upload::None),
        PostData::UrlEncoded(body) => Ok(Upload::UrlEncoded(Bytes::from(body.clone()))),
        PostData::Multipart(fields) => {
            let mut parts = Vec::new();
            parts
                .try_reserve_exact(fields.len())
                .map_err(|_| PostDataError::OutOfMemory)?;
            for field in fields {
                parts.push(encode_field(field)?);
            }
            Ok(Upload::Mime(MimeForm { parts }))
        }
    }
}

fn encode_field(field: &MultipartField) -> Result<MimePart, PostDataError> {
    if field.name.contains(['\r', '\n', '"']) {
        return Err(PostDataError::Field(format!(
            "invalid field name {:?}",
            field.name
        )));
    }

    let part = match &field.value {
        FieldValue::Text(value) => MimePart {
            name: field.name.clone(),
            filename: None,
            content_type: None,
            source: PartSource::Memory(MemoryReader::new(value.clone())),
        },
        FieldValue::File { display, .. } if display.is_empty() => MimePart {
            name: field.name.clone(),
            filename: Some(String::new()),
            content_type: Some(OCTET_STREAM.to_string()),
            source: PartSource::Empty,
        },
        FieldValue::File { display, path } => {
            if !path.is_file() {
                return Err(PostDataError::MissingFile(path.clone()));
            }
            MimePart {
                name: field.name.clone(),
                filename: Some(leafname(display).to_string()),
                content_type: Some(guess_mime_type(display).to_string()),
                source: PartSource::File(path.clone()),
            }
        }
    };
    Ok(part)
}

fn leafname(display: &str) -> &str {
    Path::new(display)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(display)
}

/// Guess a content type from a file name's extension
pub fn guess_mime_type(name: &str) -> &'static str {
    let ext = match Path::new(name).extension().and_then(|e| e.to_str()) {
        Some(ext) => ext.to_ascii_lowercase(),
        None => return FALLBACK_MIME,
    };
    match ext.as_str() {
        "css" => "text/css",
        "htm" | "html" => "text/html",
        "txt" => "text/plain",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "png" => "image/png",
        "jng" => "image/jng",
        "mng" => "image/mng",
        "webp" => "image/webp",
        "spr" => "image/x-riscos-sprite",
        "bmp" => "image/bmp",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "js" => "application/javascript",
        "json" => "application/json",
        _ => FALLBACK_MIME,
    }
}
