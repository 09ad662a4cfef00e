use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::payload::{ByteStream, Format, Payload};

/// Narrow marshaling contract between callers and the protocol client.
///
/// The client never sees concrete encodings; it only asks a handle for its
/// format, mimetype, and a resend-classifiable [`Payload`].
pub trait ContentHandle: Send + Sync {
    fn format(&self) -> Format;

    fn mimetype(&self) -> String {
        self.format().default_mimetype().to_string()
    }

    /// Produce the outbound payload. Called once per logical request; the
    /// pipeline regenerates bodies from the payload, not the handle, on
    /// retries.
    fn send(&self) -> Result<Payload>;
}

/// Decode a fully received response body.
pub trait FromContent: Sized {
    fn from_content(format: Format, bytes: Bytes) -> Result<Self>;
}

impl FromContent for Bytes {
    fn from_content(_format: Format, bytes: Bytes) -> Result<Bytes> {
        Ok(bytes)
    }
}

impl FromContent for String {
    fn from_content(_format: Format, bytes: Bytes) -> Result<String> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::MalformedResponse(format!("body is not valid UTF-8: {e}")))
    }
}

impl FromContent for serde_json::Value {
    fn from_content(_format: Format, bytes: Bytes) -> Result<serde_json::Value> {
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::MalformedResponse(format!("body is not valid JSON: {e}")))
    }
}

/// String content with an explicit format.
#[derive(Debug, Clone)]
pub struct StringHandle {
    content: String,
    format: Format,
}

impl StringHandle {
    pub fn new(content: impl Into<String>, format: Format) -> Self {
        Self {
            content: content.into(),
            format,
        }
    }

    pub fn json(content: impl Into<String>) -> Self {
        Self::new(content, Format::Json)
    }

    pub fn xml(content: impl Into<String>) -> Self {
        Self::new(content, Format::Xml)
    }
}

impl ContentHandle for StringHandle {
    fn format(&self) -> Format {
        self.format
    }

    fn send(&self) -> Result<Payload> {
        Ok(Payload::Text(self.content.clone()))
    }
}

/// In-memory binary content.
#[derive(Debug, Clone)]
pub struct BytesHandle {
    bytes: Bytes,
    format: Format,
    mimetype: Option<String>,
}

impl BytesHandle {
    pub fn new(bytes: impl Into<Bytes>, format: Format) -> Self {
        Self {
            bytes: bytes.into(),
            format,
            mimetype: None,
        }
    }

    pub fn with_mimetype(mut self, mimetype: impl Into<String>) -> Self {
        self.mimetype = Some(mimetype.into());
        self
    }
}

impl ContentHandle for BytesHandle {
    fn format(&self) -> Format {
        self.format
    }

    fn mimetype(&self) -> String {
        self.mimetype
            .clone()
            .unwrap_or_else(|| self.format.default_mimetype().to_string())
    }

    fn send(&self) -> Result<Payload> {
        Ok(Payload::Bytes(self.bytes.clone()))
    }
}

/// File-backed content, re-read from disk on each attempt.
#[derive(Debug, Clone)]
pub struct FileHandle {
    path: PathBuf,
    format: Format,
}

impl FileHandle {
    pub fn new(path: impl Into<PathBuf>, format: Format) -> Self {
        Self {
            path: path.into(),
            format,
        }
    }
}

impl ContentHandle for FileHandle {
    fn format(&self) -> Format {
        self.format
    }

    fn send(&self) -> Result<Payload> {
        Ok(Payload::File(self.path.clone()))
    }
}

/// Serializable value sent as JSON.
#[derive(Debug, Clone)]
pub struct JsonHandle<T: Serialize> {
    value: T,
}

impl<T: Serialize> JsonHandle<T> {
    pub fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T: Serialize + Send + Sync> ContentHandle for JsonHandle<T> {
    fn format(&self) -> Format {
        Format::Json
    }

    fn send(&self) -> Result<Payload> {
        let text = serde_json::to_string(&self.value)?;
        Ok(Payload::Text(text))
    }
}

impl<T: DeserializeOwned> FromContent for JsonHandle<T>
where
    T: Serialize,
{
    fn from_content(_format: Format, bytes: Bytes) -> Result<JsonHandle<T>> {
        let value: T = serde_json::from_slice(&bytes)
            .map_err(|e| Error::MalformedResponse(format!("body is not valid JSON: {e}")))?;
        Ok(JsonHandle { value })
    }
}

impl<T: Serialize> JsonHandle<T> {
    pub fn into_inner(self) -> T {
        self.value
    }
}

/// Single-use streamed content. The underlying stream can be surrendered
/// exactly once; a second `send` reports [`Error::NotResendable`].
pub struct StreamHandle {
    stream: Mutex<Option<ByteStream>>,
    format: Format,
    mimetype: Option<String>,
}

impl StreamHandle {
    pub fn new(stream: ByteStream, format: Format) -> Self {
        Self {
            stream: Mutex::new(Some(stream)),
            format,
            mimetype: None,
        }
    }

    pub fn with_mimetype(mut self, mimetype: impl Into<String>) -> Self {
        self.mimetype = Some(mimetype.into());
        self
    }
}

impl ContentHandle for StreamHandle {
    fn format(&self) -> Format {
        self.format
    }

    fn mimetype(&self) -> String {
        self.mimetype
            .clone()
            .unwrap_or_else(|| self.format.default_mimetype().to_string())
    }

    fn send(&self) -> Result<Payload> {
        let mut slot = self
            .stream
            .lock()
            .map_err(|_| Error::InvalidState("stream handle lock poisoned".to_string()))?;
        match slot.take() {
            Some(stream) => Ok(Payload::from_stream(stream)),
            None => Err(Error::NotResendable),
        }
    }
}
