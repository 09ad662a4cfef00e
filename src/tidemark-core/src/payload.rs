use bytes::Bytes;
use futures::stream::BoxStream;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Byte stream used for single-use request bodies and streamed responses.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Content format negotiated with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Json,
    Xml,
    Text,
    Binary,
    #[default]
    Unknown,
}

impl Format {
    /// Default mimetype sent when the caller does not override it.
    pub fn default_mimetype(&self) -> &'static str {
        match self {
            Format::Json => "application/json",
            Format::Xml => "application/xml",
            Format::Text => "text/plain",
            Format::Binary | Format::Unknown => "application/octet-stream",
        }
    }

    /// Best-effort format derived from a mimetype.
    pub fn from_mimetype(mimetype: &str) -> Format {
        let essence = mimetype.split(';').next().unwrap_or("").trim();
        if essence.ends_with("/json") || essence.ends_with("+json") {
            Format::Json
        } else if essence.ends_with("/xml") || essence.ends_with("+xml") {
            Format::Xml
        } else if essence.starts_with("text/") {
            Format::Text
        } else if essence.is_empty() {
            Format::Unknown
        } else {
            Format::Binary
        }
    }
}

/// An outbound request body.
///
/// Every variant except `Stream` can be regenerated identically for a retry
/// attempt; a stream can be taken exactly once. The retry controller consults
/// [`Payload::is_resendable`] before re-attempting a failed write.
pub enum Payload {
    Empty,
    Text(String),
    Bytes(Bytes),
    /// Re-opened from disk on every attempt.
    File(PathBuf),
    /// Single-use; `None` once taken.
    Stream(Option<ByteStream>),
}

impl Payload {
    pub fn from_stream(stream: ByteStream) -> Payload {
        Payload::Stream(Some(stream))
    }

    /// Whether this payload can be sent again after a failed attempt.
    pub fn is_resendable(&self) -> bool {
        !matches!(self, Payload::Stream(_))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Empty => true,
            Payload::Text(s) => s.is_empty(),
            Payload::Bytes(b) => b.is_empty(),
            _ => false,
        }
    }

    /// Take the underlying stream out of a `Stream` payload.
    ///
    /// Fails with [`Error::NotResendable`] when the stream was already
    /// consumed by an earlier attempt.
    pub fn take_stream(&mut self) -> Result<ByteStream> {
        match self {
            Payload::Stream(slot) => slot.take().ok_or(Error::NotResendable),
            _ => Err(Error::InvalidState(
                "take_stream on a buffered payload".to_string(),
            )),
        }
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Empty => write!(f, "Payload::Empty"),
            Payload::Text(s) => write!(f, "Payload::Text({} bytes)", s.len()),
            Payload::Bytes(b) => write!(f, "Payload::Bytes({} bytes)", b.len()),
            Payload::File(p) => write!(f, "Payload::File({})", p.display()),
            Payload::Stream(Some(_)) => write!(f, "Payload::Stream(pending)"),
            Payload::Stream(None) => write!(f, "Payload::Stream(consumed)"),
        }
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Payload {
        Payload::Text(s)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Payload {
        Payload::Text(s.to_string())
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Payload {
        Payload::Bytes(b)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Payload {
        Payload::Bytes(Bytes::from(b))
    }
}
