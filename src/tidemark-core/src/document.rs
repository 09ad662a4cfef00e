use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::payload::Format;

/// Metadata category selectable on document reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Content,
    /// All metadata categories at once.
    Metadata,
    Collections,
    Permissions,
    Properties,
    Quality,
}

impl Category {
    pub fn as_param(&self) -> &'static str {
        match self {
            Category::Content => "content",
            Category::Metadata => "metadata",
            Category::Collections => "collections",
            Category::Permissions => "permissions",
            Category::Properties => "properties",
            Category::Quality => "quality",
        }
    }
}

/// Opaque token identifying one document revision, used for optimistic
/// concurrency. Derived from the `ETag` response header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionToken(String);

impl VersionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Parse an entity tag header value. Strips the weak prefix and the
    /// surrounding quotes; an empty or unquoted-garbage value is a protocol
    /// violation, not a default.
    pub fn from_etag(value: &str) -> Result<VersionToken> {
        let trimmed = value.trim();
        let trimmed = trimmed.strip_prefix("W/").unwrap_or(trimmed);
        let token = trimmed
            .strip_prefix('"')
            .and_then(|rest| rest.strip_suffix('"'))
            .unwrap_or(trimmed);
        if token.is_empty() {
            return Err(Error::MalformedResponse(format!(
                "unparsable entity tag: {value:?}"
            )));
        }
        Ok(VersionToken(token.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Header form: the token wrapped back in quotes.
    pub fn to_header_value(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

/// Caller-held identity of one document.
///
/// An external descriptor survives across calls, carrying the version token
/// for optimistic concurrency; values built internally by the client are
/// valid for one call only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentDescriptor {
    pub uri: String,
    #[serde(default)]
    pub format: Format,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<VersionToken>,
    /// System time captured from a temporal write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_time: Option<DateTime<Utc>>,
}

impl DocumentDescriptor {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            format: Format::Unknown,
            mimetype: None,
            length: None,
            version: None,
            system_time: None,
        }
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn with_version(mut self, version: VersionToken) -> Self {
        self.version = Some(version);
        self
    }
}

/// Result of a temporal write: which collection, and the system time the
/// server stamped on the revision. Feeds the advance-watermark call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemporalDescriptor {
    pub uri: String,
    pub temporal_collection: String,
    pub system_time: DateTime<Utc>,
}

/// One decoded body part of a bulk read: the raw bytes plus the format the
/// server declared for them.
#[derive(Debug, Clone)]
pub struct RecordPart {
    pub format: Format,
    pub mimetype: String,
    pub bytes: Bytes,
}

/// Content and/or metadata for one URI out of a bulk read.
#[derive(Debug, Clone)]
pub struct DocumentRecord {
    pub uri: String,
    pub content: Option<RecordPart>,
    pub metadata: Option<RecordPart>,
}

impl DocumentRecord {
    /// At least one of content or metadata must be present.
    pub fn new(
        uri: impl Into<String>,
        content: Option<RecordPart>,
        metadata: Option<RecordPart>,
    ) -> Result<DocumentRecord> {
        if content.is_none() && metadata.is_none() {
            return Err(Error::MalformedResponse(
                "document record with neither content nor metadata".to_string(),
            ));
        }
        Ok(DocumentRecord {
            uri: uri.into(),
            content,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_token_from_etag() {
        let token = VersionToken::from_etag("\"12345\"").unwrap();
        assert_eq!(token.as_str(), "12345");
        assert_eq!(token.to_header_value(), "\"12345\"");

        let weak = VersionToken::from_etag("W/\"6789\"").unwrap();
        assert_eq!(weak.as_str(), "6789");

        assert!(VersionToken::from_etag("\"\"").is_err());
        assert!(VersionToken::from_etag("   ").is_err());
    }

    #[test]
    fn test_record_requires_some_part() {
        let part = RecordPart {
            format: Format::Text,
            mimetype: "text/plain".to_string(),
            bytes: Bytes::from_static(b"x"),
        };
        assert!(DocumentRecord::new("/a.txt", Some(part), None).is_ok());
        assert!(DocumentRecord::new("/a.txt", None, None).is_err());
    }
}
