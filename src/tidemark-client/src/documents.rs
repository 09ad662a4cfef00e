use chrono::{DateTime, Utc};
use reqwest::{Method, Response};

use tidemark_core::{
    Category, ContentHandle, DocumentDescriptor, DocumentRecord, Error, Format, FromContent,
    Result, TemporalDescriptor, VersionToken,
};

use crate::client::DatabaseClient;
use crate::multipart::{
    build_mixed, mixed_boundary, mixed_content_type, payload_to_bytes, DocumentPage, MixedPart,
    MultipartReader,
};
use crate::pipeline::{expect_success, header_str, LogicalRequest, HEADER_SYSTEM_TIME};
use crate::transaction::Transaction;

const MULTIPART_ACCEPT: &str = "multipart/mixed";

/// Selectors applied to a document write or delete.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Temporal collection the write lands in.
    pub temporal_collection: Option<String>,
    /// Explicit system time for the revision; the server clock otherwise.
    pub system_time: Option<DateTime<Utc>>,
    /// Extra query parameters passed through verbatim, in order.
    pub extra_params: Vec<(String, String)>,
}

impl WriteOptions {
    pub fn temporal(collection: impl Into<String>) -> Self {
        Self {
            temporal_collection: Some(collection.into()),
            ..Self::default()
        }
    }
}

/// One document of a bulk write.
pub struct BulkWrite {
    pub uri: String,
    pub content: Box<dyn ContentHandle>,
    pub metadata: Option<Box<dyn ContentHandle>>,
}

impl DatabaseClient {
    /// Read a document's content, refreshing the descriptor's version token,
    /// mimetype, and length from the response.
    pub async fn read_document<T: FromContent>(
        &self,
        desc: &mut DocumentDescriptor,
        tx: Option<&Transaction>,
    ) -> Result<T> {
        let req = LogicalRequest::new(Method::GET, "documents")
            .param("uri", &desc.uri)
            .accept(accept_for(desc))
            .tx(snapshot(tx)?);

        let response = expect_success(self.conn().send(req).await?).await?;
        refresh_descriptor(desc, &response)?;
        let format = desc.format;
        let bytes = response
            .bytes()
            .await
            .map_err(crate::pipeline::map_transport_error)?;
        desc.length = Some(bytes.len() as u64);
        T::from_content(format, bytes)
    }

    /// Conditional read keyed on the descriptor's version token. `None`
    /// means the document is unchanged since that revision.
    pub async fn read_document_if_changed<T: FromContent>(
        &self,
        desc: &mut DocumentDescriptor,
        tx: Option<&Transaction>,
    ) -> Result<Option<T>> {
        let version = desc.version.clone().ok_or_else(|| {
            Error::InvalidState("conditional read requires a version token".to_string())
        })?;

        let req = LogicalRequest::new(Method::GET, "documents")
            .param("uri", &desc.uri)
            .accept(accept_for(desc))
            .header("If-None-Match", version.to_header_value())
            .tx(snapshot(tx)?);

        let response = self.conn().send(req).await?;
        if response.status().as_u16() == 304 {
            return Ok(None);
        }
        let response = expect_success(response).await?;
        refresh_descriptor(desc, &response)?;
        let format = desc.format;
        let bytes = response
            .bytes()
            .await
            .map_err(crate::pipeline::map_transport_error)?;
        desc.length = Some(bytes.len() as u64);
        T::from_content(format, bytes).map(Some)
    }

    /// Read content and/or metadata categories for one document. With more
    /// than one category the response is multipart and gets re-paired into a
    /// single record.
    pub async fn read_document_with_metadata(
        &self,
        desc: &mut DocumentDescriptor,
        categories: &[Category],
        tx: Option<&Transaction>,
    ) -> Result<DocumentRecord> {
        let mut req = LogicalRequest::new(Method::GET, "documents")
            .param("uri", &desc.uri)
            .accept(MULTIPART_ACCEPT)
            .tx(snapshot(tx)?);
        for category in effective_categories(categories) {
            req = req.param("category", category.as_param());
        }

        let response = expect_success(self.conn().send(req).await?).await?;
        refresh_descriptor(desc, &response)?;

        let (content_requested, metadata_requested) = requested_kinds(categories);
        let reader = MultipartReader::from_response(response)?;
        let mut page = DocumentPage::new(reader, content_requested, metadata_requested);
        let record = page.next_record().await?.ok_or_else(|| {
            Error::MalformedResponse(format!("no parts returned for {}", desc.uri))
        })?;
        Ok(record)
    }

    /// Whether the document exists, refreshing descriptor headers when it
    /// does.
    pub async fn document_exists(
        &self,
        desc: &mut DocumentDescriptor,
        tx: Option<&Transaction>,
    ) -> Result<bool> {
        let req = LogicalRequest::new(Method::HEAD, "documents")
            .param("uri", &desc.uri)
            .tx(snapshot(tx)?);

        let response = self.conn().send(req).await?;
        if response.status().as_u16() == 404 {
            return Ok(false);
        }
        let response = expect_success(response).await?;
        refresh_descriptor(desc, &response)?;
        if let Some(length) = header_str(&response, "content-length").and_then(|v| v.parse().ok())
        {
            desc.length = Some(length);
        }
        Ok(true)
    }

    /// Write a document at a known URI, with optional metadata and temporal
    /// selectors. The descriptor's version token, when present, rides as a
    /// conditional header so a concurrent update fails as
    /// [`Error::VersionConflict`] instead of clobbering.
    pub async fn write_document(
        &self,
        desc: &mut DocumentDescriptor,
        content: &dyn ContentHandle,
        metadata: Option<&dyn ContentHandle>,
        options: &WriteOptions,
        tx: Option<&Transaction>,
    ) -> Result<Option<TemporalDescriptor>> {
        let mut req = LogicalRequest::new(Method::PUT, "documents").param("uri", &desc.uri);
        req = apply_write_options(req, options);
        if let Some(version) = &desc.version {
            req = req.header("If-Match", version.to_header_value());
        }
        req = attach_write_body(req, &desc.uri, content, metadata).await?;
        req = req.tx(snapshot(tx)?);

        let response = expect_success(self.conn().send(req).await?).await?;
        if let Some(value) = header_str(&response, "etag") {
            desc.version = Some(VersionToken::from_etag(value)?);
        }
        capture_temporal(&desc.uri, options, &response)
    }

    /// Create a document with a server-assigned URI. The new URI comes back
    /// in the `Location` header; a missing or unparsable value is a protocol
    /// violation, never a silent default.
    pub async fn create_document(
        &self,
        content: &dyn ContentHandle,
        metadata: Option<&dyn ContentHandle>,
        options: &WriteOptions,
        tx: Option<&Transaction>,
    ) -> Result<DocumentDescriptor> {
        let mut req = LogicalRequest::new(Method::POST, "documents");
        req = apply_write_options(req, options);
        req = attach_write_body(req, "", content, metadata).await?;
        req = req.tx(snapshot(tx)?);

        let response = expect_success(self.conn().send(req).await?).await?;
        let location = header_str(&response, "location").ok_or_else(|| {
            Error::MalformedResponse("document create returned no location".to_string())
        })?;
        let uri = parse_created_uri(location)?;

        let mut desc = DocumentDescriptor::new(uri).with_format(content.format());
        desc.mimetype = Some(content.mimetype());
        if let Some(value) = header_str(&response, "etag") {
            desc.version = Some(VersionToken::from_etag(value)?);
        }
        Ok(desc)
    }

    /// Delete a document, honoring the descriptor's version token and any
    /// temporal selectors.
    pub async fn delete_document(
        &self,
        desc: &DocumentDescriptor,
        options: &WriteOptions,
        tx: Option<&Transaction>,
    ) -> Result<()> {
        let mut req = LogicalRequest::new(Method::DELETE, "documents").param("uri", &desc.uri);
        req = apply_write_options(req, options);
        if let Some(version) = &desc.version {
            req = req.header("If-Match", version.to_header_value());
        }
        req = req.tx(snapshot(tx)?);

        expect_success(self.conn().send(req).await?).await?;
        tracing::debug!(uri = %desc.uri, "document deleted");
        Ok(())
    }

    /// Bulk read: one request, one multipart response, re-paired into
    /// per-URI records.
    pub async fn read_documents(
        &self,
        uris: &[&str],
        categories: &[Category],
        tx: Option<&Transaction>,
    ) -> Result<DocumentPage> {
        let mut req = LogicalRequest::new(Method::GET, "documents")
            .accept(MULTIPART_ACCEPT)
            .tx(snapshot(tx)?);
        for uri in uris {
            req = req.param("uri", *uri);
        }
        for category in effective_categories(categories) {
            req = req.param("category", category.as_param());
        }

        let response = expect_success(self.conn().send(req).await?).await?;
        let (content_requested, metadata_requested) = requested_kinds(categories);
        let reader = MultipartReader::from_response(response)?;
        Ok(DocumentPage::new(reader, content_requested, metadata_requested))
    }

    /// Bulk write: one multipart request covering many documents, each
    /// document's metadata part (when present) before its content part.
    pub async fn write_documents(
        &self,
        entries: &[BulkWrite],
        options: &WriteOptions,
        tx: Option<&Transaction>,
    ) -> Result<()> {
        let boundary = mixed_boundary();
        let mut parts = Vec::new();
        for entry in entries {
            if let Some(metadata) = &entry.metadata {
                parts.push(MixedPart::document(
                    &entry.uri,
                    "metadata",
                    &metadata.mimetype(),
                    payload_to_bytes(metadata.send()?).await?,
                ));
            }
            parts.push(MixedPart::document(
                &entry.uri,
                "content",
                &entry.content.mimetype(),
                payload_to_bytes(entry.content.send()?).await?,
            ));
        }
        let body = build_mixed(&parts, &boundary);

        let mut req = LogicalRequest::new(Method::POST, "documents")
            .multipart_body(body, mixed_content_type(&boundary));
        req = apply_write_options(req, options);
        req = req.tx(snapshot(tx)?);

        expect_success(self.conn().send(req).await?).await?;
        tracing::debug!(count = entries.len(), "bulk write complete");
        Ok(())
    }
}

fn snapshot(tx: Option<&Transaction>) -> Result<Option<crate::transaction::TxSnapshot>> {
    tx.map(Transaction::snapshot).transpose()
}

fn accept_for(desc: &DocumentDescriptor) -> String {
    desc.mimetype
        .clone()
        .unwrap_or_else(|| desc.format.default_mimetype().to_string())
}

/// Absent categories mean content-only.
fn effective_categories(categories: &[Category]) -> Vec<Category> {
    if categories.is_empty() {
        vec![Category::Content]
    } else {
        categories.to_vec()
    }
}

fn requested_kinds(categories: &[Category]) -> (bool, bool) {
    let effective = effective_categories(categories);
    let content = effective.contains(&Category::Content);
    let metadata = effective.iter().any(|c| *c != Category::Content);
    (content, metadata)
}

fn apply_write_options(mut req: LogicalRequest, options: &WriteOptions) -> LogicalRequest {
    if let Some(collection) = &options.temporal_collection {
        req = req.param("temporal-collection", collection);
    }
    if let Some(system_time) = &options.system_time {
        req = req.param("system-time", system_time.to_rfc3339());
    }
    for (name, value) in &options.extra_params {
        req = req.param(name, value);
    }
    req
}

/// Metadata and content together become a multipart body with metadata
/// first; content alone stays a single (possibly streaming) payload.
async fn attach_write_body(
    mut req: LogicalRequest,
    uri: &str,
    content: &dyn ContentHandle,
    metadata: Option<&dyn ContentHandle>,
) -> Result<LogicalRequest> {
    match metadata {
        None => {
            req = req.single_body(content.send()?, content.mimetype());
        }
        Some(metadata) => {
            req = req
                .param("category", Category::Metadata.as_param())
                .param("category", Category::Content.as_param());
            let boundary = mixed_boundary();
            let parts = vec![
                MixedPart::document(
                    uri,
                    "metadata",
                    &metadata.mimetype(),
                    payload_to_bytes(metadata.send()?).await?,
                ),
                MixedPart::document(
                    uri,
                    "content",
                    &content.mimetype(),
                    payload_to_bytes(content.send()?).await?,
                ),
            ];
            let body = build_mixed(&parts, &boundary);
            req = req.multipart_body(body, mixed_content_type(&boundary));
        }
    }
    Ok(req)
}

/// Temporal writes must come back stamped with the system time the server
/// chose for the revision.
fn capture_temporal(
    uri: &str,
    options: &WriteOptions,
    response: &Response,
) -> Result<Option<TemporalDescriptor>> {
    let Some(collection) = &options.temporal_collection else {
        return Ok(None);
    };
    let value = header_str(response, HEADER_SYSTEM_TIME).ok_or_else(|| {
        Error::MalformedResponse("temporal write returned no system time".to_string())
    })?;
    let system_time = parse_system_time(value)?;
    Ok(Some(TemporalDescriptor {
        uri: uri.to_string(),
        temporal_collection: collection.clone(),
        system_time,
    }))
}

pub(crate) fn parse_system_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::MalformedResponse(format!("unparsable system time {value:?}: {e}")))
}

/// The created URI hides behind the `uri` query parameter of a location
/// pointing back at the documents resource; any other path is a protocol
/// violation.
fn parse_created_uri(location: &str) -> Result<String> {
    let (path, query) = location.split_once('?').ok_or_else(|| {
        Error::MalformedResponse(format!("unparsable create location: {location}"))
    })?;
    if !path.ends_with("/documents") {
        return Err(Error::MalformedResponse(format!(
            "create location outside the documents resource: {location}"
        )));
    }
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("uri="))
        .filter(|uri| !uri.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::MalformedResponse(format!("create location carries no uri: {location}"))
        })
}

pub(crate) fn refresh_descriptor(
    desc: &mut DocumentDescriptor,
    response: &Response,
) -> Result<()> {
    if let Some(value) = header_str(response, "etag") {
        desc.version = Some(VersionToken::from_etag(value)?);
    }
    if let Some(mimetype) = header_str(response, "content-type") {
        desc.format = Format::from_mimetype(mimetype);
        desc.mimetype = Some(mimetype.to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_created_uri() {
        let uri = parse_created_uri("/v1/documents?uri=/generated/123.xml").unwrap();
        assert_eq!(uri, "/generated/123.xml");

        let uri =
            parse_created_uri("/v1/documents?database=docs&uri=/generated/9.json").unwrap();
        assert_eq!(uri, "/generated/9.json");

        assert!(parse_created_uri("/v1/documents").is_err());
        assert!(parse_created_uri("/v1/documents?uri=").is_err());
        assert!(parse_created_uri("/v1/documents?database=docs").is_err());
        // wrong resource, even with a uri parameter
        assert!(parse_created_uri("/v1/transactions?uri=/gen/1.json").is_err());
    }

    #[test]
    fn test_requested_kinds() {
        assert_eq!(requested_kinds(&[]), (true, false));
        assert_eq!(requested_kinds(&[Category::Content]), (true, false));
        assert_eq!(
            requested_kinds(&[Category::Content, Category::Metadata]),
            (true, true)
        );
        assert_eq!(requested_kinds(&[Category::Collections]), (false, true));
    }

    #[test]
    fn test_parse_system_time() {
        let t = parse_system_time("2026-08-27T10:00:00Z").unwrap();
        assert_eq!(t.to_rfc3339(), "2026-08-27T10:00:00+00:00");
        assert!(parse_system_time("yesterday").is_err());
    }
}
