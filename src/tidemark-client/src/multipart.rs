use bytes::{BufMut, Bytes, BytesMut};
use futures::StreamExt;
use reqwest::Response;

use tidemark_core::{DocumentRecord, Error, Format, FromContent, Payload, RecordPart, Result};

use crate::pipeline::{HEADER_PAGE_LENGTH, HEADER_RESULT_ESTIMATE, HEADER_START};

/// One part of an outbound `multipart/mixed` body.
pub(crate) struct MixedPart {
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl MixedPart {
    /// A document part with the disposition the server pairs parts by.
    pub fn document(uri: &str, category: &str, mimetype: &str, body: Bytes) -> MixedPart {
        MixedPart {
            headers: vec![
                ("Content-Type".to_string(), mimetype.to_string()),
                (
                    "Content-Disposition".to_string(),
                    format!("attachment; filename=\"{uri}\"; category={category}"),
                ),
            ],
            body,
        }
    }
}

pub(crate) fn mixed_boundary() -> String {
    format!("tidemark-{}", uuid::Uuid::new_v4().simple())
}

pub(crate) fn mixed_content_type(boundary: &str) -> String {
    format!("multipart/mixed; boundary={boundary}")
}

/// Assemble a `multipart/mixed` body. Buffered, so the result is resendable
/// regardless of how many parts it carries.
pub(crate) fn build_mixed(parts: &[MixedPart], boundary: &str) -> Bytes {
    let mut buf = BytesMut::new();
    for part in parts {
        buf.put_slice(format!("--{boundary}\r\n").as_bytes());
        for (name, value) in &part.headers {
            buf.put_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        buf.put_slice(b"\r\n");
        buf.put_slice(&part.body);
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(format!("--{boundary}--\r\n").as_bytes());
    buf.freeze()
}

/// Buffer a payload into one multipart part body.
pub(crate) async fn payload_to_bytes(mut payload: Payload) -> Result<Bytes> {
    match payload {
        Payload::Empty => Ok(Bytes::new()),
        Payload::Text(text) => Ok(Bytes::from(text)),
        Payload::Bytes(bytes) => Ok(bytes),
        Payload::File(ref path) => Ok(Bytes::from(tokio::fs::read(path).await?)),
        Payload::Stream(_) => {
            let mut stream = payload.take_stream()?;
            let mut buf = BytesMut::new();
            while let Some(chunk) = stream.next().await {
                buf.put_slice(&chunk?);
            }
            Ok(buf.freeze())
        }
    }
}

/// Pagination metadata carried on search and bulk-read responses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageInfo {
    pub start: Option<u64>,
    pub page_length: Option<u64>,
    pub estimate: Option<u64>,
}

impl PageInfo {
    pub(crate) fn from_response(response: &Response) -> PageInfo {
        let read = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok())
        };
        PageInfo {
            start: read(HEADER_START),
            page_length: read(HEADER_PAGE_LENGTH),
            estimate: read(HEADER_RESULT_ESTIMATE),
        }
    }
}

/// Lazy, forward-only reader over a `multipart/mixed` response body.
///
/// Not restartable: parts come off the wire in order and exactly once.
/// Dropping the reader (or calling [`MultipartReader::close`]) releases the
/// underlying connection even when parts remain unread.
pub struct MultipartReader {
    multipart: multer::Multipart<'static>,
    page: PageInfo,
}

impl MultipartReader {
    pub(crate) fn from_response(response: Response) -> Result<MultipartReader> {
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let boundary = multer::parse_boundary(&content_type).map_err(|_| {
            Error::MalformedResponse(format!(
                "expected a multipart response, got {content_type:?}"
            ))
        })?;
        let page = PageInfo::from_response(&response);
        Ok(MultipartReader {
            multipart: multer::Multipart::new(response.bytes_stream(), boundary),
            page,
        })
    }

    /// Next part, or `None` after the closing boundary. A body that ends
    /// without the closing boundary — the shape of a deferred mid-stream
    /// server error — is reported as a failure, not a clean end.
    pub async fn next_part(&mut self) -> Result<Option<Part>> {
        match self.multipart.next_field().await {
            Ok(Some(field)) => Ok(Some(Part::new(field))),
            Ok(None) => Ok(None),
            Err(e) => Err(Error::MalformedResponse(format!(
                "multipart body error: {e}"
            ))),
        }
    }

    pub fn page(&self) -> &PageInfo {
        &self.page
    }

    /// Abandon the sequence, releasing the connection.
    pub fn close(self) {}
}

/// One multipart body part with its extracted headers and a single-consume
/// content accessor.
pub struct Part {
    field: Option<multer::Field<'static>>,
    uri: Option<String>,
    category: Option<String>,
    mimetype: String,
    format: Format,
    length: Option<u64>,
}

impl Part {
    fn new(field: multer::Field<'static>) -> Part {
        let headers = field.headers();
        let mimetype = headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let (uri, category) = headers
            .get("content-disposition")
            .and_then(|v| v.to_str().ok())
            .map(parse_disposition)
            .unwrap_or((None, None));
        let length = headers
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        let format = Format::from_mimetype(&mimetype);
        Part {
            field: Some(field),
            uri,
            category,
            mimetype,
            format,
            length,
        }
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    pub fn mimetype(&self) -> &str {
        &self.mimetype
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn length(&self) -> Option<u64> {
        self.length
    }

    /// Consume the part's content. Readable exactly once; afterwards the
    /// part is spent.
    pub async fn bytes(&mut self) -> Result<Bytes> {
        let field = self.field.take().ok_or_else(|| {
            Error::InvalidState("part content already consumed".to_string())
        })?;
        field
            .bytes()
            .await
            .map_err(|e| Error::MalformedResponse(format!("multipart body error: {e}")))
    }

    pub async fn text(&mut self) -> Result<String> {
        String::from_content(self.format, self.bytes().await?)
    }

    pub async fn decode<T: FromContent>(&mut self) -> Result<T> {
        let format = self.format;
        T::from_content(format, self.bytes().await?)
    }
}

/// `filename` and `category` parameters of a Content-Disposition value.
fn parse_disposition(value: &str) -> (Option<String>, Option<String>) {
    let mut uri = None;
    let mut category = None;
    for segment in value.split(';').skip(1) {
        let Some((key, raw)) = segment.trim().split_once('=') else {
            continue;
        };
        let unquoted = raw.trim().trim_matches('"');
        match key.trim() {
            "filename" => uri = Some(unquoted.to_string()),
            "category" => category = Some(unquoted.to_string()),
            _ => {}
        }
    }
    (uri, category)
}

/// Bulk-read result: parts re-paired into per-URI document records.
///
/// When both content and metadata were requested the server alternates
/// metadata/content parts; N parts become N/2 records.
pub struct DocumentPage {
    reader: MultipartReader,
    content_requested: bool,
    metadata_requested: bool,
}

impl DocumentPage {
    pub(crate) fn new(
        reader: MultipartReader,
        content_requested: bool,
        metadata_requested: bool,
    ) -> DocumentPage {
        DocumentPage {
            reader,
            content_requested,
            metadata_requested,
        }
    }

    pub fn page(&self) -> &PageInfo {
        &self.reader.page
    }

    pub async fn next_record(&mut self) -> Result<Option<DocumentRecord>> {
        let Some(mut first) = self.reader.next_part().await? else {
            return Ok(None);
        };
        let uri = part_uri(&first)?;

        if self.content_requested && self.metadata_requested {
            let metadata = buffer_part(&mut first).await?;
            let mut second = self.reader.next_part().await?.ok_or_else(|| {
                Error::MalformedResponse(format!(
                    "metadata part for {uri} has no matching content part"
                ))
            })?;
            let content_uri = part_uri(&second)?;
            if content_uri != uri {
                return Err(Error::MalformedResponse(format!(
                    "mismatched part pairing: {uri} followed by {content_uri}"
                )));
            }
            let content = buffer_part(&mut second).await?;
            DocumentRecord::new(uri, Some(content), Some(metadata)).map(Some)
        } else if self.metadata_requested {
            let metadata = buffer_part(&mut first).await?;
            DocumentRecord::new(uri, None, Some(metadata)).map(Some)
        } else {
            let content = buffer_part(&mut first).await?;
            DocumentRecord::new(uri, Some(content), None).map(Some)
        }
    }

    pub fn close(self) {
        self.reader.close();
    }
}

fn part_uri(part: &Part) -> Result<String> {
    part.uri()
        .map(str::to_string)
        .ok_or_else(|| Error::MalformedResponse("multipart part carries no uri".to_string()))
}

async fn buffer_part(part: &mut Part) -> Result<RecordPart> {
    Ok(RecordPart {
        format: part.format(),
        mimetype: part.mimetype().to_string(),
        bytes: part.bytes().await?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn reader_over(body: Bytes, boundary: &str) -> MultipartReader {
        let stream = stream::once(async move { Ok::<Bytes, std::io::Error>(body) });
        MultipartReader {
            multipart: multer::Multipart::new(stream, boundary),
            page: PageInfo::default(),
        }
    }

    fn two_documents() -> (Bytes, String) {
        let boundary = mixed_boundary();
        let parts = vec![
            MixedPart::document(
                "/a.json",
                "metadata",
                "application/json",
                Bytes::from_static(b"{\"collections\": [\"alpha\"]}"),
            ),
            MixedPart::document(
                "/a.json",
                "content",
                "application/json",
                Bytes::from_static(b"{\"doc\": 1}"),
            ),
            MixedPart::document(
                "/b.json",
                "metadata",
                "application/json",
                Bytes::from_static(b"{\"collections\": []}"),
            ),
            MixedPart::document(
                "/b.json",
                "content",
                "application/json",
                Bytes::from_static(b"{\"doc\": 2}"),
            ),
        ];
        (build_mixed(&parts, &boundary), boundary)
    }

    #[tokio::test]
    async fn test_round_trip_parts() {
        let (body, boundary) = two_documents();
        let mut reader = reader_over(body, &boundary);

        let mut part = reader.next_part().await.unwrap().expect("first part");
        assert_eq!(part.uri(), Some("/a.json"));
        assert_eq!(part.category(), Some("metadata"));
        assert_eq!(part.format(), Format::Json);
        let text = part.text().await.unwrap();
        assert!(text.contains("alpha"));

        // single-consume: a second read is an error
        assert!(matches!(
            part.bytes().await,
            Err(Error::InvalidState(_))
        ));

        let mut seen = 1;
        while let Some(mut part) = reader.next_part().await.unwrap() {
            part.bytes().await.unwrap();
            seen += 1;
        }
        assert_eq!(seen, 4);
    }

    #[tokio::test]
    async fn test_record_pairing() {
        let (body, boundary) = two_documents();
        let mut page = DocumentPage::new(reader_over(body, &boundary), true, true);

        let a = page.next_record().await.unwrap().expect("record a");
        assert_eq!(a.uri, "/a.json");
        assert_eq!(a.content.as_ref().unwrap().bytes.as_ref(), b"{\"doc\": 1}");
        assert!(a.metadata.is_some());

        let b = page.next_record().await.unwrap().expect("record b");
        assert_eq!(b.uri, "/b.json");

        assert!(page.next_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mismatched_pairing_is_an_error() {
        let boundary = mixed_boundary();
        let parts = vec![
            MixedPart::document("/a.json", "metadata", "application/json", Bytes::new()),
            MixedPart::document("/b.json", "content", "application/json", Bytes::new()),
        ];
        let body = build_mixed(&parts, &boundary);
        let mut page = DocumentPage::new(reader_over(body, &boundary), true, true);
        assert!(matches!(
            page.next_record().await,
            Err(Error::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_body_is_an_error_not_eof() {
        let boundary = mixed_boundary();
        let parts = vec![MixedPart::document(
            "/a.json",
            "content",
            "application/json",
            Bytes::from_static(b"{}"),
        )];
        let full = build_mixed(&parts, &boundary);
        // drop the closing boundary
        let truncated = full.slice(0..full.len() - boundary.len() - 8);

        let mut reader = reader_over(truncated, &boundary);
        // The parser may reject the stream at the part boundary or when the
        // content is drained; either way it must be an error, never EOF.
        let outcome = match reader.next_part().await {
            Ok(Some(mut part)) => part.bytes().await.map(|_| ()),
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        assert!(
            matches!(outcome, Err(Error::MalformedResponse(_))),
            "truncated stream must not read as clean content: {outcome:?}"
        );
    }

    #[tokio::test]
    async fn test_payload_to_bytes_variants() {
        assert_eq!(
            payload_to_bytes(Payload::from("abc")).await.unwrap(),
            Bytes::from_static(b"abc")
        );
        let s = stream::iter(vec![
            Ok::<Bytes, std::io::Error>(Bytes::from_static(b"ab")),
            Ok(Bytes::from_static(b"cd")),
        ]);
        assert_eq!(
            payload_to_bytes(Payload::from_stream(Box::pin(s)))
                .await
                .unwrap(),
            Bytes::from_static(b"abcd")
        );
    }
}
