use serde::Deserialize;

pub type Result<T> = std::result::Result<T, Error>;

/// Structured error detail returned by the server in a JSON body.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub status_code: u16,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message_code: Option<String>,
    #[serde(default)]
    pub message: String,
}

impl std::fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message_code {
            Some(code) => write!(f, "{} {}: {}", self.status_code, code, self.message),
            None => write!(f, "{} {}: {}", self.status_code, self.status, self.message),
        }
    }
}

/// Envelope the server wraps error details in.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error_response: ErrorDetail,
}

/// Server error codes that refine an HTTP status into a distinct failure.
pub const CODE_NO_VERSION: &str = "CONTENT-NOVERSION";
pub const CODE_WRONG_VERSION: &str = "CONTENT-WRONGVERSION";
pub const CODE_EMPTY_BODY: &str = "CONTENT-EMPTYBODY";
pub const CODE_HTTPS_REQUIRED: &str = "SEC-HTTPSREQUIRED";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// 502/503/504: the server cannot take the request right now. The retry
    /// controller consumes this kind; it only reaches callers when retry is
    /// not permitted for the call.
    #[error("service unavailable ({status})")]
    ServiceUnavailable {
        status: u16,
        detail: Option<ErrorDetail>,
    },

    #[error("unauthorized: credentials rejected")]
    Unauthorized,

    #[error("forbidden for this user{}", fmt_detail(.detail))]
    ForbiddenUser { detail: Option<ErrorDetail> },

    /// The server only accepts this operation over TLS.
    #[error("server requires an HTTPS connection")]
    HttpsRequired,

    #[error("resource not found{}", fmt_detail(.detail))]
    ResourceNotFound { detail: Option<ErrorDetail> },

    /// The supplied version token no longer matches the document's current
    /// revision.
    #[error("document version conflict{}", fmt_detail(.detail))]
    VersionConflict { detail: Option<ErrorDetail> },

    /// The server demands a version token and none was supplied.
    #[error("document version required{}", fmt_detail(.detail))]
    VersionRequired { detail: Option<ErrorDetail> },

    /// The server rejected a write carrying no body.
    #[error("empty request body rejected{}", fmt_detail(.detail))]
    EmptyBody { detail: Option<ErrorDetail> },

    /// A 412/428 the server did not refine with a known error code.
    #[error("precondition failed ({status}){}", fmt_detail(.detail))]
    PreconditionFailed {
        status: u16,
        detail: Option<ErrorDetail>,
    },

    /// A retry was required but the request payload is a single-use stream
    /// that has already been consumed.
    #[error("cannot retry: request payload is not resendable")]
    NotResendable,

    #[error("retry budget exhausted after {attempts} attempts (last status {last_status})")]
    RetryBudgetExhausted { attempts: u32, last_status: u16 },

    /// The server response violated the protocol (missing or unparsable
    /// header, truncated multipart body, undecodable content).
    #[error("malformed server response: {0}")]
    MalformedResponse(String),

    /// Transport-level failure (connection refused, TLS handshake, timeout).
    #[error("transport error: {message}{}", .hint.as_deref().map(|h| format!(" ({h})")).unwrap_or_default())]
    Transport {
        message: String,
        hint: Option<String>,
    },

    /// Any other unexpected status, with the parsed server detail when the
    /// body was structured.
    #[error("request failed ({status}): {message}")]
    FailedRequest {
        status: u16,
        message: String,
        detail: Option<ErrorDetail>,
    },

    /// Client-side misuse: a finished transaction, a released client, a
    /// reconsumed part. Never sent over the wire.
    #[error("invalid client state: {0}")]
    InvalidState(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn fmt_detail(detail: &Option<ErrorDetail>) -> String {
    detail
        .as_ref()
        .map(|d| format!(": {d}"))
        .unwrap_or_default()
}

impl Error {
    /// Whether the retry controller may re-attempt after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ServiceUnavailable { .. })
    }

    /// The parsed server detail, when one was attached.
    pub fn detail(&self) -> Option<&ErrorDetail> {
        match self {
            Error::ServiceUnavailable { detail, .. }
            | Error::ForbiddenUser { detail }
            | Error::ResourceNotFound { detail }
            | Error::VersionConflict { detail }
            | Error::VersionRequired { detail }
            | Error::EmptyBody { detail }
            | Error::PreconditionFailed { detail, .. }
            | Error::FailedRequest { detail, .. } => detail.as_ref(),
            _ => None,
        }
    }
}

/// Map an HTTP status plus response body to a typed failure.
///
/// The body is only interpreted when the content type says it is structured
/// JSON; otherwise a best-effort raw snippet is carried. 412 and 428 share a
/// status but are split into distinct failures by the server error code.
pub fn classify(status: u16, content_type: Option<&str>, body: &[u8]) -> Error {
    let detail = parse_detail(content_type, body);
    let code = detail
        .as_ref()
        .and_then(|d| d.message_code.as_deref())
        .unwrap_or("");

    match status {
        401 => Error::Unauthorized,
        403 if code == CODE_HTTPS_REQUIRED => Error::HttpsRequired,
        403 => Error::ForbiddenUser { detail },
        404 => Error::ResourceNotFound { detail },
        412 | 428 => match code {
            CODE_NO_VERSION => Error::VersionRequired { detail },
            CODE_WRONG_VERSION => Error::VersionConflict { detail },
            CODE_EMPTY_BODY => Error::EmptyBody { detail },
            _ => Error::PreconditionFailed { status, detail },
        },
        502 | 503 | 504 => Error::ServiceUnavailable { status, detail },
        _ => {
            tracing::debug!(status, "unexpected response status");
            let message = match &detail {
                Some(d) => d.to_string(),
                None => raw_snippet(body),
            };
            Error::FailedRequest {
                status,
                message,
                detail,
            }
        }
    }
}

fn parse_detail(content_type: Option<&str>, body: &[u8]) -> Option<ErrorDetail> {
    let ct = content_type?;
    if !ct.contains("json") {
        return None;
    }
    serde_json::from_slice::<ErrorBody>(body)
        .map(|b| b.error_response)
        .ok()
}

fn raw_snippet(body: &[u8]) -> String {
    const MAX: usize = 256;
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if trimmed.len() > MAX {
        let mut end = MAX;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &trimmed[..end])
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json_body(status_code: u16, message_code: &str, message: &str) -> Vec<u8> {
        format!(
            r#"{{"errorResponse": {{"statusCode": {status_code}, "status": "Oops", "messageCode": "{message_code}", "message": "{message}"}}}}"#
        )
        .into_bytes()
    }

    #[test]
    fn test_classify_unauthorized_ignores_body() {
        let err = classify(401, Some("application/json"), b"not json at all");
        assert!(matches!(err, Error::Unauthorized));
    }

    #[test]
    fn test_classify_forbidden_variants() {
        let body = json_body(403, CODE_HTTPS_REQUIRED, "use https");
        let err = classify(403, Some("application/json"), &body);
        assert!(matches!(err, Error::HttpsRequired));

        let err = classify(403, Some("application/json"), &json_body(403, "SEC-PRIV", "no"));
        assert!(matches!(err, Error::ForbiddenUser { .. }));
    }

    #[test]
    fn test_classify_precondition_refinement() {
        let err = classify(
            412,
            Some("application/json"),
            &json_body(412, CODE_WRONG_VERSION, "stale"),
        );
        assert!(matches!(err, Error::VersionConflict { .. }));

        let err = classify(
            428,
            Some("application/json"),
            &json_body(428, CODE_NO_VERSION, "need one"),
        );
        assert!(matches!(err, Error::VersionRequired { .. }));

        let err = classify(
            400,
            Some("application/json"),
            &json_body(400, CODE_EMPTY_BODY, "empty"),
        );
        // 400 is not a precondition status; falls through to FailedRequest
        assert!(matches!(err, Error::FailedRequest { status: 400, .. }));

        let err = classify(
            412,
            Some("application/json"),
            &json_body(412, CODE_EMPTY_BODY, "empty"),
        );
        assert!(matches!(err, Error::EmptyBody { .. }));

        let err = classify(412, Some("text/plain"), b"precondition failed");
        assert!(matches!(err, Error::PreconditionFailed { status: 412, .. }));
    }

    #[test]
    fn test_classify_retryable_statuses() {
        for status in [502, 503, 504] {
            let err = classify(status, None, b"");
            assert!(err.is_retryable(), "status {status} should be retryable");
        }
        assert!(!classify(500, None, b"").is_retryable());
    }

    #[test]
    fn test_failed_request_carries_detail() {
        let err = classify(
            418,
            Some("application/json"),
            &json_body(418, "TEAPOT-SHORTSTOUT", "cannot brew"),
        );
        let detail = err.detail().expect("detail parsed");
        assert_eq!(detail.message_code.as_deref(), Some("TEAPOT-SHORTSTOUT"));
        assert_eq!(detail.message, "cannot brew");
    }

    #[test]
    fn test_failed_request_raw_snippet_for_unstructured_body() {
        let err = classify(500, Some("text/html"), b"<html>boom</html>");
        match err {
            Error::FailedRequest {
                status,
                message,
                detail,
            } => {
                assert_eq!(status, 500);
                assert!(message.contains("boom"));
                assert!(detail.is_none());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
