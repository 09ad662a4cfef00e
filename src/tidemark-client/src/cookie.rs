use chrono::{DateTime, Utc};

/// One session cookie captured from a `Set-Cookie` header.
///
/// Cookie-attribute semantics (secure, path, domain, max-age) are replicated
/// locally so transaction session cookies are only replayed on requests they
/// apply to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub secure: bool,
    pub max_age: Option<i64>,
}

impl Cookie {
    /// Parse a `Set-Cookie` header value. Returns `None` for values with no
    /// name/value pair; unknown attributes are ignored.
    pub fn parse(header: &str) -> Option<Cookie> {
        let mut segments = header.split(';');
        let first = segments.next()?.trim();
        let (name, value) = first.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = Cookie {
            name: name.to_string(),
            value: value.trim().to_string(),
            path: None,
            domain: None,
            secure: false,
            max_age: None,
        };

        for segment in segments {
            let segment = segment.trim();
            let (attr, attr_value) = match segment.split_once('=') {
                Some((a, v)) => (a.trim(), Some(v.trim())),
                None => (segment, None),
            };
            match attr.to_ascii_lowercase().as_str() {
                "path" => cookie.path = attr_value.map(str::to_string),
                "domain" => cookie.domain = attr_value.map(str::to_string),
                "secure" => cookie.secure = true,
                "max-age" => cookie.max_age = attr_value.and_then(|v| v.parse().ok()),
                _ => {}
            }
        }

        Some(cookie)
    }

    /// Whether this cookie may be attached to a request.
    ///
    /// `created_at` is the instant the cookie was captured (the transaction's
    /// creation time); max-age elapses relative to it.
    pub fn applies_to(
        &self,
        secure_request: bool,
        host: &str,
        request_path: &str,
        created_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.secure && !secure_request {
            return false;
        }

        if let Some(path) = &self.path {
            if !path_matches(path, request_path) {
                return false;
            }
        }

        if let Some(domain) = &self.domain {
            if !domain_matches(domain, host) {
                return false;
            }
        }

        if let Some(max_age) = self.max_age {
            if max_age <= 0 {
                return false;
            }
            let age = now.signed_duration_since(created_at).num_seconds();
            if age >= max_age {
                return false;
            }
        }

        true
    }

    /// `name=value` pair for a `Cookie` request header.
    pub fn pair(&self) -> String {
        format!("{}={}", self.name, self.value)
    }
}

/// RFC 6265 path-match: equal, or a prefix ending at a `/` boundary.
fn path_matches(cookie_path: &str, request_path: &str) -> bool {
    if cookie_path == request_path {
        return true;
    }
    if let Some(rest) = request_path.strip_prefix(cookie_path) {
        return cookie_path.ends_with('/') || rest.starts_with('/');
    }
    false
}

/// Host equals the domain, or is a subdomain of it.
fn domain_matches(cookie_domain: &str, host: &str) -> bool {
    let domain = cookie_domain.trim_start_matches('.');
    host == domain || host.ends_with(&format!(".{domain}"))
}

/// Join applicable cookies into a single `Cookie` header value.
pub fn header_value(cookies: &[Cookie]) -> String {
    cookies
        .iter()
        .map(Cookie::pair)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn parse(s: &str) -> Cookie {
        Cookie::parse(s).expect("cookie parses")
    }

    #[test]
    fn test_parse_attributes() {
        let cookie = parse("TxToken=abc123; Path=/v1; Domain=.example.com; Secure; Max-Age=60");
        assert_eq!(cookie.name, "TxToken");
        assert_eq!(cookie.value, "abc123");
        assert_eq!(cookie.path.as_deref(), Some("/v1"));
        assert_eq!(cookie.domain.as_deref(), Some(".example.com"));
        assert!(cookie.secure);
        assert_eq!(cookie.max_age, Some(60));

        assert!(Cookie::parse("no-pair-here").is_none());
    }

    #[test]
    fn test_secure_cookie_dropped_on_plain_request() {
        let cookie = parse("s=1; Secure");
        let now = Utc::now();
        assert!(!cookie.applies_to(false, "db.example.com", "/v1/documents", now, now));
        assert!(cookie.applies_to(true, "db.example.com", "/v1/documents", now, now));
    }

    #[test]
    fn test_path_constraint() {
        let cookie = parse("s=1; Path=/v1");
        let now = Utc::now();
        assert!(cookie.applies_to(false, "h", "/v1/documents", now, now));
        assert!(cookie.applies_to(false, "h", "/v1", now, now));
        assert!(!cookie.applies_to(false, "h", "/v2/documents", now, now));
        // prefix without a segment boundary does not match
        assert!(!cookie.applies_to(false, "h", "/v1x", now, now));
    }

    #[test]
    fn test_domain_constraint() {
        let cookie = parse("s=1; Domain=example.com");
        let now = Utc::now();
        assert!(cookie.applies_to(false, "example.com", "/", now, now));
        assert!(cookie.applies_to(false, "db.example.com", "/", now, now));
        assert!(!cookie.applies_to(false, "example.org", "/", now, now));
        assert!(!cookie.applies_to(false, "badexample.com", "/", now, now));
    }

    #[test]
    fn test_max_age() {
        let cookie = parse("s=1; Max-Age=60");
        let created = Utc::now();
        assert!(cookie.applies_to(false, "h", "/", created, created));
        assert!(!cookie.applies_to(false, "h", "/", created, created + Duration::seconds(61)));

        let zero = parse("s=1; Max-Age=0");
        assert!(!zero.applies_to(false, "h", "/", created, created));
    }

    #[test]
    fn test_header_value() {
        let cookies = vec![parse("a=1"), parse("b=2")];
        assert_eq!(header_value(&cookies), "a=1; b=2");
    }
}
