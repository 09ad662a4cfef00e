use rand::RngCore;
use sha2::{Digest, Sha256};

use tidemark_core::{Error, Result};

/// Security context for a connection.
#[derive(Debug, Clone)]
pub enum Auth {
    None,
    Basic { username: String, password: String },
    Bearer { token: String },
    /// HTTP digest (RFC 7616, SHA-256). Requires a challenge round-trip
    /// before the first authenticated request.
    Digest { username: String, password: String },
}

impl Auth {
    /// Whether this scheme needs an unauthenticated exchange before the real
    /// request can be authenticated.
    pub(crate) fn requires_challenge(&self) -> bool {
        matches!(self, Auth::Digest { .. })
    }

    /// Authorization header for schemes that need no challenge state.
    pub(crate) fn static_header(&self) -> Option<String> {
        match self {
            Auth::Basic { username, password } => {
                Some(format!("Basic {}", base64(format!("{username}:{password}").as_bytes())))
            }
            Auth::Bearer { token } => Some(format!("Bearer {token}")),
            _ => None,
        }
    }
}

// Standard alphabet, padded.
fn base64(input: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::with_capacity(input.len().div_ceil(3) * 4);
    for chunk in input.chunks(3) {
        let b = [
            chunk[0],
            chunk.get(1).copied().unwrap_or(0),
            chunk.get(2).copied().unwrap_or(0),
        ];
        let n = (u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2]);
        out.push(ALPHABET[(n >> 18) as usize & 63] as char);
        out.push(ALPHABET[(n >> 12) as usize & 63] as char);
        out.push(if chunk.len() > 1 {
            ALPHABET[(n >> 6) as usize & 63] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            ALPHABET[n as usize & 63] as char
        } else {
            '='
        });
    }
    out
}

/// Parsed server challenge, cached on the connection. Single writer: the
/// handshake round that observes the 401 stores it; later requests only read.
#[derive(Debug, Clone)]
pub(crate) struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub qop_auth: bool,
    pub algorithm: String,
}

impl DigestChallenge {
    /// Parse a `WWW-Authenticate: Digest ...` header value.
    pub(crate) fn parse(header: &str) -> Result<DigestChallenge> {
        let rest = header
            .trim()
            .strip_prefix("Digest ")
            .ok_or_else(|| Error::MalformedResponse("challenge is not a digest".to_string()))?;

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut qop_auth = false;
        let mut algorithm = "SHA-256".to_string();

        for (key, value) in split_challenge_params(rest) {
            match key.as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "qop" => qop_auth = value.split(',').any(|q| q.trim() == "auth"),
                "algorithm" => algorithm = value,
                _ => {}
            }
        }

        let challenge = DigestChallenge {
            realm: realm
                .ok_or_else(|| Error::MalformedResponse("digest challenge missing realm".to_string()))?,
            nonce: nonce
                .ok_or_else(|| Error::MalformedResponse("digest challenge missing nonce".to_string()))?,
            opaque,
            qop_auth,
            algorithm,
        };

        if challenge.algorithm != "SHA-256" {
            return Err(Error::MalformedResponse(format!(
                "unsupported digest algorithm: {}",
                challenge.algorithm
            )));
        }

        Ok(challenge)
    }

    /// Build the Authorization header for one request.
    pub(crate) fn authorization(
        &self,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
        cnonce: &str,
        nonce_count: u32,
    ) -> String {
        let nc = format!("{nonce_count:08x}");
        let ha1 = sha256_hex(&format!("{username}:{}:{password}", self.realm));
        let ha2 = sha256_hex(&format!("{method}:{uri}"));
        let response = if self.qop_auth {
            sha256_hex(&format!(
                "{ha1}:{}:{nc}:{cnonce}:auth:{ha2}",
                self.nonce
            ))
        } else {
            sha256_hex(&format!("{ha1}:{}:{ha2}", self.nonce))
        };

        let mut header = format!(
            "Digest username=\"{username}\", realm=\"{}\", nonce=\"{}\", uri=\"{uri}\", \
             algorithm=SHA-256, response=\"{response}\"",
            self.realm, self.nonce
        );
        if self.qop_auth {
            header.push_str(&format!(", qop=auth, nc={nc}, cnonce=\"{cnonce}\""));
        }
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(", opaque=\"{opaque}\""));
        }
        header
    }
}

/// Fresh client nonce per handshake round.
pub(crate) fn new_cnonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Split `key=value` pairs on commas, honoring quoted values (a quoted qop
/// list contains commas of its own).
fn split_challenge_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = input;
    while !rest.is_empty() {
        let Some((key, after_eq)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_ascii_lowercase();
        let after_eq = after_eq.trim_start();
        let (value, remainder) = if let Some(quoted) = after_eq.strip_prefix('"') {
            match quoted.split_once('"') {
                Some((v, r)) => (v.to_string(), r),
                None => (quoted.to_string(), ""),
            }
        } else {
            match after_eq.split_once(',') {
                Some((v, r)) => (v.trim().to_string(), r),
                None => (after_eq.trim().to_string(), ""),
            }
        };
        params.push((key, value));
        rest = remainder.trim_start_matches(',').trim_start();
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_header() {
        let auth = Auth::Basic {
            username: "rest-reader".to_string(),
            password: "secret".to_string(),
        };
        assert_eq!(
            auth.static_header().unwrap(),
            "Basic cmVzdC1yZWFkZXI6c2VjcmV0"
        );
        assert!(!auth.requires_challenge());
    }

    #[test]
    fn test_base64_padding() {
        assert_eq!(base64(b"a"), "YQ==");
        assert_eq!(base64(b"ab"), "YWI=");
        assert_eq!(base64(b"abc"), "YWJj");
    }

    #[test]
    fn test_parse_challenge() {
        let challenge = DigestChallenge::parse(
            "Digest realm=\"http-auth@example.org\", qop=\"auth, auth-int\", \
             algorithm=SHA-256, nonce=\"abc\", opaque=\"xyz\"",
        )
        .unwrap();
        assert_eq!(challenge.realm, "http-auth@example.org");
        assert_eq!(challenge.nonce, "abc");
        assert_eq!(challenge.opaque.as_deref(), Some("xyz"));
        assert!(challenge.qop_auth);

        let md5 = DigestChallenge::parse("Digest realm=\"r\", nonce=\"n\", algorithm=MD5");
        assert!(md5.is_err());
    }

    #[test]
    fn test_rfc7616_worked_example() {
        // SHA-256 example from RFC 7616 section 3.9.1
        let challenge = DigestChallenge::parse(
            "Digest realm=\"http-auth@example.org\", qop=\"auth, auth-int\", \
             algorithm=SHA-256, \
             nonce=\"7ypf/xlj9XXwfDPEoM4URrv/xwf94BcCAzFZH4GiTo0v\", \
             opaque=\"FQhe/qaU925kfnzjCev0ciny7QMkPqMAFRtzCUYo5tdS\"",
        )
        .unwrap();

        let header = challenge.authorization(
            "Mufasa",
            "Circle of Life",
            "GET",
            "/dir/index.html",
            "f2/wE4q74E6zIJEtWaHKaf5wv/H5QzzpXusqGemxURZJ",
            1,
        );

        assert!(header.contains(
            "response=\"753927fa0e85d155564e2e272a28d1802ca10daf4496794697cf8db5856cb6c1\""
        ));
        assert!(header.contains("qop=auth"));
        assert!(header.contains("nc=00000001"));
    }
}
