use bytes::Bytes;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use reqwest::header::{CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Method, Response, Url};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::io::ReaderStream;

use tidemark_core::{classify, ClientConfig, Error, Payload, Result};

use crate::auth::{new_cnonce, Auth, DigestChallenge};
use crate::cookie;
use crate::retry::{parse_retry_after, NextStep, RetryPolicy};
use crate::transaction::TxSnapshot;

/// Agent identification sent with every request.
pub const HEADER_AGENT: &str = "x-tidemark-agent";
/// Server timestamp of the response.
pub const HEADER_TIMESTAMP: &str = "x-tidemark-timestamp";
/// System time stamped on a temporal write.
pub const HEADER_SYSTEM_TIME: &str = "x-tidemark-system-time";
/// Pagination: index of the first result in the page.
pub const HEADER_START: &str = "x-tidemark-start";
/// Pagination: requested page size.
pub const HEADER_PAGE_LENGTH: &str = "x-tidemark-page-length";
/// Estimated total matching results.
pub const HEADER_RESULT_ESTIMATE: &str = "x-tidemark-result-estimate";

/// Outbound body of a logical request.
pub(crate) enum RequestBody {
    None,
    Single {
        payload: Payload,
        content_type: String,
    },
    /// Pre-assembled `multipart/mixed` body. Always buffered, hence
    /// resendable.
    Multipart {
        body: Bytes,
        content_type: String,
    },
}

impl RequestBody {
    fn is_resendable(&self) -> bool {
        match self {
            RequestBody::Single { payload, .. } => payload.is_resendable(),
            _ => true,
        }
    }
}

/// One logical call: everything needed to (re-)issue its wire request.
pub(crate) struct LogicalRequest {
    pub method: Method,
    pub path: String,
    pub params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub accept: Option<String>,
    pub body: RequestBody,
    pub tx: Option<TxSnapshot>,
    pub permit_retry: bool,
}

impl LogicalRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            params: Vec::new(),
            headers: Vec::new(),
            accept: None,
            body: RequestBody::None,
            tx: None,
            permit_retry: true,
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn accept(mut self, mimetype: impl Into<String>) -> Self {
        self.accept = Some(mimetype.into());
        self
    }

    pub fn tx(mut self, snapshot: Option<TxSnapshot>) -> Self {
        self.tx = snapshot;
        self
    }

    /// Mark the call as never-retried (transaction open/close and other
    /// non-idempotent controls).
    pub fn no_retry(mut self) -> Self {
        self.permit_retry = false;
        self
    }

    pub fn single_body(mut self, payload: Payload, content_type: impl Into<String>) -> Self {
        self.body = RequestBody::Single {
            payload,
            content_type: content_type.into(),
        };
        self
    }

    pub fn multipart_body(mut self, body: Bytes, content_type: impl Into<String>) -> Self {
        self.body = RequestBody::Multipart {
            body,
            content_type: content_type.into(),
        };
        self
    }
}

/// Shared connection state behind a `DatabaseClient`.
///
/// Holds the pooled HTTP client, the retry policy, the released flag, and
/// the digest handshake cache. The handshake cache has a single writer (the
/// request or probe that observes the 401); everything else only reads it.
pub(crate) struct Connection {
    http: reqwest::Client,
    pub(crate) config: ClientConfig,
    auth: Auth,
    pub(crate) policy: RetryPolicy,
    released: AtomicBool,
    challenge: Mutex<Option<DigestChallenge>>,
    nonce_count: AtomicU32,
    /// Async gate: concurrent callers wait for one probe round to finish
    /// rather than racing ahead of the challenge cache.
    probe_done: tokio::sync::Mutex<bool>,
}

impl Connection {
    pub fn new(config: ClientConfig, auth: Auth) -> Result<Connection> {
        let mut builder = reqwest::Client::builder()
            // Location headers are protocol data here (transaction ids,
            // created-document URIs); never follow them.
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms));
        if config.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder.build().map_err(map_transport_error)?;
        let policy = RetryPolicy::from_config(&config);

        tracing::info!(host = %config.host, port = config.port, "connected");

        Ok(Connection {
            http,
            config,
            auth,
            policy,
            released: AtomicBool::new(false),
            challenge: Mutex::new(None),
            nonce_count: AtomicU32::new(0),
            probe_done: tokio::sync::Mutex::new(false),
        })
    }

    /// One-shot teardown. Idempotent: the first call wins, later calls are
    /// no-ops.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            tracing::info!(host = %self.config.host, "connection released");
        }
    }

    pub fn ensure_open(&self) -> Result<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(Error::InvalidState(
                "client already released".to_string(),
            ));
        }
        Ok(())
    }

    /// Dispatch a logical request through the retry controller and return
    /// the final response for status interpretation by the caller.
    pub async fn send(&self, mut req: LogicalRequest) -> Result<Response> {
        self.ensure_open()?;

        let resendable = req.body.is_resendable();
        // A challenge handshake would consume a single-use body for nothing;
        // complete it with a lightweight probe first.
        if self.auth.requires_challenge() && !resendable {
            self.probe_handshake().await?;
        }

        let permit_retry = req.permit_retry && req.tx.is_none();
        let start = Instant::now();
        let mut attempts: u32 = 0;
        let mut rng = StdRng::from_entropy();

        loop {
            let response = self.issue_once(&mut req).await?;
            attempts += 1;
            let status = response.status().as_u16();
            let retry_after = parse_retry_after(response.headers());

            match self.policy.next_step(
                attempts,
                start.elapsed(),
                status,
                retry_after,
                permit_retry,
                resendable,
                &mut rng,
            ) {
                NextStep::Done => return Ok(response),
                NextStep::Veto => {
                    drop(response);
                    return Err(Error::NotResendable);
                }
                NextStep::GiveUp => {
                    drop(response);
                    tracing::warn!(attempts, status, "retry budget exhausted");
                    return Err(Error::RetryBudgetExhausted {
                        attempts,
                        last_status: status,
                    });
                }
                NextStep::Sleep(delay) => {
                    // Close the discarded response before sleeping so its
                    // connection goes back to the pool.
                    drop(response);
                    tracing::debug!(
                        attempt = attempts,
                        status,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Build and issue the wire request exactly once, completing the digest
    /// handshake inline when the body permits it.
    async fn issue_once(&self, req: &mut LogicalRequest) -> Result<Response> {
        let url = self.build_url(req)?;
        let resendable = req.body.is_resendable();
        let mut handshake_retried = false;

        loop {
            let response = self.issue_raw(req, &url).await?;

            if response.status().as_u16() == 401 && self.auth.requires_challenge() {
                let parsed = response
                    .headers()
                    .get(WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .map(DigestChallenge::parse);
                if let Some(Ok(challenge)) = parsed {
                    self.store_challenge(challenge)?;
                    if !handshake_retried && resendable {
                        handshake_retried = true;
                        continue;
                    }
                }
            }

            return Ok(response);
        }
    }

    async fn issue_raw(&self, req: &mut LogicalRequest, url: &Url) -> Result<Response> {
        let mut builder = self.http.request(req.method.clone(), url.clone());

        builder = builder.header(
            HEADER_AGENT,
            concat!("tidemark-client/", env!("CARGO_PKG_VERSION")),
        );
        if let Some(accept) = &req.accept {
            builder = builder.header(reqwest::header::ACCEPT, accept.as_str());
        }
        for (name, value) in &req.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        if let Some(header) = self.authorization_header(&req.method, url)? {
            builder = builder.header(reqwest::header::AUTHORIZATION, header);
        }

        if let Some(tx) = &req.tx {
            let now = Utc::now();
            let applicable: Vec<_> = tx
                .cookies
                .iter()
                .filter(|c| {
                    c.applies_to(
                        self.config.tls,
                        &self.config.host,
                        url.path(),
                        tx.created_at,
                        now,
                    )
                })
                .cloned()
                .collect();
            if !applicable.is_empty() {
                builder = builder.header(reqwest::header::COOKIE, cookie::header_value(&applicable));
            }
        }

        builder = match &mut req.body {
            RequestBody::None => builder,
            RequestBody::Single {
                payload,
                content_type,
            } => {
                let builder = builder.header(CONTENT_TYPE, content_type.as_str());
                match payload {
                    Payload::Empty => builder.body(Vec::new()),
                    Payload::Text(text) => builder.body(text.clone()),
                    Payload::Bytes(bytes) => builder.body(bytes.clone()),
                    Payload::File(path) => {
                        // Re-opened per attempt; this is what makes a file
                        // payload resendable.
                        let file = tokio::fs::File::open(&path).await?;
                        builder.body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
                    }
                    Payload::Stream(_) => {
                        let stream = payload.take_stream()?;
                        builder.body(reqwest::Body::wrap_stream(stream))
                    }
                }
            }
            RequestBody::Multipart { body, content_type } => builder
                .header(CONTENT_TYPE, content_type.as_str())
                .body(body.clone()),
        };

        builder.send().await.map_err(map_transport_error)
    }

    fn build_url(&self, req: &LogicalRequest) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/{}", self.config.root_url(), req.path))
            .map_err(|e| Error::InvalidState(format!("invalid request url: {e}")))?;
        {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &req.params {
                pairs.append_pair(name, value);
            }
            if let Some(database) = &self.config.database {
                pairs.append_pair("database", database);
            }
            if let Some(tx) = &req.tx {
                pairs.append_pair("txid", &tx.id);
            }
        }
        Ok(url)
    }

    fn authorization_header(&self, method: &Method, url: &Url) -> Result<Option<String>> {
        if let Some(header) = self.auth.static_header() {
            return Ok(Some(header));
        }
        let Auth::Digest { username, password } = &self.auth else {
            return Ok(None);
        };
        let challenge = self
            .challenge
            .lock()
            .map_err(|_| Error::InvalidState("challenge cache lock poisoned".to_string()))?;
        let Some(challenge) = challenge.as_ref() else {
            // No challenge seen yet; the first 401 supplies it.
            return Ok(None);
        };
        let uri = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        let nc = self.nonce_count.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Some(challenge.authorization(
            username,
            password,
            method.as_str(),
            &uri,
            &new_cnonce(),
            nc,
        )))
    }

    fn store_challenge(&self, challenge: DigestChallenge) -> Result<()> {
        let mut slot = self
            .challenge
            .lock()
            .map_err(|_| Error::InvalidState("challenge cache lock poisoned".to_string()))?;
        self.nonce_count.store(0, Ordering::SeqCst);
        *slot = Some(challenge);
        Ok(())
    }

    /// Unauthenticated HEAD against the ping resource so a challenge
    /// handshake completes before a single-use body is consumed. The lock is
    /// held across the round: a second caller mid-probe waits for the cached
    /// challenge instead of issuing its own request unauthenticated.
    async fn probe_handshake(&self) -> Result<()> {
        let mut done = self.probe_done.lock().await;
        if *done {
            return Ok(());
        }
        let url = Url::parse(&format!("{}/ping", self.config.root_url()))
            .map_err(|e| Error::InvalidState(format!("invalid request url: {e}")))?;
        tracing::debug!("probing authentication handshake");
        let response = self
            .http
            .head(url)
            .header(
                HEADER_AGENT,
                concat!("tidemark-client/", env!("CARGO_PKG_VERSION")),
            )
            .send()
            .await
            .map_err(map_transport_error)?;
        if response.status().as_u16() == 401 {
            if let Some(value) = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
            {
                self.store_challenge(DigestChallenge::parse(value)?)?;
            }
        }
        // A transport failure above leaves the flag unset so the next
        // non-resendable call probes again.
        *done = true;
        Ok(())
    }
}

/// Classify a non-success response into the typed taxonomy, consuming its
/// body for the structured server detail.
pub(crate) async fn error_from_response(response: Response) -> Error {
    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.bytes().await.unwrap_or_default();
    classify(status, content_type.as_deref(), &body)
}

pub(crate) async fn expect_success(response: Response) -> Result<Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(error_from_response(response).await)
    }
}

/// Header value as a string, when present and representable.
pub(crate) fn header_str<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

pub(crate) fn map_transport_error(err: reqwest::Error) -> Error {
    let mut hint = None;
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&err);
    while let Some(cause) = source {
        let text = cause.to_string();
        // The usual signature of a client-certificate mismatch is a TLS
        // alert during the handshake record.
        if text.contains("handshake") || text.contains("HandshakeFailure") {
            hint = Some(
                "TLS handshake failed; check the client certificate configuration".to_string(),
            );
            break;
        }
        source = cause.source();
    }
    Error::Transport {
        message: err.to_string(),
        hint,
    }
}
