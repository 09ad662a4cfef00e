use chrono::{DateTime, Utc};
use reqwest::Method;
use std::sync::{Arc, Mutex};

use tidemark_core::{Error, Result};

use crate::client::DatabaseClient;
use crate::cookie::Cookie;
use crate::pipeline::{error_from_response, Connection, LogicalRequest};

/// Transaction lifecycle. Terminal states reject further use without any
/// wire traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Open,
    Committed,
    RolledBack,
}

/// Per-request view of a transaction: id plus the session cookies captured
/// at open time. Taken fresh at every call so callers never replay a stale
/// local copy.
#[derive(Debug, Clone)]
pub(crate) struct TxSnapshot {
    pub id: String,
    pub cookies: Vec<Cookie>,
    pub created_at: DateTime<Utc>,
}

struct TxInner {
    id: String,
    cookies: Vec<Cookie>,
    created_at: DateTime<Utc>,
    state: Mutex<TxState>,
}

/// Handle to a server transaction.
///
/// Cheap to clone; all clones share the state machine. The client does not
/// serialize concurrent use of one transaction — the server does — but every
/// request reads the current id/cookies through [`TxSnapshot`].
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxInner>,
    conn: Arc<Connection>,
}

impl Transaction {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> TxState {
        self.inner
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(TxState::RolledBack)
    }

    pub(crate) fn snapshot(&self) -> Result<TxSnapshot> {
        let state = self
            .inner
            .state
            .lock()
            .map_err(|_| Error::InvalidState("transaction lock poisoned".to_string()))?;
        if *state != TxState::Open {
            return Err(Error::InvalidState(format!(
                "transaction {} is already {}",
                self.inner.id,
                state_name(*state)
            )));
        }
        Ok(TxSnapshot {
            id: self.inner.id.clone(),
            cookies: self.inner.cookies.clone(),
            created_at: self.inner.created_at,
        })
    }

    pub async fn commit(self) -> Result<()> {
        self.finish("commit", TxState::Committed).await
    }

    pub async fn rollback(self) -> Result<()> {
        self.finish("rollback", TxState::RolledBack).await
    }

    /// Close the transaction exactly once. The close request is never
    /// retried: the server side is not idempotent.
    async fn finish(self, result: &str, terminal: TxState) -> Result<()> {
        let snapshot = {
            let mut state = self
                .inner
                .state
                .lock()
                .map_err(|_| Error::InvalidState("transaction lock poisoned".to_string()))?;
            if *state != TxState::Open {
                return Err(Error::InvalidState(format!(
                    "transaction {} is already {}",
                    self.inner.id,
                    state_name(*state)
                )));
            }
            // Terminal before the wire call: the close executes at most once
            // even when the response is lost.
            *state = terminal;
            TxSnapshot {
                id: self.inner.id.clone(),
                cookies: self.inner.cookies.clone(),
                created_at: self.inner.created_at,
            }
        };

        let req = LogicalRequest::new(
            Method::POST,
            format!("transactions/{}", snapshot.id),
        )
        .param("result", result)
        .tx(Some(snapshot))
        .no_retry();

        let response = self.conn.send(req).await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        tracing::info!(txid = %self.inner.id, result, "transaction closed");
        Ok(())
    }
}

fn state_name(state: TxState) -> &'static str {
    match state {
        TxState::Open => "open",
        TxState::Committed => "committed",
        TxState::RolledBack => "rolled back",
    }
}

impl DatabaseClient {
    /// Open a server transaction, capturing its id and session cookies.
    pub async fn open_transaction(
        &self,
        name: Option<&str>,
        time_limit_seconds: Option<u64>,
    ) -> Result<Transaction> {
        let mut req = LogicalRequest::new(Method::POST, "transactions").no_retry();
        if let Some(name) = name {
            req = req.param("name", name);
        }
        if let Some(limit) = time_limit_seconds {
            req = req.param("timeLimit", limit.to_string());
        }

        let response = self.conn().send(req).await?;
        let status = response.status();
        if !(status.is_success() || status.is_redirection()) {
            return Err(error_from_response(response).await);
        }

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                Error::MalformedResponse("transaction open returned no location".to_string())
            })?;
        let id = location
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())
            .ok_or_else(|| {
                Error::MalformedResponse(format!("unparsable transaction location: {location}"))
            })?
            .to_string();

        let cookies: Vec<Cookie> = response
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(Cookie::parse)
            .collect();

        tracing::debug!(txid = %id, cookies = cookies.len(), "transaction opened");

        Ok(Transaction {
            inner: Arc::new(TxInner {
                id,
                cookies,
                created_at: Utc::now(),
                state: Mutex::new(TxState::Open),
            }),
            conn: self.conn_arc(),
        })
    }
}
