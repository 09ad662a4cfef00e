use reqwest::Method;
use std::sync::Arc;

use tidemark_core::{ClientConfig, Result};

use crate::auth::Auth;
use crate::pipeline::{expect_success, Connection, LogicalRequest};

/// Handle to one database endpoint.
///
/// Cheap to clone; all clones share one connection pool and retry policy.
/// Many tasks may issue calls concurrently through the same handle.
#[derive(Clone)]
pub struct DatabaseClient {
    conn: Arc<Connection>,
}

impl DatabaseClient {
    /// Connect to the endpoint described by `config`.
    ///
    /// No traffic is sent until the first operation; `ping` verifies
    /// reachability explicitly.
    pub fn connect(config: ClientConfig, auth: Auth) -> Result<Self> {
        Ok(Self {
            conn: Arc::new(Connection::new(config, auth)?),
        })
    }

    /// Tear down the connection. One-shot and idempotent; any operation
    /// after release fails fast instead of silently reconnecting.
    pub fn release(&self) {
        self.conn.release();
    }

    /// Health check against the ping resource.
    pub async fn ping(&self) -> Result<()> {
        let response = self
            .conn
            .send(LogicalRequest::new(Method::GET, "ping"))
            .await?;
        expect_success(response).await?;
        Ok(())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.conn.config
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn conn_arc(&self) -> Arc<Connection> {
        Arc::clone(&self.conn)
    }
}
