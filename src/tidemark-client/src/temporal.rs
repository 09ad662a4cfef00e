use chrono::{DateTime, Utc};
use reqwest::Method;

use tidemark_core::{Error, Result};

use crate::client::DatabaseClient;
use crate::documents::parse_system_time;
use crate::pipeline::{expect_success, header_str, LogicalRequest, HEADER_SYSTEM_TIME};

impl DatabaseClient {
    /// Advance the visibility watermark of a temporal collection. Documents
    /// with a system time at or below the watermark become visible to
    /// point-in-time reads.
    pub async fn advance_watermark(
        &self,
        collection: &str,
        lag_seconds: Option<u64>,
    ) -> Result<DateTime<Utc>> {
        let mut req =
            LogicalRequest::new(Method::POST, format!("temporal/{collection}/watermark"));
        if let Some(lag) = lag_seconds {
            req = req.param("lag", lag.to_string());
        }
        let response = expect_success(self.conn().send(req).await?).await?;
        let watermark = watermark_from(&response)?;
        tracing::info!(collection, watermark = %watermark.to_rfc3339(), "watermark advanced");
        Ok(watermark)
    }

    /// Current visibility watermark of a temporal collection.
    pub async fn get_watermark(&self, collection: &str) -> Result<DateTime<Utc>> {
        let req = LogicalRequest::new(Method::GET, format!("temporal/{collection}/watermark"));
        let response = expect_success(self.conn().send(req).await?).await?;
        watermark_from(&response)
    }
}

fn watermark_from(response: &reqwest::Response) -> Result<DateTime<Utc>> {
    let value = header_str(response, HEADER_SYSTEM_TIME).ok_or_else(|| {
        Error::MalformedResponse("watermark response carries no system time".to_string())
    })?;
    parse_system_time(value)
}
