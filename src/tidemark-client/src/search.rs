use reqwest::Method;
use serde::Deserialize;

use tidemark_core::{ContentHandle, FromContent, Result};

use crate::client::DatabaseClient;
use crate::multipart::PageInfo;
use crate::pipeline::{expect_success, LogicalRequest};
use crate::transaction::Transaction;

/// One page of search results, decoded by the caller's receive type.
pub struct SearchResults<T> {
    pub body: T,
    pub page: PageInfo,
}

impl DatabaseClient {
    /// Run a query against the search resource. The query rides as the
    /// request body in whatever representation its handle produces; the
    /// result page is decoded into `T`.
    pub async fn search<T: FromContent>(
        &self,
        query: &dyn ContentHandle,
        start: Option<u64>,
        page_length: Option<u64>,
        tx: Option<&Transaction>,
    ) -> Result<SearchResults<T>> {
        let mut req = LogicalRequest::new(Method::POST, "search")
            .accept("application/json")
            .single_body(query.send()?, query.mimetype())
            .tx(tx.map(Transaction::snapshot).transpose()?);
        if let Some(start) = start {
            req = req.param("start", start.to_string());
        }
        if let Some(page_length) = page_length {
            req = req.param("pageLength", page_length.to_string());
        }

        let response = expect_success(self.conn().send(req).await?).await?;
        let page = PageInfo::from_response(&response);
        let format = tidemark_core::Format::Json;
        let bytes = response
            .bytes()
            .await
            .map_err(crate::pipeline::map_transport_error)?;
        tracing::debug!(
            estimate = ?page.estimate,
            bytes = bytes.len(),
            "search page received"
        );
        Ok(SearchResults {
            body: T::from_content(format, bytes)?,
            page,
        })
    }

    /// Read a named lexicon/range index through the values resource.
    pub async fn read_values<T: FromContent>(
        &self,
        name: &str,
        tx: Option<&Transaction>,
    ) -> Result<T> {
        let req = LogicalRequest::new(Method::GET, format!("values/{name}"))
            .accept("application/json")
            .tx(tx.map(Transaction::snapshot).transpose()?);

        let response = expect_success(self.conn().send(req).await?).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(crate::pipeline::map_transport_error)?;
        T::from_content(tidemark_core::Format::Json, bytes)
    }

    /// Completion suggestions for a partial query string.
    pub async fn suggest(
        &self,
        partial: &str,
        limit: Option<u64>,
        tx: Option<&Transaction>,
    ) -> Result<Vec<String>> {
        let mut req = LogicalRequest::new(Method::GET, "suggest")
            .accept("application/json")
            .param("partial-q", partial)
            .tx(tx.map(Transaction::snapshot).transpose()?);
        if let Some(limit) = limit {
            req = req.param("limit", limit.to_string());
        }

        let response = expect_success(self.conn().send(req).await?).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(crate::pipeline::map_transport_error)?;
        let body: SuggestBody = serde_json::from_slice(&bytes)?;
        Ok(body.suggestions)
    }
}

#[derive(Deserialize)]
struct SuggestBody {
    #[serde(default)]
    suggestions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suggest_body_decodes() {
        let body: SuggestBody =
            serde_json::from_str(r#"{"suggestions": ["alpha", "alphabet"]}"#).unwrap();
        assert_eq!(body.suggestions, vec!["alpha", "alphabet"]);

        let body: SuggestBody = serde_json::from_str("{}").unwrap();
        assert!(body.suggestions.is_empty());
    }
}
