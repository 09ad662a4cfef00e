use reqwest::Method;

use tidemark_core::{Error, Payload, Result};

use crate::client::DatabaseClient;
use crate::multipart::MultipartReader;
use crate::pipeline::{expect_success, LogicalRequest};
use crate::transaction::Transaction;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

impl DatabaseClient {
    /// Evaluate ad-hoc server-side code. The result sequence comes back as
    /// `multipart/mixed`, one part per value.
    pub async fn eval(
        &self,
        source: &str,
        vars: Option<&serde_json::Value>,
        tx: Option<&Transaction>,
    ) -> Result<MultipartReader> {
        self.eval_inner("eval", "script", source, vars, tx).await
    }

    /// Invoke a module already installed on the server, by path.
    pub async fn invoke(
        &self,
        module: &str,
        vars: Option<&serde_json::Value>,
        tx: Option<&Transaction>,
    ) -> Result<MultipartReader> {
        self.eval_inner("invoke", "module", module, vars, tx).await
    }

    async fn eval_inner(
        &self,
        path: &str,
        field: &str,
        value: &str,
        vars: Option<&serde_json::Value>,
        tx: Option<&Transaction>,
    ) -> Result<MultipartReader> {
        let mut pairs = vec![(field, value.to_string())];
        if let Some(vars) = vars {
            pairs.push(("vars", serde_json::to_string(vars)?));
        }

        let req = LogicalRequest::new(Method::POST, path)
            .accept("multipart/mixed")
            .single_body(Payload::Text(form_body(&pairs)?), FORM_CONTENT_TYPE)
            .tx(tx.map(Transaction::snapshot).transpose()?);

        let response = expect_success(self.conn().send(req).await?).await?;
        MultipartReader::from_response(response)
    }
}

fn form_body(pairs: &[(&str, String)]) -> Result<String> {
    serde_urlencoded::to_string(pairs)
        .map_err(|e| Error::InvalidState(format!("unencodable form body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_form_body_escapes_code() {
        let pairs = vec![
            ("script", "fn:doc(\"/a b.json\")".to_string()),
            ("vars", "{\"n\":1}".to_string()),
        ];
        assert_eq!(
            form_body(&pairs).unwrap(),
            "script=fn%3Adoc%28%22%2Fa+b.json%22%29&vars=%7B%22n%22%3A1%7D"
        );
    }
}
