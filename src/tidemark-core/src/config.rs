use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Connection settings for one database endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    /// Content database to address; the server default when absent.
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default = "default_base_path")]
    pub base_path: String,

    // Retry configuration
    #[serde(default = "default_min_retries")]
    pub min_retries: u32,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_port() -> u16 {
    8002
}

fn default_base_path() -> String {
    "/v1".to_string()
}

fn default_min_retries() -> u32 {
    8
}

fn default_max_delay_ms() -> u64 {
    120_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn load(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ClientConfig = serde_json::from_str(&contents)?;
        Ok(config)
    }

    pub fn root_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!(
            "{}://{}:{}{}",
            scheme,
            self.host,
            self.port,
            self.base_path.trim_end_matches('/')
        )
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: default_port(),
            tls: false,
            insecure_skip_verify: false,
            database: None,
            base_path: default_base_path(),
            min_retries: default_min_retries(),
            max_delay_ms: default_max_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: ClientConfig = serde_json::from_str(r#"{"host": "db.example.com"}"#).unwrap();
        assert_eq!(config.port, 8002);
        assert_eq!(config.base_path, "/v1");
        assert_eq!(config.min_retries, 8);
        assert!(!config.tls);
    }

    #[test]
    fn test_root_url() {
        let mut config = ClientConfig::new("db.example.com", 8443);
        config.tls = true;
        assert_eq!(config.root_url(), "https://db.example.com:8443/v1");
    }
}
