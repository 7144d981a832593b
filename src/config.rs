use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;

pub const ANALYZE_CHART: &str = "analyze-chart";
pub const ANALYZE_MARKET: &str = "analyze-market";
pub const MARKET_DATA: &str = "market-data";

/// Static limit and window for a single rate-limited endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointConfig {
    pub name: String,
    pub limit: u32,
    pub window_ms: u64,
}

impl EndpointConfig {
    pub fn new(name: impl Into<String>, limit: u32, window_ms: u64) -> Self {
        Self {
            name: name.into(),
            limit,
            window_ms,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("endpoint name must not be empty".into()));
        }
        if self.limit == 0 {
            return Err(Error::Config(format!("{}: limit must be > 0", self.name)));
        }
        if self.window_ms == 0 {
            return Err(Error::Config(format!(
                "{}: window_ms must be > 0",
                self.name
            )));
        }
        Ok(())
    }
}

/// Endpoint table handed to the tracker at construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LimitsConfig {
    pub endpoints: Vec<EndpointConfig>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![
                EndpointConfig::new(ANALYZE_CHART, 10, 60_000),
                EndpointConfig::new(ANALYZE_MARKET, 10, 60_000),
                EndpointConfig::new(MARKET_DATA, 30, 60_000),
            ],
        }
    }
}

impl LimitsConfig {
    /// Parse `{ "endpoints": [{ "name", "limit", "window_ms" }] }` and validate every entry.
    pub fn from_json(s: &str) -> Result<Self> {
        let cfg: LimitsConfig = serde_json::from_str(s)
            .map_err(|e| Error::Config(format!("rate limit table: {}", e)))?;
        for ep in &cfg.endpoints {
            ep.validate()?;
        }
        Ok(cfg)
    }
}

/// Runtime configuration for the analysis backend client.
/// Values are sourced from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_key: String,
    pub api_url: String,
    pub user_agent: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub limits: LimitsConfig,
}

impl ClientConfig {
    /// Load configuration from environment.
    ///
    /// Env vars:
    /// - BULLBEAR_API_KEY [required]
    /// - BULLBEAR_API_URL (default: http://localhost:54321/functions/v1)
    /// - BULLBEAR_HTTP_TIMEOUT_SECS (default: 60)
    /// - BULLBEAR_MAX_RETRIES (default: 3)
    /// - BULLBEAR_USER_AGENT (default: bullbear-limits/<version>)
    /// - BULLBEAR_RATE_LIMITS (optional JSON endpoint table)
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("BULLBEAR_API_KEY")
            .map_err(|_| Error::Config("Missing BULLBEAR_API_KEY".to_string()))?;

        let api_url = env::var("BULLBEAR_API_URL")
            .unwrap_or_else(|_| "http://localhost:54321/functions/v1".to_string());
        let timeout_secs = env::var("BULLBEAR_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(60);
        let max_retries = env::var("BULLBEAR_MAX_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(3);
        let user_agent = env::var("BULLBEAR_USER_AGENT")
            .unwrap_or_else(|_| format!("bullbear-limits/{}", env!("CARGO_PKG_VERSION")));
        let limits = match env::var("BULLBEAR_RATE_LIMITS") {
            Ok(raw) => LimitsConfig::from_json(&raw)?,
            Err(_) => LimitsConfig::default(),
        };

        Ok(Self {
            api_key,
            api_url,
            user_agent,
            timeout_secs,
            max_retries,
            limits,
        })
    }

    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_url: api_url.into(),
            user_agent: format!("bullbear-limits/{}", env!("CARGO_PKG_VERSION")),
            timeout_secs: 60,
            max_retries: 3,
            limits: LimitsConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_covers_known_endpoints() {
        let cfg = LimitsConfig::default();
        let names: Vec<_> = cfg.endpoints.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![ANALYZE_CHART, ANALYZE_MARKET, MARKET_DATA]);
        assert!(cfg.endpoints.iter().all(|e| e.validate().is_ok()));
    }

    #[test]
    fn parses_json_table() {
        let cfg = LimitsConfig::from_json(
            r#"{"endpoints":[{"name":"analyze-chart","limit":5,"window_ms":1000}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.endpoints, vec![EndpointConfig::new(ANALYZE_CHART, 5, 1000)]);
    }

    #[test]
    fn rejects_zero_limit_and_window() {
        let err = LimitsConfig::from_json(
            r#"{"endpoints":[{"name":"x","limit":0,"window_ms":1000}]}"#,
        )
        .unwrap_err();
        assert_eq!(err.code(), "invalid_config");
        assert!(LimitsConfig::from_json(
            r#"{"endpoints":[{"name":"x","limit":1,"window_ms":0}]}"#
        )
        .is_err());
        assert!(LimitsConfig::from_json("not json").is_err());
    }
}
