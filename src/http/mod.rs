use crate::config::{ClientConfig, ANALYZE_CHART};
use crate::error::{map_status_to_error, Error, Result};
use crate::tracker::{lock_tracker, RateLimitTracker, SharedTracker};
use crate::types::{AnalysisResponse, RateMeta};
use base64::Engine; // for STANDARD.encode
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, RETRY_AFTER, USER_AGENT};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use url::Url;

/// Raw rate-limit response metadata. Values are untrusted and may be absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateHeaders {
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
    /// Epoch seconds.
    pub reset: Option<i64>,
}

impl RateHeaders {
    pub fn to_meta(self) -> RateMeta {
        let reset_at = self
            .reset
            .and_then(|epoch| chrono::DateTime::<chrono::Utc>::from_timestamp(epoch, 0))
            .map(|dt| dt.to_rfc3339());
        RateMeta {
            limit: self.limit,
            remaining: self.remaining,
            reset_at,
        }
    }
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<i64>().ok())
}

pub fn extract_rate_from_headers(headers: &HeaderMap) -> RateHeaders {
    RateHeaders {
        limit: header_i64(headers, "x-ratelimit-limit"),
        remaining: header_i64(headers, "x-ratelimit-remaining"),
        reset: header_i64(headers, "x-ratelimit-reset"),
    }
}

pub fn build_client(cfg: &ClientConfig) -> Result<Client> {
    let mut default_headers = HeaderMap::new();
    let ua = HeaderValue::from_str(&cfg.user_agent)
        .map_err(|e| Error::Config(format!("user agent: {}", e)))?;
    default_headers.insert(USER_AGENT, ua);
    let client = Client::builder()
        .default_headers(default_headers)
        .timeout(Duration::from_secs(cfg.timeout_secs))
        .use_rustls_tls()
        .build()?;
    Ok(client)
}

fn compute_backoff(attempt: u32, retry_after: Option<Duration>) -> Duration {
    if let Some(d) = retry_after {
        return d;
    }
    // Exponential backoff with jitter: base 200ms * 2^attempt, max 5s.
    let base = 200u64.saturating_mul(1u64 << attempt.min(5));
    let max = 5_000u64.min(base);
    let jitter = fastrand::u64(0..=max / 2);
    Duration::from_millis(max / 2 + jitter)
}

fn retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
}

/// Client for the chart analysis backend. Every call is gated and accounted
/// through the shared rate-limit tracker.
#[derive(Debug, Clone)]
pub struct AnalysisClient {
    client: Client,
    cfg: ClientConfig,
    base: Url,
    auth: HeaderValue,
    tracker: SharedTracker,
}

impl AnalysisClient {
    pub fn new(cfg: ClientConfig, tracker: SharedTracker) -> Result<Self> {
        let base = Url::parse(&cfg.api_url)
            .map_err(|e| Error::Config(format!("api url {}: {}", cfg.api_url, e)))?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", cfg.api_key))
            .map_err(|e| Error::Config(format!("api key: {}", e)))?;
        let client = build_client(&cfg)?;
        Ok(Self {
            client,
            cfg,
            base,
            auth,
            tracker,
        })
    }

    /// Build a client with a fresh tracker over `cfg.limits`.
    pub fn from_config(cfg: ClientConfig) -> Result<Self> {
        let tracker = RateLimitTracker::new(&cfg.limits).into_shared();
        Self::new(cfg, tracker)
    }

    pub fn tracker(&self) -> &SharedTracker {
        &self.tracker
    }

    pub fn endpoint_url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.base.as_str().trim_end_matches('/'),
            urlencoding::encode(endpoint)
        )
    }

    /// Upload a chart screenshot for analysis by the selected providers.
    pub async fn analyze_chart(
        &self,
        image: &[u8],
        mime: &str,
        providers: &[&str],
    ) -> Result<AnalysisResponse> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(image);
        let body = serde_json::json!({
            "image": format!("data:{};base64,{}", mime, encoded),
            "providers": providers,
        });
        self.call_endpoint(ANALYZE_CHART, &body).await
    }

    /// POST `body` to `endpoint`, consuming one slot of its window.
    ///
    /// Refuses without touching the network when the window is exhausted.
    /// Rate-limit headers on any response are reconciled into the tracker.
    pub async fn call_endpoint(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> Result<AnalysisResponse> {
        self.acquire(endpoint)?;
        let url = self.endpoint_url(endpoint);
        let mut attempt: u32 = 0;
        loop {
            let res = self
                .client
                .post(&url)
                .header(AUTHORIZATION, self.auth.clone())
                .header(ACCEPT, HeaderValue::from_static("application/json"))
                .json(body)
                .send()
                .await;

            let res = match res {
                Ok(r) => r,
                Err(e) => {
                    warn!("POST {} error sending request: {}", url, e);
                    if attempt < self.cfg.max_retries {
                        tokio::time::sleep(compute_backoff(attempt, None)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(Error::Transport(e));
                }
            };

            let status = res.status();
            let headers = res.headers().clone();
            let rate = extract_rate_from_headers(&headers);
            lock_tracker(&self.tracker).reconcile_from_server(
                endpoint,
                rate.limit,
                rate.remaining,
                rate.reset,
            );
            let body_text = res.text().await;

            if status.is_success() {
                let text = body_text?;
                let value: serde_json::Value = serde_json::from_str(&text)?;
                debug!("POST {} ok ({} bytes)", url, text.len());
                return Ok(AnalysisResponse {
                    value,
                    rate: rate.to_meta(),
                });
            }

            let text = body_text.unwrap_or_default();

            if status == StatusCode::TOO_MANY_REQUESTS {
                let header_delay = retry_after(&headers);
                let retry_after_secs = {
                    let mut t = lock_tracker(&self.tracker);
                    // Refused without rate metadata: hold the window shut locally.
                    if rate.limit.filter(|l| *l > 0).is_none() {
                        t.mark_exhausted(endpoint, header_delay);
                    }
                    header_delay.unwrap_or_else(|| t.seconds_until_reset(endpoint))
                };
                warn!("POST {} rate limited, retry in {}s", url, retry_after_secs);
                return Err(Error::RateLimited {
                    endpoint: endpoint.to_string(),
                    retry_after_secs,
                });
            }

            // Retry on 5xx while quota allows
            if status.is_server_error() && attempt < self.cfg.max_retries {
                let allowed = lock_tracker(&self.tracker).can_request(endpoint);
                if allowed {
                    let backoff = compute_backoff(attempt, None);
                    warn!(
                        "POST {} retrying (status {}), backoff {:?}",
                        url, status, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                    continue;
                }
            }
            return Err(map_status_to_error(status, text));
        }
    }

    fn acquire(&self, endpoint: &str) -> Result<()> {
        let mut t = lock_tracker(&self.tracker);
        if !t.can_request(endpoint) {
            return Err(Error::RateLimited {
                endpoint: endpoint.to_string(),
                retry_after_secs: t.seconds_until_reset(endpoint),
            });
        }
        t.optimistic_decrement(endpoint);
        Ok(())
    }
}
