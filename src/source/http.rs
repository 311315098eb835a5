use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use url::Url;

use super::retry::{is_retryable_http_error, is_retryable_network_error, retry_async, Permanent, RetryConfig};
use super::{parse_records, FetchWindow, LogSource};
use crate::config::Config;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::normalize::RawRecord;

const ENDPOINT: &str = "api/get_historical_logs";
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Historical log endpoint of the stats API.
pub struct HttpLogSource {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
    limit: u32,
    retry: RetryConfig,
}

impl HttpLogSource {
    pub fn new(base: &str, api_key: Option<String>, limit: u32) -> Result<Self> {
        let mut base = Url::parse(base).with_context(|| format!("invalid API base {:?}", base))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            client: Client::new(),
            endpoint: base.join(ENDPOINT)?,
            api_key,
            limit,
            retry: RetryConfig::default(),
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::new(&cfg.api_base, cfg.api_key.clone(), cfg.fetch_limit)
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn request_url(&self, window: &FetchWindow) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("from_", &window.from.format(TIME_FORMAT).to_string())
            .append_pair("till", &window.till.format(TIME_FORMAT).to_string())
            .append_pair("limit", &self.limit.to_string());
        url
    }

    async fn fetch_once(&self, url: &Url) -> Result<Vec<RawRecord>> {
        let mut req = self.client.get(url.clone());
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) if is_retryable_network_error(&e) => return Err(e.into()),
            Err(e) => {
                return Err(Permanent { operation: ENDPOINT.to_string(), reason: e.to_string() }.into())
            }
        };
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let reason = format!("HTTP {}: {}", status.as_u16(), body.chars().take(200).collect::<String>());
            if is_retryable_http_error(status.as_u16()) {
                return Err(anyhow!(reason));
            }
            return Err(Permanent { operation: ENDPOINT.to_string(), reason }.into());
        }
        let text = resp.text().await?;
        parse_records(&text)
    }
}

#[async_trait]
impl LogSource for HttpLogSource {
    async fn fetch(&self, window: &FetchWindow) -> Result<Vec<RawRecord>> {
        let url = self.request_url(window);
        let records = retry_async(&self.retry, ENDPOINT, || self.fetch_once(&url)).await?;
        log(
            Level::Info,
            Domain::Fetch,
            "window_fetched",
            obj(&[
                ("from", v_str(&window.from.to_rfc3339())),
                ("till", v_str(&window.till.to_rfc3339())),
                ("records", json!(records.len())),
                ("limit", json!(self.limit)),
            ]),
        );
        if records.len() as u64 >= self.limit as u64 {
            log(
                Level::Warn,
                Domain::Fetch,
                "limit_reached",
                obj(&[("msg", v_str("window may be incomplete; use a shorter FETCH_WINDOW_HOURS"))]),
            );
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn request_url_carries_window_and_limit() {
        let src = HttpLogSource::new("https://stats.example.org", None, 500).unwrap();
        let from = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let url = src.request_url(&FetchWindow::new(from, from + chrono::Duration::days(1)));
        assert_eq!(url.path(), "/api/get_historical_logs");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("from_".to_string(), "2025-03-01T00:00:00".to_string()),
                ("till".to_string(), "2025-03-02T00:00:00".to_string()),
                ("limit".to_string(), "500".to_string()),
            ]
        );
    }

    #[test]
    fn base_path_is_kept() {
        let src = HttpLogSource::new("https://example.org/stats", None, 1).unwrap();
        let from = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let url = src.request_url(&FetchWindow::new(from, from));
        assert_eq!(url.path(), "/stats/api/get_historical_logs");
        assert!(HttpLogSource::new("not a url", None, 1).is_err());
    }
}
