use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use licensa_common::error::{LicensaError, LicensaResult};
use licensa_db::licenses::models::ExternalLicenseRecord;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;

use super::models::{ApiLicenseEnvelope, ApiLicensePage};
use crate::reconcile::PAGE_CAP_MARGIN;
use crate::source::{FetchFailure, FetchOptions, FetchOutcome, HealthStatus, LicenseSource};

#[derive(Debug, Clone)]
pub struct LicenseApiConfig {
    pub base_url: String,
    pub api_token: String,
    pub max_retries: u32,
    pub timeout_secs: u64,
    /// First backoff step; doubles per attempt, capped at 30s.
    pub backoff_base_ms: u64,
}

impl LicenseApiConfig {
    /// Load API config from environment.
    ///
    /// Returns `None` if the API is not configured (base URL / token missing).
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("LICENSE_API_BASE_URL").ok()?;
        let api_token = std::env::var("LICENSE_API_TOKEN").ok()?;

        let max_retries = std::env::var("LICENSE_API_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);
        let timeout_secs = std::env::var("LICENSE_API_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);
        let backoff_base_ms = std::env::var("LICENSE_API_BACKOFF_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1000);

        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
            max_retries,
            timeout_secs,
            backoff_base_ms,
        })
    }
}

#[derive(Clone)]
pub struct LicenseApiClient {
    client: Client,
    config: LicenseApiConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum LicenseApiError {
    #[error("HTTP {status}: {body}")]
    HttpError { status: StatusCode, body: String },

    #[error("request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("max retries exceeded after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded {
        attempts: u32,
        last_error: String,
        last_status: Option<StatusCode>,
    },

    #[error("invalid response body: {0}")]
    Decode(String),
}

impl LicenseApiError {
    /// Classify into auth / rate-limited / transient / other.
    pub fn to_failure(&self) -> FetchFailure {
        match self {
            Self::HttpError { status, .. } => {
                FetchFailure::from_status(status.as_u16(), self.to_string())
            }
            Self::RequestError(e) => {
                if e.is_timeout() || e.is_connect() {
                    FetchFailure::network(describe_request_error(e))
                } else if let Some(status) = e.status() {
                    FetchFailure::from_status(status.as_u16(), self.to_string())
                } else {
                    FetchFailure::other(self.to_string())
                }
            }
            Self::MaxRetriesExceeded { last_status, .. } => match last_status {
                Some(status) => FetchFailure::from_status(status.as_u16(), self.to_string()),
                None => FetchFailure::network(self.to_string()),
            },
            Self::Decode(_) => FetchFailure::other(self.to_string()),
        }
    }
}

/// Spell out timeouts and refused connections so the message classifies.
fn describe_request_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("request timeout: {e}")
    } else if e.is_connect() {
        format!("connection failed: {e}")
    } else {
        e.to_string()
    }
}

impl LicenseApiClient {
    pub fn new(config: LicenseApiConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    /// For testing: create a client pointing at a specific base URL (e.g., wiremock).
    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.config.base_url = base_url.to_string();
        self
    }

    pub async fn fetch_page(&self, page: usize, limit: usize) -> Result<ApiLicensePage, LicenseApiError> {
        let url = format!(
            "{}/licenses?page={}&limit={}",
            self.config.base_url, page, limit
        );
        self.get_json(&url).await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, LicenseApiError> {
        let response = self.request_with_retry(url).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| LicenseApiError::Decode(e.to_string()))
    }

    async fn request_with_retry(&self, url: &str) -> Result<reqwest::Response, LicenseApiError> {
        let mut last_error = String::new();
        let mut last_status = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let backoff_ms = std::cmp::min(
                    self.config.backoff_base_ms.saturating_mul(1u64 << attempt.min(16)),
                    30_000,
                );
                tracing::warn!(attempt, backoff_ms, url, "retrying after backoff");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }

            let response = match self
                .client
                .get(url)
                .bearer_auth(&self.config.api_token)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    last_error = describe_request_error(&e);
                    last_status = None;
                    if e.is_timeout() || e.is_connect() {
                        continue;
                    }
                    return Err(LicenseApiError::RequestError(e));
                }
            };

            let status = response.status();

            if status.is_success() {
                return Ok(response);
            }

            // Honor Retry-After header for 429
            if status == StatusCode::TOO_MANY_REQUESTS {
                if attempt < self.config.max_retries {
                    if let Some(retry_after) = response
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                    {
                        let wait = std::cmp::min(retry_after, 60);
                        tracing::warn!(wait, "rate-limited, waiting Retry-After");
                        tokio::time::sleep(Duration::from_secs(wait)).await;
                    }
                }
                last_error = "429 Too Many Requests".to_string();
                last_status = Some(status);
                continue;
            }

            // Retry on 5xx
            if status.is_server_error() {
                let body = response.text().await.unwrap_or_default();
                last_error = format!("{status}: {body}");
                last_status = Some(status);
                continue;
            }

            // Fail fast on 4xx (except 429 handled above)
            let body = response.text().await.unwrap_or_default();
            return Err(LicenseApiError::HttpError { status, body });
        }

        Err(LicenseApiError::MaxRetriesExceeded {
            attempts: self.config.max_retries + 1,
            last_error,
            last_status,
        })
    }
}

#[async_trait]
impl LicenseSource for LicenseApiClient {
    async fn fetch_all(&self, options: &FetchOptions) -> LicensaResult<FetchOutcome> {
        if options.batch_size == 0 {
            return Err(LicensaError::Validation(
                "batch_size must be greater than zero".to_string(),
            ));
        }
        let limit = options.batch_size;
        let concurrency = options.concurrency_limit.max(1);

        let first = match self.fetch_page(1, limit).await {
            Ok(page) => page,
            Err(e) => {
                tracing::error!(error = %e, page = 1, "license page fetch failed");
                return Ok(FetchOutcome::failed(e.to_failure(), 0));
            }
        };

        // The advertised count is a hint; a short or empty page ends the fetch.
        let advertised = first.advertised_pages(limit);
        let requested = match (options.max_pages, options.max_records) {
            (None, None) => None,
            (pages, records) => {
                let by_records = records.map_or(usize::MAX, |r| r.div_ceil(limit));
                Some(pages.unwrap_or(usize::MAX).min(by_records).max(1))
            }
        };
        let cap = match (advertised, requested) {
            (Some(pages), requested) => Some(
                pages
                    .max(1)
                    .saturating_add(PAGE_CAP_MARGIN)
                    .min(requested.unwrap_or(usize::MAX)),
            ),
            (None, requested) => requested,
        };

        let mut records: Vec<ExternalLicenseRecord> = Vec::new();
        let now = Utc::now();
        let mut exhausted = first.data.len() < limit;
        records.extend(first.data.into_iter().map(|l| l.into_record(now)));
        let mut pages_fetched: usize = 1;

        let mut next: usize = 2;
        while !exhausted && cap.map_or(true, |c| next <= c) {
            let end = match cap {
                Some(c) => next.saturating_add(concurrency).min(c.saturating_add(1)),
                None => next.saturating_add(concurrency),
            };
            // join_all keeps input order, so pages stay in sequence
            let results = join_all((next..end).map(|page| self.fetch_page(page, limit))).await;

            for (page, result) in (next..end).zip(results) {
                match result {
                    Ok(body) => {
                        let len = body.data.len();
                        records.extend(body.data.into_iter().map(|l| l.into_record(now)));
                        pages_fetched += 1;
                        if len < limit {
                            exhausted = true;
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, page, "license page fetch failed");
                        return Ok(FetchOutcome::failed(e.to_failure(), pages_fetched));
                    }
                }
            }
            next = end;
        }

        // Still full at the advertised cap: report instead of silently truncating.
        if !exhausted && requested.map_or(true, |r| pages_fetched < r) {
            if let Some(advertised) = advertised {
                tracing::warn!(advertised, pages = pages_fetched, "license API kept returning full pages");
                return Ok(FetchOutcome::failed(
                    FetchFailure::other(format!(
                        "license API returned full pages past page {pages_fetched} \
                         but advertised {advertised}"
                    )),
                    pages_fetched,
                ));
            }
        }

        if let Some(max_records) = options.max_records {
            records.truncate(max_records);
        }

        tracing::info!(
            records = records.len(),
            pages = pages_fetched,
            advertised_pages = ?advertised,
            "license fetch complete"
        );
        Ok(FetchOutcome::ok(records, pages_fetched))
    }

    async fn get_license_by_app_id(
        &self,
        appid: &str,
    ) -> Result<Option<ExternalLicenseRecord>, FetchFailure> {
        let url = format!("{}/licenses/{}", self.config.base_url, appid);
        match self.get_json::<ApiLicenseEnvelope>(&url).await {
            Ok(envelope) => Ok(Some(envelope.data.into_record(Utc::now()))),
            Err(LicenseApiError::HttpError { status, .. }) if status == StatusCode::NOT_FOUND => {
                Ok(None)
            }
            Err(e) => Err(e.to_failure()),
        }
    }

    async fn health_check(&self) -> HealthStatus {
        let url = format!("{}/health", self.config.base_url);
        let error = match self
            .client
            .get(&url)
            .bearer_auth(&self.config.api_token)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => None,
            Ok(resp) => Some(format!("HTTP {}", resp.status())),
            Err(e) => Some(describe_request_error(&e)),
        };

        HealthStatus {
            healthy: error.is_none(),
            timestamp: Utc::now(),
            error,
        }
    }
}
