use async_trait::async_trait;
use chrono::{DateTime, Utc};
use licensa_common::error::{ErrorClass, LicensaError, LicensaResult};
use licensa_db::licenses::models::ExternalLicenseRecord;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    pub batch_size: usize,
    pub concurrency_limit: usize,
    pub max_records: Option<usize>,
    pub max_pages: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchFailureKind {
    /// 401 / 403
    Auth,
    /// 429
    RateLimited,
    /// 5xx, timeouts and unreachable hosts
    Transient,
    Other,
}

/// A classified fetch failure. Produced instead of an error for every
/// expected HTTP-level problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchFailure {
    pub kind: FetchFailureKind,
    pub status: Option<u16>,
    pub message: String,
}

impl FetchFailure {
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            401 | 403 => FetchFailureKind::Auth,
            429 => FetchFailureKind::RateLimited,
            500..=599 => FetchFailureKind::Transient,
            _ => FetchFailureKind::Other,
        };
        Self {
            kind,
            status: Some(status),
            message: message.into(),
        }
    }

    /// Failure below the HTTP layer (timeout, refused connection, DNS).
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: FetchFailureKind::Transient,
            status: None,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            kind: FetchFailureKind::Other,
            status: None,
            message: message.into(),
        }
    }

    pub fn is_network(&self) -> bool {
        self.kind == FetchFailureKind::Transient && self.status.is_none()
    }
}

impl From<FetchFailure> for LicensaError {
    fn from(failure: FetchFailure) -> Self {
        if failure.is_network() {
            match ErrorClass::from_message(&failure.message) {
                ErrorClass::Timeout => return LicensaError::Timeout(failure.message),
                ErrorClass::Connection => return LicensaError::Connection(failure.message),
                _ => {}
            }
        }
        LicensaError::Api {
            status: failure.status,
            message: failure.message,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchMeta {
    pub pages_fetched: usize,
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub success: bool,
    pub data: Option<Vec<ExternalLicenseRecord>>,
    pub error: Option<FetchFailure>,
    pub meta: FetchMeta,
}

impl FetchOutcome {
    pub fn ok(data: Vec<ExternalLicenseRecord>, pages_fetched: usize) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            meta: FetchMeta { pages_fetched },
        }
    }

    pub fn failed(failure: FetchFailure, pages_fetched: usize) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(failure),
            meta: FetchMeta { pages_fetched },
        }
    }
}

/// Reachability diagnostics reported by dry runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiStatus {
    pub authenticated: bool,
    pub rate_limited: bool,
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiStatus {
    pub fn healthy() -> Self {
        Self {
            authenticated: true,
            rate_limited: false,
            reachable: true,
            error: None,
        }
    }

    pub fn from_failure(failure: &FetchFailure) -> Self {
        Self {
            authenticated: failure.kind != FetchFailureKind::Auth,
            rate_limited: failure.kind == FetchFailureKind::RateLimited,
            reachable: !failure.is_network(),
            error: Some(failure.message.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The third-party license API as seen by the sync core.
#[async_trait]
pub trait LicenseSource: Send + Sync {
    /// Fetch every record (bounded by `max_records` / `max_pages`).
    ///
    /// HTTP-level failures are reported inside the outcome; `Err` is reserved
    /// for invalid arguments.
    async fn fetch_all(&self, options: &FetchOptions) -> LicensaResult<FetchOutcome>;

    async fn get_license_by_app_id(
        &self,
        appid: &str,
    ) -> Result<Option<ExternalLicenseRecord>, FetchFailure>;

    async fn health_check(&self) -> HealthStatus;
}
