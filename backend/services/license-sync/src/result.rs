use licensa_db::licenses::models::BulkUpsertError;
use serde::Serialize;

use crate::source::ApiStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncErrorEntry {
    pub identifier: String,
    pub error: String,
}

impl From<BulkUpsertError> for SyncErrorEntry {
    fn from(err: BulkUpsertError) -> Self {
        Self {
            identifier: err.identifier,
            error: err.error,
        }
    }
}

/// Outcome of one sync invocation, handed back to the caller.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    pub total_fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
    pub errors: Vec<SyncErrorEntry>,
    /// Wall-clock duration in milliseconds.
    pub duration: u64,
    pub pages_fetched: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_synced: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_updated: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_created: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_skipped: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bidirectional_synced: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bidirectional_sync_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_status: Option<ApiStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_attempted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_successful: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
