use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::licenses::models::{
    BulkUpsertResult, ExternalLicenseRecord, InternalLicensePatch, InternalLicenseRecord,
    LicenseFilters, LicensePage, LicenseQuery, LicenseStats,
};
use licensa_common::error::LicensaResult;

/// Local mirror of the third-party license table.
#[async_trait]
pub trait ExternalLicenseRepository: Send + Sync {
    async fn find_by_app_id(&self, appid: &str) -> LicensaResult<Option<ExternalLicenseRecord>>;
    async fn find_by_count_id(&self, countid: i64) -> LicensaResult<Option<ExternalLicenseRecord>>;

    async fn find_licenses(
        &self,
        query: &LicenseQuery,
    ) -> LicensaResult<LicensePage<ExternalLicenseRecord>>;

    /// Insert or update every record keyed by appid (countid when appid is absent).
    /// Written rows get `updated_at = timestamp`, so callers filter on their own clock.
    /// Per-record failures are reported in `errors` by identifier; an `Err` means
    /// the whole call failed.
    async fn bulk_upsert(
        &self,
        records: &[ExternalLicenseRecord],
        timestamp: DateTime<Utc>,
    ) -> LicensaResult<BulkUpsertResult>;

    /// Mark records (by `ExternalLicenseRecord::identifier`) as synced at `timestamp`.
    async fn bulk_mark_synced(
        &self,
        identifiers: &[String],
        timestamp: DateTime<Utc>,
    ) -> LicensaResult<u64>;

    async fn get_license_stats_with_filters(
        &self,
        filters: &LicenseFilters,
    ) -> LicensaResult<LicenseStats>;
}

/// The system-of-record license table.
#[async_trait]
pub trait InternalLicenseRepository: Send + Sync {
    async fn find_by_app_id(&self, appid: &str) -> LicensaResult<Option<InternalLicenseRecord>>;
    async fn find_by_count_id(&self, countid: i64) -> LicensaResult<Option<InternalLicenseRecord>>;

    async fn find_licenses(
        &self,
        query: &LicenseQuery,
    ) -> LicensaResult<LicensePage<InternalLicenseRecord>>;

    async fn update(
        &self,
        id: Uuid,
        patch: &InternalLicensePatch,
    ) -> LicensaResult<InternalLicenseRecord>;

    async fn save(&self, record: InternalLicenseRecord) -> LicensaResult<InternalLicenseRecord>;

    async fn get_license_stats_with_filters(
        &self,
        filters: &LicenseFilters,
    ) -> LicensaResult<LicenseStats>;
}
