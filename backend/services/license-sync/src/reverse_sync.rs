use std::collections::HashSet;

use chrono::Utc;
use licensa_common::error::LicensaResult;
use licensa_db::licenses::models::{
    ExternalSyncStatus, InternalLicensePatch, InternalLicenseRecord, LicenseFilters, LicenseQuery,
};
use licensa_db::licenses::repositories::{ExternalLicenseRepository, InternalLicenseRepository};
use licensa_normalize::to_external_record;

use crate::reconcile::PAGE_CAP_MARGIN;

/// Push internal licenses changed since their last external sync back into the
/// mirror. Returns how many mirror rows were written.
///
/// Candidates are collected before anything is marked, since marking removes
/// rows from the filtered set and would shift offset pagination.
pub async fn sync_internal_to_external<I, E>(
    internal: &I,
    mirror: &E,
    batch_size: usize,
) -> LicensaResult<usize>
where
    I: InternalLicenseRepository + ?Sized,
    E: ExternalLicenseRepository + ?Sized,
{
    let batch_size = batch_size.max(1);
    let filters = LicenseFilters {
        pending_external_push: true,
        ..Default::default()
    };

    let mut candidates: Vec<InternalLicenseRecord> = Vec::new();
    let mut page: u32 = 1;
    let mut max_pages = PAGE_CAP_MARGIN;
    loop {
        let result = internal
            .find_licenses(&LicenseQuery::page(page, batch_size as u32, filters.clone()))
            .await?;
        if page == 1 {
            max_pages = (result.total.max(0) as usize).div_ceil(batch_size) + PAGE_CAP_MARGIN;
        }
        let len = result.licenses.len();
        candidates.extend(result.licenses);
        if len < batch_size || page as usize >= max_pages {
            break;
        }
        page += 1;
    }

    if candidates.is_empty() {
        tracing::debug!("no internal licenses pending external push");
        return Ok(0);
    }

    let now = Utc::now();
    let mut pushed = 0;
    for batch in candidates.chunks(batch_size) {
        let records: Vec<_> = batch.iter().map(|r| to_external_record(r, now)).collect();
        let result = mirror.bulk_upsert(&records, now).await?;
        pushed += result.created + result.updated;

        let failed: HashSet<&str> = result.errors.iter().map(|e| e.identifier.as_str()).collect();
        for error in &result.errors {
            tracing::warn!(identifier = %error.identifier, error = %error.error, "reverse push rejected");
        }

        let patch = InternalLicensePatch {
            external_sync_status: Some(ExternalSyncStatus::Synced),
            last_external_sync: Some(now),
            ..Default::default()
        };
        for (license, record) in batch.iter().zip(&records) {
            if failed.contains(record.identifier().as_str()) {
                continue;
            }
            if let Err(e) = internal.update(license.id, &patch).await {
                tracing::warn!(error = %e, id = %license.id, "failed to mark license as pushed");
            }
        }
    }

    tracing::info!(pushed, candidates = candidates.len(), "internal licenses pushed to mirror");
    Ok(pushed)
}
