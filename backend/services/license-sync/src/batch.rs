use std::collections::HashSet;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use licensa_db::licenses::models::ExternalLicenseRecord;
use licensa_db::licenses::repositories::ExternalLicenseRepository;

use crate::result::SyncErrorEntry;

const SMALL_JOB_MAX_BATCHES: usize = 3;
const SMALL_JOB_CONCURRENCY: usize = 2;
const LARGE_JOB_MIN_BATCHES: usize = 50;
const LARGE_JOB_CONCURRENCY: usize = 8;

/// Split `items` into consecutive batches of `batch_size` (last one may be shorter).
pub fn create_batches<T: Clone>(items: &[T], batch_size: usize) -> Vec<Vec<T>> {
    items.chunks(batch_size.max(1)).map(<[T]>::to_vec).collect()
}

/// Pick how many batches run at once for a job of `total_batches`.
pub fn calculate_adaptive_concurrency(
    total_batches: usize,
    batch_size: usize,
    base_concurrency: usize,
) -> usize {
    let base = base_concurrency.max(1);
    let concurrency = if total_batches <= SMALL_JOB_MAX_BATCHES {
        base.min(SMALL_JOB_CONCURRENCY)
    } else if total_batches > LARGE_JOB_MIN_BATCHES {
        (base * 2).min(LARGE_JOB_CONCURRENCY)
    } else {
        base
    };

    tracing::debug!(total_batches, batch_size, base, concurrency, "adaptive concurrency");
    concurrency
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
    pub errors: Vec<SyncErrorEntry>,
}

impl BatchOutcome {
    pub fn merge(&mut self, other: BatchOutcome) {
        self.created += other.created;
        self.updated += other.updated;
        self.failed += other.failed;
        self.errors.extend(other.errors);
    }
}

/// One bulk upsert for the batch, then mark the records that made it as synced.
///
/// A failed mark leaves the written rows `pending` in the mirror; each of them
/// gets an error entry but still counts as created or updated.
pub async fn process_batch<E>(
    store: &E,
    batch: &[ExternalLicenseRecord],
    timestamp: DateTime<Utc>,
) -> BatchOutcome
where
    E: ExternalLicenseRepository + ?Sized,
{
    let result = match store.bulk_upsert(batch, timestamp).await {
        Ok(result) => result,
        Err(e) => {
            let message = e.to_string();
            tracing::error!(error = %message, size = batch.len(), "batch upsert failed");
            return BatchOutcome {
                failed: batch.len(),
                errors: batch
                    .iter()
                    .map(|record| SyncErrorEntry {
                        identifier: record.identifier(),
                        error: message.clone(),
                    })
                    .collect(),
                ..Default::default()
            };
        }
    };

    let failed_ids: HashSet<&str> = result.errors.iter().map(|e| e.identifier.as_str()).collect();
    let succeeded: Vec<String> = batch
        .iter()
        .map(ExternalLicenseRecord::identifier)
        .filter(|id| !failed_ids.contains(id.as_str()))
        .collect();

    let mut errors: Vec<SyncErrorEntry> =
        result.errors.iter().cloned().map(SyncErrorEntry::from).collect();

    if !succeeded.is_empty() {
        if let Err(e) = store.bulk_mark_synced(&succeeded, timestamp).await {
            tracing::warn!(error = %e, count = succeeded.len(), "failed to mark batch as synced");
            let message = format!("written but not marked synced: {e}");
            errors.extend(succeeded.into_iter().map(|identifier| SyncErrorEntry {
                identifier,
                error: message.clone(),
            }));
        }
    }

    BatchOutcome {
        created: result.created,
        updated: result.updated,
        failed: result.errors.len(),
        errors,
    }
}

/// Run `batches` in chunks of `concurrency`; each chunk completes before the
/// next starts. Outcomes come back in batch order.
pub async fn run_batches<E>(
    store: &E,
    batches: &[Vec<ExternalLicenseRecord>],
    concurrency: usize,
    timestamp: DateTime<Utc>,
) -> Vec<BatchOutcome>
where
    E: ExternalLicenseRepository + ?Sized,
{
    let mut outcomes = Vec::with_capacity(batches.len());

    for (chunk_index, chunk) in batches.chunks(concurrency.max(1)).enumerate() {
        let results = join_all(chunk.iter().map(|batch| process_batch(store, batch, timestamp))).await;

        let failed: usize = results.iter().map(|o| o.failed).sum();
        tracing::debug!(chunk = chunk_index + 1, batches = chunk.len(), failed, "batch chunk complete");
        outcomes.extend(results);
    }

    outcomes
}
