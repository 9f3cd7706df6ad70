use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use licensa_common::error::{ErrorClass, LicensaError, LicensaResult};
use licensa_config::SyncConfig;
use licensa_db::licenses::models::{ExternalLicenseRecord, LicenseFilters};
use licensa_db::licenses::repositories::{ExternalLicenseRepository, InternalLicenseRepository};
use serde::Serialize;

use crate::batch::{
    calculate_adaptive_concurrency, create_batches, process_batch, run_batches, BatchOutcome,
};
use crate::monitoring::{SyncMonitor, TracingMonitor};
use crate::reconcile::{
    log_reconcile_event, EventSink, ReconcileOptions, ReconcileStats, Reconciler, RecordOutcome,
};
use crate::result::{SyncErrorEntry, SyncResult};
use crate::reverse_sync::sync_internal_to_external;
use crate::source::{ApiStatus, FetchFailure, FetchOptions, LicenseSource};

/// Knobs for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOptions {
    pub batch_size: usize,
    pub concurrency_limit: usize,
    pub max_records: Option<usize>,
    pub max_pages: Option<usize>,
    pub reconcile_limit: Option<usize>,
    pub dry_run: bool,
    pub sync_to_internal_only: bool,
    /// Paginated reconciliation; `false` selects the single-query legacy path.
    pub comprehensive: bool,
    pub bidirectional: bool,
    /// Reconcile the whole mirror rather than only rows this run refreshed.
    pub force_full_sync: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: licensa_config::env::DEFAULT_BATCH_SIZE,
            concurrency_limit: licensa_config::env::DEFAULT_CONCURRENCY,
            max_records: None,
            max_pages: None,
            reconcile_limit: None,
            dry_run: false,
            sync_to_internal_only: false,
            comprehensive: true,
            bidirectional: false,
            force_full_sync: true,
        }
    }
}

impl From<&SyncConfig> for SyncOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            concurrency_limit: config.concurrency_limit,
            max_records: config.max_records,
            max_pages: config.max_pages,
            reconcile_limit: config.reconcile_limit,
            dry_run: config.dry_run,
            sync_to_internal_only: config.internal_only,
            comprehensive: config.comprehensive,
            bidirectional: config.bidirectional,
            force_full_sync: config.force_full_sync,
        }
    }
}

/// Drives one sync: fetch, mirror, reconcile, optionally push back.
///
/// `execute` never returns an error; every failure ends up in the
/// [`SyncResult`], after the recovery policy has had its turn.
pub struct LicenseSyncService<S, E, I, M = TracingMonitor> {
    source: Option<S>,
    mirror: E,
    internal: Option<I>,
    monitor: M,
    on_event: EventSink,
}

impl<S, E, I, M> LicenseSyncService<S, E, I, M>
where
    S: LicenseSource,
    E: ExternalLicenseRepository,
    I: InternalLicenseRepository,
    M: SyncMonitor,
{
    pub fn new(source: Option<S>, mirror: E, internal: Option<I>, monitor: M) -> Self {
        Self {
            source,
            mirror,
            internal,
            monitor,
            on_event: Arc::new(log_reconcile_event),
        }
    }

    pub fn with_event_sink(mut self, sink: EventSink) -> Self {
        self.on_event = sink;
        self
    }

    fn notify(&self, hook: &str, outcome: LicensaResult<()>) {
        if let Err(e) = outcome {
            tracing::warn!(hook, error = %e, "monitoring hook failed");
        }
    }

    pub async fn execute(&self, options: SyncOptions) -> SyncResult {
        let started = Instant::now();
        self.notify("sync_start", self.monitor.record_sync_start(&options));

        let mut result = SyncResult::default();
        if let Err(err) = self.run(&options, &mut result).await {
            let class = ErrorClass::of(&err);
            tracing::error!(error = %err, class = class.as_str(), "license sync failed");
            result.success = false;
            result.error = Some(err.to_string());
            self.recover(&options, class, &mut result).await;
        }

        result.duration = started.elapsed().as_millis() as u64;
        self.notify("sync_end", self.monitor.record_sync_end(&result));
        result
    }

    async fn recover(&self, options: &SyncOptions, class: ErrorClass, result: &mut SyncResult) {
        match class {
            ErrorClass::Timeout => {
                let retry_options = SyncOptions {
                    batch_size: (options.batch_size / 2).max(1),
                    force_full_sync: false,
                    ..options.clone()
                };
                tracing::warn!(
                    batch_size = retry_options.batch_size,
                    "timeout during sync, retrying once with a smaller batch"
                );

                let mut retry = SyncResult::default();
                match self.run(&retry_options, &mut retry).await {
                    Ok(()) => {
                        tracing::info!("recovery retry succeeded");
                        retry.recovery_attempted = Some(true);
                        retry.recovery_successful = Some(true);
                        *result = retry;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "recovery retry failed");
                        result.recovery_attempted = Some(true);
                        result.recovery_successful = Some(false);
                    }
                }
            }
            ErrorClass::Connection => {
                tracing::error!("connection failure, manual intervention required");
                result.recovery_attempted = Some(false);
            }
            ErrorClass::Api => {
                tracing::warn!("api failure, no automatic retry");
                result.recovery_attempted = Some(false);
            }
            ErrorClass::Unclassified => {}
        }
    }

    async fn run(&self, options: &SyncOptions, result: &mut SyncResult) -> LicensaResult<()> {
        if options.batch_size == 0 {
            return Err(LicensaError::Validation(
                "batch_size must be greater than zero".to_string(),
            ));
        }
        // Mirror writes carry this stamp; incremental reconciliation filters on it.
        let run_started_at = Utc::now();
        let mut refreshed_mirror = false;

        if options.sync_to_internal_only {
            tracing::info!("skipping external fetch, reconciling mirrored licenses only");
            if options.dry_run {
                let stats = self
                    .mirror
                    .get_license_stats_with_filters(&LicenseFilters::default())
                    .await?;
                tracing::info!(mirrored = stats.total, pending = stats.pending, "dry run, nothing written");
                result.dry_run = Some(true);
                result.success = true;
                return Ok(());
            }
        } else {
            let source = self.source.as_ref().ok_or_else(|| {
                LicensaError::Config("license API is not configured".to_string())
            })?;
            let fetch_options = FetchOptions {
                batch_size: options.batch_size,
                concurrency_limit: options.concurrency_limit,
                max_records: options.max_records,
                max_pages: options.max_pages,
            };

            let outcome = source.fetch_all(&fetch_options).await?;
            result.pages_fetched = outcome.meta.pages_fetched;

            if !outcome.success {
                let failure = outcome
                    .error
                    .unwrap_or_else(|| FetchFailure::other("license fetch failed without detail"));
                if options.dry_run {
                    tracing::warn!(kind = ?failure.kind, error = %failure.message, "dry run: license API unavailable");
                    result.dry_run = Some(true);
                    result.api_status = Some(ApiStatus::from_failure(&failure));
                    result.error = Some(failure.message);
                    return Ok(());
                }
                return Err(failure.into());
            }

            let records = outcome.data.unwrap_or_default();
            result.total_fetched = records.len();
            self.notify("fetched", self.monitor.record_data_processed("fetched", records.len()));

            if options.dry_run {
                tracing::info!(fetched = records.len(), "dry run, nothing written");
                result.dry_run = Some(true);
                result.api_status = Some(ApiStatus::healthy());
                result.success = true;
                return Ok(());
            }

            self.mirror_records(&records, options, run_started_at, result).await;
            refreshed_mirror = true;
        }

        if let Some(internal) = &self.internal {
            let filters = if refreshed_mirror && !options.force_full_sync {
                LicenseFilters {
                    updated_since: Some(run_started_at),
                    ..Default::default()
                }
            } else {
                LicenseFilters::default()
            };
            self.sync_internal(internal, options, filters, result).await?;

            if options.bidirectional {
                match sync_internal_to_external(internal, &self.mirror, options.batch_size).await {
                    Ok(pushed) => result.bidirectional_synced = Some(pushed),
                    Err(e) => {
                        tracing::warn!(error = %e, "bidirectional sync failed");
                        result.bidirectional_sync_error = Some(e.to_string());
                    }
                }
            }
        } else {
            tracing::info!("no internal store configured, skipping reconciliation");
        }

        result.success = true;
        Ok(())
    }

    async fn mirror_records(
        &self,
        records: &[ExternalLicenseRecord],
        options: &SyncOptions,
        timestamp: DateTime<Utc>,
        result: &mut SyncResult,
    ) {
        let batches = create_batches(records, options.batch_size);
        let concurrency =
            calculate_adaptive_concurrency(batches.len(), options.batch_size, options.concurrency_limit);
        tracing::info!(records = records.len(), batches = batches.len(), concurrency, "mirroring licenses");

        let mut total = BatchOutcome::default();
        for outcome in run_batches(&self.mirror, &batches, concurrency, timestamp).await {
            total.merge(outcome);
        }

        result.created += total.created;
        result.updated += total.updated;
        result.failed += total.failed;
        result.errors.extend(total.errors);
        self.notify(
            "mirrored",
            self.monitor
                .record_data_processed("mirrored", total.created + total.updated),
        );
    }

    async fn sync_internal(
        &self,
        internal: &I,
        options: &SyncOptions,
        filters: LicenseFilters,
        result: &mut SyncResult,
    ) -> LicensaResult<()> {
        let reconciler = Reconciler::new(internal).with_event_sink(self.on_event.clone());
        let reconcile_options = ReconcileOptions {
            batch_size: options.batch_size,
            limit: options.reconcile_limit,
            filters,
        };

        let mut stats = ReconcileStats::default();
        let outcome = if options.comprehensive {
            reconciler
                .reconcile_paginated(&self.mirror, &reconcile_options, &mut stats)
                .await
        } else {
            reconciler
                .reconcile_all(&self.mirror, &reconcile_options, &mut stats)
                .await
        };

        tracing::info!(
            processed = stats.processed,
            created = stats.created,
            updated = stats.updated,
            skipped = stats.skipped,
            pages = stats.pages,
            "internal reconciliation finished"
        );
        apply_reconcile_stats(result, stats);
        if let Some(processed) = result.internal_synced {
            self.notify("reconciled", self.monitor.record_data_processed("reconciled", processed));
        }
        outcome
    }

    /// Fetch, mirror and reconcile one license by appid.
    pub async fn sync_single(&self, appid: &str) -> SyncResult {
        let started = Instant::now();
        let mut result = SyncResult::default();

        if let Err(err) = self.run_single(appid, &mut result).await {
            tracing::error!(appid, error = %err, "single license sync failed");
            result.success = false;
            result.errors.push(SyncErrorEntry {
                identifier: appid.to_string(),
                error: err.to_string(),
            });
            result.error = Some(err.to_string());
        }

        result.duration = started.elapsed().as_millis() as u64;
        result
    }

    async fn run_single(&self, appid: &str, result: &mut SyncResult) -> LicensaResult<()> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| LicensaError::Config("license API is not configured".to_string()))?;

        let record = source
            .get_license_by_app_id(appid)
            .await
            .map_err(LicensaError::from)?
            .ok_or_else(|| LicensaError::NotFound(format!("license {appid}")))?;
        result.total_fetched = 1;
        result.pages_fetched = 1;

        let outcome = process_batch(&self.mirror, std::slice::from_ref(&record), Utc::now()).await;
        result.created += outcome.created;
        result.updated += outcome.updated;
        result.failed += outcome.failed;
        result.errors.extend(outcome.errors);

        if let Some(internal) = &self.internal {
            let reconciler = Reconciler::new(internal).with_event_sink(self.on_event.clone());
            let mut stats = ReconcileStats {
                processed: 1,
                ..Default::default()
            };
            match reconciler.reconcile_record(&record).await {
                RecordOutcome::Updated => stats.updated = 1,
                RecordOutcome::Created => stats.created = 1,
                RecordOutcome::Skipped { error } => {
                    stats.skipped = 1;
                    stats.errors.push(SyncErrorEntry {
                        identifier: record.identifier(),
                        error,
                    });
                }
            }
            apply_reconcile_stats(result, stats);
        }

        result.success = result.failed == 0;
        Ok(())
    }
}

fn apply_reconcile_stats(result: &mut SyncResult, stats: ReconcileStats) {
    result.internal_synced = Some(stats.processed);
    result.internal_created = Some(stats.created);
    result.internal_updated = Some(stats.updated);
    result.internal_skipped = Some(stats.skipped);
    result.errors.extend(stats.errors);
}
