use licensa_common::error::LicensaResult;

use crate::orchestrator::SyncOptions;
use crate::result::SyncResult;

/// Receiver of sync lifecycle events. Errors are logged by the caller and
/// otherwise ignored.
pub trait SyncMonitor: Send + Sync {
    fn record_sync_start(&self, options: &SyncOptions) -> LicensaResult<()>;
    fn record_sync_end(&self, result: &SyncResult) -> LicensaResult<()>;
    fn record_data_processed(&self, stage: &str, count: usize) -> LicensaResult<()>;
}

/// Emits lifecycle events as structured log lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMonitor;

impl SyncMonitor for TracingMonitor {
    fn record_sync_start(&self, options: &SyncOptions) -> LicensaResult<()> {
        tracing::info!(
            target: "licensa::monitoring",
            batch_size = options.batch_size,
            concurrency = options.concurrency_limit,
            dry_run = options.dry_run,
            internal_only = options.sync_to_internal_only,
            comprehensive = options.comprehensive,
            bidirectional = options.bidirectional,
            "license sync started"
        );
        Ok(())
    }

    fn record_sync_end(&self, result: &SyncResult) -> LicensaResult<()> {
        tracing::info!(
            target: "licensa::monitoring",
            success = result.success,
            fetched = result.total_fetched,
            created = result.created,
            updated = result.updated,
            failed = result.failed,
            internal_synced = result.internal_synced.unwrap_or(0),
            duration_ms = result.duration,
            "license sync finished"
        );
        Ok(())
    }

    fn record_data_processed(&self, stage: &str, count: usize) -> LicensaResult<()> {
        tracing::debug!(target: "licensa::monitoring", stage, count, "license data processed");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMonitor;

impl SyncMonitor for NoopMonitor {
    fn record_sync_start(&self, _options: &SyncOptions) -> LicensaResult<()> {
        Ok(())
    }

    fn record_sync_end(&self, _result: &SyncResult) -> LicensaResult<()> {
        Ok(())
    }

    fn record_data_processed(&self, _stage: &str, _count: usize) -> LicensaResult<()> {
        Ok(())
    }
}
