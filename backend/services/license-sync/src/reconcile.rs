use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use licensa_common::error::LicensaResult;
use licensa_db::licenses::models::{
    ExternalLicenseRecord, InternalLicenseRecord, LicenseFilters, LicenseQuery,
};
use licensa_db::licenses::repositories::{ExternalLicenseRepository, InternalLicenseRepository};
use licensa_normalize::{build_update_patch, fallback_transform, transform_robustly};
use uuid::Uuid;

use crate::result::SyncErrorEntry;

/// Extra pages allowed beyond `ceil(total / batch_size)` before the loop is cut.
pub const PAGE_CAP_MARGIN: usize = 10;
const SNAPSHOT_MAX_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Updated,
    Created,
    Skipped { error: String },
}

/// Everything the engine has to say about a run. Rendered by an [`EventSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileEvent {
    LookupFailed {
        identifier: String,
        key: &'static str,
        error: String,
    },
    Updated {
        identifier: String,
        id: Uuid,
    },
    UpdateFailed {
        identifier: String,
        id: Uuid,
        error: String,
    },
    Created {
        identifier: String,
        id: Uuid,
        fallback: Option<String>,
    },
    Skipped {
        identifier: String,
        error: String,
        snapshot: String,
    },
    PageProcessed {
        page: u32,
        records: usize,
        duplicate_appids: usize,
        duplicate_countids: usize,
    },
    PageCapReached {
        max_pages: usize,
        total: usize,
    },
    LimitReached {
        limit: usize,
    },
}

pub type EventSink = Arc<dyn Fn(&ReconcileEvent) + Send + Sync>;

/// Default sink: structured tracing output.
pub fn log_reconcile_event(event: &ReconcileEvent) {
    match event {
        ReconcileEvent::LookupFailed { identifier, key, error } => {
            tracing::debug!(%identifier, key, %error, "license lookup failed, trying next key");
        }
        ReconcileEvent::Updated { identifier, id } => {
            tracing::debug!(%identifier, %id, "internal license updated");
        }
        ReconcileEvent::UpdateFailed { identifier, id, error } => {
            tracing::warn!(%identifier, %id, %error, "update failed, creating instead");
        }
        ReconcileEvent::Created { identifier, id, fallback } => match fallback {
            Some(reason) => {
                tracing::warn!(%identifier, %id, %reason, "internal license created from fallback transform")
            }
            None => tracing::debug!(%identifier, %id, "internal license created"),
        },
        ReconcileEvent::Skipped { identifier, error, snapshot } => {
            tracing::error!(%identifier, %error, %snapshot, "license skipped");
        }
        ReconcileEvent::PageProcessed {
            page,
            records,
            duplicate_appids,
            duplicate_countids,
        } => {
            tracing::info!(page, records, duplicate_appids, duplicate_countids, "reconciled page");
        }
        ReconcileEvent::PageCapReached { max_pages, total } => {
            tracing::warn!(max_pages, total, "page cap reached, stopping reconciliation");
        }
        ReconcileEvent::LimitReached { limit } => {
            tracing::info!(limit, "reconcile limit reached");
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub processed: usize,
    pub updated: usize,
    pub created: usize,
    pub skipped: usize,
    pub pages: usize,
    pub errors: Vec<SyncErrorEntry>,
    pub page_cap_reached: bool,
}

impl ReconcileStats {
    fn record(&mut self, identifier: String, outcome: RecordOutcome) {
        self.processed += 1;
        match outcome {
            RecordOutcome::Updated => self.updated += 1,
            RecordOutcome::Created => self.created += 1,
            RecordOutcome::Skipped { error } => {
                self.skipped += 1;
                self.errors.push(SyncErrorEntry { identifier, error });
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub batch_size: usize,
    /// Stop after this many records.
    pub limit: Option<usize>,
    pub filters: LicenseFilters,
}

/// Brings mirrored records into the internal store: update when a match is
/// found by appid or countid, create otherwise.
pub struct Reconciler<'a, I: ?Sized> {
    internal: &'a I,
    on_event: EventSink,
}

impl<'a, I> Reconciler<'a, I>
where
    I: InternalLicenseRepository + ?Sized,
{
    pub fn new(internal: &'a I) -> Self {
        Self {
            internal,
            on_event: Arc::new(log_reconcile_event),
        }
    }

    pub fn with_event_sink(mut self, sink: EventSink) -> Self {
        self.on_event = sink;
        self
    }

    fn emit(&self, event: ReconcileEvent) {
        (self.on_event)(&event);
    }

    async fn find_match(
        &self,
        record: &ExternalLicenseRecord,
        identifier: &str,
    ) -> Option<InternalLicenseRecord> {
        if let Some(appid) = record.appid.as_deref().filter(|a| !a.is_empty()) {
            match self.internal.find_by_app_id(appid).await {
                Ok(Some(found)) => return Some(found),
                Ok(None) => {}
                Err(e) => self.emit(ReconcileEvent::LookupFailed {
                    identifier: identifier.to_string(),
                    key: "appid",
                    error: e.to_string(),
                }),
            }
        }

        if let Some(countid) = record.countid {
            match self.internal.find_by_count_id(countid).await {
                Ok(found) => return found,
                Err(e) => self.emit(ReconcileEvent::LookupFailed {
                    identifier: identifier.to_string(),
                    key: "countid",
                    error: e.to_string(),
                }),
            }
        }

        None
    }

    /// Reconcile one record. Never fails: a record that can be neither
    /// updated nor created comes back as `Skipped`.
    pub async fn reconcile_record(&self, record: &ExternalLicenseRecord) -> RecordOutcome {
        let now = Utc::now();
        let identifier = record.identifier();

        if let Some(existing) = self.find_match(record, &identifier).await {
            let patch = build_update_patch(record, now);
            match self.internal.update(existing.id, &patch).await {
                Ok(updated) => {
                    self.emit(ReconcileEvent::Updated {
                        identifier,
                        id: updated.id,
                    });
                    return RecordOutcome::Updated;
                }
                // a duplicate beats a lost record
                Err(e) => self.emit(ReconcileEvent::UpdateFailed {
                    identifier: identifier.clone(),
                    id: existing.id,
                    error: e.to_string(),
                }),
            }
        }

        let transformed = transform_robustly(record, now);
        let mut fallback = transformed.fallback_reason.map(|reason| reason.to_string());

        let mut saved = self.internal.save(transformed.record).await;
        if saved.is_err() && fallback.is_none() {
            saved = self.internal.save(fallback_transform(record, now)).await;
            fallback = Some("insert of full record failed".to_string());
        }

        match saved {
            Ok(created) => {
                self.emit(ReconcileEvent::Created {
                    identifier,
                    id: created.id,
                    fallback,
                });
                RecordOutcome::Created
            }
            Err(e) => {
                let error = e.to_string();
                self.emit(ReconcileEvent::Skipped {
                    identifier,
                    error: error.clone(),
                    snapshot: snapshot(record),
                });
                RecordOutcome::Skipped { error }
            }
        }
    }

    async fn reconcile_page(
        &self,
        records: &[ExternalLicenseRecord],
        limit: Option<usize>,
        stats: &mut ReconcileStats,
    ) -> bool {
        for record in records {
            if limit.is_some_and(|limit| stats.processed >= limit) {
                return false;
            }
            let outcome = self.reconcile_record(record).await;
            stats.record(record.identifier(), outcome);
        }
        true
    }

    /// Walk the mirror page by page, strictly in order.
    ///
    /// Counts accumulate into `stats` so a store failure part-way keeps what
    /// was already reconciled.
    pub async fn reconcile_paginated<E>(
        &self,
        mirror: &E,
        options: &ReconcileOptions,
        stats: &mut ReconcileStats,
    ) -> LicensaResult<()>
    where
        E: ExternalLicenseRepository + ?Sized,
    {
        let batch_size = options.batch_size.max(1);
        let total = mirror
            .get_license_stats_with_filters(&options.filters)
            .await?
            .total
            .max(0) as usize;
        let max_pages = total.div_ceil(batch_size) + PAGE_CAP_MARGIN;

        tracing::info!(total, batch_size, max_pages, "starting paginated reconciliation");

        let mut page: u32 = 1;
        let mut pages_visited = 0;
        loop {
            if let Some(limit) = options.limit {
                if stats.processed >= limit {
                    self.emit(ReconcileEvent::LimitReached { limit });
                    break;
                }
            }
            if pages_visited >= max_pages {
                stats.page_cap_reached = true;
                self.emit(ReconcileEvent::PageCapReached { max_pages, total });
                break;
            }

            let query = LicenseQuery::page(page, batch_size as u32, options.filters.clone());
            let result = mirror.find_licenses(&query).await?;
            pages_visited += 1;
            stats.pages += 1;

            if result.licenses.is_empty() {
                break;
            }
            let has_more = result.licenses.len() >= batch_size;

            let (duplicate_appids, duplicate_countids) = duplicate_keys(&result.licenses);
            let finished_page = self
                .reconcile_page(&result.licenses, options.limit, stats)
                .await;
            self.emit(ReconcileEvent::PageProcessed {
                page,
                records: result.licenses.len(),
                duplicate_appids,
                duplicate_countids,
            });

            if !finished_page {
                if let Some(limit) = options.limit {
                    self.emit(ReconcileEvent::LimitReached { limit });
                }
                break;
            }
            if !has_more {
                break;
            }
            page += 1;
        }

        Ok(())
    }

    /// Load the whole mirror in one query and reconcile it.
    pub async fn reconcile_all<E>(
        &self,
        mirror: &E,
        options: &ReconcileOptions,
        stats: &mut ReconcileStats,
    ) -> LicensaResult<()>
    where
        E: ExternalLicenseRepository + ?Sized,
    {
        let total = mirror
            .get_license_stats_with_filters(&options.filters)
            .await?
            .total
            .max(0);
        let limit = u32::try_from(total).unwrap_or(u32::MAX).max(1);

        let result = mirror
            .find_licenses(&LicenseQuery::page(1, limit, options.filters.clone()))
            .await?;
        stats.pages += 1;

        tracing::info!(records = result.licenses.len(), "starting full reconciliation");
        if !self
            .reconcile_page(&result.licenses, options.limit, stats)
            .await
        {
            if let Some(limit) = options.limit {
                self.emit(ReconcileEvent::LimitReached { limit });
            }
        }
        Ok(())
    }
}

/// How many appids / countids occur more than once in a page.
fn duplicate_keys(records: &[ExternalLicenseRecord]) -> (usize, usize) {
    let mut appids: HashMap<&str, usize> = HashMap::new();
    let mut countids: HashMap<i64, usize> = HashMap::new();
    for record in records {
        if let Some(appid) = record.appid.as_deref() {
            *appids.entry(appid).or_default() += 1;
        }
        if let Some(countid) = record.countid {
            *countids.entry(countid).or_default() += 1;
        }
    }
    (
        appids.values().filter(|&&n| n > 1).count(),
        countids.values().filter(|&&n| n > 1).count(),
    )
}

fn snapshot(record: &ExternalLicenseRecord) -> String {
    let json = serde_json::to_string(record).unwrap_or_else(|e| format!("<unserializable: {e}>"));
    json.chars().take(SNAPSHOT_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{external_record, InMemoryExternalStore, InMemoryInternalStore};
    use licensa_db::licenses::models::{ExternalSyncStatus, LicenseStatus};
    use licensa_normalize::transform_full;
    use std::sync::Mutex;

    fn recording_sink() -> (EventSink, Arc<Mutex<Vec<ReconcileEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let captured = events.clone();
        let sink: EventSink = Arc::new(move |event: &ReconcileEvent| {
            captured.lock().unwrap().push(event.clone());
        });
        (sink, events)
    }

    fn options(batch_size: usize) -> ReconcileOptions {
        ReconcileOptions {
            batch_size,
            limit: None,
            filters: LicenseFilters::default(),
        }
    }

    #[tokio::test]
    async fn unmatched_record_is_created() {
        let internal = InMemoryInternalStore::default();
        let outcome = Reconciler::new(&internal)
            .reconcile_record(&external_record(1))
            .await;

        assert_eq!(outcome, RecordOutcome::Created);
        let rows = internal.records();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].appid.as_deref(), Some("APP-1"));
        assert_eq!(rows[0].countid, Some(1));
        assert_eq!(rows[0].mid.as_deref(), Some("MID-1"));
        assert_eq!(rows[0].external_sync_status, ExternalSyncStatus::Synced);
    }

    #[tokio::test]
    async fn second_pass_updates_instead_of_duplicating() {
        let internal = InMemoryInternalStore::default();
        let reconciler = Reconciler::new(&internal);
        let record = external_record(1);

        assert_eq!(reconciler.reconcile_record(&record).await, RecordOutcome::Created);
        assert_eq!(reconciler.reconcile_record(&record).await, RecordOutcome::Updated);
        assert_eq!(internal.len(), 1);
    }

    #[tokio::test]
    async fn countid_match_used_when_appid_missing() {
        let internal = InMemoryInternalStore::default();
        let mut existing = transform_full(&external_record(7), Utc::now()).unwrap();
        existing.appid = None;
        internal.seed(existing.clone());

        let mut record = external_record(7);
        record.appid = None;
        record.attributes.status = Some(serde_json::json!("cancelled"));

        let outcome = Reconciler::new(&internal).reconcile_record(&record).await;
        assert_eq!(outcome, RecordOutcome::Updated);
        let rows = internal.records();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, existing.id);
        assert_eq!(rows[0].status, LicenseStatus::Cancel);
    }

    #[tokio::test]
    async fn failing_lookup_falls_through_to_create() {
        let internal = InMemoryInternalStore::default();
        internal.fail_lookups();
        let (sink, events) = recording_sink();

        let outcome = Reconciler::new(&internal)
            .with_event_sink(sink)
            .reconcile_record(&external_record(3))
            .await;

        assert_eq!(outcome, RecordOutcome::Created);
        let events = events.lock().unwrap();
        let keys: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ReconcileEvent::LookupFailed { key, .. } => Some(*key),
                _ => None,
            })
            .collect();
        assert_eq!(keys, vec!["appid", "countid"]);
    }

    #[tokio::test]
    async fn update_failure_falls_through_to_create() {
        let internal = InMemoryInternalStore::default();
        internal.seed(transform_full(&external_record(1), Utc::now()).unwrap());
        internal.fail_updates();
        let (sink, events) = recording_sink();

        let outcome = Reconciler::new(&internal)
            .with_event_sink(sink)
            .reconcile_record(&external_record(1))
            .await;

        assert_eq!(outcome, RecordOutcome::Created);
        assert_eq!(internal.writes(), vec!["update", "save"]);
        assert_eq!(internal.len(), 2);
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, ReconcileEvent::UpdateFailed { .. })));
    }

    #[tokio::test]
    async fn failed_insert_retries_with_fallback_record() {
        let internal = InMemoryInternalStore::default();
        internal.fail_saves(1);
        let (sink, events) = recording_sink();

        let outcome = Reconciler::new(&internal)
            .with_event_sink(sink)
            .reconcile_record(&external_record(4))
            .await;

        assert_eq!(outcome, RecordOutcome::Created);
        assert_eq!(internal.writes(), vec!["save", "save"]);
        assert!(events.lock().unwrap().iter().any(|e| matches!(
            e,
            ReconcileEvent::Created { fallback: Some(_), .. }
        )));
    }

    #[tokio::test]
    async fn persistent_insert_failure_is_skipped_with_snapshot() {
        let internal = InMemoryInternalStore::default();
        internal.fail_saves(usize::MAX);
        let (sink, events) = recording_sink();

        let mut record = external_record(5);
        record.attributes.notes = Some(serde_json::json!("x".repeat(2_000)));
        let outcome = Reconciler::new(&internal)
            .with_event_sink(sink)
            .reconcile_record(&record)
            .await;

        assert!(matches!(outcome, RecordOutcome::Skipped { .. }));
        let events = events.lock().unwrap();
        let snapshot = events
            .iter()
            .find_map(|e| match e {
                ReconcileEvent::Skipped { snapshot, .. } => Some(snapshot.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(snapshot.chars().count(), SNAPSHOT_MAX_CHARS);
        assert!(snapshot.contains("APP-5"));
    }

    #[tokio::test]
    async fn paginated_reconciles_every_page_in_order() {
        let mirror = InMemoryExternalStore::seeded((1..=25).map(external_record).collect());
        let internal = InMemoryInternalStore::default();
        let mut stats = ReconcileStats::default();

        Reconciler::new(&internal)
            .reconcile_paginated(&mirror, &options(10), &mut stats)
            .await
            .unwrap();

        assert_eq!(stats.processed, 25);
        assert_eq!(stats.created, 25);
        assert_eq!(stats.pages, 3);
        assert_eq!(mirror.page_requests(), vec![1, 2, 3]);
        assert!(!stats.page_cap_reached);
        assert_eq!(internal.len(), 25);
    }

    #[tokio::test]
    async fn paginated_run_is_idempotent() {
        let mirror = InMemoryExternalStore::seeded((1..=12).map(external_record).collect());
        let internal = InMemoryInternalStore::default();
        let reconciler = Reconciler::new(&internal);

        let mut first = ReconcileStats::default();
        reconciler
            .reconcile_paginated(&mirror, &options(5), &mut first)
            .await
            .unwrap();
        let mut second = ReconcileStats::default();
        reconciler
            .reconcile_paginated(&mirror, &options(5), &mut second)
            .await
            .unwrap();

        assert_eq!(first.created, 12);
        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 12);
        assert_eq!(internal.len(), 12);
    }

    #[tokio::test]
    async fn exact_multiple_stops_on_empty_page() {
        let mirror = InMemoryExternalStore::seeded((1..=20).map(external_record).collect());
        let internal = InMemoryInternalStore::default();
        let mut stats = ReconcileStats::default();

        Reconciler::new(&internal)
            .reconcile_paginated(&mirror, &options(10), &mut stats)
            .await
            .unwrap();

        assert_eq!(stats.processed, 20);
        assert_eq!(mirror.page_requests(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn page_cap_stops_runaway_pagination() {
        let mirror = InMemoryExternalStore::seeded((1..=25).map(external_record).collect());
        mirror.serve_endless_pages();
        let internal = InMemoryInternalStore::default();
        let (sink, events) = recording_sink();
        let mut stats = ReconcileStats::default();

        Reconciler::new(&internal)
            .with_event_sink(sink)
            .reconcile_paginated(&mirror, &options(10), &mut stats)
            .await
            .unwrap();

        // ceil(25 / 10) + 10
        assert_eq!(stats.pages, 13);
        assert!(stats.page_cap_reached);
        assert!(events.lock().unwrap().iter().any(|e| matches!(
            e,
            ReconcileEvent::PageCapReached { max_pages: 13, total: 25 }
        )));
        assert_eq!(internal.len(), 10);
    }

    #[tokio::test]
    async fn limit_caps_processed_records() {
        let mirror = InMemoryExternalStore::seeded((1..=30).map(external_record).collect());
        let internal = InMemoryInternalStore::default();
        let mut stats = ReconcileStats::default();
        let mut opts = options(10);
        opts.limit = Some(15);

        Reconciler::new(&internal)
            .reconcile_paginated(&mirror, &opts, &mut stats)
            .await
            .unwrap();

        assert_eq!(stats.processed, 15);
        assert_eq!(internal.len(), 15);
        assert_eq!(mirror.page_requests(), vec![1, 2]);
    }

    #[tokio::test]
    async fn store_failure_keeps_partial_counts() {
        let mirror = InMemoryExternalStore::seeded((1..=5).map(external_record).collect());
        mirror.go_offline();
        let internal = InMemoryInternalStore::default();
        let mut stats = ReconcileStats::default();

        let err = Reconciler::new(&internal)
            .reconcile_paginated(&mirror, &options(10), &mut stats)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("ECONNREFUSED"));
        assert_eq!(stats.processed, 0);
    }

    #[tokio::test]
    async fn legacy_path_reconciles_everything_in_one_query() {
        let mirror = InMemoryExternalStore::seeded((1..=25).map(external_record).collect());
        let internal = InMemoryInternalStore::default();
        let mut stats = ReconcileStats::default();

        Reconciler::new(&internal)
            .reconcile_all(&mirror, &options(10), &mut stats)
            .await
            .unwrap();

        assert_eq!(stats.created, 25);
        assert_eq!(stats.pages, 1);
        assert_eq!(mirror.page_requests(), vec![1]);
    }

    #[test]
    fn duplicate_keys_counts_repeated_identifiers() {
        let mut a = external_record(1);
        let b = external_record(1);
        a.countid = Some(99);
        let c = external_record(2);
        assert_eq!(duplicate_keys(&[a, b, c]), (1, 0));
    }
}
