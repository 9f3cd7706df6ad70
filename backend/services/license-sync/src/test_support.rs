//! In-memory collaborators for unit tests. Every write is recorded so tests
//! can assert on exactly which store calls a run made.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use licensa_common::error::{LicensaError, LicensaResult};
use licensa_db::licenses::models::{
    BulkUpsertError, BulkUpsertResult, ExternalAttributes, ExternalLicenseRecord,
    ExternalSyncStatus, InternalLicensePatch, InternalLicenseRecord, LicenseFilters, LicensePage,
    LicenseQuery, LicenseStats,
};
use licensa_db::licenses::repositories::{ExternalLicenseRepository, InternalLicenseRepository};
use serde_json::json;
use uuid::Uuid;

use crate::monitoring::SyncMonitor;
use crate::orchestrator::SyncOptions;
use crate::result::SyncResult;
use crate::source::{FetchFailure, FetchOptions, FetchOutcome, HealthStatus, LicenseSource};

pub fn external_record(n: usize) -> ExternalLicenseRecord {
    let now = Utc::now();
    ExternalLicenseRecord {
        id: Uuid::new_v4(),
        appid: Some(format!("APP-{n}")),
        countid: Some(n as i64),
        mid: Some(format!("MID-{n}")),
        email_license: Some(format!("owner{n}@example.com")),
        attributes: ExternalAttributes {
            dba: Some(json!(format!("Business {n}"))),
            zip: Some(json!("30301")),
            status: Some(json!("active")),
            plan: Some(json!("Premium")),
            seats_total: Some(json!(5)),
            seats_used: Some(json!(2)),
            last_payment: Some(json!(49.5)),
            ..Default::default()
        },
        external_sync_status: ExternalSyncStatus::Pending,
        last_synced_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn page_of<T: Clone>(items: &[T], query: &LicenseQuery) -> Vec<T> {
    let offset = query.offset() as usize;
    items
        .iter()
        .skip(offset)
        .take(query.limit as usize)
        .cloned()
        .collect()
}

fn stats_of<'a>(statuses: impl Iterator<Item = &'a ExternalSyncStatus>) -> LicenseStats {
    let mut stats = LicenseStats::default();
    for status in statuses {
        stats.total += 1;
        match status {
            ExternalSyncStatus::Synced => stats.synced += 1,
            ExternalSyncStatus::Pending => stats.pending += 1,
            ExternalSyncStatus::Failed => stats.failed += 1,
        }
    }
    stats
}

// ── external mirror ──────────────────────────────────────────

#[derive(Default)]
struct ExternalState {
    records: Vec<ExternalLicenseRecord>,
    writes: Vec<&'static str>,
    marked: Vec<String>,
    rejected: HashSet<String>,
    failing_batches: HashSet<String>,
    stats_timeouts: usize,
    offline: bool,
    failing_marks: bool,
    endless_pages: bool,
    page_requests: Vec<u32>,
}

impl ExternalState {
    fn matching(&self, filters: &LicenseFilters) -> Vec<ExternalLicenseRecord> {
        self.records
            .iter()
            .filter(|r| filters.sync_status.map_or(true, |s| r.external_sync_status == s))
            .filter(|r| filters.updated_since.map_or(true, |since| r.updated_at >= since))
            .cloned()
            .collect()
    }

    fn check_online(&self) -> LicensaResult<()> {
        if self.offline {
            return Err(LicensaError::Connection(
                "connection refused (ECONNREFUSED)".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryExternalStore {
    state: Arc<Mutex<ExternalState>>,
}

impl InMemoryExternalStore {
    pub fn seeded(records: Vec<ExternalLicenseRecord>) -> Self {
        let store = Self::default();
        store.state.lock().unwrap().records = records;
        store
    }

    /// Per-record failure reported in the bulk result.
    pub fn reject_identifier(&self, identifier: &str) {
        self.state.lock().unwrap().rejected.insert(identifier.to_string());
    }

    /// Whole-call failure for any batch containing `identifier`.
    pub fn fail_batches_containing(&self, identifier: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_batches
            .insert(identifier.to_string());
    }

    /// The next `count` stats queries time out.
    pub fn time_out_stats(&self, count: usize) {
        self.state.lock().unwrap().stats_timeouts = count;
    }

    pub fn go_offline(&self) {
        self.state.lock().unwrap().offline = true;
    }

    /// `bulk_mark_synced` fails while upserts keep working.
    pub fn fail_marks(&self) {
        self.state.lock().unwrap().failing_marks = true;
    }

    /// Every page request returns a full page, ignoring the offset.
    pub fn serve_endless_pages(&self) {
        self.state.lock().unwrap().endless_pages = true;
    }

    pub fn writes(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn marked_synced(&self) -> Vec<String> {
        self.state.lock().unwrap().marked.clone()
    }

    pub fn page_requests(&self) -> Vec<u32> {
        self.state.lock().unwrap().page_requests.clone()
    }

    pub fn records(&self) -> Vec<ExternalLicenseRecord> {
        self.state.lock().unwrap().records.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().records.len()
    }
}

#[async_trait]
impl ExternalLicenseRepository for InMemoryExternalStore {
    async fn find_by_app_id(&self, appid: &str) -> LicensaResult<Option<ExternalLicenseRecord>> {
        let state = self.state.lock().unwrap();
        state.check_online()?;
        Ok(state
            .records
            .iter()
            .find(|r| r.appid.as_deref() == Some(appid))
            .cloned())
    }

    async fn find_by_count_id(&self, countid: i64) -> LicensaResult<Option<ExternalLicenseRecord>> {
        let state = self.state.lock().unwrap();
        state.check_online()?;
        Ok(state.records.iter().find(|r| r.countid == Some(countid)).cloned())
    }

    async fn find_licenses(
        &self,
        query: &LicenseQuery,
    ) -> LicensaResult<LicensePage<ExternalLicenseRecord>> {
        let mut state = self.state.lock().unwrap();
        state.check_online()?;
        state.page_requests.push(query.page);

        let matching = state.matching(&query.filters);
        let licenses = if state.endless_pages {
            matching.iter().take(query.limit as usize).cloned().collect()
        } else {
            page_of(&matching, query)
        };
        Ok(LicensePage {
            licenses,
            total: matching.len() as i64,
        })
    }

    async fn bulk_upsert(
        &self,
        records: &[ExternalLicenseRecord],
        timestamp: DateTime<Utc>,
    ) -> LicensaResult<BulkUpsertResult> {
        let mut state = self.state.lock().unwrap();
        state.writes.push("bulk_upsert");
        state.check_online()?;

        if records
            .iter()
            .any(|r| state.failing_batches.contains(&r.identifier()))
        {
            return Err(LicensaError::Database("bulk upsert rejected".to_string()));
        }

        let mut result = BulkUpsertResult::default();
        for record in records {
            let identifier = record.identifier();
            if state.rejected.contains(&identifier) {
                result.errors.push(BulkUpsertError {
                    identifier,
                    error: "constraint violation".to_string(),
                });
                continue;
            }

            let existing = state.records.iter_mut().find(|r| match &record.appid {
                Some(appid) => r.appid.as_ref() == Some(appid),
                None => r.appid.is_none() && r.countid.is_some() && r.countid == record.countid,
            });
            let mut incoming = record.clone();
            incoming.updated_at = timestamp;
            match existing {
                Some(row) => {
                    incoming.id = row.id;
                    incoming.created_at = row.created_at;
                    *row = incoming;
                    result.updated += 1;
                }
                None => {
                    state.records.push(incoming);
                    result.created += 1;
                }
            }
        }
        Ok(result)
    }

    async fn bulk_mark_synced(
        &self,
        identifiers: &[String],
        timestamp: DateTime<Utc>,
    ) -> LicensaResult<u64> {
        let mut state = self.state.lock().unwrap();
        state.writes.push("bulk_mark_synced");
        state.check_online()?;
        if state.failing_marks {
            return Err(LicensaError::Database("mark synced rejected".to_string()));
        }
        state.marked.extend(identifiers.iter().cloned());

        let wanted: HashSet<&String> = identifiers.iter().collect();
        let mut count = 0;
        for row in state.records.iter_mut() {
            if wanted.contains(&row.identifier()) {
                row.external_sync_status = ExternalSyncStatus::Synced;
                row.last_synced_at = Some(timestamp);
                row.updated_at = timestamp;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn get_license_stats_with_filters(
        &self,
        filters: &LicenseFilters,
    ) -> LicensaResult<LicenseStats> {
        let mut state = self.state.lock().unwrap();
        if state.stats_timeouts > 0 {
            state.stats_timeouts -= 1;
            return Err(LicensaError::Timeout(
                "license stats timeout after 30000ms".to_string(),
            ));
        }
        state.check_online()?;
        let matching = state.matching(filters);
        Ok(stats_of(matching.iter().map(|r| &r.external_sync_status)))
    }
}

// ── internal store ───────────────────────────────────────────

#[derive(Default)]
struct InternalState {
    records: Vec<InternalLicenseRecord>,
    writes: Vec<&'static str>,
    fail_updates: bool,
    fail_saves: usize,
    fail_lookups: bool,
}

#[derive(Clone, Default)]
pub struct InMemoryInternalStore {
    state: Arc<Mutex<InternalState>>,
}

impl InMemoryInternalStore {
    pub fn seed(&self, record: InternalLicenseRecord) {
        self.state.lock().unwrap().records.push(record);
    }

    pub fn fail_updates(&self) {
        self.state.lock().unwrap().fail_updates = true;
    }

    /// The next `count` inserts fail.
    pub fn fail_saves(&self, count: usize) {
        self.state.lock().unwrap().fail_saves = count;
    }

    pub fn fail_lookups(&self) {
        self.state.lock().unwrap().fail_lookups = true;
    }

    pub fn writes(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn records(&self) -> Vec<InternalLicenseRecord> {
        self.state.lock().unwrap().records.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().records.len()
    }
}

#[async_trait]
impl InternalLicenseRepository for InMemoryInternalStore {
    async fn find_by_app_id(&self, appid: &str) -> LicensaResult<Option<InternalLicenseRecord>> {
        let state = self.state.lock().unwrap();
        if state.fail_lookups {
            return Err(LicensaError::Database("appid lookup failed".to_string()));
        }
        Ok(state
            .records
            .iter()
            .find(|r| r.appid.as_deref() == Some(appid))
            .cloned())
    }

    async fn find_by_count_id(&self, countid: i64) -> LicensaResult<Option<InternalLicenseRecord>> {
        let state = self.state.lock().unwrap();
        if state.fail_lookups {
            return Err(LicensaError::Database("countid lookup failed".to_string()));
        }
        Ok(state.records.iter().find(|r| r.countid == Some(countid)).cloned())
    }

    async fn find_licenses(
        &self,
        query: &LicenseQuery,
    ) -> LicensaResult<LicensePage<InternalLicenseRecord>> {
        let state = self.state.lock().unwrap();
        let filters = &query.filters;
        let matching: Vec<InternalLicenseRecord> = state
            .records
            .iter()
            .filter(|r| filters.sync_status.map_or(true, |s| r.external_sync_status == s))
            .filter(|r| filters.updated_since.map_or(true, |since| r.updated_at >= since))
            .filter(|r| !filters.pending_external_push || (r.appid.is_some() && r.needs_external_push()))
            .cloned()
            .collect();
        Ok(LicensePage {
            licenses: page_of(&matching, query),
            total: matching.len() as i64,
        })
    }

    async fn update(
        &self,
        id: Uuid,
        patch: &InternalLicensePatch,
    ) -> LicensaResult<InternalLicenseRecord> {
        let mut state = self.state.lock().unwrap();
        state.writes.push("update");
        if state.fail_updates {
            return Err(LicensaError::Database("update rejected".to_string()));
        }
        let row = state
            .records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| LicensaError::NotFound(format!("license {id}")))?;
        row.apply_patch(patch);
        Ok(row.clone())
    }

    async fn save(&self, record: InternalLicenseRecord) -> LicensaResult<InternalLicenseRecord> {
        let mut state = self.state.lock().unwrap();
        state.writes.push("save");
        if state.fail_saves > 0 {
            state.fail_saves -= 1;
            return Err(LicensaError::Database("insert rejected".to_string()));
        }
        state.records.push(record.clone());
        Ok(record)
    }

    async fn get_license_stats_with_filters(
        &self,
        filters: &LicenseFilters,
    ) -> LicensaResult<LicenseStats> {
        let state = self.state.lock().unwrap();
        Ok(stats_of(
            state
                .records
                .iter()
                .filter(|r| filters.sync_status.map_or(true, |s| r.external_sync_status == s))
                .map(|r| &r.external_sync_status),
        ))
    }
}

// ── source & monitor ─────────────────────────────────────────

#[derive(Clone, Default)]
pub struct FakeSource {
    records: Vec<ExternalLicenseRecord>,
    failure: Option<FetchFailure>,
    calls: Arc<Mutex<Vec<FetchOptions>>>,
}

impl FakeSource {
    pub fn with_records(records: Vec<ExternalLicenseRecord>) -> Self {
        Self {
            records,
            ..Default::default()
        }
    }

    pub fn failing(failure: FetchFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Default::default()
        }
    }

    pub fn fetch_calls(&self) -> Vec<FetchOptions> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LicenseSource for FakeSource {
    async fn fetch_all(&self, options: &FetchOptions) -> LicensaResult<FetchOutcome> {
        self.calls.lock().unwrap().push(*options);
        if let Some(failure) = &self.failure {
            return Ok(FetchOutcome::failed(failure.clone(), 0));
        }
        let mut data = self.records.clone();
        if let Some(max) = options.max_records {
            data.truncate(max);
        }
        let pages = data.len().div_ceil(options.batch_size.max(1)).max(1);
        Ok(FetchOutcome::ok(data, pages))
    }

    async fn get_license_by_app_id(
        &self,
        appid: &str,
    ) -> Result<Option<ExternalLicenseRecord>, FetchFailure> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        Ok(self
            .records
            .iter()
            .find(|r| r.appid.as_deref() == Some(appid))
            .cloned())
    }

    async fn health_check(&self) -> HealthStatus {
        HealthStatus {
            healthy: self.failure.is_none(),
            timestamp: Utc::now(),
            error: self.failure.as_ref().map(|f| f.message.clone()),
        }
    }
}

#[derive(Clone, Default)]
pub struct RecordingMonitor {
    events: Arc<Mutex<Vec<String>>>,
    broken: bool,
}

impl RecordingMonitor {
    /// Records events but reports an error for each one.
    pub fn broken() -> Self {
        Self {
            broken: true,
            ..Default::default()
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: String) -> LicensaResult<()> {
        self.events.lock().unwrap().push(event);
        if self.broken {
            return Err(LicensaError::Internal("monitor offline".to_string()));
        }
        Ok(())
    }
}

impl SyncMonitor for RecordingMonitor {
    fn record_sync_start(&self, options: &SyncOptions) -> LicensaResult<()> {
        self.push(format!("start:batch={}", options.batch_size))
    }

    fn record_sync_end(&self, result: &SyncResult) -> LicensaResult<()> {
        self.push(format!("end:success={}", result.success))
    }

    fn record_data_processed(&self, stage: &str, count: usize) -> LicensaResult<()> {
        self.push(format!("{stage}:{count}"))
    }
}
