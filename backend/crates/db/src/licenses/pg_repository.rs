use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::licenses::models::{
    BulkUpsertError, BulkUpsertResult, ExternalAttributes, ExternalLicenseRecord,
    ExternalSyncStatus, InternalLicensePatch, InternalLicenseRecord, LicenseFilters, LicensePage,
    LicenseQuery, LicenseStats, LicenseStatus,
};
use crate::licenses::repositories::{ExternalLicenseRepository, InternalLicenseRepository};
use crate::{map_sqlx_error, run_with_timeout};
use licensa_common::error::{LicensaError, LicensaResult};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const EXTERNAL_COLUMNS: &str = "id, appid, countid, mid, email_license, attributes, \
     external_sync_status, last_synced_at, created_at, updated_at";

const INTERNAL_COLUMNS: &str = "id, key, appid, countid, mid, email_license, product, dba, zip, \
     status, plan, term, last_payment, sms_balance, seats_total, seats_used, agents_name, notes, \
     starts_at, last_active, cancel_date, external_sync_status, last_external_sync, created_at, updated_at";

fn parse_sync_status(row: &PgRow) -> LicensaResult<ExternalSyncStatus> {
    let raw: String = row.get("external_sync_status");
    ExternalSyncStatus::from_str(&raw).map_err(LicensaError::Internal)
}

fn push_common_filters(qb: &mut QueryBuilder<'_, Postgres>, filters: &LicenseFilters) {
    qb.push(" where true");
    if let Some(status) = filters.sync_status {
        qb.push(" and external_sync_status = ")
            .push_bind(status.as_str());
    }
    if let Some(since) = filters.updated_since {
        qb.push(" and updated_at >= ").push_bind(since);
    }
}

fn push_stats_select(qb: &mut QueryBuilder<'_, Postgres>) {
    qb.push(
        "select count(*) as total, \
         count(*) filter (where external_sync_status = 'synced') as synced, \
         count(*) filter (where external_sync_status = 'pending') as pending, \
         count(*) filter (where external_sync_status = 'failed') as failed",
    );
}

fn map_stats_row(row: PgRow) -> LicenseStats {
    LicenseStats {
        total: row.get("total"),
        synced: row.get("synced"),
        pending: row.get("pending"),
        failed: row.get("failed"),
    }
}

// ── External mirror ─────────────────────────────────────────────

#[derive(Clone)]
pub struct PgExternalLicenseRepository {
    pool: PgPool,
    timeout: Duration,
}

impl PgExternalLicenseRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn map_row(row: PgRow) -> LicensaResult<ExternalLicenseRecord> {
        let external_sync_status = parse_sync_status(&row)?;
        let attributes: Json<ExternalAttributes> = row.get("attributes");

        Ok(ExternalLicenseRecord {
            id: row.get("id"),
            appid: row.get("appid"),
            countid: row.get("countid"),
            mid: row.get("mid"),
            email_license: row.get("email_license"),
            attributes: attributes.0,
            external_sync_status,
            last_synced_at: row.get("last_synced_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    /// Upsert one row; returns `true` when a new row was inserted.
    async fn upsert_one(
        &self,
        record: &ExternalLicenseRecord,
        timestamp: DateTime<Utc>,
    ) -> LicensaResult<bool> {
        let appid = record.appid.as_deref().filter(|a| !a.is_empty());
        let conflict_target = match (appid, record.countid) {
            (Some(_), _) => "(appid)",
            (None, Some(_)) => "(countid) where appid is null",
            (None, None) => {
                return Err(LicensaError::Validation(
                    "record has neither appid nor countid".to_string(),
                ))
            }
        };

        let sql = format!(
            "insert into external_licenses
             (id, appid, countid, mid, email_license, attributes, external_sync_status, created_at, updated_at)
             values ($1, $2, $3, $4, $5, $6, 'pending', $7, $7)
             on conflict {conflict_target} do update set
               countid = coalesce(excluded.countid, external_licenses.countid),
               mid = coalesce(excluded.mid, external_licenses.mid),
               email_license = coalesce(excluded.email_license, external_licenses.email_license),
               attributes = excluded.attributes,
               external_sync_status = 'pending',
               updated_at = excluded.updated_at
             returning (xmax = 0) as inserted"
        );

        let row = sqlx::query(&sql)
            .bind(record.id)
            .bind(appid)
            .bind(record.countid)
            .bind(&record.mid)
            .bind(&record.email_license)
            .bind(Json(&record.attributes))
            .bind(timestamp)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(row.get::<bool, _>("inserted"))
    }
}

#[async_trait]
impl ExternalLicenseRepository for PgExternalLicenseRepository {
    async fn find_by_app_id(&self, appid: &str) -> LicensaResult<Option<ExternalLicenseRecord>> {
        run_with_timeout(self.timeout, "find external license by appid", async {
            let row = sqlx::query(&format!(
                "select {EXTERNAL_COLUMNS} from external_licenses where appid = $1"
            ))
            .bind(appid)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            row.map(Self::map_row).transpose()
        })
        .await
    }

    async fn find_by_count_id(&self, countid: i64) -> LicensaResult<Option<ExternalLicenseRecord>> {
        run_with_timeout(self.timeout, "find external license by countid", async {
            let row = sqlx::query(&format!(
                "select {EXTERNAL_COLUMNS} from external_licenses
                 where countid = $1 order by created_at asc limit 1"
            ))
            .bind(countid)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            row.map(Self::map_row).transpose()
        })
        .await
    }

    async fn find_licenses(
        &self,
        query: &LicenseQuery,
    ) -> LicensaResult<LicensePage<ExternalLicenseRecord>> {
        run_with_timeout(self.timeout, "find external licenses", async {
            let mut count_qb = QueryBuilder::new("select count(*) as cnt from external_licenses");
            push_common_filters(&mut count_qb, &query.filters);
            let total: i64 = count_qb
                .build()
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_error)?
                .get("cnt");

            let mut qb = QueryBuilder::new(format!(
                "select {EXTERNAL_COLUMNS} from external_licenses"
            ));
            push_common_filters(&mut qb, &query.filters);
            qb.push(" order by created_at asc, id asc");
            qb.push(" limit ").push_bind(i64::from(query.limit));
            qb.push(" offset ").push_bind(query.offset());

            let rows = qb
                .build()
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

            let licenses = rows
                .into_iter()
                .map(Self::map_row)
                .collect::<LicensaResult<Vec<_>>>()?;

            Ok(LicensePage { licenses, total })
        })
        .await
    }

    async fn bulk_upsert(
        &self,
        records: &[ExternalLicenseRecord],
        timestamp: DateTime<Utc>,
    ) -> LicensaResult<BulkUpsertResult> {
        run_with_timeout(self.timeout, "bulk upsert external licenses", async {
            let mut result = BulkUpsertResult::default();

            for record in records {
                match self.upsert_one(record, timestamp).await {
                    Ok(true) => result.created += 1,
                    Ok(false) => result.updated += 1,
                    // A lost connection fails the whole call, not just this row.
                    Err(e @ (LicensaError::Connection(_) | LicensaError::Timeout(_))) => {
                        return Err(e)
                    }
                    Err(e) => result.errors.push(BulkUpsertError {
                        identifier: record.identifier(),
                        error: e.to_string(),
                    }),
                }
            }

            Ok(result)
        })
        .await
    }

    async fn bulk_mark_synced(
        &self,
        identifiers: &[String],
        timestamp: DateTime<Utc>,
    ) -> LicensaResult<u64> {
        if identifiers.is_empty() {
            return Ok(0);
        }

        let mut appids: Vec<String> = Vec::new();
        let mut countids: Vec<i64> = Vec::new();
        for identifier in identifiers {
            match identifier.strip_prefix("countid:") {
                Some(raw) => {
                    if let Ok(countid) = raw.parse::<i64>() {
                        countids.push(countid);
                    }
                }
                None => appids.push(identifier.clone()),
            }
        }

        run_with_timeout(self.timeout, "mark external licenses synced", async {
            let result = sqlx::query(
                "update external_licenses
                 set external_sync_status = 'synced', last_synced_at = $1, updated_at = $1
                 where appid = any($2) or (appid is null and countid = any($3))",
            )
            .bind(timestamp)
            .bind(appids)
            .bind(countids)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            Ok(result.rows_affected())
        })
        .await
    }

    async fn get_license_stats_with_filters(
        &self,
        filters: &LicenseFilters,
    ) -> LicensaResult<LicenseStats> {
        run_with_timeout(self.timeout, "external license stats", async {
            let mut qb = QueryBuilder::new("");
            push_stats_select(&mut qb);
            qb.push(" from external_licenses");
            push_common_filters(&mut qb, filters);

            let row = qb
                .build()
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

            Ok(map_stats_row(row))
        })
        .await
    }
}

// ── Internal store ──────────────────────────────────────────────

#[derive(Clone)]
pub struct PgInternalLicenseRepository {
    pool: PgPool,
    timeout: Duration,
}

impl PgInternalLicenseRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn map_row(row: PgRow) -> LicensaResult<InternalLicenseRecord> {
        let external_sync_status = parse_sync_status(&row)?;
        let status_raw: String = row.get("status");
        let status = LicenseStatus::from_str(&status_raw).map_err(LicensaError::Internal)?;

        Ok(InternalLicenseRecord {
            id: row.get("id"),
            key: row.get("key"),
            appid: row.get("appid"),
            countid: row.get("countid"),
            mid: row.get("mid"),
            email_license: row.get("email_license"),
            product: row.get("product"),
            dba: row.get("dba"),
            zip: row.get("zip"),
            status,
            plan: row.get("plan"),
            term: row.get("term"),
            last_payment: row.get("last_payment"),
            sms_balance: row.get("sms_balance"),
            seats_total: row.get("seats_total"),
            seats_used: row.get("seats_used"),
            agents_name: row.get("agents_name"),
            notes: row.get("notes"),
            starts_at: row.get("starts_at"),
            last_active: row.get("last_active"),
            cancel_date: row.get("cancel_date"),
            external_sync_status,
            last_external_sync: row.get("last_external_sync"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filters: &LicenseFilters) {
        push_common_filters(qb, filters);
        if filters.pending_external_push {
            qb.push(
                " and appid is not null \
                 and (last_external_sync is null or updated_at > last_external_sync)",
            );
        }
    }
}

#[async_trait]
impl InternalLicenseRepository for PgInternalLicenseRepository {
    async fn find_by_app_id(&self, appid: &str) -> LicensaResult<Option<InternalLicenseRecord>> {
        run_with_timeout(self.timeout, "find license by appid", async {
            let row = sqlx::query(&format!(
                "select {INTERNAL_COLUMNS} from licenses
                 where appid = $1 order by created_at asc limit 1"
            ))
            .bind(appid)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            row.map(Self::map_row).transpose()
        })
        .await
    }

    async fn find_by_count_id(&self, countid: i64) -> LicensaResult<Option<InternalLicenseRecord>> {
        run_with_timeout(self.timeout, "find license by countid", async {
            let row = sqlx::query(&format!(
                "select {INTERNAL_COLUMNS} from licenses
                 where countid = $1 order by created_at asc limit 1"
            ))
            .bind(countid)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            row.map(Self::map_row).transpose()
        })
        .await
    }

    async fn find_licenses(
        &self,
        query: &LicenseQuery,
    ) -> LicensaResult<LicensePage<InternalLicenseRecord>> {
        run_with_timeout(self.timeout, "find licenses", async {
            let mut count_qb = QueryBuilder::new("select count(*) as cnt from licenses");
            Self::push_filters(&mut count_qb, &query.filters);
            let total: i64 = count_qb
                .build()
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_error)?
                .get("cnt");

            let mut qb = QueryBuilder::new(format!("select {INTERNAL_COLUMNS} from licenses"));
            Self::push_filters(&mut qb, &query.filters);
            qb.push(" order by created_at asc, id asc");
            qb.push(" limit ").push_bind(i64::from(query.limit));
            qb.push(" offset ").push_bind(query.offset());

            let rows = qb
                .build()
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

            let licenses = rows
                .into_iter()
                .map(Self::map_row)
                .collect::<LicensaResult<Vec<_>>>()?;

            Ok(LicensePage { licenses, total })
        })
        .await
    }

    async fn update(
        &self,
        id: Uuid,
        patch: &InternalLicensePatch,
    ) -> LicensaResult<InternalLicenseRecord> {
        run_with_timeout(self.timeout, "update license", async {
            // updated_at follows last_external_sync when the patch carries one, so a
            // freshly reconciled row does not look locally modified.
            let row = sqlx::query(&format!(
                "update licenses set
                   appid = coalesce($2, appid),
                   countid = coalesce($3, countid),
                   mid = coalesce($4, mid),
                   email_license = coalesce($5, email_license),
                   dba = coalesce($6, dba),
                   zip = coalesce($7, zip),
                   status = coalesce($8, status),
                   plan = coalesce($9, plan),
                   term = coalesce($10, term),
                   last_payment = coalesce($11, last_payment),
                   sms_balance = coalesce($12, sms_balance),
                   seats_total = coalesce($13, seats_total),
                   seats_used = coalesce($14, seats_used),
                   agents_name = coalesce($15, agents_name),
                   notes = coalesce($16, notes),
                   starts_at = coalesce($17, starts_at),
                   last_active = coalesce($18, last_active),
                   cancel_date = coalesce($19, cancel_date),
                   external_sync_status = coalesce($20, external_sync_status),
                   last_external_sync = coalesce($21, last_external_sync),
                   updated_at = coalesce($21, now())
                 where id = $1
                 returning {INTERNAL_COLUMNS}"
            ))
            .bind(id)
            .bind(&patch.appid)
            .bind(patch.countid)
            .bind(&patch.mid)
            .bind(&patch.email_license)
            .bind(&patch.dba)
            .bind(&patch.zip)
            .bind(patch.status.map(|s| s.as_str()))
            .bind(&patch.plan)
            .bind(&patch.term)
            .bind(patch.last_payment)
            .bind(patch.sms_balance)
            .bind(patch.seats_total)
            .bind(patch.seats_used)
            .bind(&patch.agents_name)
            .bind(&patch.notes)
            .bind(patch.starts_at)
            .bind(patch.last_active)
            .bind(patch.cancel_date)
            .bind(patch.external_sync_status.map(|s| s.as_str()))
            .bind(patch.last_external_sync)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            match row {
                Some(r) => Self::map_row(r),
                None => Err(LicensaError::NotFound(format!("license not found: {id}"))),
            }
        })
        .await
    }

    async fn save(&self, record: InternalLicenseRecord) -> LicensaResult<InternalLicenseRecord> {
        run_with_timeout(self.timeout, "save license", async {
            let row = sqlx::query(&format!(
                "insert into licenses ({INTERNAL_COLUMNS})
                 values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                         $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25)
                 returning {INTERNAL_COLUMNS}"
            ))
            .bind(record.id)
            .bind(&record.key)
            .bind(&record.appid)
            .bind(record.countid)
            .bind(&record.mid)
            .bind(&record.email_license)
            .bind(&record.product)
            .bind(&record.dba)
            .bind(&record.zip)
            .bind(record.status.as_str())
            .bind(&record.plan)
            .bind(&record.term)
            .bind(record.last_payment)
            .bind(record.sms_balance)
            .bind(record.seats_total)
            .bind(record.seats_used)
            .bind(&record.agents_name)
            .bind(&record.notes)
            .bind(record.starts_at)
            .bind(record.last_active)
            .bind(record.cancel_date)
            .bind(record.external_sync_status.as_str())
            .bind(record.last_external_sync)
            .bind(record.created_at)
            .bind(record.updated_at)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            Self::map_row(row)
        })
        .await
    }

    async fn get_license_stats_with_filters(
        &self,
        filters: &LicenseFilters,
    ) -> LicensaResult<LicenseStats> {
        run_with_timeout(self.timeout, "license stats", async {
            let mut qb = QueryBuilder::new("");
            push_stats_select(&mut qb);
            qb.push(" from licenses");
            Self::push_filters(&mut qb, filters);

            let row = qb
                .build()
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

            Ok(map_stats_row(row))
        })
        .await
    }
}
