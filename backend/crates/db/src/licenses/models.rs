use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Reconciliation progress of a mirrored record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExternalSyncStatus {
    #[default]
    Pending,
    Synced,
    Failed,
}

impl ExternalSyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for ExternalSyncStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown external sync status: {value}")),
        }
    }
}

/// Normalized license status used by the internal store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LicenseStatus {
    Active,
    Cancel,
    Pending,
    Suspended,
    Trial,
}

impl LicenseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Cancel => "cancel",
            Self::Pending => "pending",
            Self::Suspended => "suspended",
            Self::Trial => "trial",
        }
    }
}

impl FromStr for LicenseStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "active" => Ok(Self::Active),
            "cancel" => Ok(Self::Cancel),
            "pending" => Ok(Self::Pending),
            "suspended" => Ok(Self::Suspended),
            "trial" => Ok(Self::Trial),
            _ => Err(format!("unknown license status: {value}")),
        }
    }
}

/// Business attributes exactly as the third-party API returned them.
///
/// Values stay untyped here; `licensa-normalize` is the only place that turns
/// them into internal types.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExternalAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dba: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_payment: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sms_balance: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seats_total: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seats_used: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agents_name: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starts_at: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_date: Option<Value>,
}

/// Mirror row of one third-party license record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalLicenseRecord {
    pub id: Uuid,
    pub appid: Option<String>,
    pub countid: Option<i64>,
    pub mid: Option<String>,
    pub email_license: Option<String>,
    pub attributes: ExternalAttributes,
    pub external_sync_status: ExternalSyncStatus,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExternalLicenseRecord {
    /// Stable identifier used in error lists and `bulk_mark_synced`.
    ///
    /// `appid` wins; records without one are addressed as `countid:<n>`.
    pub fn identifier(&self) -> String {
        if let Some(appid) = self.appid.as_deref().filter(|a| !a.is_empty()) {
            return appid.to_string();
        }
        if let Some(countid) = self.countid {
            return format!("countid:{countid}");
        }
        if let Some(mid) = self.mid.as_deref().filter(|m| !m.is_empty()) {
            return format!("mid:{mid}");
        }
        if let Some(email) = self.email_license.as_deref().filter(|e| !e.is_empty()) {
            return format!("email:{email}");
        }
        format!("id:{}", self.id)
    }
}

/// Normalized license row owned by the application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InternalLicenseRecord {
    pub id: Uuid,
    pub key: String,
    pub appid: Option<String>,
    pub countid: Option<i64>,
    pub mid: Option<String>,
    pub email_license: Option<String>,
    pub product: String,
    pub dba: String,
    pub zip: String,
    pub status: LicenseStatus,
    pub plan: String,
    pub term: String,
    pub last_payment: f64,
    pub sms_balance: f64,
    pub seats_total: i32,
    pub seats_used: i32,
    pub agents_name: String,
    pub notes: String,
    pub starts_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub cancel_date: Option<DateTime<Utc>>,
    pub external_sync_status: ExternalSyncStatus,
    pub last_external_sync: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update for an internal record. `None` leaves the column untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InternalLicensePatch {
    pub appid: Option<String>,
    pub countid: Option<i64>,
    pub mid: Option<String>,
    pub email_license: Option<String>,
    pub dba: Option<String>,
    pub zip: Option<String>,
    pub status: Option<LicenseStatus>,
    pub plan: Option<String>,
    pub term: Option<String>,
    pub last_payment: Option<f64>,
    pub sms_balance: Option<f64>,
    pub seats_total: Option<i32>,
    pub seats_used: Option<i32>,
    pub agents_name: Option<String>,
    pub notes: Option<String>,
    pub starts_at: Option<DateTime<Utc>>,
    pub last_active: Option<DateTime<Utc>>,
    pub cancel_date: Option<DateTime<Utc>>,
    pub external_sync_status: Option<ExternalSyncStatus>,
    pub last_external_sync: Option<DateTime<Utc>>,
}

impl InternalLicenseRecord {
    /// Apply a patch in place, mirroring the column-wise `coalesce` the
    /// Postgres store performs.
    pub fn apply_patch(&mut self, patch: &InternalLicensePatch) {
        fn set<T: Clone>(slot: &mut T, value: &Option<T>) {
            if let Some(v) = value {
                *slot = v.clone();
            }
        }

        if patch.appid.is_some() {
            self.appid = patch.appid.clone();
        }
        if patch.countid.is_some() {
            self.countid = patch.countid;
        }
        if patch.mid.is_some() {
            self.mid = patch.mid.clone();
        }
        if patch.email_license.is_some() {
            self.email_license = patch.email_license.clone();
        }
        set(&mut self.dba, &patch.dba);
        set(&mut self.zip, &patch.zip);
        set(&mut self.status, &patch.status);
        set(&mut self.plan, &patch.plan);
        set(&mut self.term, &patch.term);
        set(&mut self.last_payment, &patch.last_payment);
        set(&mut self.sms_balance, &patch.sms_balance);
        set(&mut self.seats_total, &patch.seats_total);
        set(&mut self.seats_used, &patch.seats_used);
        set(&mut self.agents_name, &patch.agents_name);
        set(&mut self.notes, &patch.notes);
        set(&mut self.starts_at, &patch.starts_at);
        set(&mut self.last_active, &patch.last_active);
        if patch.cancel_date.is_some() {
            self.cancel_date = patch.cancel_date;
        }
        set(&mut self.external_sync_status, &patch.external_sync_status);
        if patch.last_external_sync.is_some() {
            self.last_external_sync = patch.last_external_sync;
        }
        self.updated_at = patch.last_external_sync.unwrap_or_else(Utc::now);
    }

    /// True when the row changed locally after it was last reconciled.
    pub fn needs_external_push(&self) -> bool {
        match self.last_external_sync {
            Some(synced_at) => self.updated_at > synced_at,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LicenseFilters {
    pub sync_status: Option<ExternalSyncStatus>,
    /// Only rows whose `updated_at` is at or after this instant.
    pub updated_since: Option<DateTime<Utc>>,
    /// Internal store only: rows with an appid changed after their last external sync.
    pub pending_external_push: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseQuery {
    /// 1-based page number.
    pub page: u32,
    pub limit: u32,
    pub filters: LicenseFilters,
}

impl LicenseQuery {
    pub fn page(page: u32, limit: u32, filters: LicenseFilters) -> Self {
        Self {
            page: page.max(1),
            limit,
            filters,
        }
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page.max(1) - 1) * i64::from(self.limit)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicensePage<T> {
    pub licenses: Vec<T>,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BulkUpsertError {
    pub identifier: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkUpsertResult {
    pub created: usize,
    pub updated: usize,
    pub errors: Vec<BulkUpsertError>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LicenseStats {
    pub total: i64,
    pub synced: i64,
    pub pending: i64,
    pub failed: i64,
}
