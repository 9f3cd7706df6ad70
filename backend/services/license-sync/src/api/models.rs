use chrono::{DateTime, Utc};
use licensa_db::licenses::models::{ExternalAttributes, ExternalLicenseRecord, ExternalSyncStatus};
use licensa_normalize::{coerce_countid, coerce_text_id};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A license as returned by the vendor API. Every field is optional and kept
/// as raw JSON; sanitizing happens during reconciliation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiLicense {
    #[serde(default)]
    pub appid: Option<Value>,
    #[serde(default)]
    pub countid: Option<Value>,
    #[serde(default)]
    pub mid: Option<Value>,
    #[serde(default, alias = "email")]
    pub email_license: Option<Value>,
    #[serde(default)]
    pub dba: Option<Value>,
    #[serde(default)]
    pub zip: Option<Value>,
    #[serde(default)]
    pub status: Option<Value>,
    #[serde(default)]
    pub plan: Option<Value>,
    #[serde(default)]
    pub term: Option<Value>,
    #[serde(default)]
    pub last_payment: Option<Value>,
    #[serde(default)]
    pub sms_balance: Option<Value>,
    #[serde(default)]
    pub seats_total: Option<Value>,
    #[serde(default)]
    pub seats_used: Option<Value>,
    #[serde(default)]
    pub agents_name: Option<Value>,
    #[serde(default)]
    pub notes: Option<Value>,
    #[serde(default)]
    pub starts_at: Option<Value>,
    #[serde(default)]
    pub last_active: Option<Value>,
    #[serde(default)]
    pub cancel_date: Option<Value>,
}

impl ApiLicense {
    pub fn into_record(self, now: DateTime<Utc>) -> ExternalLicenseRecord {
        ExternalLicenseRecord {
            id: Uuid::new_v4(),
            appid: coerce_text_id(self.appid.as_ref()),
            countid: coerce_countid(self.countid.as_ref()),
            mid: coerce_text_id(self.mid.as_ref()),
            email_license: coerce_text_id(self.email_license.as_ref()),
            attributes: ExternalAttributes {
                dba: self.dba,
                zip: self.zip,
                status: self.status,
                plan: self.plan,
                term: self.term,
                last_payment: self.last_payment,
                sms_balance: self.sms_balance,
                seats_total: self.seats_total,
                seats_used: self.seats_used,
                agents_name: self.agents_name,
                notes: self.notes,
                starts_at: self.starts_at,
                last_active: self.last_active,
                cancel_date: self.cancel_date,
            },
            external_sync_status: ExternalSyncStatus::Pending,
            last_synced_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// `GET /licenses?page=&limit=`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiLicensePage {
    #[serde(default)]
    pub data: Vec<ApiLicense>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub total_pages: Option<u64>,
}

impl ApiLicensePage {
    /// Page count advertised by the API, derived from `total` when
    /// `totalPages` is absent. Not every deployment sends either.
    pub fn advertised_pages(&self, limit: usize) -> Option<usize> {
        let to_usize = |n: u64| usize::try_from(n).unwrap_or(usize::MAX);
        match (self.total_pages, self.total) {
            (Some(pages), _) => Some(to_usize(pages)),
            (None, Some(total)) => Some(to_usize(total).div_ceil(limit.max(1))),
            (None, None) => None,
        }
    }
}

/// `GET /licenses/{appid}`
#[derive(Debug, Clone, Deserialize)]
pub struct ApiLicenseEnvelope {
    pub data: ApiLicense,
}
