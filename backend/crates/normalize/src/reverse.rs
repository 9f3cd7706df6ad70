use chrono::{DateTime, Utc};
use licensa_db::licenses::models::{
    ExternalAttributes, ExternalLicenseRecord, ExternalSyncStatus, InternalLicenseRecord,
};
use serde_json::{json, Value};
use uuid::Uuid;

fn text(value: &str) -> Option<Value> {
    Some(Value::String(value.to_string()))
}

/// Map an internal record back into the mirror shape for internal-to-external sync.
///
/// The mirror upserts by appid, so the generated `id` only matters for new rows.
pub fn to_external_record(record: &InternalLicenseRecord, now: DateTime<Utc>) -> ExternalLicenseRecord {
    ExternalLicenseRecord {
        id: Uuid::new_v4(),
        appid: record.appid.clone(),
        countid: record.countid,
        mid: record.mid.clone(),
        email_license: record.email_license.clone(),
        attributes: ExternalAttributes {
            dba: text(&record.dba),
            zip: text(&record.zip),
            status: text(record.status.as_str()),
            plan: text(&record.plan),
            term: text(&record.term),
            last_payment: Some(json!(record.last_payment)),
            sms_balance: Some(json!(record.sms_balance)),
            seats_total: Some(json!(record.seats_total)),
            seats_used: Some(json!(record.seats_used)),
            agents_name: text(&record.agents_name),
            notes: text(&record.notes),
            starts_at: text(&record.starts_at.to_rfc3339()),
            last_active: text(&record.last_active.to_rfc3339()),
            cancel_date: record.cancel_date.map(|d| Value::String(d.to_rfc3339())),
        },
        external_sync_status: ExternalSyncStatus::Pending,
        last_synced_at: None,
        created_at: now,
        updated_at: now,
    }
}
