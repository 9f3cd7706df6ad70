use chrono::{DateTime, Utc};
use licensa_db::licenses::models::{
    ExternalLicenseRecord, ExternalSyncStatus, InternalLicensePatch, InternalLicenseRecord,
    LicenseStatus,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use uuid::Uuid;

use crate::key::generate_unique_key;
use crate::sanitize::{
    normalize_status, parse_date, sanitize_agents_name, sanitize_date,
    sanitize_number, sanitize_string,
};

pub const DEFAULT_PRODUCT: &str = "Standard";
pub const DEFAULT_PLAN: &str = "Basic";
pub const DEFAULT_TERM: &str = "monthly";

/// Largest amount the internal `numeric(12,2)`-equivalent columns accept.
pub const MAX_AMOUNT: f64 = 9_999_999_999.99;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransformError {
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
}

/// Result of [`transform_robustly`]; `fallback_reason` is set when the minimal
/// record had to be used.
#[derive(Debug, Clone)]
pub struct Transformed {
    pub record: InternalLicenseRecord,
    pub fallback_reason: Option<TransformError>,
}

fn present(value: &Option<Value>) -> Option<&Value> {
    value.as_ref().filter(|v| !v.is_null())
}

fn checked_amount(field: &'static str, value: Option<&Value>) -> Result<f64, TransformError> {
    let amount = sanitize_number(value);
    if amount > MAX_AMOUNT {
        return Err(TransformError::OutOfRange {
            field,
            value: amount,
        });
    }
    Ok(amount)
}

fn checked_seats(field: &'static str, value: Option<&Value>) -> Result<i32, TransformError> {
    let seats = sanitize_number(value).trunc();
    if seats > f64::from(i32::MAX) {
        return Err(TransformError::OutOfRange {
            field,
            value: seats,
        });
    }
    Ok(seats as i32)
}

fn placeholder_dba(now: DateTime<Utc>) -> String {
    let tag: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(4)
        .map(char::from)
        .collect();
    format!("Unnamed Business {}-{}", now.timestamp_micros(), tag.to_lowercase())
}

fn or_default(value: String, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value
    }
}

/// Full mapping of a mirror record into the internal schema.
///
/// Fails only when a value cannot be represented by the internal columns.
pub fn transform_full(
    record: &ExternalLicenseRecord,
    now: DateTime<Utc>,
) -> Result<InternalLicenseRecord, TransformError> {
    let attrs = &record.attributes;

    let dba = sanitize_string(attrs.dba.as_ref());
    let dba = if dba.is_empty() {
        placeholder_dba(now)
    } else {
        dba
    };

    Ok(InternalLicenseRecord {
        id: Uuid::new_v4(),
        key: generate_unique_key(record, now),
        appid: record.appid.clone().filter(|a| !a.is_empty()),
        countid: record.countid,
        mid: record.mid.clone().filter(|m| !m.is_empty()),
        email_license: record.email_license.clone().filter(|e| !e.is_empty()),
        product: DEFAULT_PRODUCT.to_string(),
        dba,
        zip: sanitize_string(attrs.zip.as_ref()),
        status: normalize_status(attrs.status.as_ref()),
        plan: or_default(sanitize_string(attrs.plan.as_ref()), DEFAULT_PLAN),
        term: or_default(sanitize_string(attrs.term.as_ref()), DEFAULT_TERM),
        last_payment: checked_amount("lastPayment", attrs.last_payment.as_ref())?,
        sms_balance: checked_amount("smsBalance", attrs.sms_balance.as_ref())?,
        seats_total: checked_seats("seatsTotal", attrs.seats_total.as_ref())?,
        seats_used: checked_seats("seatsUsed", attrs.seats_used.as_ref())?,
        agents_name: sanitize_agents_name(attrs.agents_name.as_ref()),
        notes: sanitize_string(attrs.notes.as_ref()),
        starts_at: sanitize_date(attrs.starts_at.as_ref(), now),
        last_active: sanitize_date(attrs.last_active.as_ref(), now),
        cancel_date: parse_date(attrs.cancel_date.as_ref()),
        external_sync_status: ExternalSyncStatus::Synced,
        last_external_sync: Some(now),
        created_at: now,
        updated_at: now,
    })
}

/// Minimal valid record carrying only identifiers and sync metadata.
pub fn fallback_transform(record: &ExternalLicenseRecord, now: DateTime<Utc>) -> InternalLicenseRecord {
    InternalLicenseRecord {
        id: Uuid::new_v4(),
        key: generate_unique_key(record, now),
        appid: record.appid.clone().filter(|a| !a.is_empty()),
        countid: record.countid,
        mid: record.mid.clone().filter(|m| !m.is_empty()),
        email_license: record.email_license.clone().filter(|e| !e.is_empty()),
        product: DEFAULT_PRODUCT.to_string(),
        dba: placeholder_dba(now),
        zip: String::new(),
        status: LicenseStatus::Pending,
        plan: DEFAULT_PLAN.to_string(),
        term: DEFAULT_TERM.to_string(),
        last_payment: 0.0,
        sms_balance: 0.0,
        seats_total: 0,
        seats_used: 0,
        agents_name: String::new(),
        notes: String::new(),
        starts_at: now,
        last_active: now,
        cancel_date: None,
        external_sync_status: ExternalSyncStatus::Synced,
        last_external_sync: Some(now),
        created_at: now,
        updated_at: now,
    }
}

/// Full mapping with the fallback path; never fails.
pub fn transform_robustly(record: &ExternalLicenseRecord, now: DateTime<Utc>) -> Transformed {
    match transform_full(record, now) {
        Ok(record) => Transformed {
            record,
            fallback_reason: None,
        },
        Err(reason) => Transformed {
            record: fallback_transform(record, now),
            fallback_reason: Some(reason),
        },
    }
}

/// Update payload for an already matched internal record.
///
/// Only attributes the external record actually carries are written; values the
/// internal schema cannot hold, unparsable dates and blank strings are left out
/// rather than overwriting good data with defaults.
pub fn build_update_patch(record: &ExternalLicenseRecord, now: DateTime<Utc>) -> InternalLicensePatch {
    let attrs = &record.attributes;

    let text = |value: &Option<Value>| {
        present(value)
            .map(|v| sanitize_string(Some(v)))
            .filter(|s| !s.is_empty())
    };
    let amount = |field: &'static str, value: &Option<Value>| {
        present(value).and_then(|v| checked_amount(field, Some(v)).ok())
    };
    let seats = |field: &'static str, value: &Option<Value>| {
        present(value).and_then(|v| checked_seats(field, Some(v)).ok())
    };

    InternalLicensePatch {
        appid: record.appid.clone().filter(|a| !a.is_empty()),
        countid: record.countid,
        mid: record.mid.clone().filter(|m| !m.is_empty()),
        email_license: record
            .email_license
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string),
        dba: text(&attrs.dba),
        zip: text(&attrs.zip),
        status: present(&attrs.status).map(|v| normalize_status(Some(v))),
        plan: text(&attrs.plan),
        term: text(&attrs.term),
        last_payment: amount("lastPayment", &attrs.last_payment),
        sms_balance: amount("smsBalance", &attrs.sms_balance),
        seats_total: seats("seatsTotal", &attrs.seats_total),
        seats_used: seats("seatsUsed", &attrs.seats_used),
        agents_name: present(&attrs.agents_name)
            .map(|v| sanitize_agents_name(Some(v)))
            .filter(|s| !s.is_empty()),
        notes: text(&attrs.notes),
        starts_at: parse_date(attrs.starts_at.as_ref()),
        last_active: parse_date(attrs.last_active.as_ref()),
        cancel_date: parse_date(attrs.cancel_date.as_ref()),
        external_sync_status: Some(ExternalSyncStatus::Synced),
        last_external_sync: Some(now),
    }
}
