use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use licensa_db::licenses::models::LicenseStatus;
use serde_json::Value;

pub const MAX_STRING_CHARS: usize = 255;

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"];

/// Trim, strip NUL bytes and cap at 255 characters. Missing or null becomes `""`.
pub fn sanitize_string(value: Option<&Value>) -> String {
    let raw = match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => return String::new(),
    };

    raw.replace('\0', "")
        .trim()
        .chars()
        .take(MAX_STRING_CHARS)
        .collect()
}

/// Numeric coercion; anything non-finite or negative becomes `0.0`.
pub fn sanitize_number(value: Option<&Value>) -> f64 {
    let n = match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(f64::NAN),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                0.0
            } else {
                trimmed.parse::<f64>().unwrap_or(f64::NAN)
            }
        }
        Some(Value::Bool(true)) => 1.0,
        Some(Value::Bool(false)) => 0.0,
        _ => f64::NAN,
    };

    if n.is_finite() && n > 0.0 {
        n
    } else {
        0.0
    }
}

/// Parse a timestamp from the shapes the third-party API is known to send:
/// RFC 3339, naive date-times, plain dates, and epoch milliseconds.
pub fn parse_date(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value {
        Some(Value::String(s)) => parse_date_str(s.trim()),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

fn parse_date_str(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }
    None
}

/// Unparsable or missing dates fall back to `now` so a bad date never blocks a sync.
pub fn sanitize_date(value: Option<&Value>, now: DateTime<Utc>) -> DateTime<Utc> {
    parse_date(value).unwrap_or(now)
}

/// Arrays are joined with `", "`, strings trimmed, everything else is `""`.
pub fn sanitize_agents_name(value: Option<&Value>) -> String {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.replace('\0', "").trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|name| !name.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
        Some(Value::String(s)) => s.replace('\0', "").trim().to_string(),
        _ => String::new(),
    }
}

/// Case-insensitive status mapping. Unrecognized values become `Pending`, never `Active`.
pub fn normalize_status(value: Option<&Value>) -> LicenseStatus {
    match value {
        Some(Value::Bool(true)) => LicenseStatus::Active,
        Some(Value::Bool(false)) => LicenseStatus::Cancel,
        Some(Value::Number(n)) => match n.as_f64() {
            Some(f) if f == 1.0 => LicenseStatus::Active,
            Some(f) if f == 0.0 => LicenseStatus::Cancel,
            _ => LicenseStatus::Pending,
        },
        Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "active" | "1" | "true" | "yes" => LicenseStatus::Active,
            "cancel" | "cancelled" | "canceled" | "inactive" | "0" | "false" | "no" => {
                LicenseStatus::Cancel
            }
            "suspended" => LicenseStatus::Suspended,
            "trial" => LicenseStatus::Trial,
            _ => LicenseStatus::Pending,
        },
        _ => LicenseStatus::Pending,
    }
}

/// Integer identifier given either as a JSON number or a numeric string.
pub fn coerce_countid(value: Option<&Value>) -> Option<i64> {
    match value {
        Some(Value::Number(n)) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0)
                .map(|f| f as i64)
        }),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Text identifier; numbers are accepted and blank strings dropped.
pub fn coerce_text_id(value: Option<&Value>) -> Option<String> {
    let text = sanitize_string(value);
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}
