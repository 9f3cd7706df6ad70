use chrono::{DateTime, Utc};
use licensa_db::licenses::models::ExternalLicenseRecord;
use rand::distributions::Alphanumeric;
use rand::Rng;

pub const MAX_KEY_CHARS: usize = 100;
const RANDOM_SUFFIX_CHARS: usize = 6;

/// Build a unique internal key from whatever identifiers the record carries.
///
/// The timestamp and random suffix are always kept intact; only the identifier
/// prefix is shortened to fit in [`MAX_KEY_CHARS`].
pub fn generate_unique_key(record: &ExternalLicenseRecord, now: DateTime<Utc>) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(appid) = record.appid.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        parts.push(appid.to_string());
    }
    if let Some(countid) = record.countid {
        parts.push(countid.to_string());
    }
    if let Some(mid) = record.mid.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        parts.push(mid.to_string());
    }
    if let Some(email) = record
        .email_license
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        parts.push(email.to_string());
    }

    let prefix = if parts.is_empty() {
        "license".to_string()
    } else {
        parts
            .join("-")
            .chars()
            .map(|c| if c.is_whitespace() { '_' } else { c })
            .collect()
    };

    let random: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RANDOM_SUFFIX_CHARS)
        .map(char::from)
        .collect::<String>()
        .to_lowercase();
    let suffix = format!("-{}-{}", now.timestamp_millis(), random);

    let budget = MAX_KEY_CHARS.saturating_sub(suffix.chars().count());
    let prefix: String = prefix.chars().take(budget).collect();

    format!("{prefix}{suffix}")
}
