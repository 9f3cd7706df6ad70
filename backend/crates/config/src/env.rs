use std::env;
use std::str::FromStr;

use licensa_common::error::{LicensaError, LicensaResult};
use serde::Deserialize;

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Runtime configuration for one license sync process.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    pub database_url: String,
    pub log_level: String,
    pub batch_size: usize,
    pub concurrency_limit: usize,
    pub max_records: Option<usize>,
    pub max_pages: Option<usize>,
    pub reconcile_limit: Option<usize>,
    pub db_timeout_secs: u64,
    pub dry_run: bool,
    pub internal_only: bool,
    pub comprehensive: bool,
    pub bidirectional: bool,
    pub force_full_sync: bool,
    pub single_appid: Option<String>,
}

impl SyncConfig {
    /// Load configuration from environment variables.
    /// Loads `.env` file if present, then reads the vars; malformed values fail fast.
    pub fn from_env() -> LicensaResult<Self> {
        // Best-effort .env load; ignore if missing
        let _ = dotenvy::dotenv();

        let batch_size: usize = parse_var_or("SYNC_BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        if batch_size == 0 {
            return Err(LicensaError::Config(
                "SYNC_BATCH_SIZE must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            database_url: get_var("DATABASE_URL")?,
            log_level: get_var_or("LOG_LEVEL", "info"),
            batch_size,
            concurrency_limit: parse_var_or("SYNC_CONCURRENCY", DEFAULT_CONCURRENCY)?.max(1),
            max_records: parse_optional_var("SYNC_MAX_RECORDS")?,
            max_pages: parse_optional_var("SYNC_MAX_PAGES")?,
            reconcile_limit: parse_optional_var("SYNC_RECONCILE_LIMIT")?,
            db_timeout_secs: parse_var_or("SYNC_DB_TIMEOUT_SECS", 30)?,
            dry_run: parse_bool_or("SYNC_DRY_RUN", false)?,
            internal_only: parse_bool_or("SYNC_INTERNAL_ONLY", false)?,
            comprehensive: parse_bool_or("SYNC_COMPREHENSIVE", true)?,
            bidirectional: parse_bool_or("SYNC_BIDIRECTIONAL", false)?,
            force_full_sync: parse_bool_or("SYNC_FORCE_FULL", true)?,
            single_appid: env::var("SYNC_APPID")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
        })
    }
}

fn get_var(key: &str) -> LicensaResult<String> {
    env::var(key).map_err(|_| LicensaError::Config(format!("{key} is required but not set")))
}

fn get_var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_var_or<T>(key: &str, default: T) -> LicensaResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_optional_var(key)?.unwrap_or(default))
}

fn parse_optional_var<T>(key: &str) -> LicensaResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| LicensaError::Config(format!("invalid {key}: {e}"))),
        _ => Ok(None),
    }
}

fn parse_bool_or(key: &str, default: bool) -> LicensaResult<bool> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "" => Ok(default),
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(LicensaError::Config(format!(
                "invalid {key}: expected a boolean, got {other:?}"
            ))),
        },
        Err(_) => Ok(default),
    }
}
