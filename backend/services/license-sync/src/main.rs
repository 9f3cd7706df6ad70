use std::time::Duration;

use licensa_config::{init_tracing, SyncConfig};
use licensa_db::licenses::pg_repository::{PgExternalLicenseRepository, PgInternalLicenseRepository};
use licensa_sync::api::{LicenseApiClient, LicenseApiConfig};
use licensa_sync::monitoring::TracingMonitor;
use licensa_sync::{LicenseSource, LicenseSyncService, SyncOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SyncConfig::from_env()?;
    init_tracing(&config.log_level);

    tracing::info!(service = "license-sync", "starting");

    let pool = licensa_db::create_pool(&config.database_url).await?;
    let db_timeout = Duration::from_secs(config.db_timeout_secs);
    let mirror = PgExternalLicenseRepository::new(pool.clone()).with_timeout(db_timeout);
    let internal = PgInternalLicenseRepository::new(pool).with_timeout(db_timeout);

    // License API is optional: without it only internal-only runs can succeed
    let source = match LicenseApiConfig::from_env() {
        Some(api_config) => {
            let client = LicenseApiClient::new(api_config)?;
            let health = client.health_check().await;
            if health.healthy {
                tracing::info!("license API reachable");
            } else {
                tracing::warn!(error = ?health.error, "license API health check failed");
            }
            Some(client)
        }
        None => {
            tracing::info!("no license API credentials found, external fetch unavailable");
            None
        }
    };

    let service = LicenseSyncService::new(source, mirror, Some(internal), TracingMonitor);

    let result = match &config.single_appid {
        Some(appid) => {
            tracing::info!(%appid, "running single license sync");
            service.sync_single(appid).await
        }
        None => service.execute(SyncOptions::from(&config)).await,
    };

    println!("{}", serde_json::to_string_pretty(&result)?);

    if !result.success {
        anyhow::bail!(
            "license sync failed: {}",
            result.error.as_deref().unwrap_or("see errors")
        );
    }
    Ok(())
}
