use std::sync::Arc;

use tracing::{error, info, warn};

use crate::{
    api::handler::AppState,
    config::Config,
    error::AppResult,
    maintenance::MaintenanceScheduler,
    router::MerchantDatabaseRouter,
    service::CreditLedger,
};

pub async fn initialize_app_state(config: &Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    // Merchant routing
    let router = Arc::new(MerchantDatabaseRouter::from_config(config.router.clone()));
    let prefixes = router.configured_prefixes();
    if prefixes.is_empty() {
        warn!("⚠️  No merchant databases configured - every merchant lookup will fail");
    } else {
        info!("✅ Router initialized for {} merchant prefix(es)", prefixes.len());
    }

    if config.router.run_migrations {
        run_migrations(&router).await?;
    }

    let ledger = CreditLedger::new(router.clone());
    info!("✅ Credit ledger initialized");

    // Background upkeep
    if config.maintenance.enabled {
        MaintenanceScheduler::new(config.maintenance.clone(), ledger.clone()).start();
        info!(
            "✅ Maintenance scheduler started (every {}s)",
            config.maintenance.interval_secs
        );
    } else {
        warn!("⚠️  Maintenance disabled - expired operations and lots will not be swept");
    }

    Ok(AppState { ledger })
}

/// Bring every configured merchant database up to the current schema
async fn run_migrations(router: &MerchantDatabaseRouter) -> AppResult<()> {
    for prefix in router.configured_prefixes() {
        info!("🔄 Running database migrations for {}...", prefix);
        let pool = router.get_or_create(&prefix)?;
        if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
            error!("❌ Migrations failed for {}: {}", prefix, e);
            return Err(e.into());
        }
    }

    info!("✓ Merchant databases migrated");
    Ok(())
}
