//! Merchant database routing.
//!
//! Every merchant's ledger lives in its own Postgres database. The router derives a
//! fixed-length routing prefix from the merchant id, resolves the connection target for that
//! prefix once, and keeps the resulting pool for the lifetime of the process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::config::{mask_url, RouterConfig};
use crate::error::{AppError, AppResult, InvalidReason, ServiceUnavailableReason};

/// Source of per-prefix connection targets
pub trait DatabaseTargets: Send + Sync {
    fn resolve(&self, prefix: &str) -> Option<String>;

    /// Every prefix this source knows about, used by background maintenance
    fn prefixes(&self) -> Vec<String>;
}

impl DatabaseTargets for HashMap<String, String> {
    fn resolve(&self, prefix: &str) -> Option<String> {
        self.get(prefix).cloned()
    }

    fn prefixes(&self) -> Vec<String> {
        let mut prefixes: Vec<String> = self.keys().cloned().collect();
        prefixes.sort();
        prefixes
    }
}

pub struct MerchantDatabaseRouter {
    config: RouterConfig,
    targets: Arc<dyn DatabaseTargets>,
    pools: RwLock<HashMap<String, PgPool>>,
}

impl MerchantDatabaseRouter {
    pub fn new(config: RouterConfig, targets: Arc<dyn DatabaseTargets>) -> Self {
        Self {
            config,
            targets,
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Router over the targets listed in configuration
    pub fn from_config(config: RouterConfig) -> Self {
        let targets: Arc<dyn DatabaseTargets> = Arc::new(config.targets.clone());
        Self::new(config, targets)
    }

    /// Routing key for a merchant id
    pub fn prefix_for(&self, merchant_id: &str) -> AppResult<String> {
        routing_prefix(merchant_id, self.config.prefix_length)
    }

    /// Pool for the merchant's database, built on first use
    pub fn pool_for(&self, merchant_id: &str) -> AppResult<PgPool> {
        let prefix = self.prefix_for(merchant_id)?;
        self.get_or_create(&prefix)
    }

    /// Cached pool for a routing prefix, resolving configuration only on a miss.
    ///
    /// Two callers racing on the same cold prefix may both build a pool; the first one stored
    /// wins and the other is dropped before it ever connects.
    pub fn get_or_create(&self, prefix: &str) -> AppResult<PgPool> {
        if let Some(pool) = self.pools.read().get(prefix) {
            return Ok(pool.clone());
        }

        let url = self.targets.resolve(prefix).ok_or_else(|| AppError::ServiceUnavailable {
            service: "merchant_database".to_string(),
            reason: ServiceUnavailableReason::MissingDatabaseTarget,
            retry_after_seconds: None,
        })?;

        let pool = self.build_pool(&url)?;

        let mut pools = self.pools.write();
        let pool = pools.entry(prefix.to_string()).or_insert(pool).clone();
        info!("Merchant pool ready for prefix {} ({})", prefix, mask_url(&url));
        Ok(pool)
    }

    fn build_pool(&self, url: &str) -> AppResult<PgPool> {
        debug!("Building pool for {}", mask_url(url));
        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .min_connections(self.config.min_connections)
            .acquire_timeout(Duration::from_secs(self.config.acquire_timeout_secs))
            .idle_timeout(Duration::from_secs(self.config.idle_timeout_secs))
            .max_lifetime(Duration::from_secs(self.config.max_lifetime_secs))
            .connect_lazy(url)
            .map_err(|e| AppError::Config(format!("Invalid database url {}: {}", mask_url(url), e)))?;
        Ok(pool)
    }

    /// Prefixes with a configured target
    pub fn configured_prefixes(&self) -> Vec<String> {
        self.targets.prefixes()
    }

    /// Prefixes with a live cached pool
    pub fn cached_prefixes(&self) -> Vec<String> {
        let mut prefixes: Vec<String> = self.pools.read().keys().cloned().collect();
        prefixes.sort();
        prefixes
    }

    pub async fn close_all(&self) {
        let pools: Vec<PgPool> = self.pools.read().values().cloned().collect();
        for pool in pools {
            pool.close().await;
        }
    }
}

/// First `length` characters of the normalised merchant id
pub fn routing_prefix(merchant_id: &str, length: usize) -> AppResult<String> {
    let normalized = merchant_id.trim().to_lowercase();
    if normalized.is_empty() {
        return Err(AppError::invalid("merchant_id", InvalidReason::Empty));
    }
    if normalized.chars().count() < length {
        return Err(AppError::invalid("merchant_id", InvalidReason::TooShort));
    }
    Ok(normalized.chars().take(length).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTargets {
        inner: HashMap<String, String>,
        lookups: AtomicUsize,
    }

    impl DatabaseTargets for CountingTargets {
        fn resolve(&self, prefix: &str) -> Option<String> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.resolve(prefix)
        }

        fn prefixes(&self) -> Vec<String> {
            self.inner.prefixes()
        }
    }

    fn router_with(targets: Arc<CountingTargets>) -> MerchantDatabaseRouter {
        let config = RouterConfig {
            prefix_length: 4,
            ..RouterConfig::default()
        };
        MerchantDatabaseRouter::new(config, targets)
    }

    fn targets() -> Arc<CountingTargets> {
        let mut inner = HashMap::new();
        inner.insert("acme".to_string(), "postgres://ledger:pw@localhost/acme".to_string());
        inner.insert("glob".to_string(), "postgres://ledger:pw@localhost/globex".to_string());
        Arc::new(CountingTargets {
            inner,
            lookups: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_routing_prefix() {
        assert_eq!(routing_prefix("  ACME-corp-01", 4).unwrap(), "acme");
        assert!(matches!(
            routing_prefix("", 4),
            Err(AppError::InvalidRequest { reason: InvalidReason::Empty, .. })
        ));
        assert!(matches!(
            routing_prefix("ab", 4),
            Err(AppError::InvalidRequest { reason: InvalidReason::TooShort, .. })
        ));
    }

    #[tokio::test]
    async fn test_pool_is_cached_per_prefix() {
        let targets = targets();
        let router = router_with(targets.clone());

        router.pool_for("acme-corp").unwrap();
        router.pool_for("ACME-other-store").unwrap();
        assert_eq!(targets.lookups.load(Ordering::SeqCst), 1);

        router.pool_for("globex").unwrap();
        assert_eq!(targets.lookups.load(Ordering::SeqCst), 2);
        assert_eq!(router.cached_prefixes(), vec!["acme".to_string(), "glob".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_target_is_not_cached() {
        let targets = targets();
        let router = router_with(targets.clone());

        let err = router.pool_for("initech").unwrap_err();
        assert!(matches!(
            err,
            AppError::ServiceUnavailable {
                reason: ServiceUnavailableReason::MissingDatabaseTarget,
                ..
            }
        ));

        router.pool_for("initech").unwrap_err();
        assert_eq!(targets.lookups.load(Ordering::SeqCst), 2);
        assert!(router.cached_prefixes().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_first_lookups_converge() {
        let router = Arc::new(router_with(targets()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let router = router.clone();
                tokio::spawn(async move { router.pool_for("acme-corp") })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(router.cached_prefixes(), vec!["acme".to_string()]);
    }

    #[test]
    fn test_configured_prefixes_sorted() {
        let router = router_with(targets());
        assert_eq!(router.configured_prefixes(), vec!["acme", "glob"]);
    }
}
