use std::collections::HashMap;

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub bind_address: String,
    pub router: RouterConfig,
    pub maintenance: MaintenanceConfig,
}

/// Per-merchant database routing
#[derive(Debug, Deserialize, Clone)]
pub struct RouterConfig {
    /// Number of leading merchant-id characters used as the routing key
    pub prefix_length: usize,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
    /// Apply migrations to every configured merchant database at startup
    pub run_migrations: bool,
    /// prefix -> connection url
    #[serde(default)]
    pub targets: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MaintenanceConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Terminal operations older than this are deleted. `None` keeps them forever.
    pub retention_days: Option<i64>,
    pub partition_months_ahead: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            prefix_length: 8,
            max_connections: 20,
            min_connections: 0,
            acquire_timeout_secs: 30,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
            run_migrations: false,
            targets: HashMap::new(),
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            retention_days: Some(90),
            partition_months_ahead: 2,
        }
    }
}

impl Config {
    /// Defaults, then `credit-ledger.toml` if present, then `LEDGER__*` variables.
    ///
    /// `LEDGER__ROUTER__TARGETS__AB12CD34=postgres://...` registers a merchant database.
    pub fn from_env() -> Result<Self, ::config::ConfigError> {
        let router = RouterConfig::default();
        let maintenance = MaintenanceConfig::default();

        let settings = ::config::Config::builder()
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("router.prefix_length", router.prefix_length as u64)?
            .set_default("router.max_connections", router.max_connections)?
            .set_default("router.min_connections", router.min_connections)?
            .set_default("router.acquire_timeout_secs", router.acquire_timeout_secs)?
            .set_default("router.idle_timeout_secs", router.idle_timeout_secs)?
            .set_default("router.max_lifetime_secs", router.max_lifetime_secs)?
            .set_default("router.run_migrations", router.run_migrations)?
            .set_default("maintenance.enabled", maintenance.enabled)?
            .set_default("maintenance.interval_secs", maintenance.interval_secs)?
            .set_default("maintenance.retention_days", maintenance.retention_days)?
            .set_default(
                "maintenance.partition_months_ahead",
                maintenance.partition_months_ahead,
            )?
            .add_source(::config::File::with_name("credit-ledger").required(false))
            .add_source(
                ::config::Environment::with_prefix("LEDGER")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let mut config: Config = settings.try_deserialize()?;
        config.router.targets = config
            .router
            .targets
            .into_iter()
            .map(|(prefix, url)| (prefix.trim().to_lowercase(), url))
            .collect();

        Ok(config)
    }
}

/// Hide the password part of a connection url before logging it
pub fn mask_url(url: &str) -> String {
    if let (Some(scheme_end), Some(at_pos)) = (url.find("://"), url.rfind('@')) {
        if at_pos > scheme_end {
            let user_pass = &url[scheme_end + 3..at_pos];
            if let Some(colon_pos) = user_pass.find(':') {
                return format!(
                    "{}{}:***{}",
                    &url[..scheme_end + 3],
                    &user_pass[..colon_pos],
                    &url[at_pos..]
                );
            }
        }
    }
    url.to_string()
}
