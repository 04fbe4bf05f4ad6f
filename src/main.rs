use anyhow::Context;
use credit_ledger::{bootstrap, config::Config, server};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,credit_ledger=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before tracing so RUST_LOG from the file applies
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting credit ledger");

    let config = Config::from_env().context("loading configuration")?;

    let state = bootstrap::initialize_app_state(&config)
        .await
        .context("initializing application state")?;

    let router = state.ledger.router().clone();
    let app = server::create_app(state);
    server::run_server(app, &config.bind_address)
        .await
        .context("running HTTP server")?;

    router.close_all().await;
    info!("✓ Merchant pools closed");

    Ok(())
}
