use ocguard_common::{VERSION, config::OcguardConfig, db::init_db};
use ocguard_manager::{ManagerSettings, run_quota_manager};
use ocguard_ocserv::{OcservClient, check_installation};
use ocguard_quota::{PgStore, ReconciliationEngine};
use secrecy::ExposeSecret;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[macro_use]
extern crate tracing;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    if dotenvy::from_filename(".env.local").is_err() {
        dotenvy::dotenv().ok();
    }
    let config = OcguardConfig::new();
    // initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{},sqlx=warn", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting ocguard version v{VERSION}");
    debug!("Using config: {config:?}");

    check_installation().await?;

    let pool = init_db(
        &config.database_host,
        config.database_port,
        &config.database_name,
        &config.database_user,
        config.database_password.expose_secret(),
    )
    .await?;

    let client = OcservClient::new(&config.ocpasswd_file);
    info!(
        "Managing ocserv accounts in {}",
        client.password_file().display()
    );
    let engine = ReconciliationEngine::new(PgStore::new(pool), client);
    let settings = ManagerSettings::from(&config);

    tokio::select! {
        res = run_quota_manager(engine, settings) => {
            // the manager only returns once ocserv has been stopped
            res?;
        }
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("Received shutdown signal, exiting");
        }
    }

    Ok(())
}
