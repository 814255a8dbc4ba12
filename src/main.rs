use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bogotto_tryon::config::Settings;
use bogotto_tryon::server::{self, AppState};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Bogotto try-on server");

    let settings = Settings::from_env()?;
    let state = AppState::from_settings(settings)?;

    server::run(state).await?;
    Ok(())
}
