use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bogotto_tryon::config::Settings;
use bogotto_tryon::harvester::Harvester;
use bogotto_tryon::scraper::HttpFetcher;
use bogotto_tryon::traits::CatalogConfig;

/// Scrape the configured product pages into `<public dir>/<collection>/<id>/`
#[derive(Parser, Debug)]
#[command(name = "harvest", version)]
struct Args {
    /// Catalog file listing product ids and page URLs (defaults to CATALOG_FILE)
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Output root (defaults to PUBLIC_DIR)
    #[arg(long)]
    public_dir: Option<PathBuf>,

    /// Only harvest these product ids; repeatable
    #[arg(long = "only", value_name = "ID")]
    only: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("Harvest aborted: {e:#}");
        return Err(e);
    }

    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let mut settings = Settings::from_env()?;
    if let Some(public_dir) = args.public_dir {
        settings.public_dir = public_dir;
    }

    let catalog_path = args.catalog.unwrap_or_else(|| settings.catalog_file.clone());
    let catalog = CatalogConfig::load(&catalog_path)
        .with_context(|| format!("Loading catalog {}", catalog_path.display()))?;

    if let Some(unknown) = args
        .only
        .iter()
        .find(|id| !catalog.products.iter().any(|p| &p.id == *id))
    {
        bail!("Unknown product id: {unknown}");
    }

    let products: Vec<_> = catalog
        .products
        .iter()
        .filter(|p| args.only.is_empty() || args.only.contains(&p.id))
        .cloned()
        .collect();

    info!(
        "Harvesting {} products into {}",
        products.len(),
        settings.catalog_dir().display()
    );

    let fetcher = HttpFetcher::new(&settings.user_agent)?;
    let harvester = Harvester::new(fetcher, settings, catalog.discovery);
    let saved = harvester.harvest_all(&products).await?;

    let images: usize = saved.iter().map(|meta| meta.images.len()).sum();
    info!("Harvest complete: {} products, {} images", saved.len(), images);

    Ok(())
}
