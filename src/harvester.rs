use std::path::Path;

use tracing::{info, warn};

use crate::config::Settings;
use crate::error::HarvestError;
use crate::models::ProductMeta;
use crate::scraper::{image_extension, parse_product_page, width_fallback_url};
use crate::traits::{DiscoveryOptions, PageFetcher, ProductDescriptor};

/// Most images kept per product
pub const MAX_IMAGES_PER_PRODUCT: usize = 12;

/// Materialises product pages into `<catalog dir>/<id>/NN.<ext>` plus `meta.json`.
///
/// Products are processed one after another and images are downloaded one at
/// a time, so a storefront never sees parallel requests from a run.
pub struct Harvester<F> {
    fetcher: F,
    settings: Settings,
    options: DiscoveryOptions,
}

impl<F: PageFetcher> Harvester<F> {
    pub fn new(fetcher: F, settings: Settings, options: DiscoveryOptions) -> Self {
        Self {
            fetcher,
            settings,
            options,
        }
    }

    /// Harvests every product in order, stopping at the first failure.
    ///
    /// Products completed before the failure keep their files.
    pub async fn harvest_all(
        &self,
        products: &[ProductDescriptor],
    ) -> Result<Vec<ProductMeta>, HarvestError> {
        let base_dir = self.settings.catalog_dir();
        create_dir(&base_dir).await?;

        let mut saved = Vec::with_capacity(products.len());

        for product in products {
            let meta = self.harvest(product).await?;
            info!("Saved {}: {} images", meta.id, meta.images.len());
            saved.push(meta);
        }

        Ok(saved)
    }

    /// Fetches one product page, downloads its images and rewrites its metadata file.
    pub async fn harvest(&self, product: &ProductDescriptor) -> Result<ProductMeta, HarvestError> {
        info!("Fetching product page for {}: {}", product.id, product.url);

        let html = self.fetcher.fetch_text(&product.url).await?;
        let page = parse_product_page(&html, product, self.options)?;

        info!(
            "Found {} candidate images for {}",
            page.image_urls.len(),
            product.id
        );

        let dir = self.settings.catalog_dir().join(&product.id);
        create_dir(&dir).await?;

        let mut images = Vec::new();

        for (index, url) in page
            .image_urls
            .iter()
            .take(MAX_IMAGES_PER_PRODUCT)
            .enumerate()
        {
            let filename = format!("{:02}{}", index + 1, image_extension(url));
            let bytes = self.download(url).await?;

            let path = dir.join(&filename);
            tokio::fs::write(&path, &bytes)
                .await
                .map_err(|e| HarvestError::io(&path, e))?;

            images.push(self.settings.site_path(&product.id, &filename));
        }

        let meta = ProductMeta {
            id: product.id.clone(),
            title: page.title,
            url: product.url.clone(),
            price_text: page.price_text,
            images,
        };

        let meta_path = dir.join("meta.json");
        let json = serde_json::to_string_pretty(&meta)?;
        tokio::fs::write(&meta_path, json)
            .await
            .map_err(|e| HarvestError::io(&meta_path, e))?;

        Ok(meta)
    }

    /// Downloads an image, retrying once without the CDN width suffix.
    async fn download(&self, url: &str) -> Result<Vec<u8>, HarvestError> {
        match self.fetcher.fetch_bytes(url).await {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                let fallback = width_fallback_url(url);
                warn!("Download failed for {url} ({e}), retrying with {fallback}");
                self.fetcher.fetch_bytes(&fallback).await
            }
        }
    }
}

async fn create_dir(dir: &Path) -> Result<(), HarvestError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| HarvestError::io(dir, e))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use reqwest::StatusCode;
    use tempfile::TempDir;

    use super::*;

    const CDN: &str = "https://bogotto.eu/cdn/shop/products";

    #[derive(Default)]
    struct FakeFetcher {
        pages: HashMap<String, String>,
        assets: HashMap<String, Vec<u8>>,
        requests: Mutex<Vec<String>>,
    }

    impl FakeFetcher {
        fn page(mut self, url: &str, html: String) -> Self {
            self.pages.insert(url.to_string(), html);
            self
        }

        fn asset(mut self, url: &str, bytes: &[u8]) -> Self {
            self.assets.insert(url.to_string(), bytes.to_vec());
            self
        }

        fn requested(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }

        fn not_found(url: &str) -> HarvestError {
            HarvestError::Fetch {
                url: url.to_string(),
                status: StatusCode::NOT_FOUND,
            }
        }
    }

    #[async_trait]
    impl PageFetcher for FakeFetcher {
        async fn fetch_text(&self, url: &str) -> Result<String, HarvestError> {
            self.requests.lock().unwrap().push(url.to_string());
            self.pages.get(url).cloned().ok_or_else(|| Self::not_found(url))
        }

        async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, HarvestError> {
            self.requests.lock().unwrap().push(url.to_string());
            self.assets.get(url).cloned().ok_or_else(|| Self::not_found(url))
        }
    }

    fn product(id: &str) -> ProductDescriptor {
        ProductDescriptor {
            id: id.to_string(),
            url: format!("https://bogotto.eu/de/products/{id}"),
        }
    }

    fn settings(dir: &TempDir) -> Settings {
        let public = dir.path().display().to_string();
        Settings::from_lookup(|key| (key == "PUBLIC_DIR").then(|| public.clone())).unwrap()
    }

    fn page_with_images(names: &[&str]) -> String {
        let imgs: String = names
            .iter()
            .map(|name| format!(r#"<img src="{CDN}/{name}">"#))
            .collect();
        format!(r#"<h1>Covelo</h1><span class="price">€ 199,00</span>{imgs}"#)
    }

    #[tokio::test]
    async fn writes_numbered_images_and_metadata() {
        let dir = TempDir::new().unwrap();
        let covelo = product("covelo");
        let fetcher = FakeFetcher::default()
            .page(&covelo.url, page_with_images(&["front.jpg", "back.png?v=4"]))
            .asset(&format!("{CDN}/front.jpg"), b"front")
            .asset(&format!("{CDN}/back.png?v=4"), b"back");

        let harvester = Harvester::new(fetcher, settings(&dir), DiscoveryOptions::default());
        let meta = harvester.harvest(&covelo).await.unwrap();

        assert_eq!(meta.title, "Covelo");
        assert_eq!(meta.price_text, "€ 199,00");
        assert_eq!(
            meta.images,
            ["/bogotto/covelo/01.jpg", "/bogotto/covelo/02.png"]
        );

        let product_dir = dir.path().join("bogotto/covelo");
        assert_eq!(std::fs::read(product_dir.join("01.jpg")).unwrap(), b"front");
        assert_eq!(std::fs::read(product_dir.join("02.png")).unwrap(), b"back");

        let written = std::fs::read_to_string(product_dir.join("meta.json")).unwrap();
        assert!(written.contains("\n  \"priceText\": \"€ 199,00\""));
        let parsed: ProductMeta = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed, meta);
    }

    #[tokio::test]
    async fn keeps_at_most_twelve_images() {
        let dir = TempDir::new().unwrap();
        let covelo = product("covelo");
        let names: Vec<String> = (0..15).map(|i| format!("img{i}.jpg")).collect();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();

        let mut fetcher = FakeFetcher::default().page(&covelo.url, page_with_images(&name_refs));
        for name in &names {
            fetcher = fetcher.asset(&format!("{CDN}/{name}"), name.as_bytes());
        }

        let harvester = Harvester::new(fetcher, settings(&dir), DiscoveryOptions::default());
        let meta = harvester.harvest(&covelo).await.unwrap();

        assert_eq!(meta.images.len(), MAX_IMAGES_PER_PRODUCT);
        assert_eq!(meta.images.last().unwrap(), "/bogotto/covelo/12.jpg");
        assert!(!dir.path().join("bogotto/covelo/13.jpg").exists());
        // one page fetch plus twelve downloads
        assert_eq!(harvester.fetcher.requested().len(), 13);
    }

    #[tokio::test]
    async fn failed_download_retries_without_width_suffix() {
        let dir = TempDir::new().unwrap();
        let covelo = product("covelo");
        let fetcher = FakeFetcher::default()
            .page(&covelo.url, page_with_images(&["front_1065x.jpg"]))
            .asset(&format!("{CDN}/front.jpg"), b"full size");

        let harvester = Harvester::new(fetcher, settings(&dir), DiscoveryOptions::default());
        let meta = harvester.harvest(&covelo).await.unwrap();

        assert_eq!(meta.images, ["/bogotto/covelo/01.jpg"]);
        assert_eq!(
            harvester.fetcher.requested()[1..],
            [format!("{CDN}/front_1065x.jpg"), format!("{CDN}/front.jpg")]
        );
        assert_eq!(
            std::fs::read(dir.path().join("bogotto/covelo/01.jpg")).unwrap(),
            b"full size"
        );
    }

    #[tokio::test]
    async fn failed_fallback_aborts_without_metadata() {
        let dir = TempDir::new().unwrap();
        let covelo = product("covelo");
        let fetcher = FakeFetcher::default()
            .page(&covelo.url, page_with_images(&["ok.jpg", "gone_800x.jpg"]))
            .asset(&format!("{CDN}/ok.jpg"), b"ok");

        let harvester = Harvester::new(fetcher, settings(&dir), DiscoveryOptions::default());
        let err = harvester.harvest(&covelo).await.unwrap_err();

        assert!(matches!(err, HarvestError::Fetch { status, .. } if status == StatusCode::NOT_FOUND));
        assert!(dir.path().join("bogotto/covelo/01.jpg").exists());
        assert!(!dir.path().join("bogotto/covelo/meta.json").exists());
    }

    #[tokio::test]
    async fn page_fetch_failure_carries_status() {
        let dir = TempDir::new().unwrap();
        let harvester = Harvester::new(
            FakeFetcher::default(),
            settings(&dir),
            DiscoveryOptions::default(),
        );

        let err = harvester.harvest(&product("missing")).await.unwrap_err();

        match err {
            HarvestError::Fetch { url, status } => {
                assert_eq!(url, "https://bogotto.eu/de/products/missing");
                assert_eq!(status, StatusCode::NOT_FOUND);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn rerun_produces_same_filenames_when_order_changes() {
        let dir = TempDir::new().unwrap();
        let covelo = product("covelo");
        let assets = |fetcher: FakeFetcher| {
            fetcher
                .asset(&format!("{CDN}/a.jpg"), b"a")
                .asset(&format!("{CDN}/b.jpg"), b"b")
        };

        let first = Harvester::new(
            assets(FakeFetcher::default().page(&covelo.url, page_with_images(&["a.jpg", "b.jpg"]))),
            settings(&dir),
            DiscoveryOptions::default(),
        )
        .harvest(&covelo)
        .await
        .unwrap();

        let second = Harvester::new(
            assets(FakeFetcher::default().page(&covelo.url, page_with_images(&["b.jpg", "a.jpg"]))),
            settings(&dir),
            DiscoveryOptions::default(),
        )
        .harvest(&covelo)
        .await
        .unwrap();

        assert_eq!(first.images, second.images);
        assert_eq!(
            std::fs::read(dir.path().join("bogotto/covelo/01.jpg")).unwrap(),
            b"b"
        );
    }

    #[tokio::test]
    async fn harvest_all_stops_at_first_failing_product() {
        let dir = TempDir::new().unwrap();
        let blaze = product("blaze-air");
        let fetcher = FakeFetcher::default()
            .page(&blaze.url, page_with_images(&["blaze.jpg"]))
            .asset(&format!("{CDN}/blaze.jpg"), b"blaze");

        let harvester = Harvester::new(fetcher, settings(&dir), DiscoveryOptions::default());
        let result = harvester
            .harvest_all(&[blaze, product("covelo"), product("tampar-tour")])
            .await;

        assert!(result.is_err());
        assert!(dir.path().join("bogotto/blaze-air/meta.json").exists());
        assert!(!dir.path().join("bogotto/tampar-tour").exists());
        assert!(
            !harvester
                .fetcher
                .requested()
                .iter()
                .any(|url| url.ends_with("tampar-tour"))
        );
    }
}
