//! Catalog configuration types and the network seam used by the harvester and the API

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::HarvestError;

/// Hand-maintained list of products to harvest, loaded once per run.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    /// Products in harvest order
    pub products: Vec<ProductDescriptor>,
    /// Image discovery switches
    #[serde(default)]
    pub discovery: DiscoveryOptions,
}

/// One catalog entry: a stable slug and the product page it is scraped from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProductDescriptor {
    /// Slug that doubles as the storage directory name
    pub id: String,
    /// Absolute product page URL
    pub url: String,
}

/// Which image sources feed the candidate set, and how candidates are canonicalised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoveryOptions {
    /// Scan inline `<script>` bodies for CDN product image URLs
    pub scan_scripts: bool,
    /// Remove the CDN `{width}` template segment so sized variants collapse
    pub strip_width_placeholders: bool,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            scan_scripts: true,
            strip_width_placeholders: true,
        }
    }
}

/// Source of remote pages and images.
///
/// Every call is a single GET with no retry; a non-success status maps to
/// [`HarvestError::Fetch`] so callers can decide on fallbacks themselves.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch a page body as text
    async fn fetch_text(&self, url: &str) -> Result<String, HarvestError>;

    /// Fetch a binary resource, typically an image
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, HarvestError>;
}
