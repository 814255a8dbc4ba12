//! HTML extraction for product pages and arbitrary pages
//!
//! Parsing is synchronous: `scraper::Html` is not `Send`, so documents are
//! parsed and dropped before any await point in the callers.

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

use crate::error::HarvestError;
use crate::traits::{DiscoveryOptions, PageFetcher, ProductDescriptor};

/// Most images returned by the generic page scrape
pub const MAX_SCRAPED_IMAGES: usize = 48;

static TITLE_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h1").expect("valid title selector"));
// Three spellings seen across storefront templates
static PRICE_SELECTOR: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("[class*='price'], .price, .product__price").expect("valid price selector")
});
static IMG_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("img").expect("valid img selector"));
static SCRIPT_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("script").expect("valid script selector"));

static PRODUCT_IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)cdn/shop/products/.+\.(jpg|jpeg|png|webp)").expect("valid product image regex")
});
static SCRIPT_IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)(https?:)?//[^"'\s]+cdn/shop/products/[^"'\s]+\.(?:jpg|jpeg|png|webp)(?:\?v=\d+)?"#,
    )
    .expect("valid script image regex")
});
// `_{width}x` as written in templates, and its percent-encoded form after URL resolution
static WIDTH_PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)_(?:%7Bwidth%7D|\{width\})x").expect("valid width placeholder regex")
});
static WIDTH_SUFFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)_(\d+)x(\.(?:jpg|jpeg|png|webp))").expect("valid width suffix regex")
});
static GENERIC_IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\.(jpg|jpeg|png|webp)(\?|$)").expect("valid generic image regex")
});

/// Everything the harvester needs from one product page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductPage {
    pub title: String,
    pub price_text: String,
    /// Canonical image URLs, de-duplicated, in discovery order
    pub image_urls: Vec<String>,
}

/// reqwest-backed [`PageFetcher`] sending a browser-like user agent.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str) -> Result<Self, HarvestError> {
        let client = Client::builder().user_agent(user_agent).build()?;
        Ok(Self { client })
    }

    /// Underlying client, shared with other outbound integrations
    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, HarvestError> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(HarvestError::Fetch {
                url: url.to_string(),
                status: response.status(),
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String, HarvestError> {
        Ok(self.get(url).await?.text().await?)
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, HarvestError> {
        Ok(self.get(url).await?.bytes().await?.to_vec())
    }
}

/// Insertion-ordered set of image URLs
#[derive(Default)]
struct ImageCandidates {
    seen: HashSet<String>,
    ordered: Vec<String>,
}

impl ImageCandidates {
    fn insert(&mut self, url: String) {
        if self.seen.insert(url.clone()) {
            self.ordered.push(url);
        }
    }

    fn into_vec(self) -> Vec<String> {
        self.ordered
    }
}

/// Extracts title, price text and product image URLs from a product page.
pub fn parse_product_page(
    html: &str,
    product: &ProductDescriptor,
    options: DiscoveryOptions,
) -> Result<ProductPage, HarvestError> {
    let base = Url::parse(&product.url).map_err(|source| HarvestError::InvalidUrl {
        url: product.url.clone(),
        source,
    })?;
    let document = Html::parse_document(html);

    let title = first_text(&document, &TITLE_SELECTOR)
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| product.id.clone());
    let price_text = first_text(&document, &PRICE_SELECTOR).unwrap_or_default();

    Ok(ProductPage {
        title,
        price_text,
        image_urls: discover_product_images(&document, &base, options),
    })
}

fn first_text(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
}

fn image_source<'a>(img: &ElementRef<'a>) -> Option<&'a str> {
    let el = img.value();
    ["src", "data-src", "data-original"]
        .into_iter()
        .filter_map(|attr| el.attr(attr))
        .find(|value| !value.trim().is_empty())
}

fn discover_product_images(document: &Html, base: &Url, options: DiscoveryOptions) -> Vec<String> {
    let mut candidates = ImageCandidates::default();

    let mut consider = |raw: &str| match base.join(raw.trim()) {
        Ok(resolved) => {
            let normalized = normalize_image_url(resolved.as_str(), options);
            if is_product_image(&normalized) {
                candidates.insert(normalized);
            }
        }
        Err(e) => debug!("Skipping unresolvable image reference {raw:?}: {e}"),
    };

    for img in document.select(&IMG_SELECTOR) {
        if let Some(src) = image_source(&img) {
            consider(src);
        }

        if let Some(srcset) = img.value().attr("srcset") {
            for candidate in srcset.split(',') {
                if let Some(url) = candidate.split_whitespace().next() {
                    consider(url);
                }
            }
        }
    }

    if options.scan_scripts {
        for script in document.select(&SCRIPT_SELECTOR) {
            let body = script.text().collect::<String>();
            for found in SCRIPT_IMAGE_RE.find_iter(&body) {
                let normalized = normalize_image_url(found.as_str(), options);
                if is_product_image(&normalized) {
                    candidates.insert(normalized);
                }
            }
        }
    }

    candidates.into_vec()
}

/// Canonicalises a candidate image URL.
///
/// Protocol-relative URLs become `https:`; with `strip_width_placeholders`
/// the CDN `_{width}x` template segment is removed in either encoding.
pub fn normalize_image_url(url: &str, options: DiscoveryOptions) -> String {
    let absolute = if url.starts_with("//") {
        format!("https:{url}")
    } else {
        url.to_string()
    };

    if options.strip_width_placeholders {
        WIDTH_PLACEHOLDER_RE.replace_all(&absolute, "").into_owned()
    } else {
        absolute
    }
}

/// Whether the URL points into the CDN product image directory with an image extension
pub fn is_product_image(url: &str) -> bool {
    PRODUCT_IMAGE_RE.is_match(url)
}

/// Alternative download URL with the CDN's explicit `_<width>x` size suffix removed.
pub fn width_fallback_url(url: &str) -> String {
    WIDTH_SUFFIX_RE.replace(url, "$2").into_owned()
}

/// File extension (with the leading dot) of the URL path, `.jpg` when absent.
pub fn image_extension(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            Path::new(u.path())
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| format!(".{ext}"))
        })
        .unwrap_or_else(|| ".jpg".to_string())
}

/// Collects up to [`MAX_SCRAPED_IMAGES`] image URLs referenced by `<img>` tags of any page.
pub fn scrape_page_images(html: &str, page_url: &Url) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut candidates = ImageCandidates::default();

    for img in document.select(&IMG_SELECTOR) {
        let Some(src) = image_source(&img) else {
            continue;
        };
        if let Ok(resolved) = page_url.join(src.trim())
            && GENERIC_IMAGE_RE.is_match(resolved.as_str())
        {
            candidates.insert(resolved.into());
        }
    }

    let mut images = candidates.into_vec();
    images.truncate(MAX_SCRAPED_IMAGES);
    images
}
