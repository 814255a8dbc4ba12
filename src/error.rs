//! Error types shared by the harvester, the try-on pipeline and configuration loading

use std::path::PathBuf;

use reqwest::StatusCode;
use thiserror::Error;

/// Failures while harvesting a product page and its images.
#[derive(Error, Debug)]
pub enum HarvestError {
    /// The remote server answered with a non-success status.
    #[error("Failed to fetch {url} ({status})")]
    Fetch { url: String, status: StatusCode },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize product metadata: {0}")]
    Json(#[from] serde_json::Error),
}

impl HarvestError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failures while reading harvested metadata back for the listing API.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed product metadata in {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Invalid environment values or catalog files.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Failed to read catalog file {}: {source}", .path.display())]
    CatalogRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse catalog file {}: {source}", .path.display())]
    CatalogParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Product id must not be empty")]
    EmptyProductId,

    #[error("Duplicate product id: {0}")]
    DuplicateProductId(String),

    #[error("Product {id} has an invalid page URL: {url}")]
    InvalidProductUrl { id: String, url: String },
}

/// Failures in the virtual try-on pipeline.
#[derive(Error, Debug)]
pub enum TryOnError {
    #[error("GEMINI_API_KEY is not configured")]
    MissingApiKey,

    #[error("Invalid product image reference: {0}")]
    InvalidProductReference(String),

    #[error("Product image not found: {0}")]
    ProductImageNotFound(String),

    #[error("Failed to fetch product image: {0}")]
    ProductImageFetch(StatusCode),

    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Image processing failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("Provider returned invalid image data: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("Image provider error ({status}): {message}")]
    Provider { status: StatusCode, message: String },

    #[error("Image provider is still rate limiting after retry")]
    RateLimited,

    /// The provider answered without an image; carries whatever text it sent instead.
    #[error("{0}")]
    NoImage(String),
}

impl TryOnError {
    /// Whether the failure was caused by the caller's input rather than the server.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidProductReference(_)
                | Self::ProductImageNotFound(_)
                | Self::ProductImageFetch(_)
        )
    }
}
