//! Environment-driven settings and catalog file loading
//!
//! Both binaries call `dotenvy::dotenv()` first, so every key below can also
//! live in a `.env` file next to the working directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::traits::CatalogConfig;

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36";
pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash-image-preview";

/// Runtime settings shared by the harvester and the HTTP server.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root of the static site tree (`PUBLIC_DIR`)
    pub public_dir: PathBuf,
    /// Sub-directory of `public_dir` holding product directories (`CATALOG_COLLECTION`)
    pub collection: Option<String>,
    /// Product descriptor list (`CATALOG_FILE`)
    pub catalog_file: PathBuf,
    /// Server listen address (`BIND_ADDR`)
    pub bind_addr: String,
    /// User agent sent with page and image fetches (`USER_AGENT`)
    pub user_agent: String,
    pub gemini: GeminiSettings,
    /// Per-IP limiter for the try-on endpoint, disabled when `TRYON_RATE_LIMIT` is unset
    pub rate_limit: Option<RateLimitSettings>,
    /// Key the limiter on `Forwarded`/`X-Forwarded-For` instead of the socket peer
    /// (`TRUST_FORWARDED_HEADERS`); only safe behind a proxy that overwrites them
    pub trust_forwarded_headers: bool,
    /// Back-off before the single retry when the provider does not suggest one
    pub retry_delay: Duration,
    /// Largest accepted person upload
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct GeminiSettings {
    pub api_key: Option<String>,
    pub model: String,
    pub api_base: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub max_requests: u32,
    pub window: Duration,
}

impl Settings {
    /// Reads settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup, applying defaults for unset keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let collection = match lookup("CATALOG_COLLECTION") {
            Some(value) => Some(value.trim().trim_matches('/').to_string()).filter(|v| !v.is_empty()),
            None => Some("bogotto".to_string()),
        };

        let rate_limit = match get("TRYON_RATE_LIMIT") {
            Some(raw) => {
                let max_requests: u32 = parse_value("TRYON_RATE_LIMIT", &raw)?;
                if max_requests == 0 {
                    return Err(ConfigError::InvalidValue {
                        key: "TRYON_RATE_LIMIT",
                        value: raw,
                    });
                }
                let window_secs: u64 = parse_or(&get, "TRYON_RATE_WINDOW_SECS", 60)?;
                if window_secs == 0 {
                    return Err(ConfigError::InvalidValue {
                        key: "TRYON_RATE_WINDOW_SECS",
                        value: "0".to_string(),
                    });
                }
                Some(RateLimitSettings {
                    max_requests,
                    window: Duration::from_secs(window_secs),
                })
            }
            None => None,
        };

        Ok(Self {
            public_dir: get("PUBLIC_DIR").map_or_else(|| PathBuf::from("public"), PathBuf::from),
            collection,
            catalog_file: get("CATALOG_FILE")
                .map_or_else(|| PathBuf::from("catalog.json"), PathBuf::from),
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            user_agent: get("USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            gemini: GeminiSettings {
                api_key: get("GEMINI_API_KEY"),
                model: get("GEMINI_IMAGE_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
                api_base: get("GEMINI_API_BASE")
                    .unwrap_or_else(|| DEFAULT_GEMINI_API_BASE.to_string()),
            },
            rate_limit,
            trust_forwarded_headers: parse_or(&get, "TRUST_FORWARDED_HEADERS", false)?,
            retry_delay: Duration::from_secs(parse_or(&get, "TRYON_RETRY_DELAY_SECS", 20)?),
            max_upload_bytes: parse_or(&get, "MAX_UPLOAD_BYTES", 15 * 1024 * 1024)?,
        })
    }

    /// Directory holding one sub-directory per product.
    pub fn catalog_dir(&self) -> PathBuf {
        match &self.collection {
            Some(collection) => self.public_dir.join(collection),
            None => self.public_dir.clone(),
        }
    }

    /// Site-relative path under which a harvested file is served.
    pub fn site_path(&self, product_id: &str, filename: &str) -> String {
        match &self.collection {
            Some(collection) => format!("/{collection}/{product_id}/{filename}"),
            None => format!("/{product_id}/{filename}"),
        }
    }
}

fn parse_value<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
    })
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    get(key).map_or(Ok(default), |raw| parse_value(key, &raw))
}

impl CatalogConfig {
    /// Reads and validates a catalog file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::CatalogRead {
            path: path.to_path_buf(),
            source,
        })?;

        let catalog: Self =
            serde_json::from_str(&contents).map_err(|source| ConfigError::CatalogParse {
                path: path.to_path_buf(),
                source,
            })?;

        catalog.validate()?;
        Ok(catalog)
    }

    /// Ids must be unique non-empty slugs and every page URL absolute http(s).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();

        for product in &self.products {
            let id = product.id.as_str();
            if id.trim().is_empty() {
                return Err(ConfigError::EmptyProductId);
            }
            // ids become directory names verbatim
            if id.trim() != id || id.contains(['/', '\\']) || id == "." || id == ".." {
                return Err(ConfigError::InvalidValue {
                    key: "products[].id",
                    value: product.id.clone(),
                });
            }
            if !seen.insert(id) {
                return Err(ConfigError::DuplicateProductId(id.to_string()));
            }

            let valid_url = url::Url::parse(&product.url)
                .map(|u| matches!(u.scheme(), "http" | "https"))
                .unwrap_or(false);
            if !valid_url {
                return Err(ConfigError::InvalidProductUrl {
                    id: id.to_string(),
                    url: product.url.clone(),
                });
            }
        }

        Ok(())
    }
}
