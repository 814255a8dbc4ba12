//! # Virtual Try-On
//!
//! This module composes a visitor's photo with a catalog product image by
//! asking a hosted Gemini image model to render the garment onto the person.
//!
//! ## Pipeline
//!
//! 1. **Resolve** the product reference: a site-relative path is read from the
//!    public directory, anything else must be an absolute http(s) URL.
//! 2. **Downscale** both images to fit inside 1024x1024 and re-encode them as
//!    JPEG, which keeps the request small and the token count bounded.
//! 3. **Generate** with a fixed prompt, person image first, product second.
//! 4. **Retry once** if the provider reports a rate limit, waiting for the
//!    `RetryInfo.retryDelay` it suggests or the configured default.
//! 5. **Extract** the first inline image of the first candidate.
//!
//! ## Environment Configuration
//!
//! `GEMINI_API_KEY` enables generation. Without it the server still starts and
//! every try-on request fails with a JSON error.

use std::io::{Cursor, ErrorKind};
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::GenericImageView;
use reqwest::{Client, StatusCode};
use tracing::{info, warn};

use crate::config::GeminiSettings;
use crate::error::{HarvestError, TryOnError};
use crate::models::{
    Content, GenerateContentRequest, GenerateContentResponse, Part, ProviderError,
    ProviderErrorEnvelope,
};
use crate::traits::PageFetcher;

/// Instruction sent with every try-on request.
pub const TRYON_PROMPT: &str = "Compose a realistic virtual try-on: put the garment from the second image onto the person in the first image. \
Maintain natural body shape, lighting, and pose. Seamlessly align edges, avoid artifacts, and keep background intact. \
Return only the final composited photo.";

/// Longest edge of images sent to the provider.
pub const MAX_DIMENSION: u32 = 1024;

const JPEG_QUALITY: u8 = 90;

/// Result of a single generation attempt.
#[derive(Debug, Clone)]
pub enum GenerationOutcome {
    Completed(GenerateContentResponse),
    /// The provider refused because of quota; carries its suggested back-off if any
    RateLimited { retry_after: Option<Duration> },
}

/// A hosted model able to answer `generateContent` requests.
///
/// Rate limiting is reported as [`GenerationOutcome::RateLimited`] rather than
/// an error so [`TryOnService`] can own the retry policy.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(
        &self,
        request: &GenerateContentRequest,
    ) -> Result<GenerationOutcome, TryOnError>;
}

/// REST client for the Gemini `generateContent` endpoint.
///
/// ## Fields
///
/// - `client`: shared HTTP client, cloned from the page fetcher so connection
///   pools are reused
/// - `settings`: API key, model name and API base URL
///
/// ## Error Handling
///
/// - **Missing API key**: [`TryOnError::MissingApiKey`] before any network call
/// - **HTTP 429 / error code 429**: reported as a rate-limited outcome
/// - **Other error envelopes or non-success statuses**: [`TryOnError::Provider`] with the provider's
///   error message, or the raw body when it is not a Google error envelope
#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    settings: GeminiSettings,
}

impl GeminiClient {
    pub fn new(client: Client, settings: GeminiSettings) -> Self {
        if settings.api_key.is_none() {
            warn!("GEMINI_API_KEY not set - virtual try-on will be disabled");
        }

        Self { client, settings }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.settings.api_base.trim_end_matches('/'),
            urlencoding::encode(&self.settings.model)
        )
    }
}

#[async_trait]
impl ImageGenerator for GeminiClient {
    async fn generate(
        &self,
        request: &GenerateContentRequest,
    ) -> Result<GenerationOutcome, TryOnError> {
        let api_key = self
            .settings
            .api_key
            .as_deref()
            .ok_or(TryOnError::MissingApiKey)?;

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        // quota errors can arrive with any status, including 200
        let provider_error = serde_json::from_str::<ProviderErrorEnvelope>(&body)
            .ok()
            .map(|envelope| envelope.error);

        let rate_limited = status == StatusCode::TOO_MANY_REQUESTS
            || provider_error.as_ref().is_some_and(|e| e.code == 429);
        if rate_limited {
            return Ok(GenerationOutcome::RateLimited {
                retry_after: provider_error.as_ref().and_then(retry_delay),
            });
        }

        if status.is_success() && provider_error.is_none() {
            let parsed = serde_json::from_str(&body).map_err(|e| TryOnError::Provider {
                status,
                message: format!("Unexpected response body: {e}"),
            })?;
            return Ok(GenerationOutcome::Completed(parsed));
        }

        Err(TryOnError::Provider {
            status,
            message: provider_error
                .map(|e| e.message)
                .filter(|m| !m.is_empty())
                .unwrap_or(body),
        })
    }
}

/// Back-off suggested by a `google.rpc.RetryInfo` detail.
///
/// Only the leading whole seconds are used, so `"20s"` and `"20.7s"` both mean
/// twenty seconds; anything without leading digits is ignored.
pub fn retry_delay(error: &ProviderError) -> Option<Duration> {
    let raw = error
        .details
        .iter()
        .filter(|detail| detail.type_url.contains("RetryInfo"))
        .find_map(|detail| detail.retry_delay.as_deref())?;

    let digits: String = raw
        .trim()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok().map(Duration::from_secs)
}

/// Runs try-on generations with a single rate-limit retry.
#[derive(Clone)]
pub struct TryOnService {
    generator: Arc<dyn ImageGenerator>,
    default_retry_delay: Duration,
}

impl TryOnService {
    pub fn new(generator: Arc<dyn ImageGenerator>, default_retry_delay: Duration) -> Self {
        Self {
            generator,
            default_retry_delay,
        }
    }

    /// Downscales both photos and returns the composited image bytes.
    pub async fn render(&self, person: &[u8], product: &[u8]) -> Result<Vec<u8>, TryOnError> {
        let person = downscale(person)?;
        let product = downscale(product)?;

        let request = build_request(&person, &product);
        self.generate_with_retry(&request).await
    }

    /// Issues the request, and exactly one more after a back-off if the first is rate limited.
    pub async fn generate_with_retry(
        &self,
        request: &GenerateContentRequest,
    ) -> Result<Vec<u8>, TryOnError> {
        let mut outcome = self.generator.generate(request).await?;

        if let GenerationOutcome::RateLimited { retry_after } = outcome {
            let delay = retry_after.unwrap_or(self.default_retry_delay);
            warn!("Image provider rate limited, retrying once in {delay:?}");
            tokio::time::sleep(delay).await;
            outcome = self.generator.generate(request).await?;
        }

        match outcome {
            GenerationOutcome::Completed(response) => {
                let image = extract_image(&response)?;
                info!("Try-on image generated ({} bytes)", image.len());
                Ok(image)
            }
            GenerationOutcome::RateLimited { .. } => Err(TryOnError::RateLimited),
        }
    }
}

fn build_request(person_jpeg: &[u8], product_jpeg: &[u8]) -> GenerateContentRequest {
    GenerateContentRequest {
        contents: vec![Content {
            role: Some("user".to_string()),
            parts: vec![
                Part::text(TRYON_PROMPT),
                Part::inline("image/jpeg", STANDARD.encode(person_jpeg)),
                Part::inline("image/jpeg", STANDARD.encode(product_jpeg)),
            ],
        }],
    }
}

/// Decodes the first inline image, or turns the text parts into an error.
pub fn extract_image(response: &GenerateContentResponse) -> Result<Vec<u8>, TryOnError> {
    let parts = response.first_parts();

    if let Some(inline) = parts.iter().find_map(|p| p.inline_data.as_ref()) {
        return Ok(STANDARD.decode(inline.data.trim())?);
    }

    let text = parts
        .iter()
        .filter_map(|p| p.text.as_deref())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    Err(TryOnError::NoImage(if text.is_empty() {
        "No image returned".to_string()
    } else {
        text
    }))
}

/// Fits an image inside [`MAX_DIMENSION`] square (never enlarging) and re-encodes it as JPEG.
pub fn downscale(bytes: &[u8]) -> Result<Vec<u8>, TryOnError> {
    let decoded = image::load_from_memory(bytes)?;
    let (width, height) = decoded.dimensions();

    let fitted = if width > MAX_DIMENSION || height > MAX_DIMENSION {
        decoded.resize(MAX_DIMENSION, MAX_DIMENSION, FilterType::Triangle)
    } else {
        decoded
    };

    // JPEG has no alpha channel
    let rgb = fitted.to_rgb8();

    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY).encode_image(&rgb)?;
    Ok(out.into_inner())
}

/// Loads the product image a try-on request refers to.
///
/// `/`-prefixed references are files under `public_dir`; other references
/// must be absolute http(s) URLs and are fetched once.
pub async fn load_product_image(
    reference: &str,
    public_dir: &Path,
    fetcher: &dyn PageFetcher,
) -> Result<Vec<u8>, TryOnError> {
    if let Some(relative) = reference.strip_prefix('/') {
        let relative = Path::new(relative);
        let escapes_root = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes_root || relative.as_os_str().is_empty() {
            return Err(TryOnError::InvalidProductReference(reference.to_string()));
        }

        let path = public_dir.join(relative);
        return match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(TryOnError::ProductImageNotFound(reference.to_string()))
            }
            Err(source) => Err(TryOnError::Io { path, source }),
        };
    }

    if !(reference.starts_with("http://") || reference.starts_with("https://")) {
        return Err(TryOnError::InvalidProductReference(reference.to_string()));
    }

    fetcher.fetch_bytes(reference).await.map_err(|e| match e {
        HarvestError::Fetch { status, .. } => TryOnError::ProductImageFetch(status),
        HarvestError::Http(e) => TryOnError::Http(e),
        other => TryOnError::InvalidProductReference(other.to_string()),
    })
}
