//! HTTP API: catalog listing, generic page scrape and virtual try-on

use std::sync::Arc;
use std::time::Duration;

use actix_files::Files;
use actix_multipart::{Multipart, MultipartError};
use actix_web::http::StatusCode;
use actix_web::http::header::{CACHE_CONTROL, CONTENT_TYPE, RETRY_AFTER};
use actix_web::{App, HttpRequest, HttpResponse, HttpServer, ResponseError, middleware, web};
use futures::TryStreamExt;
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::catalog;
use crate::config::Settings;
use crate::error::{CatalogError, HarvestError, TryOnError};
use crate::models::{ProductList, ScrapedImages};
use crate::ratelimit::{FixedWindowLimiter, RateLimitDecision, RateLimitStore};
use crate::scraper::{HttpFetcher, scrape_page_images};
use crate::traits::PageFetcher;
use crate::tryon::{self, GeminiClient, TryOnService};

// `productUrl` is a path or URL, never a document
const MAX_TEXT_FIELD_BYTES: usize = 8 * 1024;

/// Shared state handed to every request handler.
pub struct AppState {
    pub settings: Settings,
    pub fetcher: Arc<dyn PageFetcher>,
    pub tryon: TryOnService,
    pub limiter: Option<Arc<dyn RateLimitStore>>,
}

impl AppState {
    /// Wires the production collaborators: reqwest fetcher, Gemini client, in-memory limiter.
    pub fn from_settings(settings: Settings) -> Result<Self, HarvestError> {
        let fetcher = HttpFetcher::new(&settings.user_agent)?;
        let gemini = GeminiClient::new(fetcher.client().clone(), settings.gemini.clone());
        let tryon = TryOnService::new(Arc::new(gemini), settings.retry_delay);

        let limiter = settings.rate_limit.map(|limits| {
            info!(
                "Try-on rate limit: {} requests per {:?} per client",
                limits.max_requests, limits.window
            );
            Arc::new(FixedWindowLimiter::new(limits)) as Arc<dyn RateLimitStore>
        });

        Ok(Self {
            settings,
            fetcher: Arc::new(fetcher),
            tryon,
            limiter,
        })
    }
}

/// Errors surfaced to HTTP clients as `{"error": "<message>"}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Too many requests, retry in {} seconds", .retry_after.as_secs())]
    TooManyRequests { retry_after: Duration },

    #[error("{0}")]
    Internal(String),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut response = HttpResponse::build(self.status_code());
        if let Self::TooManyRequests { retry_after } = self {
            response.insert_header((RETRY_AFTER, retry_after.as_secs().to_string()));
        }
        response.json(serde_json::json!({ "error": self.to_string() }))
    }
}

impl From<CatalogError> for ApiError {
    fn from(e: CatalogError) -> Self {
        error!("Failed to list products: {e}");
        Self::Internal(e.to_string())
    }
}

impl From<TryOnError> for ApiError {
    fn from(e: TryOnError) -> Self {
        if e.is_client_error() {
            warn!("Rejected try-on request: {e}");
            Self::BadRequest(e.to_string())
        } else {
            error!("Try-on failed: {e}");
            Self::Internal(e.to_string())
        }
    }
}

/// Registers the API routes; static files are mounted separately by [`run`].
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(
        web::QueryConfig::default()
            .error_handler(|err, _req| ApiError::BadRequest(err.to_string()).into()),
    )
    .route("/healthz", web::get().to(healthz))
    .service(
        web::scope("/api")
            .route("/products", web::get().to(list_products))
            .route("/scrape", web::get().to(scrape))
            .route("/vton", web::post().to(try_on)),
    );
}

/// Serves the API and the public directory until the process is stopped.
pub async fn run(state: AppState) -> std::io::Result<()> {
    let bind_addr = state.settings.bind_addr.clone();
    let public_dir = state.settings.public_dir.clone();
    let data = web::Data::new(state);

    info!("Listening on {bind_addr}, serving {}", public_dir.display());

    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .wrap(middleware::Logger::default())
            .configure(configure)
            .service(Files::new("/", public_dir.clone()))
    })
    .bind(bind_addr)?
    .run()
    .await
}

async fn healthz() -> HttpResponse {
    HttpResponse::Ok().body("ok")
}

async fn list_products(state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let products = catalog::list_products(&state.settings.catalog_dir()).await?;
    Ok(HttpResponse::Ok().json(ProductList { products }))
}

#[derive(Deserialize)]
struct ScrapeQuery {
    url: Option<String>,
}

async fn scrape(
    state: web::Data<AppState>,
    query: web::Query<ScrapeQuery>,
) -> Result<HttpResponse, ApiError> {
    let page_url = query
        .url
        .as_deref()
        .filter(|u| u.starts_with("http://") || u.starts_with("https://"))
        .and_then(|u| Url::parse(u).ok())
        .ok_or_else(|| ApiError::BadRequest("Provide ?url".to_string()))?;

    let html = match state.fetcher.fetch_text(page_url.as_str()).await {
        Ok(html) => html,
        Err(HarvestError::Fetch { status, .. }) => {
            return Err(ApiError::BadRequest(format!(
                "Fetch failed {}",
                status.as_u16()
            )));
        }
        Err(e) => {
            error!("Scrape of {page_url} failed: {e}");
            return Err(ApiError::Internal(e.to_string()));
        }
    };

    let images = scrape_page_images(&html, &page_url);
    info!("Scraped {} images from {page_url}", images.len());

    Ok(HttpResponse::Ok().json(ScrapedImages { images }))
}

#[derive(Default)]
struct TryOnForm {
    person: Option<Vec<u8>>,
    product_url: Option<String>,
}

async fn try_on(
    req: HttpRequest,
    payload: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    if let Some(limiter) = &state.limiter {
        let client = client_key(&req, state.settings.trust_forwarded_headers);

        if let RateLimitDecision::Rejected { retry_after } = limiter.check(&client).await {
            warn!("Rate limited try-on request from {client}");
            return Err(ApiError::TooManyRequests { retry_after });
        }
    }

    let is_multipart = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("multipart/form-data"));
    if !is_multipart {
        return Err(ApiError::BadRequest(
            "Expected multipart/form-data".to_string(),
        ));
    }

    let form = read_form(
        Multipart::new(req.headers(), payload),
        state.settings.max_upload_bytes,
    )
    .await?;

    let (Some(person), Some(product_url)) = (form.person, form.product_url) else {
        return Err(ApiError::BadRequest(
            "Missing person image or productUrl".to_string(),
        ));
    };

    info!("Try-on requested for {product_url}");

    let product = tryon::load_product_image(
        &product_url,
        &state.settings.public_dir,
        state.fetcher.as_ref(),
    )
    .await?;
    let image = state.tryon.render(&person, &product).await?;

    Ok(HttpResponse::Ok()
        .content_type("image/png")
        .insert_header((CACHE_CONTROL, "no-store"))
        .body(image))
}

/// Address the rate limiter counts against.
///
/// Forwarded headers are client-controlled unless a proxy rewrites them, so
/// they are only consulted when explicitly trusted.
fn client_key(req: &HttpRequest, trust_forwarded_headers: bool) -> String {
    if trust_forwarded_headers
        && let Some(addr) = req.connection_info().realip_remote_addr()
    {
        return addr.to_string();
    }

    req.peer_addr()
        .map_or_else(|| "unknown".to_string(), |addr| addr.ip().to_string())
}

async fn read_form(mut multipart: Multipart, max_upload_bytes: usize) -> Result<TryOnForm, ApiError> {
    let invalid = |e: MultipartError| ApiError::BadRequest(format!("Invalid multipart body: {e}"));
    let mut form = TryOnForm::default();

    while let Some(mut field) = multipart.try_next().await.map_err(invalid)? {
        let name = field
            .content_disposition()
            .get_name()
            .unwrap_or_default()
            .to_string();
        let limit = if name == "person" {
            max_upload_bytes
        } else {
            MAX_TEXT_FIELD_BYTES
        };

        let mut data = Vec::new();
        while let Some(chunk) = field.try_next().await.map_err(invalid)? {
            if data.len() + chunk.len() > limit {
                return Err(ApiError::BadRequest(format!(
                    "Field {name} exceeds {limit} bytes"
                )));
            }
            data.extend_from_slice(&chunk);
        }

        match name.as_str() {
            "person" => form.person = Some(data).filter(|d| !d.is_empty()),
            "productUrl" => {
                form.product_url = String::from_utf8(data)
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty());
            }
            _ => {}
        }
    }

    Ok(form)
}
