//! Data models for harvested product metadata and Gemini API payloads

use serde::{Deserialize, Serialize};

/// Product metadata written to `<id>/meta.json` by the harvester and served by the listing API
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductMeta {
    pub id: String,
    pub title: String,
    /// Product page the record was scraped from
    pub url: String,
    /// Price exactly as displayed on the page, parsed at render time if at all
    #[serde(rename = "priceText")]
    pub price_text: String,
    /// Site-relative image paths in discovery order
    pub images: Vec<String>,
}

impl ProductMeta {
    /// Stand-in record for a product directory without metadata
    pub fn placeholder(id: &str) -> Self {
        Self {
            id: id.to_string(),
            title: id.to_string(),
            ..Self::default()
        }
    }
}

/// Body of the `/api/products` response
#[derive(Debug, Serialize, Deserialize)]
pub struct ProductList {
    pub products: Vec<ProductMeta>,
}

/// Body of the `/api/scrape` response
#[derive(Debug, Serialize, Deserialize)]
pub struct ScrapedImages {
    pub images: Vec<String>,
}

/// `generateContent` request payload
#[derive(Debug, Serialize)]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
}

/// A turn in the conversation, made of ordered parts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// Either a text fragment or an inline binary blob
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }

    pub fn inline(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            text: None,
            inline_data: Some(InlineData {
                mime_type: mime_type.into(),
                data: data.into(),
            }),
        }
    }
}

/// Base64 payload with its MIME type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

/// `generateContent` success payload
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
}

impl GenerateContentResponse {
    /// Parts of the first candidate, empty when the provider returned none
    pub fn first_parts(&self) -> &[Part] {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.as_slice())
            .unwrap_or_default()
    }
}

/// Google API error envelope: `{"error": {...}}`
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderErrorEnvelope {
    pub error: ProviderError,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderError {
    pub code: u16,
    pub message: String,
    pub status: String,
    pub details: Vec<ErrorDetail>,
}

/// One entry of `error.details`; only `RetryInfo` entries are interpreted
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ErrorDetail {
    #[serde(rename = "@type")]
    pub type_url: String,
    #[serde(rename = "retryDelay")]
    pub retry_delay: Option<String>,
}
