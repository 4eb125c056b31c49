//! Catalog service client
//!
//! Registers a finished collection so it can be found by id. Only the
//! default manifest output mode talks to the catalog.

use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

/// HTTP connect timeout in seconds
pub const HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;

/// HTTP request timeout in seconds
pub const HTTP_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Catalog errors
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Client could not be built or request could not be sent
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Catalog answered with a non-success status
    #[error("catalog rejected request: {status}: {body}")]
    ApiError {
        /// HTTP status code
        status: u16,
        /// Response body, for diagnostics
        body: String,
    },
}

/// Result type for catalog operations
pub type CatalogResult<T> = Result<T, CatalogError>;

/// Client for the collections endpoint of the catalog service
pub struct CatalogClient {
    client: Client,
    base_url: String,
    token: String,
}

impl CatalogClient {
    /// Create a client for `api_host`.
    ///
    /// A bare host name is reached over HTTPS; a host given with an explicit
    /// `http://` or `https://` scheme is used as is.
    pub fn new(api_host: &str, token: impl Into<String>) -> CatalogResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(HTTP_REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| CatalogError::HttpError(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url(api_host),
            token: token.into(),
        })
    }

    /// Full URL of the collections endpoint
    pub fn collections_url(&self) -> String {
        format!("{}/arvados/v1/collections", self.base_url)
    }

    /// Register a collection under `id` with the given manifest
    pub async fn create_collection(&self, id: &str, manifest_text: &str) -> CatalogResult<()> {
        let url = self.collections_url();
        debug!(url = %url, id, "Registering collection");

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, format!("OAuth2 {}", self.token))
            .json(&collection_body(id, manifest_text))
            .send()
            .await
            .map_err(|e| CatalogError::HttpError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(CatalogError::ApiError {
                status: status.as_u16(),
                body,
            });
        }

        info!(id, "Collection registered");
        Ok(())
    }
}

fn base_url(api_host: &str) -> String {
    let host = api_host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{host}")
    }
}

/// Request body for creating a collection
pub fn collection_body(id: &str, manifest_text: &str) -> serde_json::Value {
    json!({
        "collection": {
            "uuid": id,
            "manifest_text": manifest_text,
        }
    })
}
