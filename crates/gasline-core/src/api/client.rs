//! API client for the storefront REST API.
//!
//! Only the two idempotent catalog reads used for snapshots live here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize};
use tracing::{debug, warn};

use crate::models::{AgenciesData, Agency, Product, ProductsData};
use crate::sync::SnapshotSource;

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
pub const REQUEST_TIMEOUT_SECS: u64 = 20;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Standard `{success, data, message}` wrapper around every response.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: Option<bool>,
    data: Option<T>,
    message: Option<String>,
}

impl<T: Default> Envelope<T> {
    /// A missing `success` flag or missing `data` is an empty result, not a
    /// failure. Only an explicit `success: false` is.
    fn into_data(self, what: &str) -> Result<T, ApiError> {
        if self.success == Some(false) {
            return Err(ApiError::Rejected(
                self.message
                    .unwrap_or_else(|| format!("{} request was not successful", what)),
            ));
        }
        Ok(self.data.unwrap_or_default())
    }
}

/// API client for the storefront backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Arc<str>,
    token: Option<Arc<str>>,
}

impl ApiClient {
    /// Create a new API client rooted at `base_url` (e.g. `https://api.example.com/api`).
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: Arc::from(base_url.trim_end_matches('/')),
            token: None,
        })
    }

    /// Set the bearer token for authenticated requests
    pub fn set_token(&mut self, token: impl Into<Arc<str>>) {
        self.token = Some(token.into());
    }

    /// Create a new ApiClient with the given token, sharing the connection pool.
    pub fn with_token(&self, token: impl Into<Arc<str>>) -> Self {
        Self {
            client: self.client.clone(),
            base_url: Arc::clone(&self.base_url),
            token: Some(token.into()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header(header::ACCEPT, "application/json");
        match self.token {
            Some(ref token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(
        response: reqwest::Response,
    ) -> Result<Option<reqwest::Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T, ApiError> {
        let url = self.url(path);
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = self
                .authorized(self.client.get(&url).query(query))
                .send()
                .await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => {
                    let text = response.text().await?;
                    return serde_json::from_str(&text).map_err(|e| {
                        ApiError::InvalidResponse(format!("Failed to parse response from {}: {}", url, e))
                    });
                }
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(url = %url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                }
            }
        }
    }

    // ===== Catalog Fetching Methods =====

    /// Fetch every agency currently accepting orders
    pub async fn fetch_active_agencies(&self) -> Result<Vec<Agency>, ApiError> {
        let envelope: Envelope<AgenciesData> = self.get("/agencies/active", &[]).await?;
        let data = envelope.into_data("Agency list")?;
        debug!(count = data.agencies.len(), "Agencies response received");
        Ok(data.agencies)
    }

    /// Fetch the product list of one agency
    pub async fn fetch_products(&self, agency_id: &str) -> Result<Vec<Product>, ApiError> {
        let envelope: Envelope<ProductsData> =
            self.get("/products", &[("agencyId", agency_id)]).await?;
        let data = envelope.into_data("Product list")?;
        debug!(agency = %agency_id, count = data.products.len(), "Products response received");
        Ok(data.products)
    }
}

#[async_trait]
impl SnapshotSource for ApiClient {
    async fn fetch_agencies(&self) -> Result<Vec<Agency>, ApiError> {
        self.fetch_active_agencies().await
    }

    async fn fetch_products(&self, agency_id: &str) -> Result<Vec<Product>, ApiError> {
        ApiClient::fetch_products(self, agency_id).await
    }
}
