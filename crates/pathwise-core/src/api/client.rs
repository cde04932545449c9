//! Authenticated API client for the learning platform REST API.
//!
//! Pages (learning paths, quizzes, notes, notifications, ...) go through
//! `ApiClient`, which asks the session manager for the current bearer on
//! every request instead of keeping a token of its own.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::ApiError;
use crate::auth::SessionManager;

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Build the shared HTTP client. Clones share one connection pool.
pub fn build_http_client(timeout: Duration) -> Result<Client, ApiError> {
    Ok(Client::builder().timeout(timeout).build()?)
}

/// Join a base URL and an endpoint path with exactly one slash.
pub(crate) fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Check if response is successful, returning an error with body if not.
pub(crate) async fn check_response(
    response: reqwest::Response,
) -> Result<reqwest::Response, ApiError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::from_status(status, &body))
    }
}

/// Deserialize a successful response body.
pub(crate) async fn read_json<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ApiError> {
    let response = check_response(response).await?;
    let url = response.url().to_string();
    response
        .json()
        .await
        .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON from {}: {}", url, e)))
}

/// API client for the learning platform.
/// Clone is cheap - the reqwest client and the session are both shared.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    session: Arc<SessionManager>,
    initial_backoff: Duration,
}

impl ApiClient {
    pub fn new(client: Client, base_url: impl Into<String>, session: Arc<SessionManager>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            session,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        }
    }

    /// Override the first rate-limit backoff (doubles on each retry).
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Start a request with the current bearer attached, returning the token
    /// that was used so an unauthorized answer can be traced back to it.
    fn request(&self, method: Method, path: &str) -> (RequestBuilder, Option<String>) {
        let url = join_url(&self.base_url, path);
        let token = self.session.bearer();
        let mut builder = self.client.request(method, url);
        if let Some(ref token) = token {
            builder = builder.bearer_auth(token);
        }
        (builder, token)
    }

    /// Build (without sending) the request that `method path` would issue.
    pub fn build_request(&self, method: Method, path: &str) -> Result<reqwest::Request, ApiError> {
        let (builder, _) = self.request(method, path);
        Ok(builder.build()?)
    }

    async fn send<T, B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let (mut builder, token) = self.request(method.clone(), path);
            if let Some(body) = body {
                builder = builder.json(body);
            }
            let response = builder.send().await?;
            let status = response.status();

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                retries += 1;
                if retries > MAX_RATE_LIMIT_RETRIES {
                    return Err(ApiError::RateLimited);
                }
                warn!(path = path, retry = retries, backoff_ms = backoff.as_millis() as u64, "Rate limited, backing off");
                tokio::time::sleep(backoff).await;
                backoff *= 2; // Exponential backoff
                continue;
            }

            return match read_json(response).await {
                Err(err) if err.is_unauthorized() => {
                    if let Some(token) = token {
                        debug!(path = path, "Protected request unauthorized");
                        self.session.invalidate(&token);
                    }
                    Err(err)
                }
                other => other,
            };
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send::<T, ()>(Method::GET, path, None).await
    }

    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send(Method::POST, path, Some(body)).await
    }

    pub async fn put<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send(Method::PUT, path, Some(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send::<T, ()>(Method::DELETE, path, None).await
    }
}
