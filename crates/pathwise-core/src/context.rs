//! Wiring for one client run: config, session, and API client built once
//! and handed to whatever needs them.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use crate::api::{build_http_client, ApiClient, HttpAuthBackend};
use crate::auth::{SessionManager, TokenStore};
use crate::config::Config;

#[derive(Clone)]
pub struct AppContext {
    pub config: Config,
    pub session: Arc<SessionManager>,
    pub api: ApiClient,
}

impl AppContext {
    /// Build the context using the token store named in `config`.
    pub fn new(config: Config) -> Result<Self> {
        let store = config.token_store()?;
        Self::with_store(config, store)
    }

    /// Build the context over an explicit token store.
    pub fn with_store(config: Config, store: Arc<dyn TokenStore>) -> Result<Self> {
        let api_url = config.api_url();
        debug!(api_url = %api_url, "Creating client context");

        let client =
            build_http_client(config.request_timeout()).context("Failed to build HTTP client")?;
        let backend = Arc::new(HttpAuthBackend::new(client.clone(), api_url.clone()));
        let session = Arc::new(SessionManager::new(backend, store));
        let api = ApiClient::new(client, api_url, session.clone());

        Ok(Self {
            config,
            session,
            api,
        })
    }

    /// Build the context and verify any stored credential before returning.
    pub async fn start(config: Config) -> Result<Self> {
        let context = Self::new(config)?;
        context.session.initialize().await;
        Ok(context)
    }
}
