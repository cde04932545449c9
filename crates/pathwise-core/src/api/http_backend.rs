use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::client::{check_response, join_url, read_json};
use super::ApiError;
use crate::auth::{AuthBackend, AuthGrant, Verification};
use crate::models::{PasswordChange, Principal, ProfileUpdate, RegistrationForm};

#[derive(Debug, Serialize)]
struct VerifyRequest<'a> {
    token: &'a str,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    valid: bool,
    #[serde(default)]
    user: Option<Principal>,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    user: Principal,
    token: String,
}

impl AuthResponse {
    fn into_grant(self) -> Result<AuthGrant, ApiError> {
        if self.token.trim().is_empty() {
            return Err(ApiError::InvalidResponse(
                "Auth response did not include a token".to_string(),
            ));
        }
        Ok(AuthGrant {
            token: self.token,
            principal: self.user,
        })
    }
}

/// `AuthBackend` over the platform's REST endpoints.
#[derive(Clone)]
pub struct HttpAuthBackend {
    client: Client,
    base_url: String,
}

impl HttpAuthBackend {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }
}

#[async_trait]
impl AuthBackend for HttpAuthBackend {
    async fn verify_token(&self, token: &str) -> Result<Verification, ApiError> {
        let response = self
            .client
            .post(self.url("/auth/verify-token"))
            .json(&VerifyRequest { token })
            .send()
            .await?;

        let status = response.status();
        if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
            // The backend answers `valid: false` with 400/401
            debug!(status = status.as_u16(), "Token rejected by backend");
            return Ok(Verification::Invalid);
        }

        let body: VerifyResponse = read_json(response).await?;
        match (body.valid, body.user) {
            (true, Some(user)) => Ok(Verification::Valid(user)),
            (true, None) => Err(ApiError::InvalidResponse(
                "Token reported valid without a user".to_string(),
            )),
            (false, _) => Ok(Verification::Invalid),
        }
    }

    async fn login(&self, username: &str, password: &str) -> Result<AuthGrant, ApiError> {
        let response = self
            .client
            .post(self.url("/auth/login"))
            .json(&LoginRequest { username, password })
            .send()
            .await?;

        read_json::<AuthResponse>(response).await?.into_grant()
    }

    async fn register(&self, form: &RegistrationForm) -> Result<AuthGrant, ApiError> {
        let response = self
            .client
            .post(self.url("/auth/register"))
            .json(form)
            .send()
            .await?;

        read_json::<AuthResponse>(response).await?.into_grant()
    }

    async fn fetch_profile(&self, token: &str) -> Result<Principal, ApiError> {
        let response = self
            .client
            .get(self.url("/user/profile"))
            .bearer_auth(token)
            .send()
            .await?;

        read_json(response).await
    }

    async fn update_profile(
        &self,
        token: &str,
        update: &ProfileUpdate,
    ) -> Result<Principal, ApiError> {
        let response = self
            .client
            .put(self.url("/user/profile"))
            .bearer_auth(token)
            .json(update)
            .send()
            .await?;

        read_json(response).await
    }

    async fn change_password(
        &self,
        token: &str,
        change: &PasswordChange,
    ) -> Result<(), ApiError> {
        let response = self
            .client
            .put(self.url("/user/profile/password"))
            .bearer_auth(token)
            .json(change)
            .send()
            .await?;

        check_response(response).await?;
        Ok(())
    }

    async fn delete_account(&self, token: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .delete(self.url("/user/profile/delete"))
            .bearer_auth(token)
            .send()
            .await?;

        check_response(response).await?;
        Ok(())
    }
}
