//! API client for the netpulse authentication endpoints.
//!
//! This module provides the `AuthClient` struct, the reqwest-backed
//! implementation of `AuthApi`. Every response is normalized into either a
//! typed success value or an `AuthError`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::User;
use crate::config::{Config, PasswordResetPolicy};

use super::AuthError;

// ============================================================================
// Constants
// ============================================================================

const LOGIN_PATH: &str = "auth/login";
const REGISTER_PATH: &str = "auth/register";
const FORGOT_PASSWORD_PATH: &str = "auth/forgot-password";
const CURRENT_USER_PATH: &str = "auth/me";
const LOGOUT_PATH: &str = "auth/logout";

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

/// Registration payload. Fields the backend wants beyond email, password
/// and name travel in `extra` and are flattened into the request body.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Registration {
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

/// Successful login or registration.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    pub user: User,
    pub token: String,
}

/// Reply to a password reset request. The backend may send an empty body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Acknowledgement {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Serialize)]
struct ResetRequest<'a> {
    email: &'a str,
}

// ============================================================================
// AuthApi
// ============================================================================

/// The authentication operations the forms and the context depend on.
#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn login(&self, credentials: &Credentials) -> Result<AuthResponse, AuthError>;

    async fn register(&self, registration: &Registration) -> Result<AuthResponse, AuthError>;

    async fn request_password_reset(&self, email: &str) -> Result<Acknowledgement, AuthError>;

    /// Resolve the identity behind a token restored from storage.
    async fn fetch_current_user(&self, token: &str) -> Result<User, AuthError>;

    /// Best-effort server-side invalidation. Never fails from the caller's
    /// point of view; client-side logout proceeds regardless.
    async fn logout(&self, token: &str);
}

/// API client for the netpulse backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct AuthClient {
    client: Client,
    base_url: String,
    reset_policy: PasswordResetPolicy,
}

impl AuthClient {
    /// Create a new client from the application config
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.api_base_url.clone(),
            reset_policy: config.password_reset_policy,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, AuthError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(AuthError::from_status(status, &body))
        }
    }

    async fn post<B, T>(&self, path: &str, body: &B, token: Option<&str>) -> Result<T, AuthError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        debug!(url = %url, "POST");

        let mut request = self.client.post(&url).json(body);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = Self::check_response(request.send().await?).await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl AuthApi for AuthClient {
    async fn login(&self, credentials: &Credentials) -> Result<AuthResponse, AuthError> {
        self.post(LOGIN_PATH, credentials, None).await
    }

    async fn register(&self, registration: &Registration) -> Result<AuthResponse, AuthError> {
        self.post(REGISTER_PATH, registration, None).await
    }

    async fn request_password_reset(&self, email: &str) -> Result<Acknowledgement, AuthError> {
        let url = self.url(FORGOT_PASSWORD_PATH);
        debug!(url = %url, "POST");

        let sent = self
            .client
            .post(&url)
            .json(&ResetRequest { email })
            .send()
            .await?;

        match Self::check_response(sent).await {
            Ok(response) => {
                let text = response.text().await?;
                Ok(parse_acknowledgement(&text))
            }
            Err(err) => resolve_reset_failure(self.reset_policy, err),
        }
    }

    async fn fetch_current_user(&self, token: &str) -> Result<User, AuthError> {
        let url = self.url(CURRENT_USER_PATH);
        debug!(url = %url, "GET");

        let response = self.client.get(&url).bearer_auth(token).send().await?;
        let response = Self::check_response(response).await?;
        Ok(response.json().await?)
    }

    async fn logout(&self, token: &str) {
        let url = self.url(LOGOUT_PATH);
        let result = self.client.post(&url).bearer_auth(token).send().await;

        match result {
            Ok(response) if response.status().is_success() => {
                debug!("Server-side logout acknowledged");
            }
            Ok(response) => {
                warn!(status = %response.status(), "Server-side logout rejected, ignoring");
            }
            Err(e) => {
                warn!(error = %e, "Server-side logout failed, ignoring");
            }
        }
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// An empty or unparseable acknowledgement body still counts as success.
fn parse_acknowledgement(body: &str) -> Acknowledgement {
    if body.trim().is_empty() {
        return Acknowledgement::default();
    }
    serde_json::from_str(body).unwrap_or_default()
}

/// Under the uniform policy an unknown email is indistinguishable from a
/// known one, so callers cannot enumerate accounts.
fn resolve_reset_failure(
    policy: PasswordResetPolicy,
    err: AuthError,
) -> Result<Acknowledgement, AuthError> {
    match (policy, err) {
        (PasswordResetPolicy::Uniform, AuthError::NotFound) => {
            debug!("Reset requested for unknown email, acknowledging uniformly");
            Ok(Acknowledgement::default())
        }
        (_, err) => Err(err),
    }
}
