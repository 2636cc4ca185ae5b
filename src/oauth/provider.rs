//! Provider adapter: the only component that talks to the OAuth provider.
//!
//! The core depends on the narrow [`Provider`] trait; [`HttpProvider`] is
//! the reqwest-backed implementation with a bounded timeout per call.
//! Provider OAuth error codes are classified into distinct error kinds so
//! callers can tell a dead grant from a transient outage.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;

use crate::error::{AuthError, Result};

/// OAuth endpoints and client settings for the storage provider.
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub auth_url: String,
    pub token_url: String,
    pub revoke_url: String,
    pub userinfo_url: String,
    pub scopes: Vec<String>,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    /// Upper bound for any single provider call, in seconds.
    pub timeout_secs: u64,
}

impl ProviderConfig {
    /// Builds the authorization URL with PKCE challenge and state embedded.
    pub fn build_auth_url(&self, challenge: &str, state: &str) -> String {
        let scopes = self.scopes.join(" ");
        format!(
            "{}?client_id={}&redirect_uri={}&scope={}&state={}&code_challenge={}&code_challenge_method=S256&response_type=code&access_type=offline&prompt=consent",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(state),
            urlencoding::encode(challenge),
        )
    }
}

/// Tokens returned by the provider.
#[derive(Clone, Debug)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// The narrow seam the rest of the subsystem depends on.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Exchanges an authorization code plus PKCE verifier for tokens.
    async fn exchange_code(&self, code: &str, verifier: &str) -> Result<TokenSet>;

    /// Obtains a fresh access token from a refresh token.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet>;

    /// Revokes a single token at the provider.
    async fn revoke(&self, token: &str) -> Result<()>;

    /// Fetches the account identity (e.g. email) for an access token.
    async fn fetch_identity(&self, access_token: &str) -> Result<String>;
}

/// Standard OAuth 2.0 token response.
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl From<TokenResponse> for TokenSet {
    fn from(resp: TokenResponse) -> Self {
        TokenSet {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
            expires_at: resp.expires_in.map(|s| Utc::now() + Duration::seconds(s)),
        }
    }
}

#[derive(Deserialize)]
struct UserInfo {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

/// Stateless reqwest-backed provider adapter.
pub struct HttpProvider {
    client: reqwest::Client,
    config: ProviderConfig,
}

impl HttpProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self { client, config })
    }

    async fn token_request(
        &self,
        form: HashMap<&str, &str>,
        during_refresh: bool,
    ) -> Result<TokenSet> {
        let response = self
            .client
            .post(&self.config.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(transient)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_oauth_error(status, &body, during_refresh));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::TransientProvider(format!("malformed token response: {}", e)))?;

        Ok(token_response.into())
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn exchange_code(&self, code: &str, verifier: &str) -> Result<TokenSet> {
        tracing::debug!("exchanging authorization code");

        let mut form = HashMap::new();
        form.insert("grant_type", "authorization_code");
        form.insert("code", code);
        form.insert("code_verifier", verifier);
        form.insert("redirect_uri", self.config.redirect_uri.as_str());
        form.insert("client_id", self.config.client_id.as_str());
        form.insert("client_secret", self.config.client_secret.as_str());

        self.token_request(form, false).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet> {
        tracing::debug!("refreshing access token");

        let mut form = HashMap::new();
        form.insert("grant_type", "refresh_token");
        form.insert("refresh_token", refresh_token);
        form.insert("client_id", self.config.client_id.as_str());
        form.insert("client_secret", self.config.client_secret.as_str());

        self.token_request(form, true).await
    }

    async fn revoke(&self, token: &str) -> Result<()> {
        let mut form = HashMap::new();
        form.insert("token", token);

        let response = self
            .client
            .post(&self.config.revoke_url)
            .form(&form)
            .send()
            .await
            .map_err(transient)?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::TransientProvider(format!(
                "revoke endpoint returned {}",
                status
            )));
        }
        Ok(())
    }

    async fn fetch_identity(&self, access_token: &str) -> Result<String> {
        let response = self
            .client
            .get(&self.config.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(transient)?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::TransientProvider(format!(
                "userinfo endpoint returned {}",
                status
            )));
        }

        let info: UserInfo = response
            .json()
            .await
            .map_err(|e| AuthError::TransientProvider(format!("malformed userinfo: {}", e)))?;

        info.email
            .or(info.id)
            .ok_or_else(|| AuthError::TransientProvider("userinfo missing identity".to_string()))
    }
}

fn transient(e: reqwest::Error) -> AuthError {
    if e.is_timeout() {
        AuthError::TransientProvider("provider call timed out".to_string())
    } else {
        AuthError::TransientProvider(format!("provider unreachable: {}", e))
    }
}

/// Maps a provider OAuth error body to a distinct, user-actionable kind.
fn classify_oauth_error(status: StatusCode, body: &str, during_refresh: bool) -> AuthError {
    if status.is_server_error() {
        return AuthError::TransientProvider(format!("provider returned {}", status));
    }

    let code = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error")?.as_str().map(str::to_string))
        .unwrap_or_default();

    match code.as_str() {
        // During refresh a dead grant means the refresh token was revoked
        // or expired, which requires a full re-authorization
        "invalid_grant" if during_refresh => AuthError::ReauthorizationRequired,
        "invalid_grant" => AuthError::InvalidGrant,
        "redirect_uri_mismatch" => AuthError::RedirectMismatch,
        "invalid_client" | "unauthorized_client" => AuthError::InvalidClientConfig,
        "access_denied" => AuthError::AccessDenied,
        _ => AuthError::TransientProvider(format!("provider returned {}", status)),
    }
}
