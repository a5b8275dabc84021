//! OAuth2 `refresh_token` grant, as used for GitHub App user tokens.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use super::{Credential, CredentialRefresher};
use crate::broker::Broker;

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 8 * 60 * 60;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Exchanges the stored refresh token for a new access token and stores
/// the rotated refresh token in its place.
pub struct OAuthRefresher {
    client: reqwest::Client,
    broker: Broker,
    namespace: String,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl OAuthRefresher {
    pub fn new(
        broker: Broker,
        namespace: impl Into<String>,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            broker,
            namespace: namespace.into(),
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    pub fn refresh_token_key(&self, subject: &str) -> String {
        format!("{}_refresh_token_{}", self.namespace, subject)
    }

    /// Seed or replace the refresh token for `subject`.
    pub async fn store_refresh_token(&self, subject: &str, token: &str) -> Result<()> {
        self.broker
            .set(&self.refresh_token_key(subject), token, None)
            .await
            .context("Failed to store refresh token")
    }
}

#[async_trait]
impl CredentialRefresher for OAuthRefresher {
    async fn refresh(&self, subject: &str) -> Result<Credential> {
        let key = self.refresh_token_key(subject);
        let refresh_token = self
            .broker
            .get(&key)
            .await
            .context("Failed to read refresh token")?
            .with_context(|| format!("No refresh token stored for '{}'; re-authenticate", subject))?;

        let response = self
            .client
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .with_context(|| format!("Failed to reach token endpoint {}", self.token_url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Token endpoint returned {}: {}", status, body);
        }
        let body: TokenResponse = response
            .json()
            .await
            .context("Failed to parse token endpoint response")?;

        // GitHub reports grant failures with 200 and an `error` field.
        if let Some(error) = body.error {
            bail!(
                "Token refresh rejected: {}{}",
                error,
                body.error_description
                    .map(|d| format!(" ({})", d))
                    .unwrap_or_default()
            );
        }
        let access_token = body
            .access_token
            .context("Token endpoint response has no access_token")?;

        if let Some(rotated) = body.refresh_token {
            self.broker
                .set(&key, &rotated, None)
                .await
                .context("Failed to store rotated refresh token")?;
        }

        let expires_in = body.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        tracing::debug!(subject, expires_in, "access token refreshed");
        let expires_at = chrono::TimeDelta::try_seconds(expires_in)
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .with_context(|| format!("Token endpoint returned an out-of-range expires_in: {}", expires_in))?;
        Ok(Credential {
            value: access_token,
            expires_at,
        })
    }
}
