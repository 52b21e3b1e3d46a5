//! Authorization-code-for-token exchange.

use super::provider::ProviderConfig;
use crate::credentials::Token;
use chrono::{Duration, Utc};
use serde::Deserialize;
use thiserror::Error;

/// Token exchange failure. Always terminal: the code is single-use.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The request could not be built locally.
    #[error("failed to build token request: {0}")]
    Local(String),
    #[error("identity provider unreachable: {0}")]
    Unreachable(String),
    #[error("identity provider rejected the exchange with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("malformed token response: {0}")]
    Malformed(String),
    #[error("token exchange timed out")]
    TimedOut,
}

impl ExchangeError {
    /// Whether the fault lies with the provider rather than this instance.
    pub fn is_provider_side(&self) -> bool {
        !matches!(self, ExchangeError::Local(_))
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            ExchangeError::Local(err.to_string())
        } else if err.is_timeout() {
            ExchangeError::TimedOut
        } else if err.is_decode() {
            ExchangeError::Malformed(err.to_string())
        } else {
            ExchangeError::Unreachable(err.to_string())
        }
    }
}

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize, Debug)]
pub(crate) struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    pub(crate) fn into_token(self) -> Token {
        // An expiry that does not fit a timestamp is treated as unknown.
        let expires_at = self
            .expires_in
            .and_then(Duration::try_seconds)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime));
        let scopes = self
            .scope
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        Token {
            access_token: self.access_token,
            token_type: self.token_type.unwrap_or_else(|| "Bearer".to_string()),
            refresh_token: self.refresh_token,
            expires_at,
            scopes,
        }
    }
}

/// Exchanges `code` for a token, proving possession of `verifier`.
pub async fn exchange_code_for_token(
    http: &reqwest::Client,
    provider: &ProviderConfig,
    code: &str,
    verifier: &str,
) -> Result<Token, ExchangeError> {
    let form = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", provider.redirect_uri.as_str()),
        ("client_id", provider.client_id.as_str()),
        ("client_secret", provider.client_secret.as_str()),
        ("code_verifier", verifier),
    ];

    tracing::debug!(token_url = %provider.token_url, "Exchanging authorization code for token");

    let response = http
        .post(&provider.token_url)
        .header("Accept", "application/json")
        .form(&form)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(ExchangeError::Rejected {
            status: status.as_u16(),
            body,
        });
    }

    let body = response.bytes().await?;
    let token_response: TokenResponse =
        serde_json::from_slice(&body).map_err(|e| ExchangeError::Malformed(e.to_string()))?;

    tracing::debug!(
        has_refresh_token = token_response.refresh_token.is_some(),
        expires_in = ?token_response.expires_in,
        "Token exchange successful"
    );

    Ok(token_response.into_token())
}
