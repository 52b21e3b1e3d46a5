//! OAuth 2.0 client for the identity provider.
//!
//! Covers the provider-facing half of the authorization code flow with PKCE:
//! 1. Build the authorization URL carrying `state` and the S256 challenge
//! 2. Exchange the returned code plus the verifier for a token
//! 3. Optionally look up the account name the token belongs to

mod exchange;
mod provider;

pub use exchange::{exchange_code_for_token, ExchangeError};
pub use provider::{ProviderConfig, CALLBACK_PATH};

use crate::credentials::Token;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

/// Provider operations the connect flow depends on.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn authorization_url(&self, state: &str, code_challenge: &str) -> String;

    /// Single attempt; codes cannot be reused so callers never retry.
    async fn exchange(&self, code: &str, verifier: &str) -> Result<Token, ExchangeError>;

    /// Name of the provider account the token was issued for, if known.
    async fn account_username(&self, _token: &Token) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Only the field we keep from the account payload.
#[derive(Deserialize)]
struct AccountResponse {
    username: Option<String>,
}

/// HTTP implementation of [`IdentityProvider`].
#[derive(Clone)]
pub struct OAuthClient {
    provider: ProviderConfig,
    http: reqwest::Client,
}

impl OAuthClient {
    pub fn new(provider: ProviderConfig) -> Self {
        Self {
            provider,
            http: reqwest::Client::new(),
        }
    }

    pub fn provider(&self) -> &ProviderConfig {
        &self.provider
    }
}

#[async_trait]
impl IdentityProvider for OAuthClient {
    fn authorization_url(&self, state: &str, code_challenge: &str) -> String {
        self.provider.build_auth_url(state, code_challenge)
    }

    async fn exchange(&self, code: &str, verifier: &str) -> Result<Token, ExchangeError> {
        exchange_code_for_token(&self.http, &self.provider, code, verifier).await
    }

    async fn account_username(&self, token: &Token) -> Result<Option<String>> {
        let account: AccountResponse = self
            .http
            .get(&self.provider.account_url)
            .bearer_auth(&token.access_token)
            .header("Accept", "application/json")
            .send()
            .await
            .context("Failed to send account request")?
            .error_for_status()
            .context("Account request rejected")?
            .json()
            .await
            .context("Failed to parse account response")?;

        Ok(account.username)
    }
}
