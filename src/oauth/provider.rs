//! Identity-provider endpoint configuration.

use crate::config::OAuthConfig;
use anyhow::{anyhow, Context, Result};
use reqwest::Url;

/// Path of the callback route, appended to the configured site URL.
pub const CALLBACK_PATH: &str = "/oauth/complete";

/// Resolved endpoints and client credentials for one identity provider.
#[derive(Clone, Debug, PartialEq)]
pub struct ProviderConfig {
    /// OAuth authorization endpoint URL
    pub auth_url: String,

    /// Token exchange endpoint URL
    pub token_url: String,

    /// Account endpoint used to look up the external username
    pub account_url: String,

    pub scopes: Vec<String>,

    pub client_id: String,

    pub client_secret: String,

    /// Where the provider sends the user back to
    pub redirect_uri: String,
}

impl ProviderConfig {
    /// Derives the endpoints from the provider base URL (`<base>/oauth`,
    /// `<base>/api/token`, `<base>/api/account`).
    pub fn from_config(config: &OAuthConfig) -> Result<Self> {
        if !config.is_configured() {
            return Err(anyhow!("OAuth client id and secret must be configured"));
        }

        let mut base = config.base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = Url::parse(&base)
            .with_context(|| format!("Failed to parse provider base URL '{}'", base))?;

        let join = |path: &str| -> Result<String> {
            base.join(path)
                .map(|url| url.to_string())
                .with_context(|| format!("Failed to build provider URL for '{}'", path))
        };

        let site_url = config.site_url.trim().trim_end_matches('/');
        let redirect_uri = format!("{}{}", site_url, CALLBACK_PATH);
        Url::parse(&redirect_uri)
            .with_context(|| format!("Failed to parse redirect URL '{}'", redirect_uri))?;

        Ok(Self {
            auth_url: join("oauth")?,
            token_url: join("api/token")?,
            account_url: join("api/account")?,
            scopes: config.scopes.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri,
        })
    }

    /// Builds the authorization URL for a PKCE (S256) request.
    pub fn build_auth_url(&self, state: &str, code_challenge: &str) -> String {
        let scopes = self.scopes.join(" ");
        format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}&code_challenge={}&code_challenge_method={}",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(state),
            urlencoding::encode(code_challenge),
            crate::pkce::CHALLENGE_METHOD,
        )
    }
}
