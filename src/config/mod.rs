//! Service configuration.
//!
//! Loaded from a TOML file; secrets and paths can be overridden from the
//! environment. A missing encryption key is generated on first start and
//! written back so that stored credentials stay readable across restarts.

use crate::secret::{generate_secret, Alphabet};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::ops::RangeInclusive;
use std::time::Duration;

/// Accepted range for every `[flow]` duration, in seconds (one second to one day).
const FLOW_SECONDS_RANGE: RangeInclusive<u64> = 1..=86_400;

/// Complete service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectConfig {
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

/// Identity-provider client settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// 32-byte key sealing stored tokens. Generated when empty.
    #[serde(default)]
    pub encryption_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Externally reachable URL of this service; the callback lives beneath it.
    #[serde(default = "default_site_url")]
    pub site_url: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
}

fn default_base_url() -> String {
    "https://lichess.org/".to_string()
}

fn default_site_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_scopes() -> Vec<String> {
    vec!["preference:read".to_string()]
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            encryption_key: String::new(),
            base_url: default_base_url(),
            site_url: default_site_url(),
            scopes: default_scopes(),
        }
    }
}

impl OAuthConfig {
    pub fn is_configured(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }
}

/// HTTP listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Cookie carrying the authenticated user id
    #[serde(default = "default_identity_cookie")]
    pub identity_cookie: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_identity_cookie() -> String {
    "connect_user".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            identity_cookie: default_identity_cookie(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
}

fn default_db_path() -> String {
    "lichess_connect.db".to_string()
}

fn default_cleanup_interval() -> u64 {
    60
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            cleanup_interval_seconds: default_cleanup_interval(),
        }
    }
}

/// Timing of the two-leg connect flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    /// How long a started authorization can be completed
    #[serde(default = "default_session_ttl")]
    pub session_ttl_seconds: u64,
    /// How long the background waiter keeps its subscription
    #[serde(default = "default_completion_wait")]
    pub completion_wait_seconds: u64,
    /// Deadline for handling a callback, provider round-trips included
    #[serde(default = "default_callback_budget")]
    pub callback_budget_seconds: u64,
}

fn default_session_ttl() -> u64 {
    600
}

fn default_completion_wait() -> u64 {
    45
}

fn default_callback_budget() -> u64 {
    5
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            session_ttl_seconds: default_session_ttl(),
            completion_wait_seconds: default_completion_wait(),
            callback_budget_seconds: default_callback_budget(),
        }
    }
}

impl FlowConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_seconds)
    }

    pub fn completion_wait(&self) -> Duration {
        Duration::from_secs(self.completion_wait_seconds)
    }

    pub fn callback_budget(&self) -> Duration {
        Duration::from_secs(self.callback_budget_seconds)
    }
}

/// Cluster fan-out. Disabled when `nats_url` is unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub nats_url: Option<String>,
    #[serde(default = "default_subject")]
    pub subject: String,
}

fn default_subject() -> String {
    "lichess_connect.oauth.complete".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nats_url: None,
            subject: default_subject(),
        }
    }
}

impl ConnectConfig {
    /// Fills in generated values. Returns whether anything changed and the
    /// file should be saved.
    pub fn ensure_defaults(&mut self) -> Result<bool> {
        let mut changed = false;

        if self.oauth.encryption_key.is_empty() {
            self.oauth.encryption_key = generate_secret(Alphabet::Standard, 32)
                .context("Failed to generate encryption key")?;
            changed = true;
        }

        Ok(changed)
    }

    /// Trims stray whitespace from values usually pasted in by hand.
    pub fn sanitize(&mut self) {
        self.oauth.client_id = self.oauth.client_id.trim().to_string();
        self.oauth.client_secret = self.oauth.client_secret.trim().to_string();
        self.oauth.base_url = self.oauth.base_url.trim().to_string();
        self.oauth.site_url = self.oauth.site_url.trim().to_string();
    }

    pub fn validate(&self) -> Result<()> {
        if self.oauth.client_id.is_empty() {
            return Err(anyhow!("must have an oauth client id"));
        }
        if self.oauth.client_secret.is_empty() {
            return Err(anyhow!("must have an oauth client secret"));
        }
        if self.oauth.encryption_key.is_empty() {
            return Err(anyhow!("must have an encryption key"));
        }
        crate::credentials::validate_key(&self.oauth.encryption_key)?;
        let durations = [
            ("session_ttl_seconds", self.flow.session_ttl_seconds),
            ("completion_wait_seconds", self.flow.completion_wait_seconds),
            ("callback_budget_seconds", self.flow.callback_budget_seconds),
        ];
        for (name, seconds) in durations {
            if !FLOW_SECONDS_RANGE.contains(&seconds) {
                return Err(anyhow!(
                    "flow.{} must be between {} and {} seconds, got {}",
                    name,
                    FLOW_SECONDS_RANGE.start(),
                    FLOW_SECONDS_RANGE.end(),
                    seconds
                ));
            }
        }
        Ok(())
    }

    /// Applies `LICHESS_CONNECT_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        let overrides: [(&str, &mut String); 7] = [
            ("LICHESS_CONNECT_CLIENT_ID", &mut self.oauth.client_id),
            ("LICHESS_CONNECT_CLIENT_SECRET", &mut self.oauth.client_secret),
            ("LICHESS_CONNECT_ENCRYPTION_KEY", &mut self.oauth.encryption_key),
            ("LICHESS_CONNECT_BASE_URL", &mut self.oauth.base_url),
            ("LICHESS_CONNECT_SITE_URL", &mut self.oauth.site_url),
            ("LICHESS_CONNECT_BIND_ADDR", &mut self.server.bind_addr),
            ("LICHESS_CONNECT_DB_PATH", &mut self.storage.db_path),
        ];
        for (var, field) in overrides {
            if let Ok(value) = std::env::var(var) {
                *field = value;
            }
        }

        if let Ok(url) = std::env::var("NATS_URL") {
            self.cluster.nats_url = Some(url);
        }
    }
}

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ConnectConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: ConnectConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Writes configuration back as TOML.
pub fn save_config<P: AsRef<Path>>(path: P, config: &ConnectConfig) -> Result<()> {
    let path = path.as_ref();
    let contents = toml::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(path, contents)
        .with_context(|| format!("Failed to write config file {}", path.display()))?;
    Ok(())
}
