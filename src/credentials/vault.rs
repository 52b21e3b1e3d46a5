//! Token vault over the shared key/value store.

use super::encryption::{Sealed, TokenCipher};
use super::Token;
use crate::store::{KvStore, StoreError};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

const KEY_PREFIX: &str = "oauth_token_";

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("user has not connected an account")]
    NotConnected,
    /// The record no longer opens under the current key. Unrecoverable: the user must reconnect.
    #[error("stored credential cannot be decrypted: {0}")]
    Decryption(String),
    #[error(transparent)]
    Unavailable(#[from] StoreError),
    #[error("failed to seal or encode credential: {0}")]
    Encoding(String),
}

/// Record as persisted. Tokens never appear here in the clear.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IssuedCredential {
    pub user_id: String,
    pub access_token: Sealed,
    pub refresh_token: Option<Sealed>,
    pub token_type: String,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub external_username: Option<String>,
    pub connected_at: DateTime<Utc>,
}

/// Decrypted view handed back by [`TokenVault::load`].
#[derive(Clone, Debug, PartialEq)]
pub struct StoredCredential {
    pub user_id: String,
    pub token: Token,
    pub external_username: Option<String>,
    pub connected_at: DateTime<Utc>,
}

/// Encrypted credential storage, one record per user (last write wins).
#[derive(Clone)]
pub struct TokenVault {
    kv: Arc<dyn KvStore>,
    cipher: TokenCipher,
}

impl TokenVault {
    /// # Arguments
    /// * `kv` - Backing store
    /// * `encryption_key` - 32-byte process key from configuration
    pub fn new(kv: Arc<dyn KvStore>, encryption_key: &str) -> Result<Self> {
        let cipher = TokenCipher::new(encryption_key).context("Invalid encryption key")?;
        Ok(Self { kv, cipher })
    }

    fn key(user_id: &str) -> String {
        format!("{}{}", KEY_PREFIX, user_id)
    }

    pub fn store(
        &self,
        user_id: &str,
        token: &Token,
        external_username: Option<String>,
    ) -> Result<(), VaultError> {
        let access_token = self
            .cipher
            .seal(&token.access_token)
            .map_err(|e| VaultError::Encoding(e.to_string()))?;
        let refresh_token = token
            .refresh_token
            .as_deref()
            .map(|t| self.cipher.seal(t))
            .transpose()
            .map_err(|e| VaultError::Encoding(e.to_string()))?;

        let record = IssuedCredential {
            user_id: user_id.to_string(),
            access_token,
            refresh_token,
            token_type: token.token_type.clone(),
            expires_at: token.expires_at,
            scopes: token.scopes.clone(),
            external_username,
            connected_at: Utc::now(),
        };

        let bytes =
            serde_json::to_vec(&record).map_err(|e| VaultError::Encoding(e.to_string()))?;
        self.kv.set(&Self::key(user_id), &bytes, None)?;

        debug!(
            user_id = %user_id,
            has_refresh_token = record.refresh_token.is_some(),
            "Stored encrypted credential"
        );
        Ok(())
    }

    pub fn load(&self, user_id: &str) -> Result<StoredCredential, VaultError> {
        let bytes = self
            .kv
            .get(&Self::key(user_id))?
            .ok_or(VaultError::NotConnected)?;
        let record: IssuedCredential = serde_json::from_slice(&bytes)
            .map_err(|e| VaultError::Decryption(format!("unreadable record: {}", e)))?;

        let access_token = self
            .cipher
            .open(&record.access_token)
            .map_err(|e| VaultError::Decryption(e.to_string()))?;
        let refresh_token = record
            .refresh_token
            .as_ref()
            .map(|sealed| self.cipher.open(sealed))
            .transpose()
            .map_err(|e| VaultError::Decryption(e.to_string()))?;

        Ok(StoredCredential {
            user_id: record.user_id,
            token: Token {
                access_token,
                token_type: record.token_type,
                refresh_token,
                expires_at: record.expires_at,
                scopes: record.scopes,
            },
            external_username: record.external_username,
            connected_at: record.connected_at,
        })
    }

    /// Removes the user's credential. Returns `false` if there was none.
    pub fn disconnect(&self, user_id: &str) -> Result<bool, VaultError> {
        Ok(self.kv.delete(&Self::key(user_id))?)
    }
}
