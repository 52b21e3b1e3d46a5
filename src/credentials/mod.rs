//! Encrypted per-user storage of issued OAuth tokens.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       TokenVault                         │
//! │  - store / load / disconnect per user    │
//! │  - transparent sealing and opening       │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!      (seal)               (open)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       TokenCipher                        │
//! │  - AES-256-GCM, process-wide key         │
//! │  - fresh nonce per sealed value          │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       KvStore                            │
//! │  - one JSON record per user, no TTL      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use lichess_connect::credentials::{Token, TokenVault};
//! use lichess_connect::store::SqliteKvStore;
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let kv = Arc::new(SqliteKvStore::new("connect.db")?);
//! let vault = TokenVault::new(kv, "0123456789abcdef0123456789abcdef")?;
//!
//! let token = Token {
//!     access_token: "lio_abc".to_string(),
//!     token_type: "Bearer".to_string(),
//!     refresh_token: None,
//!     expires_at: None,
//!     scopes: vec!["preference:read".to_string()],
//! };
//! vault.store("user1", &token, Some("magnus".to_string()))?;
//!
//! let stored = vault.load("user1")?;
//! assert_eq!(stored.token.access_token, "lio_abc");
//! # Ok(())
//! # }
//! ```
//!
//! Losing or rotating the key strands every stored record: loads then fail
//! with [`VaultError::Decryption`] and the user has to reconnect.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod encryption;
mod vault;

pub use encryption::{validate_key, Sealed, TokenCipher, KEY_SIZE};
pub use vault::{IssuedCredential, StoredCredential, TokenVault, VaultError};

/// Token issued by the identity provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// Bearer token for API requests
    pub access_token: String,

    /// Usually "Bearer"
    pub token_type: String,

    pub refresh_token: Option<String>,

    /// When the access token expires (UTC), if the provider said so
    pub expires_at: Option<DateTime<Utc>>,

    /// Granted scopes
    #[serde(default)]
    pub scopes: Vec<String>,
}
