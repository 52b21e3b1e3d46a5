//! Pending authorization sessions, keyed by OAuth `state`.
//!
//! A session is written when the user starts connecting and must be read and
//! then deleted exactly once by the callback. The TTL bounds how long an
//! abandoned flow lingers.

use crate::store::{KvStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const KEY_PREFIX: &str = "oauth_state_";

/// Server-side half of an in-flight authorization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingAuthorization {
    pub user_id: String,
    pub state: String,
    pub verifier: String,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

impl PendingAuthorization {
    pub fn new(user_id: &str, state: String, verifier: String, ttl: Duration) -> Self {
        Self {
            user_id: user_id.to_string(),
            state,
            verifier,
            created_at: Utc::now(),
            ttl_seconds: ttl.as_secs(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no pending authorization for this state")]
    NotFound,
    #[error(transparent)]
    Unavailable(#[from] StoreError),
    #[error("stored authorization is unreadable: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// TTL-bounded store of [`PendingAuthorization`] records.
#[derive(Clone)]
pub struct SessionStore {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl SessionStore {
    /// # Arguments
    /// * `ttl` - How long a session stays claimable (600s in production)
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn key(state: &str) -> String {
        format!("{}{}", KEY_PREFIX, state)
    }

    pub fn put(&self, pending: &PendingAuthorization) -> Result<(), SessionError> {
        let bytes = serde_json::to_vec(pending)?;
        self.kv.set(&Self::key(&pending.state), &bytes, Some(self.ttl))?;
        Ok(())
    }

    pub fn get(&self, state: &str) -> Result<PendingAuthorization, SessionError> {
        let bytes = self
            .kv
            .get(&Self::key(state))?
            .ok_or(SessionError::NotFound)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Returns `false` if the session was already gone (expired or claimed by
    /// a concurrent callback).
    pub fn delete(&self, state: &str) -> Result<bool, SessionError> {
        Ok(self.kv.delete(&Self::key(state))?)
    }
}
