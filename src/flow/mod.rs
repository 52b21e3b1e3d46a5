//! Two-leg OAuth connect flow with PKCE.
//!
//! ```text
//! initiate(user)                       complete(caller, state, code)
//!   ├─ state (32), verifier (64)         ├─ get + delete session by state
//!   ├─ SessionStore.put                  ├─ validate code / session / state / user
//!   ├─ challenge = S256(verifier)        ├─ exchange(code, verifier) under deadline
//!   ├─ subscribe + detached waiter       ├─ TokenVault.store
//!   └─ redirect URL                      └─ CompletionBroker.publish (always, once)
//! ```

use crate::broker::{CompletionBroker, LoginResult, WaitOutcome};
use crate::credentials::{StoredCredential, TokenVault, VaultError};
use crate::oauth::{ExchangeError, IdentityProvider};
use crate::pkce::code_challenge;
use crate::secret::{generate_secret, Alphabet, SecretError};
use crate::session::{PendingAuthorization, SessionError, SessionStore};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

#[cfg(test)]
mod tests;

pub const STATE_LENGTH: usize = 32;
pub const VERIFIER_LENGTH: usize = 64;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error(transparent)]
    Entropy(#[from] SecretError),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("invalid or expired state")]
    InvalidOrExpiredState,
    #[error("state does not match the stored authorization")]
    StateMismatch,
    #[error("authorization code missing")]
    MissingCode,
    #[error("authorization belongs to a different user")]
    UserMismatch,
    #[error("token exchange failed: {0}")]
    Exchange(#[from] ExchangeError),
    #[error("stored credential cannot be decrypted: {0}")]
    Decryption(String),
    #[error("user has not connected an account")]
    NotConnected,
    #[error("internal error: {0}")]
    Internal(String),
}

impl FlowError {
    /// Failures caused by the request itself (expired flow, tampering, wrong user).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            FlowError::InvalidOrExpiredState
                | FlowError::StateMismatch
                | FlowError::MissingCode
                | FlowError::UserMismatch
        )
    }

    /// Message safe to show the end user. Never carries internal detail.
    pub fn public_message(&self) -> &'static str {
        match self {
            FlowError::Entropy(_) | FlowError::StoreUnavailable(_) | FlowError::Internal(_) => {
                "internal error, please try again later"
            }
            FlowError::InvalidOrExpiredState => "invalid or expired state, please connect again",
            FlowError::StateMismatch => "state invalid",
            FlowError::MissingCode => "code not found",
            FlowError::UserMismatch => "not authorized, incorrect user",
            FlowError::Exchange(_) => "failed to exchange authorization code",
            FlowError::Decryption(_) => "stored credential is unreadable, please reconnect",
            FlowError::NotConnected => "account not connected",
        }
    }
}

impl From<SessionError> for FlowError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound => FlowError::InvalidOrExpiredState,
            other => FlowError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<VaultError> for FlowError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::NotConnected => FlowError::NotConnected,
            VaultError::Decryption(msg) => FlowError::Decryption(msg),
            VaultError::Unavailable(e) => FlowError::StoreUnavailable(e.to_string()),
            VaultError::Encoding(msg) => FlowError::Internal(msg),
        }
    }
}

/// Timing knobs for the flow.
#[derive(Clone, Copy, Debug)]
pub struct FlowTimings {
    /// How long the detached waiter keeps its subscription after initiate
    pub completion_wait: Duration,
    /// Deadline for the whole callback, provider calls included
    pub callback_budget: Duration,
}

impl Default for FlowTimings {
    fn default() -> Self {
        Self {
            completion_wait: Duration::from_secs(45),
            callback_budget: Duration::from_secs(5),
        }
    }
}

/// Successful callback outcome.
#[derive(Clone, Debug, PartialEq)]
pub struct Connected {
    pub user_id: String,
    pub external_username: Option<String>,
}

/// Orchestrates session, provider, vault and broker across both legs.
#[derive(Clone)]
pub struct FlowController {
    sessions: SessionStore,
    vault: TokenVault,
    provider: Arc<dyn IdentityProvider>,
    broker: Arc<CompletionBroker>,
    timings: FlowTimings,
}

impl FlowController {
    pub fn new(
        sessions: SessionStore,
        vault: TokenVault,
        provider: Arc<dyn IdentityProvider>,
        broker: Arc<CompletionBroker>,
        timings: FlowTimings,
    ) -> Self {
        Self {
            sessions,
            vault,
            provider,
            broker,
            timings,
        }
    }

    pub fn vault(&self) -> &TokenVault {
        &self.vault
    }

    pub fn broker(&self) -> &Arc<CompletionBroker> {
        &self.broker
    }

    /// First leg: persists a pending authorization and returns the provider URL
    /// to redirect `user_id` to.
    pub async fn initiate(&self, user_id: &str) -> Result<String, FlowError> {
        let state = generate_secret(Alphabet::UrlSafe, STATE_LENGTH)?;
        let verifier = generate_secret(Alphabet::UrlSafe, VERIFIER_LENGTH)?;

        let pending = PendingAuthorization::new(user_id, state, verifier, self.sessions.ttl());
        self.sessions.put(&pending)?;

        let url = self
            .provider
            .authorization_url(&pending.state, &code_challenge(&pending.verifier));

        self.spawn_completion_waiter(user_id);

        info!(user_id = %user_id, "Redirecting to OAuth provider");
        Ok(url)
    }

    /// Keeps a subscription open for the wait window so the attempt has a
    /// listener, then always unsubscribes.
    fn spawn_completion_waiter(&self, user_id: &str) {
        let mut subscription = self.broker.subscribe(user_id);
        let broker = Arc::clone(&self.broker);
        let wait = self.timings.completion_wait;

        tokio::spawn(async move {
            let outcome = subscription.wait(wait).await;
            match &outcome {
                WaitOutcome::Delivered(LoginResult::Connected) => {
                    debug!(user_id = %subscription.user_id(), "Login attempt completed")
                }
                WaitOutcome::Delivered(LoginResult::Failed(reason)) => {
                    debug!(user_id = %subscription.user_id(), reason = %reason, "Login attempt failed")
                }
                WaitOutcome::TimedOut => {
                    debug!(user_id = %subscription.user_id(), "Timed out waiting for OAuth")
                }
                WaitOutcome::Closed => {}
            }
            broker.unsubscribe(subscription.user_id(), subscription.id());
        });
    }

    /// Second leg: consumes the pending authorization for `state` and exchanges
    /// `code` for a token on behalf of `caller_id`.
    ///
    /// Whatever happens, including a panic inside the attempt, the result is
    /// published exactly once to the completion broker for `caller_id`.
    pub async fn complete(
        &self,
        caller_id: &str,
        state: &str,
        code: &str,
    ) -> Result<Connected, FlowError> {
        let attempt = AssertUnwindSafe(self.complete_attempt(caller_id, state, code))
            .catch_unwind()
            .await;

        let outcome = attempt.unwrap_or_else(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(user_id = %caller_id, panic = %message, "Recovered from a panic in OAuth callback");
            Err(FlowError::Internal(message))
        });

        let result = match &outcome {
            Ok(connected) => {
                info!(
                    user_id = %caller_id,
                    external_username = ?connected.external_username,
                    "OAuth flow completed successfully"
                );
                LoginResult::Connected
            }
            Err(e) if e.is_client_error() => {
                warn!(user_id = %caller_id, error = %e, "OAuth callback rejected");
                LoginResult::Failed(e.public_message().to_string())
            }
            Err(e) => {
                error!(user_id = %caller_id, error = %e, "OAuth callback failed");
                LoginResult::Failed(e.public_message().to_string())
            }
        };
        self.broker.publish(caller_id, result, false);

        outcome
    }

    /// Current credential for `user_id`, or `None` if they never connected.
    ///
    /// A record that no longer decrypts surfaces as [`FlowError::Decryption`];
    /// the only remedy is to connect again.
    pub fn connection(&self, user_id: &str) -> Result<Option<StoredCredential>, FlowError> {
        match self.vault.load(user_id) {
            Ok(credential) => Ok(Some(credential)),
            Err(VaultError::NotConnected) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Forgets the user's credential. Returns `false` if there was none.
    pub fn disconnect(&self, user_id: &str) -> Result<bool, FlowError> {
        let removed = self.vault.disconnect(user_id)?;
        if removed {
            info!(user_id = %user_id, "Disconnected provider account");
        }
        Ok(removed)
    }

    async fn complete_attempt(
        &self,
        caller_id: &str,
        state: &str,
        code: &str,
    ) -> Result<Connected, FlowError> {
        let deadline = Instant::now() + self.timings.callback_budget;

        // Claim the session before any check so a rejected callback still burns it.
        let session = match self.sessions.get(state) {
            Ok(session) => {
                if self.sessions.delete(state)? {
                    Some(session)
                } else {
                    debug!(user_id = %caller_id, "Lost race for pending authorization");
                    None
                }
            }
            Err(SessionError::NotFound) => None,
            Err(e) => return Err(e.into()),
        };

        if code.is_empty() {
            return Err(FlowError::MissingCode);
        }
        let session = session.ok_or(FlowError::InvalidOrExpiredState)?;
        if session.state != state {
            return Err(FlowError::StateMismatch);
        }
        if session.user_id != caller_id {
            return Err(FlowError::UserMismatch);
        }

        let token = timeout_at(deadline, self.provider.exchange(code, &session.verifier))
            .await
            .map_err(|_| ExchangeError::TimedOut)??;

        let external_username =
            match timeout_at(deadline, self.provider.account_username(&token)).await {
                Ok(Ok(username)) => username,
                Ok(Err(e)) => {
                    warn!(user_id = %caller_id, error = %e, "Failed to look up provider account");
                    None
                }
                Err(_) => {
                    warn!(user_id = %caller_id, "Timed out looking up provider account");
                    None
                }
            };

        self.vault
            .store(&session.user_id, &token, external_username.clone())?;

        Ok(Connected {
            user_id: session.user_id,
            external_username,
        })
    }
}
