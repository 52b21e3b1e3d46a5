//! Login completion broker.
//!
//! Lets any number of in-process waiters block until a user's login attempt
//! resolves, even though the resolution happens on a different HTTP request
//! (and possibly on a different instance of the cluster).
//!
//! Each subscription moves from Waiting to exactly one terminal state:
//! Delivered (a result arrived), TimedOut (the waiter gave up), Unsubscribed,
//! or Closed (broker shut down). Delivery never blocks the publisher: every
//! subscription owns a capacity-1 channel and a full or dropped receiver is
//! skipped.

use crate::cluster::ClusterNotifier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};


/// How a login attempt ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoginResult {
    Connected,
    /// Client-safe description of the failure
    Failed(String),
}

impl LoginResult {
    pub fn from_error(error: Option<String>) -> Self {
        match error {
            None => LoginResult::Connected,
            Some(message) => LoginResult::Failed(message),
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            LoginResult::Connected => None,
            LoginResult::Failed(message) => Some(message),
        }
    }
}

/// Resolution of a login, as exchanged between cluster peers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub user_id: String,
    pub error: Option<String>,
}

/// Result of [`Subscription::wait`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Delivered(LoginResult),
    TimedOut,
    /// Unsubscribed, or the broker was closed.
    Closed,
}

/// Handle held by a waiter.
pub struct Subscription {
    id: u64,
    user_id: String,
    created_at: DateTime<Utc>,
    receiver: mpsc::Receiver<LoginResult>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Waits for the result. `None` once the subscription has been removed
    /// without a delivery.
    pub async fn recv(&mut self) -> Option<LoginResult> {
        self.receiver.recv().await
    }

    /// Non-blocking check for a delivered result.
    pub fn try_recv(&mut self) -> Option<LoginResult> {
        self.receiver.try_recv().ok()
    }

    pub async fn wait(&mut self, timeout: Duration) -> WaitOutcome {
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(Some(result)) => WaitOutcome::Delivered(result),
            Ok(None) => WaitOutcome::Closed,
            Err(_) => WaitOutcome::TimedOut,
        }
    }
}

struct Waiter {
    id: u64,
    sender: mpsc::Sender<LoginResult>,
}

#[derive(Default)]
struct Registry {
    closed: bool,
    waiters: HashMap<String, Vec<Waiter>>,
}

/// Publish/subscribe hub for login completions, keyed by user id.
pub struct CompletionBroker {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    cluster: Arc<dyn ClusterNotifier>,
}

impl CompletionBroker {
    pub fn new(cluster: Arc<dyn ClusterNotifier>) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
            cluster,
        }
    }

    // A panic while the lock is held cannot leave the map half-updated, so a
    // poisoned lock is still safe to use.
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new waiting subscription for `user_id`.
    ///
    /// On a closed broker the subscription is returned already terminated.
    pub fn subscribe(&self, user_id: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(1);

        let mut registry = self.registry();
        if !registry.closed {
            registry
                .waiters
                .entry(user_id.to_string())
                .or_default()
                .push(Waiter { id, sender });
        }
        drop(registry);

        debug!(user_id = %user_id, subscription_id = id, "Completion subscription registered");

        Subscription {
            id,
            user_id: user_id.to_string(),
            created_at: Utc::now(),
            receiver,
        }
    }

    /// Removes a subscription. Idempotent, and harmless after delivery.
    pub fn unsubscribe(&self, user_id: &str, subscription_id: u64) {
        let mut registry = self.registry();
        if let Some(waiters) = registry.waiters.get_mut(user_id) {
            waiters.retain(|w| w.id != subscription_id);
            if waiters.is_empty() {
                registry.waiters.remove(user_id);
            }
        }
    }

    /// Delivers `result` to every current waiter for `user_id` and removes them.
    ///
    /// Locally originated results are also broadcast to cluster peers; results
    /// that arrived from the cluster are not re-broadcast. Returns the number of
    /// waiters that received the result. A no-op once the broker is closed.
    pub fn publish(&self, user_id: &str, result: LoginResult, from_cluster: bool) -> usize {
        let waiters = {
            let mut registry = self.registry();
            if registry.closed {
                return 0;
            }
            registry.waiters.remove(user_id).unwrap_or_default()
        };

        let delivered = waiters
            .iter()
            .filter(|w| w.sender.try_send(result.clone()).is_ok())
            .count();

        debug!(
            user_id = %user_id,
            waiters = waiters.len(),
            delivered,
            from_cluster,
            "Published login completion"
        );

        if !from_cluster {
            self.cluster.broadcast(CompletionEvent {
                user_id: user_id.to_string(),
                error: result.error().map(str::to_string),
            });
        }

        delivered
    }

    /// Shuts the broker down. Pending waiters observe [`WaitOutcome::Closed`].
    pub fn close(&self) {
        let drained = {
            let mut registry = self.registry();
            if registry.closed {
                return;
            }
            registry.closed = true;
            std::mem::take(&mut registry.waiters)
        };

        let pending: usize = drained.values().map(Vec::len).sum();
        info!(pending, "Completion broker closed");
    }

    pub fn is_closed(&self) -> bool {
        self.registry().closed
    }

    /// Number of waiting subscriptions for `user_id`.
    pub fn subscriber_count(&self, user_id: &str) -> usize {
        self.registry().waiters.get(user_id).map_or(0, Vec::len)
    }
}
