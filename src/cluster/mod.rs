//! Cluster fan-out of login completions over NATS.
//!
//! A login can finish on one instance while the waiter sits on another. Every
//! locally published completion is broadcast on a core NATS subject; each
//! instance listens on that subject and hands peer events to its own broker
//! with `from_cluster = true` so they are never broadcast again.

use crate::broker::{CompletionBroker, CompletionEvent, LoginResult};
use anyhow::{Context, Result};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Best-effort broadcast to cooperating instances. Must not block.
pub trait ClusterNotifier: Send + Sync {
    fn broadcast(&self, event: CompletionEvent);
}

/// Single-instance deployments.
pub struct NoopNotifier;

impl ClusterNotifier for NoopNotifier {
    fn broadcast(&self, _event: CompletionEvent) {}
}

/// Wire format on the cluster subject.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterMessage {
    /// Instance that published the event
    pub origin: Uuid,
    #[serde(flatten)]
    pub event: CompletionEvent,
}

/// Connects to NATS for cluster fan-out.
pub async fn connect(url: &str) -> Result<async_nats::Client> {
    info!("Connecting to NATS at {}", url);

    async_nats::connect(url)
        .await
        .context("Failed to connect to NATS")
}

/// Publishes completions on a NATS subject.
#[derive(Clone)]
pub struct NatsNotifier {
    client: async_nats::Client,
    subject: String,
    instance_id: Uuid,
}

impl NatsNotifier {
    pub fn new(client: async_nats::Client, subject: impl Into<String>, instance_id: Uuid) -> Self {
        Self {
            client,
            subject: subject.into(),
            instance_id,
        }
    }
}

impl ClusterNotifier for NatsNotifier {
    fn broadcast(&self, event: CompletionEvent) {
        let message = ClusterMessage {
            origin: self.instance_id,
            event,
        };
        let payload = match serde_json::to_vec(&message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to serialize cluster completion event");
                return;
            }
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(user_id = %message.event.user_id, "No runtime available, cluster broadcast skipped");
            return;
        };

        let client = self.client.clone();
        let subject = self.subject.clone();
        let user_id = message.event.user_id;
        runtime.spawn(async move {
            if let Err(e) = client.publish(subject.clone(), payload.into()).await {
                warn!(
                    user_id = %user_id,
                    subject = %subject,
                    error = %e,
                    "Failed to broadcast completion to cluster"
                );
            }
        });
    }
}

/// Applies one message from the cluster subject to the local broker.
///
/// Returns `false` for messages this instance published itself.
pub fn handle_cluster_message(
    payload: &[u8],
    instance_id: Uuid,
    broker: &CompletionBroker,
) -> Result<bool> {
    let message: ClusterMessage =
        serde_json::from_slice(payload).context("Malformed cluster completion event")?;

    if message.origin == instance_id {
        return Ok(false);
    }

    let delivered = broker.publish(
        &message.event.user_id,
        LoginResult::from_error(message.event.error),
        true,
    );
    debug!(
        user_id = %message.event.user_id,
        origin = %message.origin,
        delivered,
        "Applied cluster completion event"
    );
    Ok(true)
}

/// Listens for peer completions until the subscription ends.
pub async fn run_cluster_listener(
    client: async_nats::Client,
    subject: String,
    instance_id: Uuid,
    broker: Arc<CompletionBroker>,
) -> Result<()> {
    let mut subscriber = client
        .subscribe(subject.clone())
        .await
        .with_context(|| format!("Failed to subscribe to '{}'", subject))?;

    info!(subject = %subject, instance_id = %instance_id, "Listening for cluster completions");

    while let Some(message) = subscriber.next().await {
        if let Err(e) = handle_cluster_message(&message.payload, instance_id, &broker) {
            warn!(error = %e, "Ignoring cluster completion event");
        }
    }

    info!(subject = %subject, "Cluster completion subscription ended");
    Ok(())
}
