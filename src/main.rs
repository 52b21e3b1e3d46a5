use anyhow::{Context, Result};
use lichess_connect::api::{create_oauth_router, OAuthAppState};
use lichess_connect::broker::CompletionBroker;
use lichess_connect::cluster::{self, ClusterNotifier, NatsNotifier, NoopNotifier};
use lichess_connect::config::{load_config, save_config, ConnectConfig};
use lichess_connect::credentials::TokenVault;
use lichess_connect::flow::{FlowController, FlowTimings};
use lichess_connect::oauth::{OAuthClient, ProviderConfig};
use lichess_connect::session::SessionStore;
use lichess_connect::store::{run_store_cleanup, KvStore, SqliteKvStore};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lichess_connect=info".into()),
        )
        .init();

    info!("Lichess Connect starting...");

    // Load configuration; environment wins over the file
    let config_path = std::env::var("LICHESS_CONNECT_CONFIG")
        .unwrap_or_else(|_| "connect.toml".to_string());

    let mut config = if Path::new(&config_path).exists() {
        load_config(&config_path)?
    } else {
        warn!(path = %config_path, "Config file not found, using defaults");
        ConnectConfig::default()
    };
    config.apply_env_overrides();
    config.sanitize();

    if config.ensure_defaults()? {
        save_config(&config_path, &config)?;
        info!(path = %config_path, "Generated encryption key and saved configuration");
    }
    config.validate().context("Invalid configuration")?;

    info!(
        base_url = %config.oauth.base_url,
        site_url = %config.oauth.site_url,
        db_path = %config.storage.db_path,
        bind_addr = %config.server.bind_addr,
        clustered = config.cluster.nats_url.is_some(),
        "Configuration loaded"
    );

    // Initialize key/value store (sessions and credentials share it)
    let kv: Arc<dyn KvStore> = Arc::new(
        SqliteKvStore::new(&config.storage.db_path)
            .context("Failed to initialize key/value store")?,
    );
    tokio::spawn(run_store_cleanup(
        Arc::clone(&kv),
        config.storage.cleanup_interval_seconds,
    ));
    info!("Key/value store initialized");

    // Cluster fan-out, when configured
    let instance_id = Uuid::new_v4();
    let nats_client = match &config.cluster.nats_url {
        Some(url) => Some(cluster::connect(url).await?),
        None => None,
    };
    let notifier: Arc<dyn ClusterNotifier> = match &nats_client {
        Some(client) => Arc::new(NatsNotifier::new(
            client.clone(),
            config.cluster.subject.clone(),
            instance_id,
        )),
        None => Arc::new(NoopNotifier),
    };

    let broker = Arc::new(CompletionBroker::new(notifier));

    if let Some(client) = nats_client {
        let subject = config.cluster.subject.clone();
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            if let Err(e) = cluster::run_cluster_listener(client, subject, instance_id, broker).await {
                tracing::error!(error = %e, "Cluster listener stopped");
            }
        });
    }

    // Connect flow
    let provider = ProviderConfig::from_config(&config.oauth)?;
    info!(redirect_uri = %provider.redirect_uri, "OAuth provider configured");

    let flow = FlowController::new(
        SessionStore::new(Arc::clone(&kv), config.flow.session_ttl()),
        TokenVault::new(Arc::clone(&kv), &config.oauth.encryption_key)?,
        Arc::new(OAuthClient::new(provider)),
        Arc::clone(&broker),
        FlowTimings {
            completion_wait: config.flow.completion_wait(),
            callback_budget: config.flow.callback_budget(),
        },
    );

    // Start HTTP API server
    let router = create_oauth_router(OAuthAppState {
        flow,
        identity_cookie: config.server.identity_cookie.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .context("Failed to bind HTTP listener")?;
    info!(bind_addr = %config.server.bind_addr, "HTTP API listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    // Graceful shutdown
    server_handle.abort();
    broker.close();
    info!("Lichess Connect stopped");

    Ok(())
}
