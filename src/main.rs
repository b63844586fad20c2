// src/main.rs
use ami_bridge::ami::{AmiConnection, BridgeCluster, ConnectionSettings, DispatchTable};
use ami_bridge::config::AppConfig;
use ami_bridge::services::{CallTracker, TaskQueue, WebhookTaskQueue};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_line_number(true)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("🚀 Starting AMI bridge");

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if config.channels.is_empty() {
        warn!("⚠️  No channels configured, nothing to do");
        return Ok(());
    }

    let mut connections = Vec::with_capacity(config.channels.len());
    let mut webhook_workers = Vec::with_capacity(config.channels.len());
    for channel in &config.channels {
        let (webhook, worker) = WebhookTaskQueue::start(
            &channel.webhook_url,
            config.tracker.webhook_timeout_ms,
            config.tracker.job_queue_size,
        )?;
        webhook_workers.push(worker);
        let queue: Arc<dyn TaskQueue> = Arc::new(webhook);
        let tracker = Arc::new(CallTracker::new(
            channel.account_id,
            channel.inbox_id,
            &config.tracker,
            queue,
        ));
        let dispatch = DispatchTable::builder().on_any(tracker).build();

        let settings = ConnectionSettings::from_config(channel, &config.ami);
        info!(
            "Channel inbox={} account={} -> {}",
            channel.inbox_id,
            channel.account_id,
            settings.server_id()
        );
        connections.push(Arc::new(AmiConnection::new(settings, dispatch)));
    }

    let cluster = BridgeCluster::new(connections);
    cluster.start();
    info!("✅ Bridge cluster started ({} channels)", cluster.connections().len());

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }

    info!("Shutting down");
    cluster.shutdown().await;
    drop(cluster);

    // Workers exit once every tracker (and its queue sender) is gone.
    let flush = futures::future::join_all(webhook_workers);
    if tokio::time::timeout(Duration::from_secs(5), flush).await.is_err() {
        warn!("⚠️  Webhook delivery still busy at exit, pending jobs dropped");
    }
    info!("👋 AMI bridge stopped");
    Ok(())
}
