// src/ami/client.rs
use crate::ami::connection::{AmiConnection, ConnectionStatus};
use crate::ami::constants::{
    INITIAL_RECONNECT_DELAY_MS, MAX_RECONNECT_ATTEMPTS, MAX_RECONNECT_DELAY_MS,
};
use crate::config::ReconnectSettings;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Exponential backoff with jitter between connection attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    /// 0 means unlimited
    max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(INITIAL_RECONNECT_DELAY_MS),
            max_delay: Duration::from_millis(MAX_RECONNECT_DELAY_MS),
            max_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            max_attempts,
        }
    }

    pub fn from_settings(settings: &ReconnectSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.initial_delay_ms),
            Duration::from_millis(settings.max_delay_ms),
            settings.max_attempts,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts != 0 && attempts >= self.max_attempts
    }

    /// Delay after the `attempt`-th failure (1-based): the doubled base
    /// capped at `max_delay`, then jittered into its upper half.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let base = self
            .initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        let base_ms = base.as_millis() as u64;
        if base_ms < 2 {
            return base;
        }
        let jittered = rand::thread_rng().gen_range(base_ms / 2..=base_ms);
        Duration::from_millis(jittered)
    }
}

/// Keeps one connection per configured channel alive.
pub struct BridgeCluster {
    connections: Vec<Arc<AmiConnection>>,
    cancel: CancellationToken,
    supervisors: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl BridgeCluster {
    pub fn new(connections: Vec<Arc<AmiConnection>>) -> Self {
        Self {
            connections,
            cancel: CancellationToken::new(),
            supervisors: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn connections(&self) -> &[Arc<AmiConnection>] {
        &self.connections
    }

    pub fn start(&self) {
        let mut supervisors = self.supervisors.lock();
        for connection in &self.connections {
            let connection = connection.clone();
            let cancel = self.cancel.clone();
            supervisors.push(tokio::spawn(async move {
                BridgeClient::run(connection, cancel).await;
            }));
        }
        info!("Started {} AMI supervisors", supervisors.len());
    }

    /// Stop supervising and close every connection.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let supervisors: Vec<JoinHandle<()>> = std::mem::take(&mut *self.supervisors.lock());
        for supervisor in supervisors {
            if let Err(e) = supervisor.await {
                warn!("AMI supervisor ended abnormally: {}", e);
            }
        }
        for connection in &self.connections {
            connection.disconnect().await;
        }
        info!("All AMI connections closed");
    }
}

struct BridgeClient;

impl BridgeClient {
    async fn run(connection: Arc<AmiConnection>, cancel: CancellationToken) {
        let server_id = connection.server_id().to_string();

        loop {
            info!("Connecting to AMI: {}", server_id);

            let connected = tokio::select! {
                _ = cancel.cancelled() => return,
                result = connection.connect_with_retry() => result,
            };

            if let Err(e) = connected {
                error!("AMI supervisor for {} stopped: {}", server_id, e);
                return;
            }

            let mut status = connection.subscribe_status();
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = status.wait_for(|s| *s != ConnectionStatus::Ready) => {
                    if changed.is_err() {
                        return;
                    }
                }
            }

            let delay = connection.settings().reconnect.delay_for(1);
            warn!(
                "AMI connection {} lost ({}), reconnecting in {}ms",
                server_id,
                connection.status(),
                delay.as_millis()
            );
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(delay) => {}
            }
        }
    }
}
