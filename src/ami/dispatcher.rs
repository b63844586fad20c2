// src/ami/dispatcher.rs
//! Event name to handler routing

use crate::ami::event::AmiEvent;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Receives events from the dispatcher task.
///
/// Handlers run one at a time in arrival order. A returned error is logged
/// and does not stop delivery to later handlers or events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &AmiEvent) -> anyhow::Result<()>;

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Adapter for plain closures.
pub struct FnHandler<F> {
    name: String,
    f: F,
}

pub fn handler_fn<F>(name: &str, f: F) -> Arc<FnHandler<F>>
where
    F: Fn(&AmiEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler {
        name: name.to_string(),
        f,
    })
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&AmiEvent) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, event: &AmiEvent) -> anyhow::Result<()> {
        (self.f)(event)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Immutable event name -> handlers table, fixed when the connection is
/// built.
#[derive(Default, Clone)]
pub struct DispatchTable {
    by_name: HashMap<String, Vec<Arc<dyn EventHandler>>>,
    catch_all: Vec<Arc<dyn EventHandler>>,
}

#[derive(Default)]
pub struct DispatchTableBuilder {
    table: DispatchTable,
}

impl DispatchTableBuilder {
    /// Route events named `name` (any case) to `handler`.
    pub fn on(mut self, name: &str, handler: Arc<dyn EventHandler>) -> Self {
        self.table
            .by_name
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(handler);
        self
    }

    /// Route every event name in `names` to the same handler.
    pub fn on_each(mut self, names: &[&str], handler: Arc<dyn EventHandler>) -> Self {
        for name in names {
            self = self.on(name, handler.clone());
        }
        self
    }

    /// Receive every event after the named handlers have run.
    pub fn on_any(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.table.catch_all.push(handler);
        self
    }

    pub fn build(self) -> DispatchTable {
        self.table
    }
}

impl DispatchTable {
    pub fn builder() -> DispatchTableBuilder {
        DispatchTableBuilder::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty() && self.catch_all.is_empty()
    }

    pub fn handler_count(&self, name: &str) -> usize {
        self.by_name
            .get(&name.to_ascii_lowercase())
            .map(Vec::len)
            .unwrap_or(0)
            + self.catch_all.len()
    }

    /// Run every matching handler in registration order. Returns the number
    /// of handlers that failed.
    pub async fn dispatch(&self, event: &AmiEvent) -> usize {
        let named = self
            .by_name
            .get(&event.name().to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut failures = 0;
        for handler in named.iter().chain(self.catch_all.iter()) {
            if let Err(e) = handler.handle(event).await {
                failures += 1;
                error!(
                    "Handler {} failed on {} (Uniqueid {:?}): {:#}",
                    handler.name(),
                    event.name(),
                    event.unique_id(),
                    e
                );
            }
        }
        failures
    }
}

/// Drain the event queue until the reader drops its sender or the session
/// is cancelled.
pub(crate) async fn run_dispatcher(
    table: Arc<DispatchTable>,
    mut events: mpsc::Receiver<AmiEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = events.recv() => match next {
                Some(event) => event,
                None => break,
            },
        };
        table.dispatch(&event).await;
    }
    debug!("Event dispatcher stopped");
}
