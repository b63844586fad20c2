// src/ami/correlator.rs
//! Matches responses to the actions waiting for them

use crate::ami::action::Action;
use crate::ami::connection::DisconnectReason;
use crate::ami::response::AmiResponse;
use crate::error::{AmiError, AmiResult};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

type Slot = oneshot::Sender<AmiResult<AmiResponse>>;

struct Waiter {
    seq: u64,
    action: String,
    tx: Slot,
}

#[derive(Default)]
struct Registry {
    next_seq: u64,
    /// Actions without an ActionID, in the order they were written.
    fifo: VecDeque<Waiter>,
    by_id: HashMap<String, Waiter>,
    closed: Option<DisconnectReason>,
}

/// Waiter registry shared by senders and the reader task.
///
/// A waiter whose caller gave up stays queued with a dropped receiver so the
/// late response still consumes its slot and never reaches the next caller.
pub(crate) struct Correlator {
    inner: Mutex<Registry>,
}

/// Handle returned by [`Correlator::register`].
pub(crate) struct PendingResponse {
    seq: u64,
    action: String,
    action_id: Option<String>,
    rx: oneshot::Receiver<AmiResult<AmiResponse>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Registry::default()),
        }
    }

    /// Register a waiter for `action`. Must be called before the action's
    /// bytes are written.
    pub fn register(&self, action: &Action) -> AmiResult<PendingResponse> {
        let mut reg = self.inner.lock();
        if let Some(reason) = &reg.closed {
            return Err(AmiError::Disconnected(reason.clone()));
        }

        reg.next_seq += 1;
        let seq = reg.next_seq;
        let (tx, rx) = oneshot::channel();
        let waiter = Waiter {
            seq,
            action: action.name().to_string(),
            tx,
        };

        match action.action_id() {
            Some(id) => {
                reg.by_id.retain(|_, w| !w.tx.is_closed());
                if reg.by_id.insert(id.to_string(), waiter).is_some() {
                    warn!("[CORRELATE] ActionID {} reused, previous waiter replaced", id);
                }
            }
            None => reg.fifo.push_back(waiter),
        }

        Ok(PendingResponse {
            seq,
            action: action.name().to_string(),
            action_id: action.action_id().map(str::to_string),
            rx,
        })
    }

    /// Drop a waiter whose action never made it onto the wire.
    pub fn cancel(&self, pending: &PendingResponse) {
        let mut reg = self.inner.lock();
        match &pending.action_id {
            Some(id) => {
                if reg.by_id.get(id).map(|w| w.seq) == Some(pending.seq) {
                    reg.by_id.remove(id);
                }
            }
            None => reg.fifo.retain(|w| w.seq != pending.seq),
        }
    }

    /// Route a response to its waiter.
    pub fn resolve(&self, response: AmiResponse) {
        let waiter = {
            let mut reg = self.inner.lock();
            match response.action_id() {
                Some(id) => match reg.by_id.remove(id) {
                    Some(waiter) => waiter,
                    None => {
                        warn!(
                            "[CORRELATE] Response for unknown ActionID {} dropped: {}",
                            id,
                            response.message_or_default()
                        );
                        return;
                    }
                },
                None => match reg.fifo.pop_front() {
                    Some(waiter) => waiter,
                    None => {
                        warn!(
                            "[CORRELATE] Response with no pending action dropped: {} {}",
                            response.status(),
                            response.message_or_default()
                        );
                        return;
                    }
                },
            }
        };

        if waiter.tx.send(Ok(response)).is_err() {
            debug!(
                "[CORRELATE] Late response for {} discarded (caller timed out)",
                waiter.action
            );
        }
    }

    /// Release every waiter with `reason` and refuse new registrations.
    pub fn close(&self, reason: DisconnectReason) {
        let waiters: Vec<Waiter> = {
            let mut reg = self.inner.lock();
            if reg.closed.is_none() {
                reg.closed = Some(reason.clone());
            }
            let mut drained: Vec<Waiter> = reg.fifo.drain(..).collect();
            drained.extend(reg.by_id.drain().map(|(_, w)| w));
            drained
        };

        let released = waiters
            .into_iter()
            .map(|w| w.tx.send(Err(AmiError::Disconnected(reason.clone()))).is_ok())
            .filter(|sent| *sent)
            .count();
        if released > 0 {
            debug!("[CORRELATE] Released {} pending waiters: {}", released, reason);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed.is_some()
    }

    pub fn closed_reason(&self) -> Option<DisconnectReason> {
        self.inner.lock().closed.clone()
    }

    /// Number of queued waiters, including ones whose caller already gave up.
    pub fn pending_count(&self) -> usize {
        let reg = self.inner.lock();
        reg.fifo.len() + reg.by_id.len()
    }
}

impl PendingResponse {
    /// Wait for the response. On timeout the waiter stays registered so the
    /// response, if it ever arrives, is swallowed.
    pub async fn wait(self, limit: Duration) -> AmiResult<AmiResponse> {
        match timeout(limit, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AmiError::Disconnected(DisconnectReason::ConnectionClosed)),
            Err(_) => {
                warn!(
                    "[CORRELATE] {} timed out after {}ms",
                    self.action,
                    limit.as_millis()
                );
                Err(AmiError::ActionTimeout {
                    action: self.action,
                    timeout_ms: limit.as_millis() as u64,
                })
            }
        }
    }
}
