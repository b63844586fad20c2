// src/services/call_tracker.rs
use crate::ami::{AmiEvent, EventHandler};
use crate::config::TrackerSettings;
use crate::error::AmiResult;
use crate::models::{CallEvent, CallSession, SessionChange};
use crate::services::jobs::LifecycleJob;
use crate::services::task_queue::TaskQueue;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, instrument, trace};

/// Bounded memory of recently applied event fingerprints.
struct DedupWindow {
    capacity: usize,
    order: VecDeque<u64>,
    seen: HashSet<u64>,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::with_capacity(capacity.max(1)),
            seen: HashSet::with_capacity(capacity.max(1)),
        }
    }

    /// Remember `fingerprint`; false if it is already in the window.
    fn insert(&mut self, fingerprint: u64) -> bool {
        if !self.seen.insert(fingerprint) {
            return false;
        }
        self.order.push_back(fingerprint);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

struct TrackerState {
    sessions: HashMap<String, CallSession>,
    dedup: DedupWindow,
}

/// Folds the event stream of one channel into per-call sessions and submits
/// a lifecycle job for every externally visible change.
pub struct CallTracker {
    account_id: i64,
    inbox_id: i64,
    recording_variable: String,
    queue: Arc<dyn TaskQueue>,
    state: Mutex<TrackerState>,
}

impl CallTracker {
    pub fn new(
        account_id: i64,
        inbox_id: i64,
        settings: &TrackerSettings,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            account_id,
            inbox_id,
            recording_variable: settings.recording_variable.clone(),
            queue,
            state: Mutex::new(TrackerState {
                sessions: HashMap::new(),
                dedup: DedupWindow::new(settings.dedup_window),
            }),
        }
    }

    /// Apply one event to the session map. Returns the job to submit, if any.
    ///
    /// Runs entirely under the tracker lock and never waits on I/O.
    pub fn apply(&self, event: &AmiEvent) -> Option<LifecycleJob> {
        let Some(call_id) = event.unique_id() else {
            trace!("Event {} without Uniqueid ignored", event.name());
            return None;
        };
        let parsed = CallEvent::parse(event, &self.recording_variable);
        if matches!(parsed, CallEvent::IgnoredVariable) {
            return None;
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;

        if !state.sessions.contains_key(call_id) && !parsed.opens_session() {
            return None;
        }
        if !state.dedup.insert(event.fingerprint()) {
            debug!("Duplicate {} for call {} ignored", event.name(), call_id);
            return None;
        }

        let session = state
            .sessions
            .entry(call_id.to_string())
            .or_insert_with(|| {
                info!("📞 New call session: {}", call_id);
                CallSession::new(call_id, event.received_at())
            });

        let change = session.apply(&parsed, event.name(), event.received_at())?;
        Some(Self::job_for(session, change))
    }

    fn job_for(session: &CallSession, change: SessionChange) -> LifecycleJob {
        match change {
            SessionChange::ConversationStarted {
                caller_number,
                caller_name,
                channel_state,
            } => {
                let shown = caller_name
                    .as_deref()
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or(&caller_number);
                info!(
                    "Incoming call {} from {} ({})",
                    session.call_id, shown, caller_number
                );
                LifecycleJob::ConversationFromCall {
                    call_id: session.call_id.clone(),
                    summary: format!("Incoming call from {} ({})", shown, caller_number),
                    caller_number,
                    caller_name,
                    channel_state,
                    metadata: session.metadata(),
                }
            }
            SessionChange::Updated { previous, summary } => {
                if previous != session.status {
                    info!(
                        "Call {} status: {} -> {}",
                        session.call_id, previous, session.status
                    );
                }
                LifecycleJob::UpdateCall {
                    call_id: session.call_id.clone(),
                    status_summary: summary,
                    metadata: session.metadata(),
                }
            }
        }
    }

    /// Apply `event` and submit the resulting job. The queue is called after
    /// the tracker lock is released.
    #[instrument(skip(self, event), fields(event = %event.name(), call_id = ?event.unique_id()))]
    pub async fn handle_event(&self, event: &AmiEvent) -> AmiResult<()> {
        let Some(job) = self.apply(event) else {
            return Ok(());
        };
        let payload = job.to_payload()?;
        self.queue
            .enqueue(job.job_type(), self.account_id, self.inbox_id, payload)
            .await
    }

    pub fn session(&self, call_id: &str) -> Option<CallSession> {
        self.state.lock().sessions.get(call_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn account_id(&self) -> i64 {
        self.account_id
    }

    pub fn inbox_id(&self) -> i64 {
        self.inbox_id
    }
}

#[async_trait]
impl EventHandler for CallTracker {
    async fn handle(&self, event: &AmiEvent) -> anyhow::Result<()> {
        self.handle_event(event).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "call-tracker"
    }
}
