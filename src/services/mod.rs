// src/services/mod.rs
pub mod call_tracker;
pub mod jobs;
pub mod originator;
pub mod task_queue;

pub use call_tracker::CallTracker;
pub use jobs::{ConversationStore, LifecycleJob, JOB_CONVERSATION_FROM_CALL, JOB_UPDATE_CALL};
pub use originator::{render_channel, OriginateOutcome, OriginateRequest, Originator};
pub use task_queue::{LocalTaskQueue, QueuedJob, TaskQueue, WebhookTaskQueue};
