// src/services/jobs.rs
use crate::error::AmiResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

pub const JOB_CONVERSATION_FROM_CALL: &str = "conversation_from_call";
pub const JOB_UPDATE_CALL: &str = "update_call";

/// Persistence side of the bridge: conversations and their call activity.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn ensure_conversation_started(
        &self,
        account_id: i64,
        inbox_id: i64,
        caller_number: &str,
        caller_name: &str,
        call_id: &str,
        metadata: &serde_json::Value,
    ) -> AmiResult<()>;

    async fn apply_call_lifecycle_update(
        &self,
        account_id: i64,
        inbox_id: i64,
        call_id: &str,
        status_summary: &str,
        metadata: &serde_json::Value,
    ) -> AmiResult<()>;
}

/// A lifecycle fact handed to the task queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job_type", rename_all = "snake_case")]
pub enum LifecycleJob {
    ConversationFromCall {
        call_id: String,
        caller_number: String,
        caller_name: Option<String>,
        channel_state: Option<String>,
        summary: String,
        metadata: serde_json::Value,
    },
    UpdateCall {
        call_id: String,
        status_summary: String,
        metadata: serde_json::Value,
    },
}

impl LifecycleJob {
    pub fn job_type(&self) -> &'static str {
        match self {
            LifecycleJob::ConversationFromCall { .. } => JOB_CONVERSATION_FROM_CALL,
            LifecycleJob::UpdateCall { .. } => JOB_UPDATE_CALL,
        }
    }

    pub fn call_id(&self) -> &str {
        match self {
            LifecycleJob::ConversationFromCall { call_id, .. } => call_id,
            LifecycleJob::UpdateCall { call_id, .. } => call_id,
        }
    }

    pub fn to_payload(&self) -> AmiResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_payload(payload: serde_json::Value) -> AmiResult<Self> {
        Ok(serde_json::from_value(payload)?)
    }

    /// Apply the job to the store.
    #[instrument(skip(self, store), fields(job = self.job_type(), call_id = self.call_id()))]
    pub async fn perform(
        &self,
        store: &dyn ConversationStore,
        account_id: i64,
        inbox_id: i64,
    ) -> AmiResult<()> {
        match self {
            LifecycleJob::ConversationFromCall {
                call_id,
                caller_number,
                caller_name,
                metadata,
                ..
            } => {
                // Unknown names show the number instead.
                let name = caller_name
                    .as_deref()
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or(caller_number);
                debug!(
                    "Ensuring conversation for call {} from {} ({})",
                    call_id, name, caller_number
                );
                store
                    .ensure_conversation_started(
                        account_id,
                        inbox_id,
                        caller_number,
                        name,
                        call_id,
                        metadata,
                    )
                    .await
            }
            LifecycleJob::UpdateCall {
                call_id,
                status_summary,
                metadata,
            } => {
                debug!("Applying lifecycle update for call {}: {}", call_id, status_summary);
                store
                    .apply_call_lifecycle_update(account_id, inbox_id, call_id, status_summary, metadata)
                    .await
            }
        }
    }
}
