// src/models/call_session.rs
use crate::models::call_event::{is_answered_dial_status, is_failed_dial_status, CallEvent};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::json;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Channel hung up
    HungUp,
    /// Dial attempt failed before the call was ever bridged
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    New,
    Dialing,
    Bridged,
    Ended(EndReason),
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::New => "new",
            CallStatus::Dialing => "dialing",
            CallStatus::Bridged => "bridged",
            CallStatus::Ended(EndReason::HungUp) => "ended",
            CallStatus::Ended(EndReason::Failed) => "failed_not_bridged",
        }
    }

    /// Position along New -> Dialing -> Bridged -> Ended.
    pub fn rank(&self) -> u8 {
        match self {
            CallStatus::New => 0,
            CallStatus::Dialing => 1,
            CallStatus::Bridged => 2,
            CallStatus::Ended(_) => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Ended(_))
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CallStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub event_name: String,
    pub received_at: DateTime<Utc>,
}

/// Externally visible result of applying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionChange {
    /// First ringing `Newchannel` with a caller number
    ConversationStarted {
        caller_number: String,
        caller_name: Option<String>,
        channel_state: Option<String>,
    },
    Updated {
        previous: CallStatus,
        summary: String,
    },
}

/// Lifecycle record of one call, keyed by the switch's unique id.
#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    pub call_id: String,
    pub status: CallStatus,
    pub last_event_name: Option<String>,
    pub caller_number: Option<String>,
    pub caller_name: Option<String>,
    pub channel: Option<String>,
    /// Advisory only, never used for lookup
    pub dest_id: Option<String>,
    /// Advisory only, never used for lookup
    pub bridge_id: Option<String>,
    pub dial_string: Option<String>,
    pub dial_status: Option<String>,
    pub bridge_peer: Option<String>,
    pub hangup_cause: Option<String>,
    pub recording_path: Option<String>,
    pub conversation_started: bool,
    pub answered: bool,
    pub bridge_left: bool,
    pub history: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CallSession {
    pub fn new(call_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            call_id: call_id.to_string(),
            status: CallStatus::New,
            last_event_name: None,
            caller_number: None,
            caller_name: None,
            channel: None,
            dest_id: None,
            bridge_id: None,
            dial_string: None,
            dial_status: None,
            bridge_peer: None,
            hangup_cause: None,
            recording_path: None,
            conversation_started: false,
            answered: false,
            bridge_left: false,
            history: Vec::new(),
            created_at: at,
            updated_at: at,
        }
    }

    pub fn was_bridged(&self) -> bool {
        self.bridge_peer.is_some() || self.bridge_id.is_some() || self.status == CallStatus::Bridged
    }

    /// Fold one event into the session.
    ///
    /// Status only moves forward; an event that does not fit the current
    /// status is recorded in the history and otherwise ignored.
    pub fn apply(
        &mut self,
        event: &CallEvent,
        event_name: &str,
        received_at: DateTime<Utc>,
    ) -> Option<SessionChange> {
        self.history.push(HistoryEntry {
            event_name: event_name.to_string(),
            received_at,
        });
        self.last_event_name = Some(event_name.to_string());
        self.updated_at = received_at;

        let previous = self.status;
        let summary = match event {
            CallEvent::NewChannel {
                channel_state,
                caller_number,
                caller_name,
                channel,
            } => {
                if self.channel.is_none() {
                    self.channel = channel.clone();
                }
                let Some(number) = caller_number else {
                    return None;
                };
                if self.conversation_started || previous.is_terminal() || !event.is_ringing_channel() {
                    return None;
                }
                self.conversation_started = true;
                self.caller_number = Some(number.clone());
                self.caller_name = caller_name.clone();
                return Some(SessionChange::ConversationStarted {
                    caller_number: number.clone(),
                    caller_name: caller_name.clone(),
                    channel_state: channel_state.clone(),
                });
            }
            CallEvent::DialBegin { dial_string, dest_id } => match previous {
                CallStatus::New | CallStatus::Dialing => {
                    self.status = CallStatus::Dialing;
                    self.dial_string = dial_string.clone();
                    if dest_id.is_some() {
                        self.dest_id = dest_id.clone();
                    }
                    format!(
                        "Call dialing to {}...",
                        self.dial_string.as_deref().unwrap_or("unknown")
                    )
                }
                _ => return None,
            },
            CallEvent::DialEnd { dial_status, .. } => {
                if previous != CallStatus::Dialing {
                    return None;
                }
                let status = dial_status.clone().unwrap_or_default();
                self.dial_status = dial_status.clone();
                if is_answered_dial_status(&status) {
                    self.answered = true;
                } else if is_failed_dial_status(&status) && !self.answered && !self.was_bridged() {
                    self.status = CallStatus::Ended(EndReason::Failed);
                }
                format!("Call attempt ended. Status: {}", status)
            }
            CallEvent::BridgeEnter { bridge_id, peer } => match previous {
                CallStatus::New | CallStatus::Dialing => {
                    self.status = CallStatus::Bridged;
                    self.bridge_id = bridge_id.clone();
                    self.bridge_peer = peer.clone();
                    self.bridge_left = false;
                    "Call connected.".to_string()
                }
                CallStatus::Bridged => {
                    // Re-bridged after a transfer: keep the record current quietly.
                    if bridge_id.is_some() {
                        self.bridge_id = bridge_id.clone();
                    }
                    if peer.is_some() {
                        self.bridge_peer = peer.clone();
                    }
                    self.bridge_left = false;
                    return None;
                }
                CallStatus::Ended(_) => return None,
            },
            CallEvent::BridgeLeave { .. } => {
                if previous != CallStatus::Bridged || self.bridge_left {
                    return None;
                }
                self.bridge_left = true;
                "Call disconnected from bridge.".to_string()
            }
            CallEvent::Hangup { cause } => {
                if previous.is_terminal() {
                    if self.hangup_cause.is_none() {
                        self.hangup_cause = cause.clone();
                    }
                    return None;
                }
                self.status = CallStatus::Ended(EndReason::HungUp);
                self.hangup_cause = cause.clone();
                format!(
                    "Call hung up. Reason: {}",
                    cause.as_deref().unwrap_or("unknown")
                )
            }
            CallEvent::Recording { path } => {
                if self.recording_path.as_deref() == Some(path.as_str()) {
                    return None;
                }
                self.recording_path = Some(path.clone());
                format!("Call recording available: {}", path)
            }
            CallEvent::IgnoredVariable | CallEvent::Other => return None,
        };

        Some(SessionChange::Updated { previous, summary })
    }

    /// Derived-field snapshot sent with every lifecycle notification.
    pub fn metadata(&self) -> serde_json::Value {
        json!({
            "call_id": self.call_id,
            "call_status": self.status.as_str(),
            "last_event": self.last_event_name,
            "caller_number": self.caller_number,
            "caller_name": self.caller_name,
            "channel": self.channel,
            "dest_id": self.dest_id,
            "bridge_id": self.bridge_id,
            "dial_string": self.dial_string,
            "dial_status": self.dial_status,
            "bridge_peer": self.bridge_peer,
            "hangup_cause": self.hangup_cause,
            "recording_path": self.recording_path,
            "event_count": self.history.len(),
        })
    }
}
