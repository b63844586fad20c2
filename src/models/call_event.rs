// src/models/call_event.rs
use crate::ami::constants::events;
use crate::ami::AmiEvent;

/// Dial statuses that end an unanswered attempt.
pub const FAILED_DIAL_STATUSES: &[&str] = &["BUSY", "NOANSWER", "CONGESTION", "CANCEL", "CHANUNAVAIL"];

/// Channel states that count as ringing on `Newchannel`.
const RINGING_STATES: &[&str] = &["Ring", "Ringing"];

/// Typed view of the events that drive the call lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    NewChannel {
        channel_state: Option<String>,
        caller_number: Option<String>,
        caller_name: Option<String>,
        channel: Option<String>,
    },
    DialBegin {
        dial_string: Option<String>,
        dest_id: Option<String>,
    },
    DialEnd {
        dial_status: Option<String>,
        dest_id: Option<String>,
    },
    BridgeEnter {
        bridge_id: Option<String>,
        peer: Option<String>,
    },
    BridgeLeave {
        bridge_id: Option<String>,
    },
    Hangup {
        cause: Option<String>,
    },
    /// Recording path announced through the configured channel variable
    Recording {
        path: String,
    },
    /// Variable-set event for some other variable
    IgnoredVariable,
    Other,
}

fn owned(value: Option<&str>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl CallEvent {
    /// Classify `event`. `recording_variable` names the channel variable that
    /// carries the recording path.
    pub fn parse(event: &AmiEvent, recording_variable: &str) -> Self {
        let name = event.name();
        let is = |expected: &str| name.eq_ignore_ascii_case(expected);

        if is(events::NEW_CHANNEL) {
            CallEvent::NewChannel {
                channel_state: owned(event.header("ChannelStateDesc")),
                caller_number: owned(event.caller_id_num()),
                caller_name: owned(event.caller_id_name()),
                channel: owned(event.channel()),
            }
        } else if is(events::DIAL_BEGIN) {
            CallEvent::DialBegin {
                dial_string: owned(event.header("DialString")),
                dest_id: owned(event.header("DestUniqueid")),
            }
        } else if is(events::DIAL_END) {
            CallEvent::DialEnd {
                dial_status: owned(event.header("DialStatus")),
                dest_id: owned(event.header("DestUniqueid")),
            }
        } else if is(events::BRIDGE_ENTER) {
            CallEvent::BridgeEnter {
                bridge_id: owned(event.header("BridgeUniqueid")),
                peer: owned(event.header("ConnectedLineNum")),
            }
        } else if is(events::BRIDGE_LEAVE) {
            CallEvent::BridgeLeave {
                bridge_id: owned(event.header("BridgeUniqueid")),
            }
        } else if is(events::HANGUP) {
            CallEvent::Hangup {
                cause: owned(event.header("Cause-txt")),
            }
        } else if is(events::VAR_SET) {
            let variable = event.header("Variable").unwrap_or_default();
            match owned(event.header("Value")) {
                Some(path) if variable.trim().eq_ignore_ascii_case(recording_variable) => {
                    CallEvent::Recording { path }
                }
                _ => CallEvent::IgnoredVariable,
            }
        } else {
            CallEvent::Other
        }
    }

    /// Whether this event may open a session for an unseen call id.
    pub fn opens_session(&self) -> bool {
        !matches!(self, CallEvent::Other | CallEvent::IgnoredVariable)
    }

    /// `Newchannel` in a ringing state.
    pub fn is_ringing_channel(&self) -> bool {
        match self {
            CallEvent::NewChannel {
                channel_state: Some(state),
                ..
            } => RINGING_STATES.iter().any(|s| s.eq_ignore_ascii_case(state)),
            _ => false,
        }
    }
}

pub fn is_failed_dial_status(status: &str) -> bool {
    FAILED_DIAL_STATUSES
        .iter()
        .any(|s| s.eq_ignore_ascii_case(status))
}

pub fn is_answered_dial_status(status: &str) -> bool {
    status.eq_ignore_ascii_case("ANSWER")
}

#[cfg(test)]
mod tests {
    use super::*;

    const REC: &str = "CDR(recordingfile)";

    #[test]
    fn test_parse_new_channel() {
        let event = AmiEvent::new(
            "Newchannel",
            [
                ("Uniqueid", "1.1"),
                ("ChannelStateDesc", "Ring"),
                ("CallerIDNum", "5551234"),
                ("CallerIDName", "Alice"),
            ],
        );
        let parsed = CallEvent::parse(&event, REC);
        assert!(parsed.is_ringing_channel());
        assert!(parsed.opens_session());
        match parsed {
            CallEvent::NewChannel { caller_number, caller_name, .. } => {
                assert_eq!(caller_number.as_deref(), Some("5551234"));
                assert_eq!(caller_name.as_deref(), Some("Alice"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_up_channel_is_not_ringing() {
        let event = AmiEvent::new("Newchannel", [("Uniqueid", "1.2"), ("ChannelStateDesc", "Up")]);
        assert!(!CallEvent::parse(&event, REC).is_ringing_channel());
    }

    #[test]
    fn test_recording_variable_match() {
        let event = AmiEvent::new(
            "VarSet",
            [
                ("Uniqueid", "1.3"),
                ("Variable", "cdr(recordingfile)"),
                ("Value", "/var/spool/asterisk/monitor/1.3.wav"),
            ],
        );
        assert_eq!(
            CallEvent::parse(&event, REC),
            CallEvent::Recording {
                path: "/var/spool/asterisk/monitor/1.3.wav".to_string()
            }
        );

        let blank = AmiEvent::new(
            "VarSet",
            [("Uniqueid", "1.3"), ("Variable", REC), ("Value", "")],
        );
        assert_eq!(CallEvent::parse(&blank, REC), CallEvent::IgnoredVariable);

        let other = AmiEvent::new(
            "VarSet",
            [("Uniqueid", "1.3"), ("Variable", "DIALSTATUS"), ("Value", "BUSY")],
        );
        assert!(!CallEvent::parse(&other, REC).opens_session());
    }

    #[test]
    fn test_unknown_event() {
        let event = AmiEvent::new("Newexten", [("Uniqueid", "1.4")]);
        assert_eq!(CallEvent::parse(&event, REC), CallEvent::Other);
    }

    #[test]
    fn test_dial_status_classes() {
        assert!(is_failed_dial_status("busy"));
        assert!(is_failed_dial_status("CHANUNAVAIL"));
        assert!(!is_failed_dial_status("ANSWER"));
        assert!(is_answered_dial_status("ANSWER"));
    }
}
