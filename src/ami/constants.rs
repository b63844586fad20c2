// src/ami/constants.rs
//! Manager protocol constants and tuning values

/// Default AMI TCP port
pub const DEFAULT_AMI_PORT: u16 = 5038;

/// Greeting line prefix sent by the switch right after accept
pub const BANNER_PREFIX: &str = "Asterisk Call Manager";

/// Line terminator written on the wire
pub const LINE_TERMINATOR: &str = "\r\n";

/// Largest block accepted before the decoder starts discarding (1 MiB)
pub const MAX_BLOCK_SIZE: usize = 1024 * 1024;

/// Block keys
pub const KEY_ACTION: &str = "Action";
pub const KEY_ACTION_ID: &str = "ActionID";
pub const KEY_EVENT: &str = "Event";
pub const KEY_RESPONSE: &str = "Response";
pub const KEY_MESSAGE: &str = "Message";

/// Action names used by the bridge
pub const ACTION_LOGIN: &str = "Login";
pub const ACTION_LOGOFF: &str = "Logoff";
pub const ACTION_PING: &str = "Ping";
pub const ACTION_ORIGINATE: &str = "Originate";

/// Placeholder substituted with the dialed number in channel templates
pub const DESTINATION_PLACEHOLDER: &str = "{destination_number}";

/// Short alias accepted for [`DESTINATION_PLACEHOLDER`]
pub const DESTINATION_PLACEHOLDER_ALIAS: &str = "{dest}";

/// Connect timeout in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Per-read timeout of the reader task in milliseconds
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 2000;

/// Command response timeout in milliseconds
pub const DEFAULT_ACTION_TIMEOUT_MS: u64 = 10_000;

/// Bound on the best-effort Logoff sent by disconnect
pub const DEFAULT_LOGOFF_TIMEOUT_MS: u64 = 1000;

/// Grace period for background tasks to finish after cancellation
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2000;

/// Maximum number of queued events before dropping
pub const DEFAULT_EVENT_QUEUE_SIZE: usize = 1000;

/// Pause after a malformed block before reading again
pub const DEFAULT_PARSE_ERROR_BACKOFF_MS: u64 = 100;

/// Reconnect policy defaults
pub const INITIAL_RECONNECT_DELAY_MS: u64 = 1000;
pub const MAX_RECONNECT_DELAY_MS: u64 = 60_000;
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Inbound event names consumed by the call tracker
pub mod events {
    /// Channel created; ringing state opens a call session
    pub const NEW_CHANNEL: &str = "Newchannel";

    /// Dial attempt started
    pub const DIAL_BEGIN: &str = "DialBegin";

    /// Dial attempt finished with a DialStatus
    pub const DIAL_END: &str = "DialEnd";

    /// Channel joined a bridge (call connected)
    pub const BRIDGE_ENTER: &str = "BridgeEnter";

    /// Channel left a bridge
    pub const BRIDGE_LEAVE: &str = "BridgeLeave";

    /// Channel hung up
    pub const HANGUP: &str = "Hangup";

    /// Channel variable set
    pub const VAR_SET: &str = "VarSet";

    /// All events the tracker subscribes to
    pub const CALL_EVENTS: &[&str] = &[
        NEW_CHANNEL,
        DIAL_BEGIN,
        DIAL_END,
        BRIDGE_ENTER,
        BRIDGE_LEAVE,
        HANGUP,
        VAR_SET,
    ];
}
