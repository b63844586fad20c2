// src/config.rs
//! Bridge configuration
//!
//! Loaded with the `config` crate from built-in defaults, optional
//! `config/default` and `config/{RUN_MODE}` files, and `BRIDGE__*`
//! environment variables, then checked with `validator`.

use crate::ami::constants::*;
use crate::error::{AmiError, AmiResult};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::env;
use validator::{Validate, ValidationError};

/// Main application configuration
#[derive(Debug, Deserialize, Clone, Validate)]
pub struct AppConfig {
    #[serde(default)]
    #[validate(nested)]
    pub ami: AmiSettings,

    #[serde(default)]
    #[validate(nested)]
    pub tracker: TrackerSettings,

    #[serde(default)]
    #[validate(nested)]
    pub channels: Vec<ChannelConfig>,
}

/// Manager protocol timing and buffering
#[derive(Debug, Deserialize, Clone, Validate)]
pub struct AmiSettings {
    /// TCP connect timeout
    #[serde(default = "default_connect_timeout")]
    #[validate(range(min = 1))]
    pub connect_timeout_ms: u64,

    /// Per-read idle timeout of the reader task, also bounds login and probe
    #[serde(default = "default_read_timeout")]
    #[validate(range(min = 1))]
    pub read_timeout_ms: u64,

    #[serde(default = "default_action_timeout")]
    #[validate(range(min = 1))]
    pub action_timeout_ms: u64,

    #[serde(default = "default_logoff_timeout")]
    pub logoff_timeout_ms: u64,

    /// How long disconnect waits for background tasks before aborting them
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    #[serde(default = "default_event_queue_size")]
    #[validate(range(min = 1))]
    pub event_queue_size: usize,

    #[serde(default = "default_parse_error_backoff")]
    pub parse_error_backoff_ms: u64,

    #[serde(default)]
    #[validate(nested)]
    pub reconnect: ReconnectSettings,
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_read_timeout() -> u64 {
    DEFAULT_READ_TIMEOUT_MS
}

fn default_action_timeout() -> u64 {
    DEFAULT_ACTION_TIMEOUT_MS
}

fn default_logoff_timeout() -> u64 {
    DEFAULT_LOGOFF_TIMEOUT_MS
}

fn default_shutdown_grace() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_MS
}

fn default_event_queue_size() -> usize {
    DEFAULT_EVENT_QUEUE_SIZE
}

fn default_parse_error_backoff() -> u64 {
    DEFAULT_PARSE_ERROR_BACKOFF_MS
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct ReconnectSettings {
    #[serde(default = "default_initial_delay")]
    #[validate(range(min = 1))]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    #[validate(range(min = 1))]
    pub max_delay_ms: u64,

    /// 0 retries forever
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_initial_delay() -> u64 {
    INITIAL_RECONNECT_DELAY_MS
}

fn default_max_delay() -> u64 {
    MAX_RECONNECT_DELAY_MS
}

fn default_max_attempts() -> u32 {
    MAX_RECONNECT_ATTEMPTS
}

/// Call tracker tuning
#[derive(Debug, Deserialize, Clone, Validate)]
pub struct TrackerSettings {
    /// Number of recent event fingerprints remembered for de-duplication
    #[serde(default = "default_dedup_window")]
    #[validate(range(min = 1))]
    pub dedup_window: usize,

    /// Channel variable that carries the recording file path
    #[serde(default = "default_recording_variable")]
    #[validate(length(min = 1))]
    pub recording_variable: String,

    /// Request timeout for webhook job delivery
    #[serde(default = "default_webhook_timeout")]
    #[validate(range(min = 1))]
    pub webhook_timeout_ms: u64,

    /// Jobs buffered ahead of the delivery worker before new ones are refused
    #[serde(default = "default_job_queue_size")]
    #[validate(range(min = 1))]
    pub job_queue_size: usize,
}

fn default_dedup_window() -> usize {
    512
}

fn default_recording_variable() -> String {
    "CDR(recordingfile)".to_string()
}

fn default_webhook_timeout() -> u64 {
    5000
}

fn default_job_queue_size() -> usize {
    1024
}

/// One switch line, keyed by inbox
#[derive(Deserialize, Clone, Validate)]
pub struct ChannelConfig {
    pub account_id: i64,
    pub inbox_id: i64,

    #[validate(length(min = 1))]
    pub host: String,

    #[serde(default = "default_ami_port")]
    #[validate(range(min = 1))]
    pub port: u16,

    #[validate(length(min = 1))]
    pub username: String,

    #[validate(length(min = 1))]
    pub password: String,

    /// Endpoint receiving lifecycle jobs
    #[validate(url)]
    pub webhook_url: String,

    #[validate(length(min = 1))]
    pub default_caller_id: String,

    #[validate(length(min = 1))]
    pub default_context: String,

    #[validate(length(min = 1))]
    pub default_extension: String,

    #[serde(default = "default_priority")]
    #[validate(range(min = 1))]
    pub default_priority: u32,

    /// Dial channel pattern, e.g. `PJSIP/{destination_number}@trunk`
    #[validate(custom(function = "validate_channel_template"))]
    pub originate_channel_string: String,
}

fn default_ami_port() -> u16 {
    DEFAULT_AMI_PORT
}

fn default_priority() -> u32 {
    1
}

/// Template must mention the destination placeholder.
pub fn validate_channel_template(template: &str) -> Result<(), ValidationError> {
    if template.contains(DESTINATION_PLACEHOLDER) || template.contains(DESTINATION_PLACEHOLDER_ALIAS)
    {
        Ok(())
    } else {
        let mut err = ValidationError::new("missing_destination_placeholder");
        err.message = Some(format!("channel template must contain {}", DESTINATION_PLACEHOLDER).into());
        Err(err)
    }
}

impl std::fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("account_id", &self.account_id)
            .field("inbox_id", &self.inbox_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("webhook_url", &self.webhook_url)
            .field("default_caller_id", &self.default_caller_id)
            .field("default_context", &self.default_context)
            .field("default_extension", &self.default_extension)
            .field("default_priority", &self.default_priority)
            .field("originate_channel_string", &self.originate_channel_string)
            .finish()
    }
}

impl ChannelConfig {
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for AmiSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            action_timeout_ms: DEFAULT_ACTION_TIMEOUT_MS,
            logoff_timeout_ms: DEFAULT_LOGOFF_TIMEOUT_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            event_queue_size: DEFAULT_EVENT_QUEUE_SIZE,
            parse_error_backoff_ms: DEFAULT_PARSE_ERROR_BACKOFF_MS,
            reconnect: ReconnectSettings::default(),
        }
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: INITIAL_RECONNECT_DELAY_MS,
            max_delay_ms: MAX_RECONNECT_DELAY_MS,
            max_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            dedup_window: default_dedup_window(),
            recording_variable: default_recording_variable(),
            webhook_timeout_ms: default_webhook_timeout(),
            job_queue_size: default_job_queue_size(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and optional config files
    pub fn load() -> AmiResult<Self> {
        dotenvy::dotenv().ok();
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // BRIDGE__AMI__ACTION_TIMEOUT_MS=5000
            .add_source(
                Environment::with_prefix("BRIDGE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Self::finish(config)
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &str) -> AmiResult<Self> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("BRIDGE")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        Self::finish(config)
    }

    /// Parse TOML text, without touching files or the environment
    pub fn from_toml_str(text: &str) -> AmiResult<Self> {
        let config = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?;

        Self::finish(config)
    }

    fn finish(config: Config) -> AmiResult<Self> {
        let app: AppConfig = config.try_deserialize()?;
        app.validate()?;
        app.check_unique_inboxes()?;
        Ok(app)
    }

    fn check_unique_inboxes(&self) -> AmiResult<()> {
        let mut seen = std::collections::HashSet::new();
        for channel in &self.channels {
            if !seen.insert(channel.inbox_id) {
                return Err(AmiError::Config(format!(
                    "inbox {} configured more than once",
                    channel.inbox_id
                )));
            }
        }
        Ok(())
    }

    /// Channel configuration for an inbox
    pub fn channel(&self, inbox_id: i64) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.inbox_id == inbox_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[ami]
action_timeout_ms = 3000

[[channels]]
account_id = 1
inbox_id = 7
host = "10.0.0.5"
username = "bridge"
password = "s3cret"
webhook_url = "https://app.example.com/webhooks/ami"
default_caller_id = "5550000"
default_context = "from-internal"
default_extension = "100"
originate_channel_string = "PJSIP/{destination_number}@trunk"
"#;

    #[test]
    fn test_defaults() {
        let ami = AmiSettings::default();
        assert_eq!(ami.connect_timeout_ms, 5000);
        assert_eq!(ami.read_timeout_ms, 2000);
        assert_eq!(ami.reconnect.max_attempts, 10);

        let tracker = TrackerSettings::default();
        assert_eq!(tracker.dedup_window, 512);
        assert_eq!(tracker.recording_variable, "CDR(recordingfile)");
    }

    #[test]
    fn test_from_toml() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.ami.action_timeout_ms, 3000);
        assert_eq!(config.ami.read_timeout_ms, 2000);

        let channel = config.channel(7).unwrap();
        assert_eq!(channel.port, 5038);
        assert_eq!(channel.default_priority, 1);
        assert_eq!(channel.server_addr(), "10.0.0.5:5038");
        assert!(config.channel(8).is_none());
    }

    #[test]
    fn test_template_without_placeholder_rejected() {
        let text = SAMPLE.replace("PJSIP/{destination_number}@trunk", "PJSIP/trunk");
        let err = AppConfig::from_toml_str(&text).unwrap_err();
        assert_eq!(err.error_code(), "config_error");
    }

    #[test]
    fn test_short_placeholder_accepted() {
        assert!(validate_channel_template("PJSIP/{dest}@trunk").is_ok());
        assert!(validate_channel_template("PJSIP/100").is_err());
    }

    #[test]
    fn test_bad_webhook_url_rejected() {
        let text = SAMPLE.replace("https://app.example.com/webhooks/ami", "not a url");
        assert!(AppConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn test_duplicate_inbox_rejected() {
        let second = SAMPLE
            .split("[[channels]]")
            .nth(1)
            .unwrap()
            .to_string();
        let text = format!("{}[[channels]]{}", SAMPLE, second);
        assert!(AppConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();
        let text = format!("{:?}", config.channel(7).unwrap());
        assert!(!text.contains("s3cret"));
    }
}
