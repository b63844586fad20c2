// src/services/originator.rs
use crate::ami::constants::{ACTION_ORIGINATE, DESTINATION_PLACEHOLDER, DESTINATION_PLACEHOLDER_ALIAS};
use crate::ami::{Action, AmiConnection, Headers};
use crate::config::ChannelConfig;
use crate::error::{AmiError, AmiResult};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Per-call overrides; anything left `None` (or blank) uses the channel
/// defaults.
#[derive(Debug, Clone, Default)]
pub struct OriginateRequest {
    pub destination: String,
    pub caller_id: Option<String>,
    pub context: Option<String>,
    pub extension: Option<String>,
    pub priority: Option<u32>,
}

impl OriginateRequest {
    pub fn new(destination: &str) -> Self {
        Self {
            destination: destination.to_string(),
            ..Default::default()
        }
    }

    pub fn caller_id(mut self, caller_id: &str) -> Self {
        self.caller_id = Some(caller_id.to_string());
        self
    }

    pub fn context(mut self, context: &str) -> Self {
        self.context = Some(context.to_string());
        self
    }

    pub fn extension(mut self, extension: &str) -> Self {
        self.extension = Some(extension.to_string());
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// What the switch said about the originate command. A rejection is a
/// normal result, distinct from failing to reach the switch.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OriginateOutcome {
    Accepted {
        channel: String,
        message: String,
        attributes: Headers,
    },
    Rejected {
        channel: String,
        message: String,
        attributes: Headers,
    },
}

impl OriginateOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, OriginateOutcome::Accepted { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            OriginateOutcome::Accepted { message, .. } | OriginateOutcome::Rejected { message, .. } => message,
        }
    }

    pub fn channel(&self) -> &str {
        match self {
            OriginateOutcome::Accepted { channel, .. } | OriginateOutcome::Rejected { channel, .. } => channel,
        }
    }
}

/// Substitute the destination into every placeholder occurrence.
pub fn render_channel(template: &str, destination: &str) -> AmiResult<String> {
    if !template.contains(DESTINATION_PLACEHOLDER) && !template.contains(DESTINATION_PLACEHOLDER_ALIAS) {
        return Err(AmiError::Validation(format!(
            "channel template '{}' must contain {}",
            template, DESTINATION_PLACEHOLDER
        )));
    }

    // Single pass: text coming from the destination is never rescanned.
    let mut rendered = String::with_capacity(template.len() + destination.len());
    let mut rest = template;
    loop {
        let next = [DESTINATION_PLACEHOLDER, DESTINATION_PLACEHOLDER_ALIAS]
            .iter()
            .filter_map(|placeholder| rest.find(placeholder).map(|at| (at, placeholder.len())))
            .min_by_key(|(at, _)| *at);
        match next {
            Some((at, len)) => {
                rendered.push_str(&rest[..at]);
                rendered.push_str(destination);
                rest = &rest[at + len..];
            }
            None => {
                rendered.push_str(rest);
                return Ok(rendered);
            }
        }
    }
}

fn pick<'a>(value: Option<&'a str>, default: &'a str) -> &'a str {
    value.map(str::trim).filter(|v| !v.is_empty()).unwrap_or(default)
}

/// Places outbound calls on one channel's connection.
pub struct Originator {
    connection: Arc<AmiConnection>,
    channel: ChannelConfig,
}

impl Originator {
    pub fn new(connection: Arc<AmiConnection>, channel: ChannelConfig) -> Self {
        Self { connection, channel }
    }

    pub fn connection(&self) -> &Arc<AmiConnection> {
        &self.connection
    }

    /// Build the Originate action for `request` without sending it.
    pub fn build_action(&self, request: &OriginateRequest) -> AmiResult<Action> {
        let destination = request.destination.trim();
        if destination.is_empty() {
            return Err(AmiError::Validation("destination is required".to_string()));
        }
        if request.priority == Some(0) {
            return Err(AmiError::Validation("priority must be at least 1".to_string()));
        }

        let channel = render_channel(&self.channel.originate_channel_string, destination)?;
        let priority = request.priority.unwrap_or(self.channel.default_priority);

        Ok(Action::new(ACTION_ORIGINATE)
            .param("Channel", channel)
            .param("Context", pick(request.context.as_deref(), &self.channel.default_context))
            .param("Exten", pick(request.extension.as_deref(), &self.channel.default_extension))
            .param("Priority", priority.to_string())
            .param("CallerID", pick(request.caller_id.as_deref(), &self.channel.default_caller_id))
            .param("Async", "true"))
    }

    /// Ask the switch to place a call. Returns once the command is
    /// acknowledged; call progress arrives later as events.
    #[instrument(skip(self, request), fields(inbox_id = self.channel.inbox_id, destination = %request.destination))]
    pub async fn originate(&self, request: &OriginateRequest) -> AmiResult<OriginateOutcome> {
        // Bad input is reported before connection state.
        let action = self.build_action(request)?;
        let channel = action.param_value("Channel").unwrap_or_default().to_string();

        if !self.connection.is_ready() {
            warn!("❌ Originate to {} refused: connection {}", channel, self.connection.status());
            return Err(AmiError::NotReady(self.connection.status().to_string()));
        }

        info!("📤 Originating call via {}", channel);
        let response = self.connection.send_action(action, None).await?;
        let message = response.message_or_default().to_string();
        let attributes = response.attributes().clone();

        if response.is_success() {
            info!("✅ Originate accepted for {}: {}", channel, message);
            Ok(OriginateOutcome::Accepted {
                channel,
                message,
                attributes,
            })
        } else {
            warn!("Originate rejected for {}: {}", channel, message);
            Ok(OriginateOutcome::Rejected {
                channel,
                message,
                attributes,
            })
        }
    }
}
