// src/ami/response.rs
//! Synchronous replies to actions

use crate::ami::constants::{KEY_ACTION_ID, KEY_MESSAGE, KEY_RESPONSE};
use crate::ami::headers::Headers;

/// A `Response:` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmiResponse {
    success: bool,
    status: String,
    message: Option<String>,
    action_id: Option<String>,
    attributes: Headers,
    output: Vec<String>,
}

impl AmiResponse {
    /// Build from a decoded block. Returns `None` when there is no
    /// `Response` key.
    pub fn from_headers(attributes: Headers, output: Vec<String>) -> Option<Self> {
        let status = attributes.get(KEY_RESPONSE)?.trim().to_string();
        let success = is_success_status(&status);
        let message = attributes.get_non_empty(KEY_MESSAGE).map(str::to_string);
        let action_id = attributes.get_non_empty(KEY_ACTION_ID).map(str::to_string);
        Some(Self {
            success,
            status,
            message,
            action_id,
            attributes,
            output,
        })
    }

    pub fn success(message: &str) -> Self {
        Self::synthetic("Success", true, message)
    }

    pub fn error(message: &str) -> Self {
        Self::synthetic("Error", false, message)
    }

    fn synthetic(status: &str, success: bool, message: &str) -> Self {
        Self {
            success,
            status: status.to_string(),
            message: Some(message.to_string()),
            action_id: None,
            attributes: [(KEY_RESPONSE, status), (KEY_MESSAGE, message)]
                .into_iter()
                .collect(),
            output: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Raw `Response:` value (`Success`, `Error`, `Goodbye`, `Follows`).
    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Message or a fixed fallback, for logs and user-facing errors.
    pub fn message_or_default(&self) -> &str {
        self.message
            .as_deref()
            .unwrap_or(if self.success { "OK" } else { "No message from switch" })
    }

    pub fn action_id(&self) -> Option<&str> {
        self.action_id.as_deref()
    }

    pub fn attributes(&self) -> &Headers {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key)
    }

    /// Command output lines of a `Response: Follows` block.
    pub fn output(&self) -> &[String] {
        &self.output
    }
}

fn is_success_status(status: &str) -> bool {
    ["Success", "Goodbye", "Follows", "Pong"]
        .iter()
        .any(|ok| status.eq_ignore_ascii_case(ok))
}
