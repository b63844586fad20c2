// src/ami/action.rs
//! Outgoing manager actions

use crate::ami::constants::{
    ACTION_LOGIN, ACTION_LOGOFF, ACTION_PING, KEY_ACTION, KEY_ACTION_ID, LINE_TERMINATOR,
};
use crate::ami::headers::Headers;
use std::fmt;
use uuid::Uuid;

/// A manager command: name, ordered unique parameters and an optional
/// correlation identifier.
///
/// Only callers that ask for an `ActionID` get one; everything else is
/// matched to its response in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    name: String,
    params: Headers,
    action_id: Option<String>,
}

impl Action {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Headers::new(),
            action_id: None,
        }
    }

    /// Add a parameter. Setting an existing key replaces its value so keys
    /// stay unique. An `ActionID` key in any case becomes the action's
    /// correlation id.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        if key.eq_ignore_ascii_case(KEY_ACTION_ID) {
            return self.with_action_id(value);
        }
        self.params.set(key, value);
        self
    }

    /// Add a parameter only when a value is present.
    pub fn param_opt(self, key: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(value) => self.param(key, value),
            None => self,
        }
    }

    pub fn with_action_id(mut self, action_id: impl Into<String>) -> Self {
        self.action_id = Some(action_id.into());
        self
    }

    pub fn with_generated_action_id(self) -> Self {
        self.with_action_id(Uuid::new_v4().to_string())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &Headers {
        &self.params
    }

    pub fn param_value(&self, key: &str) -> Option<&str> {
        self.params.get(key)
    }

    pub fn action_id(&self) -> Option<&str> {
        self.action_id.as_deref()
    }

    pub fn is_login(&self) -> bool {
        self.name.eq_ignore_ascii_case(ACTION_LOGIN)
    }

    /// Login with username/secret; events are switched on for the session.
    pub fn login(username: &str, secret: &str) -> Self {
        Self::new(ACTION_LOGIN)
            .param("Username", username)
            .param("Secret", secret)
            .param("Events", "on")
    }

    pub fn ping() -> Self {
        Self::new(ACTION_PING)
    }

    pub fn logoff() -> Self {
        Self::new(ACTION_LOGOFF)
    }

    /// Serialize to the wire block, terminated by a blank line.
    pub fn to_wire_format(&self) -> String {
        let mut out = String::with_capacity(64 + self.params.len() * 32);
        push_line(&mut out, KEY_ACTION, &self.name);
        if let Some(id) = &self.action_id {
            push_line(&mut out, KEY_ACTION_ID, id);
        }
        for (key, value) in self.params.iter() {
            push_line(&mut out, key, value);
        }
        out.push_str(LINE_TERMINATOR);
        out
    }

    /// First key or value that would break block framing, if any.
    pub(crate) fn framing_violation(&self) -> Option<&str> {
        let breaks = |s: &str| s.contains('\r') || s.contains('\n');
        if breaks(&self.name) {
            return Some(&self.name);
        }
        if let Some(id) = self.action_id.as_deref().filter(|id| breaks(id)) {
            return Some(id);
        }
        self.params
            .iter()
            .find(|(k, v)| breaks(k) || breaks(v))
            .map(|(k, _)| k)
    }
}

fn push_line(out: &mut String, key: &str, value: &str) {
    out.push_str(key);
    out.push_str(": ");
    out.push_str(value);
    out.push_str(LINE_TERMINATOR);
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_login() {
            return write!(f, "{} [REDACTED]", self.name);
        }
        write!(f, "{}", self.name)?;
        if let Some(id) = &self.action_id {
            write!(f, " (ActionID {})", id)?;
        }
        let params: Vec<String> = self
            .params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        if !params.is_empty() {
            write!(f, " {}", params.join(" "))?;
        }
        Ok(())
    }
}
