// src/ami/event.rs
//! Asynchronous events pushed by the switch

use crate::ami::constants::KEY_EVENT;
use crate::ami::headers::Headers;
use chrono::{DateTime, Utc};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A parsed `Event:` block.
///
/// Carries the attribute list exactly as received plus the local arrival
/// time. Typed access for the call lifecycle lives in
/// [`CallEvent`](crate::models::CallEvent); everything else stays reachable
/// through [`header`](Self::header).
#[derive(Debug, Clone)]
pub struct AmiEvent {
    name: String,
    headers: Headers,
    received_at: DateTime<Utc>,
}

impl AmiEvent {
    /// Build from a decoded block. Returns `None` when the block has no
    /// `Event` key.
    pub fn from_headers(headers: Headers) -> Option<Self> {
        let name = headers.get_non_empty(KEY_EVENT)?.trim().to_string();
        Some(Self {
            name,
            headers,
            received_at: Utc::now(),
        })
    }

    /// Convenience constructor used by simulators and tests.
    pub fn new<K, V>(name: &str, attributes: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut headers = Headers::new();
        headers.push(KEY_EVENT, name);
        for (k, v) in attributes {
            headers.push(k, v);
        }
        Self {
            name: name.to_string(),
            headers,
            received_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_event(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn with_received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = at;
        self
    }

    /// Channel unique id, the call correlation key.
    pub fn unique_id(&self) -> Option<&str> {
        self.headers.get_non_empty("Uniqueid")
    }

    pub fn caller_id_num(&self) -> Option<&str> {
        self.headers.get_non_empty("CallerIDNum")
    }

    pub fn caller_id_name(&self) -> Option<&str> {
        self.headers.get_non_empty("CallerIDName")
    }

    pub fn channel(&self) -> Option<&str> {
        self.headers.get_non_empty("Channel")
    }

    /// Stable digest of the event name and its attribute snapshot.
    ///
    /// Independent of attribute order and of the arrival timestamp, so a
    /// redelivered event hashes the same as the original.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.name.to_ascii_lowercase().hash(&mut hasher);
        let mut pairs: Vec<(String, &str)> = self
            .headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        pairs.sort();
        pairs.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for AmiEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AmiEvent {{ Event: {}", self.name)?;
        if let Some(uid) = self.unique_id() {
            write!(f, ", Uniqueid: {}", uid)?;
        }
        if let Some(caller) = self.caller_id_num() {
            write!(f, ", CallerIDNum: {}", caller)?;
        }
        write!(f, ", Headers: {} }}", self.headers.len())
    }
}
