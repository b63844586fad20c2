// src/models/mod.rs
pub mod call_event;
pub mod call_session;

pub use call_event::CallEvent;
pub use call_session::{CallSession, CallStatus, EndReason, HistoryEntry, SessionChange};
