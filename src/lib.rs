// src/lib.rs
//! Bridge between an Asterisk manager connection and a conversation store.
//!
//! One `AmiConnection` per channel feeds a `CallTracker`, which turns the
//! call events into lifecycle jobs; an `Originator` places outbound calls on
//! the same connection.

pub mod ami;
pub mod config;
pub mod error;
pub mod models;
pub mod services;

pub use ami::{Action, AmiConnection, AmiEvent, AmiResponse, BridgeCluster, ConnectionStatus};
pub use config::AppConfig;
pub use error::{AmiError, AmiResult};
pub use services::{CallTracker, Originator};
