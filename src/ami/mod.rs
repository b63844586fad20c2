// src/ami/mod.rs
//! Asterisk Manager Interface client
//!
//! `AmiConnection` owns one socket: a single reader task demultiplexes
//! responses (handed to the correlator) from events (queued for the
//! dispatcher). `BridgeCluster` supervises one connection per channel.

pub mod action;
pub mod client;
pub mod codec;
pub mod connection;
pub mod constants;
mod correlator;
pub mod dispatcher;
pub mod event;
pub mod headers;
mod reader;
pub mod response;

pub use action::Action;
pub use client::{BridgeCluster, ReconnectPolicy};
pub use codec::{AmiCodec, Frame};
pub use connection::{AmiConnection, ConnectionSettings, ConnectionStatus, DisconnectReason};
pub use dispatcher::{handler_fn, DispatchTable, DispatchTableBuilder, EventHandler};
pub use event::AmiEvent;
pub use headers::Headers;
pub use response::AmiResponse;
