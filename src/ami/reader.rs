// src/ami/reader.rs
//! The single task that reads the socket

use crate::ami::codec::{AmiCodec, Frame};
use crate::ami::connection::{ConnectionStatus, DisconnectReason};
use crate::ami::correlator::Correlator;
use crate::ami::event::AmiEvent;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub(crate) struct ReaderContext {
    pub server_id: String,
    pub correlator: Arc<Correlator>,
    pub event_tx: mpsc::Sender<AmiEvent>,
    pub status_tx: Arc<watch::Sender<ConnectionStatus>>,
    pub dropped_events: Arc<AtomicU64>,
    pub protocol_version: Arc<Mutex<Option<String>>>,
    pub cancel: CancellationToken,
    pub read_timeout: Duration,
    pub parse_error_backoff: Duration,
}

/// Hand an event to the dispatcher without waiting. Returns false once the
/// dispatcher is gone.
fn forward_event(ctx: &ReaderContext, event: AmiEvent) -> bool {
    match ctx.event_tx.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(event)) => {
            let dropped = ctx.dropped_events.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                "[READ] {} event queue full, dropping {} (Uniqueid {:?}, {} dropped so far)",
                ctx.server_id,
                event.name(),
                event.unique_id(),
                dropped
            );
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

pub(crate) async fn reader_loop(stream: FramedRead<OwnedReadHalf, AmiCodec>, ctx: ReaderContext) {
    let result = std::panic::AssertUnwindSafe(reader_loop_inner(stream, &ctx))
        .catch_unwind()
        .await;

    let reason = match result {
        Ok(reason) => reason,
        Err(_) => {
            error!("[READ] {} reader task panicked", ctx.server_id);
            DisconnectReason::IoError("reader task panicked".to_string())
        }
    };

    // No waiter may outlive the reader.
    ctx.correlator.close(reason.clone());

    if reason != DisconnectReason::ClientRequested {
        ctx.status_tx
            .send_replace(ConnectionStatus::Failed(reason.clone()));
    }
    debug!("[READ] {} reader stopped: {}", ctx.server_id, reason);
}

async fn reader_loop_inner(
    mut stream: FramedRead<OwnedReadHalf, AmiCodec>,
    ctx: &ReaderContext,
) -> DisconnectReason {
    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return DisconnectReason::ClientRequested,
            next = timeout(ctx.read_timeout, stream.next()) => next,
        };

        let frame = match next {
            Err(_) => {
                trace!("[READ] {} idle for {}ms", ctx.server_id, ctx.read_timeout.as_millis());
                continue;
            }
            Ok(None) => {
                info!("[READ] {} connection closed (EOF)", ctx.server_id);
                return DisconnectReason::ConnectionClosed;
            }
            Ok(Some(Err(e))) => {
                warn!("[READ] {} read error: {}", ctx.server_id, e);
                return DisconnectReason::IoError(e.to_string());
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Frame::Banner(version) => {
                debug!("[READ] {} greeting: protocol {}", ctx.server_id, version);
                *ctx.protocol_version.lock() = Some(version);
            }
            Frame::Response(response) => {
                trace!(
                    "[READ] {} response {} {:?}",
                    ctx.server_id,
                    response.status(),
                    response.message()
                );
                ctx.correlator.resolve(response);
            }
            Frame::Event(event) => {
                trace!("[READ] {} {}", ctx.server_id, event);
                if !forward_event(ctx, event) {
                    debug!("[READ] {} dispatcher gone, events are no longer delivered", ctx.server_id);
                }
            }
            Frame::Malformed(reason) => {
                warn!("[READ] {} malformed block skipped: {}", ctx.server_id, reason);
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => return DisconnectReason::ClientRequested,
                    _ = sleep(ctx.parse_error_backoff) => {}
                }
            }
        }
    }
}
