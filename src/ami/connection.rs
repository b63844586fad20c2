// src/ami/connection.rs
use crate::ami::action::Action;
use crate::ami::client::ReconnectPolicy;
use crate::ami::codec::AmiCodec;
use crate::ami::constants::*;
use crate::ami::correlator::Correlator;
use crate::ami::dispatcher::{run_dispatcher, DispatchTable};
use crate::ami::reader::{reader_loop, ReaderContext};
use crate::ami::response::AmiResponse;
use crate::config::{AmiSettings, ChannelConfig};
use crate::error::{AmiError, AmiResult};
use futures::SinkExt;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Lifecycle state of one manager connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Failed(DisconnectReason),
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Authenticating => write!(f, "authenticating"),
            ConnectionStatus::Ready => write!(f, "ready"),
            ConnectionStatus::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Clean EOF on the TCP connection
    ConnectionClosed,
    /// TCP I/O error (io::Error is not Clone, so we store the message)
    IoError(String),
    /// Connect, login or probe failed
    ConnectFailed(String),
    /// Client called disconnect()
    ClientRequested,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ConnectionClosed => write!(f, "connection closed"),
            DisconnectReason::IoError(msg) => write!(f, "I/O error: {}", msg),
            DisconnectReason::ConnectFailed(msg) => write!(f, "connect failed: {}", msg),
            DisconnectReason::ClientRequested => write!(f, "client requested disconnect"),
        }
    }
}

/// Everything needed to open and run one connection.
#[derive(Clone)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub action_timeout: Duration,
    pub logoff_timeout: Duration,
    pub shutdown_grace: Duration,
    pub event_queue_size: usize,
    pub parse_error_backoff: Duration,
    pub reconnect: ReconnectPolicy,
}

impl ConnectionSettings {
    pub fn new(host: &str, port: u16, username: &str, secret: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            username: username.to_string(),
            secret: secret.to_string(),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            action_timeout: Duration::from_millis(DEFAULT_ACTION_TIMEOUT_MS),
            logoff_timeout: Duration::from_millis(DEFAULT_LOGOFF_TIMEOUT_MS),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
            event_queue_size: DEFAULT_EVENT_QUEUE_SIZE,
            parse_error_backoff: Duration::from_millis(DEFAULT_PARSE_ERROR_BACKOFF_MS),
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn from_config(channel: &ChannelConfig, ami: &AmiSettings) -> Self {
        Self {
            host: channel.host.clone(),
            port: channel.port,
            username: channel.username.clone(),
            secret: channel.password.clone(),
            connect_timeout: Duration::from_millis(ami.connect_timeout_ms),
            read_timeout: Duration::from_millis(ami.read_timeout_ms),
            action_timeout: Duration::from_millis(ami.action_timeout_ms),
            logoff_timeout: Duration::from_millis(ami.logoff_timeout_ms),
            shutdown_grace: Duration::from_millis(ami.shutdown_grace_ms),
            event_queue_size: ami.event_queue_size,
            parse_error_backoff: Duration::from_millis(ami.parse_error_backoff_ms),
            reconnect: ReconnectPolicy::from_settings(&ami.reconnect),
        }
    }

    pub fn server_id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("secret", &"[REDACTED]")
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("action_timeout", &self.action_timeout)
            .field("event_queue_size", &self.event_queue_size)
            .finish()
    }
}

/// One live socket with its reader and dispatcher tasks.
struct Session {
    writer: Mutex<FramedWrite<OwnedWriteHalf, AmiCodec>>,
    correlator: Arc<Correlator>,
    cancel: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

/// Client side of the manager protocol for one switch.
///
/// Only the background reader touches the read half of the socket. Senders
/// share the write half behind a mutex and register their waiter while
/// holding it, so waiter order always equals wire order.
pub struct AmiConnection {
    settings: ConnectionSettings,
    server_id: String,
    dispatch: Arc<DispatchTable>,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    status_rx: watch::Receiver<ConnectionStatus>,
    session: parking_lot::Mutex<Option<Arc<Session>>>,
    lifecycle: Mutex<()>,
    dropped_events: Arc<AtomicU64>,
    protocol_version: Arc<parking_lot::Mutex<Option<String>>>,
}

/// Establish a TCP connection with a timeout.
async fn tcp_connect_with_timeout(settings: &ConnectionSettings) -> AmiResult<TcpStream> {
    let tcp_result = timeout(
        settings.connect_timeout,
        TcpStream::connect((settings.host.as_str(), settings.port)),
    )
    .await;

    match tcp_result {
        Ok(Ok(stream)) => {
            debug!("[CONNECT] TCP connection established");
            Ok(stream)
        }
        Ok(Err(e)) => {
            warn!("[CONNECT] TCP connect failed: {}", e);
            Err(AmiError::Connection(format!(
                "{}:{}: {}",
                settings.host, settings.port, e
            )))
        }
        Err(_) => {
            warn!(
                "[CONNECT] TCP connect timed out after {}ms",
                settings.connect_timeout.as_millis()
            );
            Err(AmiError::ConnectTimeout {
                host: settings.host.clone(),
                port: settings.port,
                timeout_ms: settings.connect_timeout.as_millis() as u64,
            })
        }
    }
}

impl AmiConnection {
    pub fn new(settings: ConnectionSettings, dispatch: DispatchTable) -> Self {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            server_id: settings.server_id(),
            settings,
            dispatch: Arc::new(dispatch),
            status_tx: Arc::new(status_tx),
            status_rx,
            session: parking_lot::Mutex::new(None),
            lifecycle: Mutex::new(()),
            dropped_events: Arc::new(AtomicU64::new(0)),
            protocol_version: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        *self.status_rx.borrow() == ConnectionStatus::Ready
    }

    /// Watch status transitions.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Events dropped because the dispatcher queue was full, over the
    /// lifetime of this connection.
    pub fn dropped_event_count(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Protocol version from the greeting line of the current session.
    pub fn protocol_version(&self) -> Option<String> {
        self.protocol_version.lock().clone()
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status_tx.send_replace(status.clone());
        if previous != status {
            debug!("[STATUS] {} {} -> {}", self.server_id, previous, status);
        }
    }

    /// Open the socket, start the reader, log in and probe.
    ///
    /// Any failure tears the session down and leaves the status `Failed`.
    #[instrument(skip(self), fields(server = %self.server_id))]
    pub async fn connect(&self) -> AmiResult<()> {
        let _guard = self.lifecycle.lock().await;

        if self.is_ready() {
            debug!("[CONNECT] {} already ready", self.server_id);
            return Ok(());
        }

        self.teardown(false).await;
        self.set_status(ConnectionStatus::Connecting);
        info!("Connecting to AMI: {}", self.server_id);

        match self.establish().await {
            Ok(()) => {
                info!("✅ Connected and authenticated to AMI: {}", self.server_id);
                Ok(())
            }
            Err(e) => {
                error!("AMI connect to {} failed: {}", self.server_id, e);
                self.teardown(false).await;
                self.set_status(ConnectionStatus::Failed(DisconnectReason::ConnectFailed(
                    e.to_string(),
                )));
                Err(e)
            }
        }
    }

    async fn establish(&self) -> AmiResult<()> {
        let stream = tcp_connect_with_timeout(&self.settings).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let correlator = Arc::new(Correlator::new());
        let cancel = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::channel(self.settings.event_queue_size.max(1));
        *self.protocol_version.lock() = None;

        let reader = tokio::spawn(reader_loop(
            FramedRead::new(read_half, AmiCodec::new()),
            ReaderContext {
                server_id: self.server_id.clone(),
                correlator: correlator.clone(),
                event_tx,
                status_tx: self.status_tx.clone(),
                dropped_events: self.dropped_events.clone(),
                protocol_version: self.protocol_version.clone(),
                cancel: cancel.clone(),
                read_timeout: self.settings.read_timeout,
                parse_error_backoff: self.settings.parse_error_backoff,
            },
        ));
        let dispatcher = tokio::spawn(run_dispatcher(
            self.dispatch.clone(),
            event_rx,
            cancel.clone(),
        ));

        let session = Arc::new(Session {
            writer: Mutex::new(FramedWrite::new(write_half, AmiCodec::new())),
            correlator,
            cancel,
            tasks: parking_lot::Mutex::new(vec![reader, dispatcher]),
        });
        *self.session.lock() = Some(session.clone());

        self.set_status(ConnectionStatus::Authenticating);
        self.authenticate(&session).await?;
        self.mark_ready(&session)
    }

    /// Promote to Ready unless the reader already ended the session.
    fn mark_ready(&self, session: &Session) -> AmiResult<()> {
        let promoted = self.status_tx.send_if_modified(|status| {
            if *status == ConnectionStatus::Authenticating && !session.correlator.is_closed() {
                *status = ConnectionStatus::Ready;
                true
            } else {
                false
            }
        });
        if promoted {
            debug!("[STATUS] {} authenticating -> ready", self.server_id);
            return Ok(());
        }
        let reason = session
            .correlator
            .closed_reason()
            .unwrap_or(DisconnectReason::ConnectionClosed);
        warn!("[AUTH] {} session ended during login: {}", self.server_id, reason);
        Err(AmiError::Disconnected(reason))
    }

    async fn authenticate(&self, session: &Session) -> AmiResult<()> {
        let login = Action::login(&self.settings.username, &self.settings.secret);
        let response = self
            .send_on(session, login, self.settings.read_timeout)
            .await?;
        if !response.is_success() {
            warn!(
                "[AUTH] {} login rejected: {}",
                self.server_id,
                response.message_or_default()
            );
            return Err(AmiError::AuthFailed(response.message_or_default().to_string()));
        }
        debug!("[AUTH] {} login accepted", self.server_id);

        let probe = self
            .send_on(session, Action::ping(), self.settings.read_timeout)
            .await?;
        if !probe.is_success() {
            return Err(AmiError::AuthFailed(format!(
                "ping probe rejected: {}",
                probe.message_or_default()
            )));
        }
        Ok(())
    }

    /// Send an action and wait for its response.
    ///
    /// Requires a ready connection. `limit` defaults to the configured
    /// action timeout.
    pub async fn send_action(
        &self,
        action: Action,
        limit: Option<Duration>,
    ) -> AmiResult<AmiResponse> {
        let session = self.ready_session()?;
        self.send_on(&session, action, limit.unwrap_or(self.settings.action_timeout))
            .await
    }

    fn ready_session(&self) -> AmiResult<Arc<Session>> {
        let status = self.status();
        if status != ConnectionStatus::Ready {
            return Err(AmiError::NotReady(status.to_string()));
        }
        self.session
            .lock()
            .clone()
            .ok_or_else(|| AmiError::NotReady(ConnectionStatus::Disconnected.to_string()))
    }

    async fn send_on(
        &self,
        session: &Session,
        action: Action,
        limit: Duration,
    ) -> AmiResult<AmiResponse> {
        if let Some(field) = action.framing_violation() {
            return Err(AmiError::Validation(format!(
                "line break in field '{}' of action {}",
                field,
                action.name()
            )));
        }
        debug!("[SEND] {} {}", self.server_id, action);

        let pending = {
            let mut writer = session.writer.lock().await;
            let pending = session.correlator.register(&action)?;
            if let Err(e) = writer.send(action).await {
                session.correlator.cancel(&pending);
                warn!("[SEND] {} write failed: {}", self.server_id, e);
                return Err(AmiError::Io(e));
            }
            pending
        };

        pending.wait(limit).await
    }

    /// Log off and close. Safe to call in any state, any number of times.
    #[instrument(skip(self), fields(server = %self.server_id))]
    pub async fn disconnect(&self) {
        let _guard = self.lifecycle.lock().await;
        let logoff = self.is_ready();
        self.teardown(logoff).await;
        self.set_status(ConnectionStatus::Disconnected);
        info!("AMI connection closed: {}", self.server_id);
    }

    async fn teardown(&self, logoff: bool) {
        let session = self.session.lock().take();
        let Some(session) = session else {
            return;
        };

        if logoff {
            // Logoff carries its own ActionID so its Goodbye never lands on
            // a FIFO waiter.
            let action = Action::logoff().with_generated_action_id();
            match self
                .send_on(&session, action, self.settings.logoff_timeout)
                .await
            {
                Ok(response) => debug!("[LOGOFF] {} {}", self.server_id, response.status()),
                Err(e) => debug!("[LOGOFF] {} skipped: {}", self.server_id, e),
            }
        }

        session.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *session.tasks.lock());
        for task in tasks {
            let abort = task.abort_handle();
            if timeout(self.settings.shutdown_grace, task).await.is_err() {
                warn!(
                    "[SHUTDOWN] {} task did not stop within {}ms, aborting",
                    self.server_id,
                    self.settings.shutdown_grace.as_millis()
                );
                abort.abort();
            }
        }

        session.correlator.close(DisconnectReason::ClientRequested);

        let closed = timeout(self.settings.shutdown_grace, async {
            let mut writer = session.writer.lock().await;
            SinkExt::<Action>::close(&mut *writer).await
        })
        .await;
        match closed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("[SHUTDOWN] {} socket close: {}", self.server_id, e),
            Err(_) => warn!("[SHUTDOWN] {} writer busy, dropping socket", self.server_id),
        }
    }

    /// `connect` with exponential backoff between attempts. Authentication
    /// failures are returned immediately.
    pub async fn connect_with_retry(&self) -> AmiResult<()> {
        let policy = &self.settings.reconnect;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e @ AmiError::AuthFailed(_)) => return Err(e),
                Err(e) => {
                    if policy.is_exhausted(attempt) {
                        error!(
                            "Giving up on {} after {} attempts: {}",
                            self.server_id, attempt, e
                        );
                        return Err(e);
                    }
                    let delay = policy.delay_for(attempt);
                    warn!(
                        "Reconnecting to {} in {}ms (attempt {})",
                        self.server_id,
                        delay.as_millis(),
                        attempt + 1
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
