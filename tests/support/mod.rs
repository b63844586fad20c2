// tests/support/mod.rs
//! Scripted in-process AMI server for integration tests
//!
//! The server greets with a banner, parses each action block it receives,
//! records it, and writes whatever the script returns. Tests can also push
//! raw blocks (events) or hang up at any time.
#![allow(dead_code)]

use ami_bridge::error::AmiResult;
use ami_bridge::services::TaskQueue;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const USERNAME: &str = "bridge";
pub const SECRET: &str = "secret";

/// One action block as the server saw it.
#[derive(Debug, Clone)]
pub struct ReceivedAction {
    pub headers: Vec<(String, String)>,
}

impl ReceivedAction {
    fn parse(lines: &[String]) -> Self {
        let headers = lines
            .iter()
            .filter_map(|line| {
                line.split_once(':')
                    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            })
            .collect();
        Self { headers }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn name(&self) -> &str {
        self.get("Action").unwrap_or_default()
    }

    pub fn is(&self, name: &str) -> bool {
        self.name().eq_ignore_ascii_case(name)
    }
}

/// Builder for raw wire blocks.
pub struct BlockBuilder {
    lines: Vec<(String, String)>,
}

impl BlockBuilder {
    pub fn response(status: &str) -> Self {
        Self {
            lines: vec![("Response".to_string(), status.to_string())],
        }
    }

    pub fn event(name: &str) -> Self {
        Self {
            lines: vec![("Event".to_string(), name.to_string())],
        }
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.lines.push((key.to_string(), value.to_string()));
        self
    }

    /// Echo the action's ActionID, if it had one.
    pub fn reply_to(self, action: &ReceivedAction) -> Self {
        match action.get("ActionID") {
            Some(id) => self.header("ActionID", id),
            None => self,
        }
    }

    pub fn build(self) -> String {
        let mut out = String::new();
        for (k, v) in self.lines {
            out.push_str(&format!("{}: {}\r\n", k, v));
        }
        out.push_str("\r\n");
        out
    }
}

pub fn success(action: &ReceivedAction, message: &str) -> String {
    BlockBuilder::response("Success")
        .reply_to(action)
        .header("Message", message)
        .build()
}

pub fn error(action: &ReceivedAction, message: &str) -> String {
    BlockBuilder::response("Error")
        .reply_to(action)
        .header("Message", message)
        .build()
}

/// Answers login, ping and logoff like a healthy switch. Anything else gets
/// `None` so scripts can layer on top.
pub fn standard_reply(action: &ReceivedAction) -> Option<Vec<String>> {
    if action.is("Login") {
        let ok = action.get("Username") == Some(USERNAME) && action.get("Secret") == Some(SECRET);
        return Some(vec![if ok {
            success(action, "Authentication accepted")
        } else {
            error(action, "Authentication failed")
        }]);
    }
    if action.is("Ping") {
        return Some(vec![BlockBuilder::response("Success")
            .reply_to(action)
            .header("Ping", "Pong")
            .build()]);
    }
    if action.is("Logoff") {
        return Some(vec![BlockBuilder::response("Goodbye")
            .reply_to(action)
            .header("Message", "Thanks for all the fish.")
            .build()]);
    }
    None
}

pub type Script = Arc<dyn Fn(&ReceivedAction) -> Vec<String> + Send + Sync>;

/// A script reply equal to this closes the socket once earlier replies
/// are written.
pub const HANG_UP: &str = "\u{0}hang-up";

/// Standard replies, plus a generic success for every other action.
pub fn default_script() -> Script {
    Arc::new(|action: &ReceivedAction| {
        standard_reply(action).unwrap_or_else(|| vec![success(action, "OK")])
    })
}

enum Command {
    Push(String),
    HangUp,
}

pub struct FakeAmiServer {
    pub port: u16,
    received: Arc<Mutex<Vec<ReceivedAction>>>,
    commands: mpsc::UnboundedSender<Command>,
    handle: JoinHandle<()>,
}

impl FakeAmiServer {
    pub async fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(Mutex::new(Vec::new()));
        let (commands, mut command_rx) = mpsc::unbounded_channel();

        let log = received.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if !serve(stream, &script, &log, &mut command_rx).await {
                    break;
                }
            }
        });

        Self {
            port,
            received,
            commands,
            handle,
        }
    }

    /// Write a raw block to the connected client.
    pub fn push(&self, block: String) {
        let _ = self.commands.send(Command::Push(block));
    }

    /// Close the client socket from the server side.
    pub fn hang_up(&self) {
        let _ = self.commands.send(Command::HangUp);
    }

    pub fn received(&self) -> Vec<ReceivedAction> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_named(&self, name: &str) -> Vec<ReceivedAction> {
        self.received().into_iter().filter(|a| a.is(name)).collect()
    }

    /// Wait until at least `count` actions named `name` arrived.
    pub async fn wait_for_actions(&self, name: &str, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.received_named(name).len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("server never received the expected actions");
    }
}

impl Drop for FakeAmiServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Serve one client. Returns false when the command channel is gone.
async fn serve(
    stream: TcpStream,
    script: &Script,
    log: &Arc<Mutex<Vec<ReceivedAction>>>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> bool {
    let (read_half, mut write_half) = stream.into_split();
    if write_half
        .write_all(b"Asterisk Call Manager/5.0.1\r\n")
        .await
        .is_err()
    {
        return true;
    }

    let mut lines = BufReader::new(read_half).lines();
    let mut block: Vec<String> = Vec::new();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    _ => return true,
                };
                let line = line.trim_end_matches('\r');
                if !line.is_empty() {
                    block.push(line.to_string());
                    continue;
                }
                if block.is_empty() {
                    continue;
                }
                let action = ReceivedAction::parse(&block);
                block.clear();
                log.lock().unwrap().push(action.clone());
                for reply in (script.as_ref())(&action) {
                    if reply == HANG_UP {
                        let _ = write_half.shutdown().await;
                        return true;
                    }
                    if write_half.write_all(reply.as_bytes()).await.is_err() {
                        return true;
                    }
                }
            }
            command = commands.recv() => match command {
                Some(Command::Push(raw)) => {
                    if write_half.write_all(raw.as_bytes()).await.is_err() {
                        return true;
                    }
                }
                Some(Command::HangUp) => return true,
                None => return false,
            }
        }
    }
}

/// Task queue that records every submitted job.
#[derive(Clone)]
pub struct RecordingQueue {
    tx: mpsc::UnboundedSender<(String, serde_json::Value)>,
}

impl RecordingQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, serde_json::Value)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn enqueue(
        &self,
        job_type: &str,
        _account_id: i64,
        _inbox_id: i64,
        payload: serde_json::Value,
    ) -> AmiResult<()> {
        let _ = self.tx.send((job_type.to_string(), payload));
        Ok(())
    }
}
