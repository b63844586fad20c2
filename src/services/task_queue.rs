// src/services/task_queue.rs
//! Hand-off of lifecycle jobs to whatever performs them
//!
//! The tracker never calls the conversation store inline; it submits jobs
//! here. `LocalTaskQueue` runs them in-process, `WebhookTaskQueue` posts
//! them to the application over HTTP. Both hand jobs to a worker through a
//! bounded channel and `enqueue` never waits: a full buffer refuses the job.

use crate::error::{AmiError, AmiResult};
use crate::services::jobs::{ConversationStore, LifecycleJob};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, ClientBuilder};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(
        &self,
        job_type: &str,
        account_id: i64,
        inbox_id: i64,
        payload: serde_json::Value,
    ) -> AmiResult<()>;
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuedJob {
    pub job_type: String,
    pub account_id: i64,
    pub inbox_id: i64,
    pub payload: serde_json::Value,
}

/// In-process queue: a bounded channel drained by one worker that performs
/// jobs against a `ConversationStore`.
pub struct LocalTaskQueue {
    tx: mpsc::Sender<QueuedJob>,
}

impl LocalTaskQueue {
    pub fn start(store: Arc<dyn ConversationStore>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(Self::run_worker(store, rx));
        (Self { tx }, worker)
    }

    async fn run_worker(store: Arc<dyn ConversationStore>, mut rx: mpsc::Receiver<QueuedJob>) {
        while let Some(queued) = rx.recv().await {
            let job = match LifecycleJob::from_payload(queued.payload) {
                Ok(job) => job,
                Err(e) => {
                    error!("Dropping undecodable {} job: {}", queued.job_type, e);
                    continue;
                }
            };
            if let Err(e) = job
                .perform(store.as_ref(), queued.account_id, queued.inbox_id)
                .await
            {
                error!(
                    "Job {} for call {} failed: {}",
                    queued.job_type,
                    job.call_id(),
                    e
                );
            }
        }
        debug!("Local task queue worker stopped");
    }
}

#[async_trait]
impl TaskQueue for LocalTaskQueue {
    async fn enqueue(
        &self,
        job_type: &str,
        account_id: i64,
        inbox_id: i64,
        payload: serde_json::Value,
    ) -> AmiResult<()> {
        submit(
            &self.tx,
            "local",
            QueuedJob {
                job_type: job_type.to_string(),
                account_id,
                inbox_id,
                payload,
            },
        )
    }
}

fn submit(tx: &mpsc::Sender<QueuedJob>, queue: &str, job: QueuedJob) -> AmiResult<()> {
    tx.try_send(job).map_err(|e| match e {
        mpsc::error::TrySendError::Full(job) => AmiError::Queue(format!(
            "{} task queue full, refusing {} job",
            queue, job.job_type
        )),
        mpsc::error::TrySendError::Closed(_) => {
            AmiError::Queue(format!("{} task queue is closed", queue))
        }
    })
}

#[derive(Debug, Serialize)]
struct WebhookEnvelope<'a> {
    job_type: &'a str,
    account_id: i64,
    inbox_id: i64,
    origin_host: &'a str,
    enqueued_at: String,
    payload: &'a serde_json::Value,
}

/// HTTP side of the webhook queue, owned by the delivery worker.
struct WebhookDelivery {
    http_client: Client,
    webhook_url: String,
    origin_host: String,
}

impl WebhookDelivery {
    fn new(webhook_url: &str, timeout_ms: u64) -> AmiResult<Self> {
        let http_client = ClientBuilder::new()
            .timeout(Duration::from_millis(timeout_ms))
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;

        let origin_host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "ami-bridge".to_string());

        Ok(Self {
            http_client,
            webhook_url: webhook_url.to_string(),
            origin_host,
        })
    }

    #[instrument(skip(self, job), fields(url = %self.webhook_url, job_type = %job.job_type))]
    async fn deliver(&self, job: &QueuedJob) -> AmiResult<()> {
        let envelope = WebhookEnvelope {
            job_type: &job.job_type,
            account_id: job.account_id,
            inbox_id: job.inbox_id,
            origin_host: &self.origin_host,
            enqueued_at: Utc::now().to_rfc3339(),
            payload: &job.payload,
        };

        let response = self
            .http_client
            .post(&self.webhook_url)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AmiError::Queue(format!("webhook timed out: {}", e))
                } else {
                    AmiError::Queue(format!("webhook unreachable: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!("Webhook rejected {} job: status={}", job.job_type, status);
            return Err(AmiError::Queue(format!(
                "webhook returned HTTP {}",
                status.as_u16()
            )));
        }

        debug!("Webhook accepted {} job", job.job_type);
        Ok(())
    }

    async fn run_worker(self, mut rx: mpsc::Receiver<QueuedJob>) {
        while let Some(job) = rx.recv().await {
            if let Err(e) = self.deliver(&job).await {
                error!("Webhook delivery of {} job failed: {}", job.job_type, e);
            }
        }
        debug!("Webhook worker for {} stopped", self.webhook_url);
    }
}

/// Buffers jobs for a worker that posts each one as JSON to the
/// application's webhook endpoint.
pub struct WebhookTaskQueue {
    tx: mpsc::Sender<QueuedJob>,
    webhook_url: String,
    origin_host: String,
}

impl WebhookTaskQueue {
    /// Build the HTTP client and spawn the delivery worker. The worker ends
    /// once the queue is dropped and the buffer is drained.
    pub fn start(
        webhook_url: &str,
        timeout_ms: u64,
        capacity: usize,
    ) -> AmiResult<(Self, JoinHandle<()>)> {
        let delivery = WebhookDelivery::new(webhook_url, timeout_ms)?;
        let origin_host = delivery.origin_host.clone();
        info!("Webhook task queue -> {} (origin {})", webhook_url, origin_host);

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(delivery.run_worker(rx));
        Ok((
            Self {
                tx,
                webhook_url: webhook_url.to_string(),
                origin_host,
            },
            worker,
        ))
    }

    pub fn webhook_url(&self) -> &str {
        &self.webhook_url
    }

    pub fn origin_host(&self) -> &str {
        &self.origin_host
    }
}

#[async_trait]
impl TaskQueue for WebhookTaskQueue {
    async fn enqueue(
        &self,
        job_type: &str,
        account_id: i64,
        inbox_id: i64,
        payload: serde_json::Value,
    ) -> AmiResult<()> {
        submit(
            &self.tx,
            "webhook",
            QueuedJob {
                job_type: job_type.to_string(),
                account_id,
                inbox_id,
                payload,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::jobs::MockConversationStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_local_queue_performs_jobs_in_order() {
        let mut store = MockConversationStore::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_ensure_conversation_started()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _, _, _| Ok(()));
        store
            .expect_apply_call_lifecycle_update()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _, _| Ok(()));

        let (queue, worker) = LocalTaskQueue::start(Arc::new(store), 4);

        let start = LifecycleJob::ConversationFromCall {
            call_id: "1.1".into(),
            caller_number: "5551234".into(),
            caller_name: None,
            channel_state: Some("Ring".into()),
            summary: "Incoming call from 5551234 (5551234)".into(),
            metadata: json!({}),
        };
        let update = LifecycleJob::UpdateCall {
            call_id: "1.1".into(),
            status_summary: "Call connected.".into(),
            metadata: json!({}),
        };
        for job in [start, update] {
            queue
                .enqueue(job.job_type(), 1, 7, job.to_payload().unwrap())
                .await
                .unwrap();
        }

        drop(queue);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_local_queue_survives_bad_payload() {
        let mut store = MockConversationStore::new();
        store
            .expect_apply_call_lifecycle_update()
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));

        let (queue, worker) = LocalTaskQueue::start(Arc::new(store), 4);
        queue
            .enqueue("update_call", 1, 7, json!({"job_type": "nonsense"}))
            .await
            .unwrap();
        let good = LifecycleJob::UpdateCall {
            call_id: "1.2".into(),
            status_summary: "Call connected.".into(),
            metadata: json!({}),
        };
        queue
            .enqueue(good.job_type(), 1, 7, good.to_payload().unwrap())
            .await
            .unwrap();

        drop(queue);
        worker.await.unwrap();
    }

    /// Accepts connections and never answers, like a stalled application.
    async fn silent_endpoint() -> (tokio::net::TcpListener, String) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        (listener, url)
    }

    /// Answers every request with 200 and forwards the JSON body.
    async fn recording_endpoint() -> (String, mpsc::UnboundedReceiver<serde_json::Value>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    loop {
                        let n = match stream.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        buf.extend_from_slice(&chunk[..n]);
                        let text = String::from_utf8_lossy(&buf).to_string();
                        let Some(split) = text.find("\r\n\r\n") else {
                            continue;
                        };
                        let length = text[..split]
                            .lines()
                            .find_map(|l| {
                                let (k, v) = l.split_once(':')?;
                                k.eq_ignore_ascii_case("content-length")
                                    .then(|| v.trim().parse::<usize>().ok())
                                    .flatten()
                            })
                            .unwrap_or(0);
                        let body = &buf[split + 4..];
                        if body.len() < length {
                            continue;
                        }
                        let _ = tx.send(serde_json::from_slice(&body[..length]).unwrap());
                        let _ = stream
                            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                            .await;
                        buf.clear();
                    }
                });
            }
        });
        (url, rx)
    }

    #[tokio::test]
    async fn test_webhook_worker_posts_envelope() {
        let (url, mut bodies) = recording_endpoint().await;
        let (queue, worker) = WebhookTaskQueue::start(&url, 2000, 8).unwrap();
        assert!(!queue.origin_host().is_empty());

        queue
            .enqueue("update_call", 1, 7, json!({"call_id": "1.1"}))
            .await
            .unwrap();

        let body = tokio::time::timeout(Duration::from_secs(3), bodies.recv())
            .await
            .expect("webhook never called")
            .unwrap();
        assert_eq!(body["job_type"], "update_call");
        assert_eq!(body["account_id"], 1);
        assert_eq!(body["inbox_id"], 7);
        assert_eq!(body["origin_host"], queue.origin_host());
        assert_eq!(body["payload"]["call_id"], "1.1");

        drop(queue);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_webhook_enqueue_does_not_wait_for_endpoint() {
        let (_listener, url) = silent_endpoint().await;
        let (queue, _worker) = WebhookTaskQueue::start(&url, 5000, 8).unwrap();

        for n in 0..4 {
            tokio::time::timeout(
                Duration::from_millis(100),
                queue.enqueue("update_call", 1, 7, json!({ "n": n })),
            )
            .await
            .expect("enqueue waited on the endpoint")
            .unwrap();
        }
    }

    #[tokio::test]
    async fn test_webhook_full_buffer_refuses_job() {
        let (_listener, url) = silent_endpoint().await;
        let (queue, _worker) = WebhookTaskQueue::start(&url, 5000, 1).unwrap();

        // The worker holds at most one job in flight and the buffer one more.
        let results: Vec<_> = futures::future::join_all(
            (0..3).map(|n| queue.enqueue("update_call", 1, 7, json!({ "n": n }))),
        )
        .await;
        let err = results[2].as_ref().unwrap_err();
        assert_eq!(err.error_code(), "queue_error");
        assert!(err.to_string().contains("full"));
    }

    #[tokio::test]
    async fn test_webhook_unreachable_is_queue_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let delivery = WebhookDelivery::new(&format!("http://127.0.0.1:{}/hook", port), 500).unwrap();
        let job = QueuedJob {
            job_type: "update_call".into(),
            account_id: 1,
            inbox_id: 7,
            payload: json!({}),
        };
        let err = delivery.deliver(&job).await.unwrap_err();
        assert_eq!(err.error_code(), "queue_error");
    }

    #[tokio::test]
    async fn test_local_queue_closed_after_worker_stops() {
        let store = MockConversationStore::new();
        let (queue, worker) = LocalTaskQueue::start(Arc::new(store), 1);
        worker.abort();
        let _ = worker.await;

        let err = queue
            .enqueue("update_call", 1, 7, json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "queue_error");
    }
}
