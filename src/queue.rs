use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};

use crate::error::CoreError;
use crate::llm::{CompletionBackend, Message};

/// What a queued request produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    ChatReply,
    PersonaGeneration,
    SceneGeneration,
    Summarization,
}

/// One unit of model-bound work.
///
/// `token` is the chat's fencing token at submission time; `None` marks an
/// unfenced request (summarization), whose idempotence is enforced by the
/// memory watermark instead.
pub struct GenerationRequest {
    pub id: String,
    pub kind: RequestKind,
    pub chat_id: i64,
    pub token: Option<u64>,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub stop: Vec<String>,
    reply: oneshot::Sender<Result<String, CoreError>>,
}

/// Handle the submitter awaits for the result.
pub struct PendingGeneration {
    pub id: String,
    rx: oneshot::Receiver<Result<String, CoreError>>,
}

impl PendingGeneration {
    pub async fn wait(self) -> Result<String, CoreError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(CoreError::GenerationFailed(
                "worker stopped before delivering the result".to_string(),
            )),
        }
    }
}

/// Monotonic per-chat tokens used to discard superseded results.
///
/// `/regenerate` and `/cancel` advance the token; the worker compares a
/// request's token against the current one both before executing and before
/// delivering, so a result can never land after being superseded.
#[derive(Default)]
pub struct FenceRegistry {
    tokens: Mutex<HashMap<i64, u64>>,
}

impl FenceRegistry {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, u64>> {
        self.tokens.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bump the chat's token and return the new value.
    pub fn advance(&self, chat_id: i64) -> u64 {
        let mut tokens = self.lock();
        let entry = tokens.entry(chat_id).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn current(&self, chat_id: i64) -> u64 {
        *self.lock().get(&chat_id).unwrap_or(&0)
    }

    /// Unfenced requests are always current.
    pub fn is_current(&self, chat_id: i64, token: Option<u64>) -> bool {
        match token {
            Some(token) => token == self.current(chat_id),
            None => true,
        }
    }
}

/// Retry policy for calls against the completion endpoint.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &crate::config::BotConfig) -> Self {
        Self {
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            max_attempts: config.max_retries.max(1),
            backoff: Duration::from_secs(config.retry_backoff_secs),
        }
    }
}

/// Bounded submission lane for all model-bound work.
///
/// A single worker drains the channel in FIFO order, so requests for one
/// chat complete in submission order; the bounded capacity is the
/// backpressure that protects the local model server.
pub struct RequestQueue {
    tx: flume::Sender<GenerationRequest>,
    fences: Arc<FenceRegistry>,
}

impl RequestQueue {
    /// Create the queue and spawn its worker task.
    pub fn start(
        capacity: usize,
        settings: WorkerSettings,
        backend: Arc<dyn CompletionBackend>,
    ) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = flume::bounded(capacity);
        let fences = Arc::new(FenceRegistry::default());
        let worker = tokio::spawn(run_worker(rx, backend, fences.clone(), settings));
        (Arc::new(Self { tx, fences }), worker)
    }

    /// Enqueue a request. Fails with `QueueSaturated` when the lane is at
    /// capacity rather than queueing unboundedly.
    pub fn submit(
        &self,
        kind: RequestKind,
        chat_id: i64,
        token: Option<u64>,
        messages: Vec<Message>,
        max_tokens: u32,
        stop: Vec<String>,
    ) -> Result<PendingGeneration, CoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let id = uuid::Uuid::new_v4().to_string();
        let request = GenerationRequest {
            id: id.clone(),
            kind,
            chat_id,
            token,
            messages,
            max_tokens,
            stop,
            reply: reply_tx,
        };

        match self.tx.try_send(request) {
            Ok(()) => Ok(PendingGeneration { id, rx: reply_rx }),
            Err(flume::TrySendError::Full(_)) => {
                tracing::warn!("Generation queue saturated, rejecting request for chat {}", chat_id);
                Err(CoreError::QueueSaturated)
            }
            Err(flume::TrySendError::Disconnected(_)) => Err(CoreError::GenerationFailed(
                "generation worker is not running".to_string(),
            )),
        }
    }

    /// Requests currently waiting in the lane (excludes the one being
    /// executed).
    pub fn queue_len(&self) -> usize {
        self.tx.len()
    }

    pub fn fences(&self) -> &FenceRegistry {
        &self.fences
    }
}

async fn run_worker(
    rx: flume::Receiver<GenerationRequest>,
    backend: Arc<dyn CompletionBackend>,
    fences: Arc<FenceRegistry>,
    settings: WorkerSettings,
) {
    tracing::info!("Generation worker started and listening for jobs");

    while let Ok(request) = rx.recv_async().await {
        // Superseded while waiting in the queue: skip without touching the
        // model at all.
        if !fences.is_current(request.chat_id, request.token) {
            tracing::debug!(
                "Dropping superseded request {} for chat {} before execution",
                request.id,
                request.chat_id
            );
            let _ = request.reply.send(Err(CoreError::StaleResult));
            continue;
        }

        let result = execute_with_retry(backend.as_ref(), &request, &settings).await;

        // Superseded mid-flight: the call itself cannot be aborted, but the
        // result must not be delivered.
        if !fences.is_current(request.chat_id, request.token) {
            tracing::debug!(
                "Discarding stale result of request {} for chat {}",
                request.id,
                request.chat_id
            );
            let _ = request.reply.send(Err(CoreError::StaleResult));
            continue;
        }

        let _ = request
            .reply
            .send(result.map_err(|e| CoreError::GenerationFailed(e.to_string())));
    }

    tracing::info!("Generation worker stopped");
}

async fn execute_with_retry(
    backend: &dyn CompletionBackend,
    request: &GenerationRequest,
    settings: &WorkerSettings,
) -> anyhow::Result<String> {
    let mut last_error = None;

    for attempt in 1..=settings.max_attempts {
        match timeout(
            settings.request_timeout,
            backend.complete(&request.messages, request.max_tokens, &request.stop),
        )
        .await
        {
            Ok(Ok(text)) => return Ok(text),
            Ok(Err(e)) => {
                tracing::warn!(
                    "Request {} attempt {}/{} failed: {}",
                    request.id,
                    attempt,
                    settings.max_attempts,
                    e
                );
                last_error = Some(e);
            }
            Err(_) => {
                tracing::warn!(
                    "Request {} attempt {}/{} timed out after {:?}",
                    request.id,
                    attempt,
                    settings.max_attempts,
                    settings.request_timeout
                );
                last_error = Some(anyhow!(
                    "completion request timed out after {:?}",
                    settings.request_timeout
                ));
            }
        }

        if attempt < settings.max_attempts {
            sleep(settings.backoff * attempt).await;
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow!("no completion attempts were made")))
}
