use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use crate::config::BotConfig;
use crate::llm::{CompletionBackend, LlmClient};
use crate::queue::{RequestQueue, WorkerSettings};
use crate::session::{ChatNotice, SessionController};
use crate::store::HistoryStore;

/// The assembled core: store, generation lane and controller, wired from
/// config at startup with an explicit lifecycle.
pub struct BotRuntime {
    pub config: BotConfig,
    pub store: Arc<HistoryStore>,
    pub queue: Arc<RequestQueue>,
    pub controller: Arc<SessionController>,
    pub notices: flume::Receiver<ChatNotice>,
    worker: JoinHandle<()>,
}

impl BotRuntime {
    /// Wire everything up. Persistence unavailability is the one fatal
    /// startup condition; everything downstream is recovered per message.
    pub fn bootstrap(config: BotConfig) -> Result<Self> {
        let store = Arc::new(
            HistoryStore::new(&config.database_path).with_context(|| {
                format!("failed to open history store at {}", config.database_path)
            })?,
        );
        tracing::info!("History store initialized: {}", config.database_path);

        let backend: Arc<dyn CompletionBackend> = Arc::new(LlmClient::new(
            config.llm_api_url.clone(),
            config.llm_api_key.clone(),
            config.llm_model.clone(),
        ));

        let settings = WorkerSettings::from_config(&config);
        let (queue, worker) = RequestQueue::start(config.queue_capacity, settings, backend.clone());

        let (notice_tx, notice_rx) = flume::unbounded();
        let controller = Arc::new(SessionController::new(
            store.clone(),
            queue.clone(),
            backend,
            notice_tx,
            config.clone(),
        ));

        Ok(Self {
            config,
            store,
            queue,
            controller,
            notices: notice_rx,
            worker,
        })
    }

    /// Drain and stop the generation worker. Pending handles resolve as
    /// failed rather than hanging their callers.
    pub async fn shutdown(self) {
        let Self {
            queue,
            controller,
            worker,
            ..
        } = self;

        // Dropping the last submitter closes the lane; the worker drains
        // whatever is already queued and exits.
        drop(controller);
        drop(queue);

        if let Err(e) = worker.await {
            if !e.is_cancelled() {
                tracing::warn!("Generation worker ended abnormally: {}", e);
            }
        }
        tracing::info!("Generation worker stopped cleanly");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("reverie_{}_{}.db", name, uuid::Uuid::new_v4()));
        path
    }

    #[tokio::test]
    async fn bootstrap_and_shutdown_complete_cleanly() {
        let path = temp_db_path("runtime");
        let config = BotConfig {
            database_path: path.to_string_lossy().into_owned(),
            ..Default::default()
        };

        let runtime = BotRuntime::bootstrap(config).expect("bootstrap");
        assert_eq!(runtime.queue.queue_len(), 0);
        runtime.shutdown().await;

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn bootstrap_fails_when_the_store_path_is_unusable() {
        let config = BotConfig {
            database_path: "/nonexistent-dir/reverie.db".to_string(),
            ..Default::default()
        };
        assert!(BotRuntime::bootstrap(config).is_err());
    }
}
