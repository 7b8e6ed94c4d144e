use crate::error::CoreError;
use crate::llm::Message;
use crate::queue::{RequestKind, RequestQueue};
use crate::store::{HistoryStore, Turn};

/// The summarization instruction sent alongside the raw window.
const CONSOLIDATION_INSTRUCTION: &str =
    "You are a memory consolidation module. Analyze the preceding conversation. \
     Create a concise, third-person, past-tense summary of the key plot points, \
     character decisions, and newly established facts. Ignore conversational \
     filler. The summary must be objective and factual based only on the text \
     provided. This summary will serve as long-term memory.";

const MERGE_INSTRUCTION: &str =
    "An earlier summary of the story so far is included above. Fold its \
     established facts into the new summary instead of repeating it verbatim; \
     produce one self-contained summary that supersedes it.";

/// Token budget for summaries; generous enough for a dense paragraph,
/// bounded so the summary cannot crowd out the live context.
pub const SUMMARY_MAX_TOKENS: u32 = 400;

/// Assemble the summarization prompt from the prior summary (if any) and the
/// raw turns accumulated since the last consolidation.
pub fn build_consolidation_messages(prior_summary: Option<&str>, window: &[Turn]) -> Vec<Message> {
    let mut messages = Vec::with_capacity(window.len() + 2);

    if let Some(summary) = prior_summary {
        messages.push(Message::system(format!(
            "(Story so far: {})",
            summary.trim()
        )));
    }

    for turn in window {
        messages.push(Message {
            role: turn.role.as_db_str().to_string(),
            content: turn.content.clone(),
        });
    }

    let instruction = if prior_summary.is_some() {
        format!("{}\n\n{}", CONSOLIDATION_INSTRUCTION, MERGE_INSTRUCTION)
    } else {
        CONSOLIDATION_INSTRUCTION.to_string()
    };
    messages.push(Message::user(instruction));

    messages
}

/// Run one consolidation pass up to `watermark_target` accepted turns.
///
/// Returns `Ok(true)` when a new summary was stored, `Ok(false)` when the
/// pass was skipped (watermark already passed, or nothing to summarize —
/// e.g. a crash-and-resume replay of an old trigger). A failed generation
/// propagates as `GenerationFailed` and leaves the stored summary untouched;
/// the next trigger simply covers a larger window.
pub async fn consolidate(
    store: &HistoryStore,
    queue: &RequestQueue,
    chat_id: i64,
    watermark_target: u64,
) -> Result<bool, CoreError> {
    let prior = store.get_summary(chat_id)?;
    let prior_watermark = prior.as_ref().map(|s| s.watermark).unwrap_or(0);

    if watermark_target <= prior_watermark {
        tracing::debug!(
            "Skipping consolidation for chat {}: watermark {} already passed (at {})",
            chat_id,
            watermark_target,
            prior_watermark
        );
        return Ok(false);
    }

    let mut window = store.fetch_after(chat_id, prior_watermark)?;
    // Turns appended after the trigger belong to the next pass; keep the
    // stored watermark honest about what the summary covers.
    window.truncate((watermark_target - prior_watermark) as usize);
    if window.is_empty() {
        return Ok(false);
    }

    let messages =
        build_consolidation_messages(prior.as_ref().map(|s| s.summary_text.as_str()), &window);

    let pending = queue.submit(
        RequestKind::Summarization,
        chat_id,
        None,
        messages,
        SUMMARY_MAX_TOKENS,
        Vec::new(),
    )?;

    let summary = pending.wait().await?;
    let summary = summary.trim();
    if summary.is_empty() {
        return Err(CoreError::GenerationFailed(
            "summarization returned an empty result".to_string(),
        ));
    }

    let stored = store.set_summary(chat_id, summary, watermark_target)?;
    if stored {
        tracing::info!(
            "Consolidated memory for chat {} up to watermark {}",
            chat_id,
            watermark_target
        );
    }
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::CompletionBackend;
    use crate::queue::WorkerSettings;
    use crate::store::Role;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn temp_db_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("reverie_{}_{}.db", name, uuid::Uuid::new_v4()));
        path
    }

    struct FixedBackend {
        reply: String,
        calls: AtomicU32,
    }

    impl FixedBackend {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.to_string(),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl CompletionBackend for FixedBackend {
        async fn complete(
            &self,
            _messages: &[Message],
            _max_tokens: u32,
            _stop: &[String],
        ) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            request_timeout: Duration::from_secs(5),
            max_attempts: 1,
            backoff: Duration::from_millis(1),
        }
    }

    fn turn(role: Role, content: &str) -> Turn {
        Turn {
            role,
            content: content.to_string(),
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn prompt_includes_prior_summary_and_window() {
        let window = vec![
            turn(Role::User, "We reached the lighthouse."),
            turn(Role::Assistant, "The keeper was gone."),
        ];
        let messages = build_consolidation_messages(Some("They sailed north."), &window);

        assert_eq!(messages.len(), 4);
        assert!(messages[0].content.contains("They sailed north."));
        assert_eq!(messages[1].content, "We reached the lighthouse.");
        assert_eq!(messages[2].role, "assistant");
        assert!(messages[3].content.contains("memory consolidation module"));
        assert!(messages[3].content.contains("supersedes"));
    }

    #[test]
    fn prompt_without_prior_summary_skips_the_merge_instruction() {
        let window = vec![turn(Role::User, "Hello.")];
        let messages = build_consolidation_messages(None, &window);
        assert_eq!(messages.len(), 2);
        assert!(!messages[1].content.contains("supersedes"));
    }

    #[tokio::test]
    async fn consolidation_stores_summary_and_advances_watermark() {
        let path = temp_db_path("consolidate_store");
        let store = HistoryStore::new(&path).expect("db init");
        for i in 0..4 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            store.append_turn(1, role, &format!("turn {}", i)).expect("append");
        }

        let backend = FixedBackend::new("They met at the tavern.");
        let (queue, _worker) = RequestQueue::start(4, settings(), backend.clone());

        let stored = consolidate(&store, &queue, 1, 4).await.expect("consolidate");
        assert!(stored);

        let summary = store.get_summary(1).expect("get").expect("exists");
        assert_eq!(summary.summary_text, "They met at the tavern.");
        assert_eq!(summary.watermark, 4);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn passed_watermark_is_a_no_op_without_a_model_call() {
        let path = temp_db_path("consolidate_noop");
        let store = HistoryStore::new(&path).expect("db init");
        for i in 0..6 {
            store.append_turn(1, Role::User, &format!("turn {}", i)).expect("append");
        }
        store.set_summary(1, "already covered", 6).expect("seed summary");

        let backend = FixedBackend::new("should never be used");
        let (queue, _worker) = RequestQueue::start(4, settings(), backend.clone());

        let stored = consolidate(&store, &queue, 1, 6).await.expect("replay trigger");
        assert!(!stored);
        let stored = consolidate(&store, &queue, 1, 4).await.expect("older trigger");
        assert!(!stored);

        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        let summary = store.get_summary(1).expect("get").expect("exists");
        assert_eq!(summary.summary_text, "already covered");

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn window_is_truncated_to_the_target_watermark() {
        let path = temp_db_path("consolidate_truncate");
        let store = HistoryStore::new(&path).expect("db init");
        for i in 0..10 {
            store.append_turn(1, Role::User, &format!("turn {}", i)).expect("append");
        }

        let backend = FixedBackend::new("partial window summary");
        let (queue, _worker) = RequestQueue::start(4, settings(), backend);

        // Trigger recorded at 6 turns even though 10 exist by execution time.
        let stored = consolidate(&store, &queue, 1, 6).await.expect("consolidate");
        assert!(stored);
        let summary = store.get_summary(1).expect("get").expect("exists");
        assert_eq!(summary.watermark, 6);

        let _ = std::fs::remove_file(&path);
    }
}
