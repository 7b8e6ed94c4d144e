//! Telegram transport for Reverie.
//!
//! A long-polling tokio loop that:
//! - Receives messages and callback-query button presses and routes them into
//!   the session controller as parsed `Inbound` actions.
//! - Renders the controller's `Outbound` payloads as messages with inline
//!   keyboards.
//! - Relays asynchronous chat notices (queue position, memory formed) from
//!   the controller's notice channel.
//!
//! Optional: set `telegram_allowed_chat_id` to restrict the bot to a single
//! authorized chat. No new dependencies — uses the existing `reqwest`.

use std::sync::Arc;

use serde::Deserialize;

use crate::session::{ChatNotice, Command, Inbound, Outbound, SessionController};

// ─── Telegram API types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
}

#[derive(Deserialize)]
struct Update {
    update_id: i64,
    message: Option<TelegramMessage>,
    callback_query: Option<CallbackQuery>,
}

#[derive(Deserialize)]
struct TelegramMessage {
    chat: TelegramChat,
    text: Option<String>,
}

#[derive(Deserialize)]
struct CallbackQuery {
    id: String,
    message: Option<TelegramMessage>,
    data: Option<String>,
}

#[derive(Deserialize)]
struct TelegramChat {
    id: i64,
}

// ─── Public entry point ──────────────────────────────────────────────────────

pub struct TelegramBot {
    api_base: String,
    client: reqwest::Client,
    controller: Arc<SessionController>,
    allowed_chat_id: Option<i64>,
    poll_timeout_secs: u64,
}

impl TelegramBot {
    pub fn new(
        token: &str,
        controller: Arc<SessionController>,
        allowed_chat_id: Option<i64>,
        poll_timeout_secs: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            api_base: format!("https://api.telegram.org/bot{}", token),
            client: reqwest::Client::new(),
            controller,
            allowed_chat_id,
            poll_timeout_secs,
        })
    }

    /// Relay controller notices (queue position, memory formed) as they
    /// arrive, independent of the request/reply exchange. The handle must be
    /// aborted at shutdown: the relay pins the controller alive through its
    /// `Arc`, so it never observes the channel closing on its own.
    pub fn spawn_notice_relay(
        self: &Arc<Self>,
        notices: flume::Receiver<ChatNotice>,
    ) -> tokio::task::JoinHandle<()> {
        let bot = self.clone();
        tokio::spawn(async move {
            while let Ok(notice) = notices.recv_async().await {
                if !notice.outbound.text.trim().is_empty() {
                    bot.send_outbound(notice.chat_id, &notice.outbound).await;
                }
            }
        })
    }

    /// Run the long-polling loop until the process shuts down.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            "Telegram bot active (allowed_chat_id: {:?})",
            self.allowed_chat_id
        );
        let mut offset: i64 = 0;

        loop {
            let updates = match self.poll_updates(offset).await {
                Some(u) => u,
                None => continue,
            };

            for update in updates {
                offset = update.update_id + 1;

                let Some((chat_id, inbound, ack)) = self.parse_update(update) else {
                    continue;
                };

                if let Some(allowed) = self.allowed_chat_id {
                    if chat_id != allowed {
                        tracing::debug!(
                            "Telegram: ignoring message from unauthorized chat {}",
                            chat_id
                        );
                        continue;
                    }
                }

                if let Some(callback_id) = ack {
                    self.answer_callback(&callback_id).await;
                }

                // Each action is handled on its own task so one chat's slow
                // generation does not stall another chat's wizard taps.
                let bot = self.clone();
                tokio::spawn(async move {
                    if matches!(inbound, Inbound::Text(_)) {
                        bot.send_chat_action(chat_id).await;
                    }
                    let replies = bot.controller.handle_inbound(chat_id, inbound).await;
                    for outbound in replies {
                        bot.send_outbound(chat_id, &outbound).await;
                    }
                });
            }
        }
    }

    /// Map a raw update to (chat, parsed action, callback id to ack).
    fn parse_update(&self, update: Update) -> Option<(i64, Inbound, Option<String>)> {
        if let Some(query) = update.callback_query {
            let chat_id = query.message.as_ref().map(|m| m.chat.id)?;
            let data = query.data?;
            return Some((chat_id, Inbound::Choice(data), Some(query.id)));
        }

        let msg = update.message?;
        let chat_id = msg.chat.id;
        let text = match msg.text {
            Some(t) if !t.trim().is_empty() => t.trim().to_string(),
            _ => return None,
        };

        tracing::info!("Telegram [chat {}]: {:?}", chat_id, text);
        Some((chat_id, parse_input(&text), None))
    }

    // ─── HTTP helpers ────────────────────────────────────────────────────

    async fn poll_updates(&self, offset: i64) -> Option<Vec<Update>> {
        let url = format!("{}/getUpdates", self.api_base);
        let params = serde_json::json!({
            "offset": offset,
            "timeout": self.poll_timeout_secs,
            "allowed_updates": ["message", "callback_query"]
        });

        let resp = match self.client.post(&url).json(&params).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Telegram getUpdates error: {}", e);
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
                return None;
            }
        };

        let body: TelegramResponse<Vec<Update>> = match resp.json().await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!("Telegram getUpdates parse error: {}", e);
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
                return None;
            }
        };

        if !body.ok {
            tracing::warn!("Telegram API returned ok=false");
            tokio::time::sleep(tokio::time::Duration::from_secs(10)).await;
            return None;
        }

        Some(body.result.unwrap_or_default())
    }

    async fn send_outbound(&self, chat_id: i64, outbound: &Outbound) {
        // Telegram enforces a 4096-character limit per message.
        const MAX_LEN: usize = 4096;

        let chunks = chunk_text(&outbound.text, MAX_LEN);
        let last = chunks.len().saturating_sub(1);

        for (index, chunk) in chunks.iter().enumerate() {
            let mut payload = serde_json::json!({ "chat_id": chat_id, "text": chunk });

            // The keyboard goes on the final chunk only.
            if index == last && !outbound.choices.is_empty() {
                let keyboard: Vec<Vec<serde_json::Value>> = outbound
                    .choices
                    .iter()
                    .map(|row| {
                        row.iter()
                            .map(|choice| {
                                serde_json::json!({
                                    "text": choice.label,
                                    "callback_data": choice.data
                                })
                            })
                            .collect()
                    })
                    .collect();
                payload["reply_markup"] = serde_json::json!({ "inline_keyboard": keyboard });
            }

            let url = format!("{}/sendMessage", self.api_base);
            match self.client.post(&url).json(&payload).send().await {
                Ok(r) if r.status().is_success() => {
                    tracing::debug!("Telegram: sent reply to chat {}", chat_id);
                }
                Ok(r) => {
                    tracing::warn!("Telegram sendMessage failed: HTTP {}", r.status());
                }
                Err(e) => {
                    tracing::error!("Telegram sendMessage error: {}", e);
                }
            }
        }
    }

    async fn send_chat_action(&self, chat_id: i64) {
        let url = format!("{}/sendChatAction", self.api_base);
        let payload = serde_json::json!({ "chat_id": chat_id, "action": "typing" });
        if let Err(e) = self.client.post(&url).json(&payload).send().await {
            tracing::debug!("Telegram sendChatAction error: {}", e);
        }
    }

    async fn answer_callback(&self, callback_id: &str) {
        let url = format!("{}/answerCallbackQuery", self.api_base);
        let payload = serde_json::json!({ "callback_query_id": callback_id });
        if let Err(e) = self.client.post(&url).json(&payload).send().await {
            tracing::debug!("Telegram answerCallbackQuery error: {}", e);
        }
    }
}

/// Parse user text into a command or a plain role-play message.
fn parse_input(text: &str) -> Inbound {
    if !text.starts_with('/') {
        return Inbound::Text(text.to_string());
    }

    // "/command@botname args" — the command word is everything up to the
    // first whitespace, with an optional @mention suffix.
    let word = text.split_whitespace().next().unwrap_or(text);
    let command = word.split('@').next().unwrap_or(word);

    match command {
        "/start" => Inbound::Command(Command::Start),
        "/setup" => Inbound::Command(Command::Setup),
        "/help" => Inbound::Command(Command::Help),
        "/about" => Inbound::Command(Command::About),
        "/settings" | "/display_current_setup" => Inbound::Command(Command::Settings),
        "/clear" => Inbound::Command(Command::Clear),
        "/delete" => Inbound::Command(Command::Delete),
        "/regenerate" => Inbound::Command(Command::Regenerate),
        "/cancel" => Inbound::Command(Command::Cancel),
        // Unknown commands fall back to help rather than being role-played.
        _ => Inbound::Command(Command::Help),
    }
}

/// Split on char boundaries into chunks of at most `max_len` bytes.
fn chunk_text(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if current.len() + ch.len_utf8() > max_len {
            chunks.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse_with_mentions_and_arguments() {
        assert!(matches!(
            parse_input("/start"),
            Inbound::Command(Command::Start)
        ));
        assert!(matches!(
            parse_input("/setup@reverie_bot"),
            Inbound::Command(Command::Setup)
        ));
        assert!(matches!(
            parse_input("/regenerate please"),
            Inbound::Command(Command::Regenerate)
        ));
        assert!(matches!(
            parse_input("/unknowncmd"),
            Inbound::Command(Command::Help)
        ));
    }

    #[test]
    fn plain_text_stays_a_roleplay_message() {
        match parse_input("The door creaks open") {
            Inbound::Text(text) => assert_eq!(text, "The door creaks open"),
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[test]
    fn long_replies_are_chunked_on_char_boundaries() {
        let text = "ab".repeat(3000);
        let chunks = chunk_text(&text, 4096);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() <= 4096));
        assert_eq!(chunks.concat(), text);

        let short = chunk_text("hello", 4096);
        assert_eq!(short, vec!["hello".to_string()]);
    }
}
