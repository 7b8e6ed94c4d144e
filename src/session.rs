use std::sync::Arc;

use crate::catalog;
use crate::config::BotConfig;
use crate::error::CoreError;
use crate::llm::{CompletionBackend, Message};
use crate::memory;
use crate::queue::{RequestKind, RequestQueue};
use crate::store::{ChatSession, HistoryStore, Role};
use crate::wizard::{
    self, GenerationOutcome, GenerationTarget, WizardEffect, WizardInput, WizardState,
};

/// Commands the transport has already parsed out of user input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Setup,
    Help,
    About,
    Settings,
    Clear,
    Delete,
    Regenerate,
    Cancel,
}

/// One user action, as delivered by the transport.
#[derive(Debug, Clone)]
pub enum Inbound {
    Command(Command),
    Text(String),
    Choice(String),
}

/// One button in a choice menu.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    pub label: String,
    pub data: String,
}

impl Choice {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

/// One outbound payload: text plus optional choice-menu rows. The transport
/// owns how these render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub text: String,
    pub choices: Vec<Vec<Choice>>,
}

impl Outbound {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            choices: Vec::new(),
        }
    }

    pub fn with_choices(text: impl Into<String>, choices: Vec<Vec<Choice>>) -> Self {
        Self {
            text: text.into(),
            choices,
        }
    }
}

/// A message pushed to a chat outside the request/reply exchange, e.g. the
/// queue-position notice or the consolidation announcement.
#[derive(Debug, Clone)]
pub struct ChatNotice {
    pub chat_id: i64,
    pub outbound: Outbound,
}

/// The per-message dispatcher binding store, wizard, queue and memory.
pub struct SessionController {
    store: Arc<HistoryStore>,
    queue: Arc<RequestQueue>,
    backend: Arc<dyn CompletionBackend>,
    notices: flume::Sender<ChatNotice>,
    config: BotConfig,
}

impl SessionController {
    pub fn new(
        store: Arc<HistoryStore>,
        queue: Arc<RequestQueue>,
        backend: Arc<dyn CompletionBackend>,
        notices: flume::Sender<ChatNotice>,
        config: BotConfig,
    ) -> Self {
        Self {
            store,
            queue,
            backend,
            notices,
            config,
        }
    }

    /// The single entry point the transport calls per user action.
    ///
    /// Every error is recovered here: the worst outcome for the chat is a
    /// user-visible notice, never an inconsistent session.
    pub async fn handle_inbound(&self, chat_id: i64, input: Inbound) -> Vec<Outbound> {
        match self.dispatch(chat_id, input).await {
            Ok(replies) => replies,
            Err(error) if error.is_silent() => Vec::new(),
            Err(error) => {
                tracing::debug!("Recovered error for chat {}: {}", chat_id, error);
                vec![Outbound::text(user_notice(&error))]
            }
        }
    }

    async fn dispatch(&self, chat_id: i64, input: Inbound) -> Result<Vec<Outbound>, CoreError> {
        let mut session = self
            .store
            .session_or_default(chat_id, self.config.memory_enabled_default)?;

        match input {
            Inbound::Command(command) => self.handle_command(&mut session, command).await,
            Inbound::Text(text) => {
                if session.wizard_state.is_some() {
                    self.advance_wizard(&mut session, WizardInput::Text(text)).await
                } else {
                    self.roleplay_turn(&mut session, text).await
                }
            }
            Inbound::Choice(data) => {
                if session.wizard_state.is_some() {
                    self.advance_wizard(&mut session, WizardInput::Choice(data)).await
                } else {
                    Ok(vec![Outbound::text(
                        "Nothing to select right now. Use /setup to configure me.",
                    )])
                }
            }
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Commands
    // ────────────────────────────────────────────────────────────────────

    async fn handle_command(
        &self,
        session: &mut ChatSession,
        command: Command,
    ) -> Result<Vec<Outbound>, CoreError> {
        match command {
            Command::Start => self.start_chat(session).await,
            Command::Setup => {
                session.wizard_state = Some(WizardState::MainMenu);
                self.store.save_session(session)?;
                Ok(vec![wizard::prompt(&WizardState::MainMenu, session)])
            }
            Command::Help => Ok(vec![Outbound::text(HELP_TEXT)]),
            Command::About => Ok(vec![Outbound::text(ABOUT_TEXT)]),
            Command::Settings => Ok(vec![Outbound::text(render_settings(session))]),
            Command::Clear => {
                self.store.clear_history(session.chat_id)?;
                session.turns_since_consolidation = 0;
                Ok(vec![Outbound::text(
                    "Chat history and long-term memory cleared!",
                )])
            }
            Command::Delete => {
                session.wizard_state = Some(WizardState::DeleteMenu);
                self.store.save_session(session)?;
                Ok(vec![wizard::prompt(&WizardState::DeleteMenu, session)])
            }
            Command::Regenerate => self.regenerate(session).await,
            Command::Cancel => {
                // Invalidate any in-flight generation regardless of wizard
                // state; its result will be silently discarded on delivery.
                self.queue.fences().advance(session.chat_id);
                if session.wizard_state.take().is_some() {
                    self.store.save_session(session)?;
                    Ok(vec![Outbound::text("Operation cancelled.")])
                } else {
                    Ok(vec![Outbound::text("Nothing to cancel.")])
                }
            }
        }
    }

    async fn start_chat(&self, session: &mut ChatSession) -> Result<Vec<Outbound>, CoreError> {
        self.store.clear_history(session.chat_id)?;
        session.turns_since_consolidation = 0;
        session.wizard_state = None;

        if let Some(name) = &session.user_name {
            self.store.save_session(session)?;
            return Ok(vec![Outbound::text(format!(
                "Welcome back, {}! A new chat has begun.",
                name
            ))]);
        }

        let next = WizardState::AwaitingName { onboarding: true };
        session.wizard_state = Some(next.clone());
        self.store.save_session(session)?;
        Ok(vec![
            Outbound::text(WELCOME_TEXT),
            wizard::prompt(&next, session),
        ])
    }

    async fn regenerate(&self, session: &mut ChatSession) -> Result<Vec<Outbound>, CoreError> {
        let recent = self.store.fetch_recent(session.chat_id, 2)?;
        let Some(last) = recent.last() else {
            return Ok(vec![Outbound::text("No previous AI response to regenerate.")]);
        };

        match last.role {
            Role::Assistant => {
                let Some(user_text) = recent
                    .iter()
                    .rev()
                    .find(|turn| turn.role == Role::User)
                    .map(|turn| turn.content.clone())
                else {
                    return Ok(vec![Outbound::text(
                        "Could not find the last user message to regenerate from.",
                    )]);
                };
                self.store.delete_last_exchange(session.chat_id, 2)?;
                self.store.append_turn(session.chat_id, Role::User, &user_text)?;
                self.submit_and_reply(session).await
            }
            Role::User => {
                // The previous generation is still in flight (or it failed):
                // the fresh token taken below supersedes it, and the turn we
                // replay is already the trailing one in history.
                self.submit_and_reply(session).await
            }
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Role-play turns
    // ────────────────────────────────────────────────────────────────────

    async fn roleplay_turn(
        &self,
        session: &mut ChatSession,
        text: String,
    ) -> Result<Vec<Outbound>, CoreError> {
        if session.user_name.is_none() {
            return Ok(vec![Outbound::text(
                "Please run /start to set up your character first.",
            )]);
        }

        if !self.backend.is_online().await {
            return Ok(vec![Outbound::text(
                "AI connection is offline. Please make sure the model server is running.",
            )]);
        }

        self.store.append_turn(session.chat_id, Role::User, text.trim())?;
        self.submit_and_reply(session).await
    }

    /// Submit a chat-reply generation for the history as it stands, await
    /// delivery, and append the assistant turn on success.
    async fn submit_and_reply(
        &self,
        session: &mut ChatSession,
    ) -> Result<Vec<Outbound>, CoreError> {
        let chat_id = session.chat_id;
        let messages = self.build_chat_messages(session)?;
        let stop = stop_sequences(session);

        // A fresh token supersedes anything still in flight for this chat.
        let token = self.queue.fences().advance(chat_id);

        let waiting = self.queue.queue_len();
        if waiting > 0 {
            self.notify(
                chat_id,
                Outbound::text(format!(
                    "Your request is position #{} in the queue.",
                    waiting + 1
                )),
            );
        }

        let pending = self.queue.submit(
            RequestKind::ChatReply,
            chat_id,
            Some(token),
            messages,
            self.config.max_response_tokens,
            stop,
        )?;

        let reply_text = pending.wait().await?;
        self.store.append_turn(chat_id, Role::Assistant, &reply_text)?;
        self.after_accepted_turn(session)?;

        Ok(vec![Outbound::text(reply_text)])
    }

    /// Assemble the prompt from persona, scene, user profile, summary (when
    /// memory is enabled) and the last M raw turns.
    fn build_chat_messages(&self, session: &ChatSession) -> Result<Vec<Message>, CoreError> {
        let mut messages = Vec::new();
        messages.push(Message::system(system_prompt(session)));

        if session.memory_enabled {
            if let Some(summary) = self.store.get_summary(session.chat_id)? {
                messages.push(Message::system(format!(
                    "(Memory: {})",
                    summary.summary_text
                )));
            }
        }

        let recent = self
            .store
            .fetch_recent(session.chat_id, self.config.max_history_messages)?;
        for turn in recent {
            messages.push(Message {
                role: turn.role.as_db_str().to_string(),
                content: turn.content,
            });
        }

        Ok(messages)
    }

    /// Bookkeeping after an accepted exchange: bump the consolidation
    /// counter and schedule a summarization pass at the threshold.
    fn after_accepted_turn(&self, session: &mut ChatSession) -> Result<(), CoreError> {
        session.turns_since_consolidation += 1;

        let due = session.memory_enabled
            && session.turns_since_consolidation >= self.config.consolidation_interval;

        if due {
            // The counter reset is committed before the job runs; a replayed
            // trigger after a crash is caught by the watermark.
            session.turns_since_consolidation = 0;
            self.store.save_session(session)?;
            let watermark = self.store.count_turns(session.chat_id)?;
            self.spawn_consolidation(session.chat_id, watermark);
        } else {
            self.store.save_session(session)?;
        }

        Ok(())
    }

    fn spawn_consolidation(&self, chat_id: i64, watermark: u64) {
        let store = self.store.clone();
        let queue = self.queue.clone();
        let notices = self.notices.clone();

        tokio::spawn(async move {
            match memory::consolidate(&store, &queue, chat_id, watermark).await {
                Ok(true) => {
                    let _ = notices.send(ChatNotice {
                        chat_id,
                        outbound: Outbound::text("(A new memory has been formed.)"),
                    });
                }
                Ok(false) => {}
                Err(e) => {
                    // Non-fatal; the next trigger covers a larger window.
                    tracing::warn!("Memory consolidation failed for chat {}: {}", chat_id, e);
                }
            }
        });
    }

    // ────────────────────────────────────────────────────────────────────
    // Wizard
    // ────────────────────────────────────────────────────────────────────

    async fn advance_wizard(
        &self,
        session: &mut ChatSession,
        input: WizardInput,
    ) -> Result<Vec<Outbound>, CoreError> {
        let state = session
            .wizard_state
            .clone()
            .expect("advance_wizard called with an active wizard");

        let step = match wizard::advance(&state, &input, session) {
            Ok(step) => step,
            Err(CoreError::InvalidWizardInput(hint)) => {
                // State unchanged; re-prompt with the hint on top.
                let mut reply = wizard::prompt(&state, session);
                reply.text = format!("{}\n\n{}", hint, reply.text);
                return Ok(vec![reply]);
            }
            Err(other) => return Err(other),
        };

        self.apply_step(session, step).await
    }

    async fn apply_step(
        &self,
        session: &mut ChatSession,
        step: wizard::WizardStep,
    ) -> Result<Vec<Outbound>, CoreError> {
        // Commit the transition before any externally observable effect, so
        // a crash leaves the wizard resumable instead of duplicating effects.
        session.wizard_state = step.next.clone();

        let mut generation: Option<GenerationTarget> = None;
        let mut delete_history = false;

        for effect in &step.effects {
            match effect {
                WizardEffect::SetName(name) => session.user_name = Some(name.clone()),
                WizardEffect::SetProfile(profile) => {
                    session.user_profile = Some(profile.clone())
                }
                WizardEffect::SetPersona(choice) => session.persona = choice.clone(),
                WizardEffect::SetScene(choice) => session.scene = choice.clone(),
                WizardEffect::SaveCustomPersona { name, prompt } => {
                    session
                        .custom_personas
                        .insert(name.clone(), prompt.clone());
                }
                WizardEffect::SetMemoryEnabled(enabled) => session.memory_enabled = *enabled,
                WizardEffect::RequestGeneration(target) => generation = Some(target.clone()),
                WizardEffect::DeleteProfile => {
                    session.user_name = None;
                    session.user_profile = None;
                }
                WizardEffect::DeleteCustomPersonas => session.custom_personas.clear(),
                WizardEffect::DeleteHistory => delete_history = true,
                WizardEffect::DeleteAll => {
                    // Full cascade; the in-memory session reverts to default
                    // and the row is NOT re-created.
                    self.store.delete_chat(session.chat_id)?;
                    self.queue.fences().advance(session.chat_id);
                    *session = ChatSession::new_default(
                        session.chat_id,
                        self.config.memory_enabled_default,
                    );
                    return Ok(vec![step.reply]);
                }
            }
        }

        self.store.save_session(session)?;

        if delete_history {
            self.store.clear_history(session.chat_id)?;
            session.turns_since_consolidation = 0;
        }

        if let Some(target) = generation {
            return self.run_generation(session, target, step.reply).await;
        }

        Ok(vec![step.reply])
    }

    /// Execute an on-demand persona/scene generation while the wizard sits
    /// in its waiting state, then feed the outcome back into the graph.
    async fn run_generation(
        &self,
        session: &mut ChatSession,
        target: GenerationTarget,
        queued_reply: Outbound,
    ) -> Result<Vec<Outbound>, CoreError> {
        let chat_id = session.chat_id;

        // Announce the wait immediately; the final result follows once the
        // queued request resolves.
        self.notify(chat_id, queued_reply);

        let (kind, prompt_text) = match &target {
            GenerationTarget::Persona { category } => (
                RequestKind::PersonaGeneration,
                catalog::build_persona_prompt(category),
            ),
            GenerationTarget::Scene { genre } => {
                (RequestKind::SceneGeneration, catalog::build_scene_prompt(genre))
            }
        };

        let outcome = match self.queue.submit(
            kind,
            chat_id,
            None,
            vec![Message::user(prompt_text)],
            self.config.max_response_tokens,
            Vec::new(),
        ) {
            Ok(pending) => match pending.wait().await {
                Ok(text) => match &target {
                    GenerationTarget::Persona { .. } => {
                        match catalog::parse_generated_persona(&text) {
                            Ok((name, prompt)) => GenerationOutcome::Persona { name, prompt },
                            Err(e) => GenerationOutcome::Failed {
                                notice: e.to_string(),
                            },
                        }
                    }
                    GenerationTarget::Scene { .. } => GenerationOutcome::Scene { text },
                },
                Err(e) => GenerationOutcome::Failed {
                    notice: user_notice(&e),
                },
            },
            Err(e) => GenerationOutcome::Failed {
                notice: user_notice(&e),
            },
        };

        // The session may have changed while the request was in flight
        // (/cancel, restart); reload before transitioning.
        let mut fresh = self
            .store
            .session_or_default(chat_id, self.config.memory_enabled_default)?;
        let Some(state) = fresh.wizard_state.clone() else {
            return Ok(Vec::new());
        };

        let step = wizard::generation_finished(&state, outcome, &fresh);
        if step.next.is_none() && step.reply.text.is_empty() {
            return Ok(Vec::new());
        }

        fresh.wizard_state = step.next.clone();
        self.store.save_session(&fresh)?;
        *session = fresh;

        Ok(vec![step.reply])
    }

    fn notify(&self, chat_id: i64, outbound: Outbound) {
        let _ = self.notices.send(ChatNotice { chat_id, outbound });
    }
}

/// The role-play framing the original of every prompt starts from.
fn system_prompt(session: &ChatSession) -> String {
    let persona_prompt = session.persona.resolve_prompt(&session.custom_personas);
    let name = session.user_name.as_deref().unwrap_or("user");
    let profile = session.user_profile.as_deref().unwrap_or("not specified");
    let scene = session.scene.resolve_text();

    format!(
        "(This is a role-play. {} The user you are talking to is named '{}'. \
         Their description is: '{}'. The scene is: '{}'. You will now begin \
         the role-play.)",
        persona_prompt, name, profile, scene
    )
}

/// Stop generation when the model starts speaking as the user.
fn stop_sequences(session: &ChatSession) -> Vec<String> {
    match &session.user_name {
        Some(name) => vec![format!("\n{}:", name), format!("\n*{}", name)],
        None => Vec::new(),
    }
}

fn render_settings(session: &ChatSession) -> String {
    let memory_status = if session.memory_enabled {
        "Enabled"
    } else {
        "Disabled"
    };
    format!(
        "Your Current Settings\n\n\
         👤 Name: {}\n\
         🎭 AI Persona: {}\n\
         🏞️ Scenery: {}\n\
         🧠 Long-Term Memory: {}\n\n\
         📝 Profile Description:\n{}",
        session.user_name.as_deref().unwrap_or("Not Set"),
        session.persona.display_name(),
        session.scene.display_name(),
        memory_status,
        session.user_profile.as_deref().unwrap_or("Not Set"),
    )
}

fn user_notice(error: &CoreError) -> String {
    match error {
        CoreError::QueueSaturated => {
            "I'm handling a lot of requests right now. Please try again shortly.".to_string()
        }
        CoreError::GenerationFailed(_) => {
            "I'm sorry, my thinking process failed. The model might be very busy or \
             offline. Please try again in a moment."
                .to_string()
        }
        CoreError::InvalidWizardInput(hint) => hint.clone(),
        CoreError::Persistence(_) => {
            "Something went wrong saving our conversation. Please try again.".to_string()
        }
        CoreError::StaleResult => String::new(),
    }
}

const WELCOME_TEXT: &str = "Welcome!\n\
     I am an AI role-playing companion, ready to create immersive stories with you.\n\n\
     What I can do:\n\
     • Engage in dynamic, continuous role-play.\n\
     • Remember our adventures with a long-term memory system.\n\
     • Generate unique characters and scenes on demand using the /setup menu.\n\n\
     You have full control over my personality, the scenery, and your character's \
     profile.";

const HELP_TEXT: &str = "Bot Commands\n\
     /start - 💬 Starts a new chat\n\
     /setup - ⚙️ Opens the Setup Hub\n\
     /about - ℹ️ Learn about my features\n\
     /settings - 👀 Shows your current settings\n\
     /regenerate - 🔄 Regenerates the last response\n\
     /clear - 🧹 Clears chat history and memory\n\
     /delete - 🗑️ Permanently delete user data\n\
     /cancel - ❌ Cancels the current operation\n\
     /help - ❓ Shows this help";

const ABOUT_TEXT: &str = "About This Bot\n\
     I am an AI role-playing companion powered by a locally hosted language model. \
     My purpose is to create dynamic, interactive, continuous stories with you.\n\n\
     My Core Capabilities:\n\
     • Character Customization: use /setup to define your character's name and \
     profile, as well as my persona and the scene for our role-play.\n\
     • Long-Term Memory: every so often I distill our story into a summary so I \
     don't forget important details. You can toggle this in /setup.\n\
     • AI-Powered Generation: in the persona and scenery menus, pick \"Surprise \
     Me!\" and I'll create a unique character or setting on demand.";
