use serde::{Deserialize, Serialize};

use crate::catalog::{
    self, persona_categories, personas, scene_genres, sceneries, PersonaChoice, SceneChoice,
};
use crate::error::CoreError;
use crate::session::{Choice, Outbound};
use crate::store::ChatSession;

/// What kind of content an on-demand generation step produces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GenerationTarget {
    Persona { category: String },
    Scene { genre: String },
}

/// The configuration wizard's current step plus any partially entered data.
///
/// Serialized into the chat session row so a restart resumes the same step.
/// `None` in the session (no wizard) is the IDLE state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum WizardState {
    MainMenu,
    AwaitingName { onboarding: bool },
    AwaitingProfile { onboarding: bool },
    PersonaList,
    PersonaCustomName,
    PersonaCustomPrompt { name: String },
    PersonaGenrePick,
    SceneList,
    SceneCustom,
    SceneGenrePick,
    MemoryToggle,
    DeleteMenu,
    AwaitingGeneration { target: GenerationTarget },
    ReviewGenerated {
        target: GenerationTarget,
        name: Option<String>,
        text: String,
    },
}

/// Input shapes a wizard step can receive, already parsed by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WizardInput {
    Text(String),
    Choice(String),
    Cancel,
}

/// Side effects the controller applies after committing a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WizardEffect {
    SetName(String),
    SetProfile(String),
    SetPersona(PersonaChoice),
    SetScene(SceneChoice),
    SaveCustomPersona { name: String, prompt: String },
    SetMemoryEnabled(bool),
    RequestGeneration(GenerationTarget),
    DeleteProfile,
    DeleteCustomPersonas,
    DeleteHistory,
    DeleteAll,
}

/// Result of one transition: the next state (`None` = wizard finished),
/// effects to apply, and the reply to render.
#[derive(Debug)]
pub struct WizardStep {
    pub next: Option<WizardState>,
    pub effects: Vec<WizardEffect>,
    pub reply: Outbound,
}

impl WizardStep {
    fn stay_idle(reply: Outbound) -> Self {
        Self {
            next: None,
            effects: Vec::new(),
            reply,
        }
    }

    fn goto(next: WizardState, session: &ChatSession) -> Self {
        let reply = prompt(&next, session);
        Self {
            next: Some(next),
            effects: Vec::new(),
            reply,
        }
    }

    fn with_effects(mut self, effects: Vec<WizardEffect>) -> Self {
        self.effects = effects;
        self
    }

    fn with_reply(mut self, reply: Outbound) -> Self {
        self.reply = reply;
        self
    }
}

/// Outcome of an on-demand generation, fed back into the wizard by the
/// controller once the queued request resolves.
#[derive(Debug, Clone)]
pub enum GenerationOutcome {
    Persona { name: String, prompt: String },
    Scene { text: String },
    Failed { notice: String },
}

fn invalid(hint: &str) -> CoreError {
    CoreError::InvalidWizardInput(hint.to_string())
}

/// Advance the wizard one step.
///
/// The universal cancel is handled here, before per-state dispatch, so no
/// state has to declare it. Invalid input returns `InvalidWizardInput` and
/// the caller keeps the state unchanged.
pub fn advance(
    state: &WizardState,
    input: &WizardInput,
    session: &ChatSession,
) -> Result<WizardStep, CoreError> {
    if matches!(input, WizardInput::Cancel) {
        return Ok(WizardStep::stay_idle(Outbound::text(
            "Operation cancelled.",
        )));
    }

    match state {
        WizardState::MainMenu => advance_main_menu(input, session),
        WizardState::AwaitingName { onboarding } => match input {
            WizardInput::Text(name) if !name.trim().is_empty() => {
                let name = name.trim().to_string();
                if *onboarding {
                    let next = WizardState::AwaitingProfile { onboarding: true };
                    Ok(WizardStep::goto(next, session)
                        .with_effects(vec![WizardEffect::SetName(name)]))
                } else {
                    Ok(confirm_to_menu(
                        format!("Name updated to {}.", name),
                        session,
                    )
                    .with_effects(vec![WizardEffect::SetName(name)]))
                }
            }
            _ => Err(invalid("Please send the name as a plain text message.")),
        },
        WizardState::AwaitingProfile { onboarding } => match input {
            WizardInput::Text(profile) if !profile.trim().is_empty() => {
                let profile = profile.trim().to_string();
                let effects = vec![WizardEffect::SetProfile(profile)];
                if *onboarding {
                    Ok(WizardStep::stay_idle(Outbound::text(
                        "Profile saved! You can start chatting right away, or use /setup \
                         for more options.",
                    ))
                    .with_effects(effects))
                } else {
                    Ok(confirm_to_menu("Profile updated.".to_string(), session)
                        .with_effects(effects))
                }
            }
            _ => Err(invalid(
                "Please send your character description as a plain text message.",
            )),
        },
        WizardState::PersonaList => advance_persona_list(input, session),
        WizardState::PersonaCustomName => match input {
            WizardInput::Text(name) if !name.trim().is_empty() => Ok(WizardStep::goto(
                WizardState::PersonaCustomPrompt {
                    name: name.trim().to_string(),
                },
                session,
            )),
            _ => Err(invalid("Please send a name for the new persona.")),
        },
        WizardState::PersonaCustomPrompt { name } => match input {
            WizardInput::Text(prompt) if !prompt.trim().is_empty() => {
                let name = name.clone();
                let prompt = prompt.trim().to_string();
                Ok(confirm_to_menu(
                    format!("Custom persona '{}' saved and active!", name),
                    session,
                )
                .with_effects(vec![
                    WizardEffect::SaveCustomPersona {
                        name: name.clone(),
                        prompt: prompt.clone(),
                    },
                    WizardEffect::SetPersona(PersonaChoice::Custom { name, prompt }),
                ]))
            }
            _ => Err(invalid(
                "Please send the persona prompt (e.g. 'You are a grumpy dwarf...').",
            )),
        },
        WizardState::PersonaGenrePick => match input {
            WizardInput::Choice(data) if data == "back" => {
                Ok(WizardStep::goto(WizardState::PersonaList, session))
            }
            WizardInput::Choice(data)
                if persona_categories().iter().any(|(id, _)| *id == data.as_str()) =>
            {
                let target = GenerationTarget::Persona {
                    category: data.clone(),
                };
                Ok(WizardStep::goto(
                    WizardState::AwaitingGeneration {
                        target: target.clone(),
                    },
                    session,
                )
                .with_effects(vec![WizardEffect::RequestGeneration(target)]))
            }
            _ => Err(invalid("Please pick a category from the menu.")),
        },
        WizardState::SceneList => advance_scene_list(input, session),
        WizardState::SceneCustom => match input {
            WizardInput::Text(text) if !text.trim().is_empty() => {
                let scene = SceneChoice::Custom {
                    text: text.trim().to_string(),
                };
                Ok(confirm_to_menu("Scenery updated.".to_string(), session)
                    .with_effects(vec![WizardEffect::SetScene(scene)]))
            }
            _ => Err(invalid("Please describe the scene as a plain text message.")),
        },
        WizardState::SceneGenrePick => match input {
            WizardInput::Choice(data) if data == "back" => {
                Ok(WizardStep::goto(WizardState::SceneList, session))
            }
            WizardInput::Choice(data)
                if scene_genres().iter().any(|(id, _)| *id == data.as_str()) =>
            {
                let target = GenerationTarget::Scene {
                    genre: data.clone(),
                };
                Ok(WizardStep::goto(
                    WizardState::AwaitingGeneration {
                        target: target.clone(),
                    },
                    session,
                )
                .with_effects(vec![WizardEffect::RequestGeneration(target)]))
            }
            _ => Err(invalid("Please pick a genre from the menu.")),
        },
        WizardState::MemoryToggle => match input {
            WizardInput::Choice(data) if data == "on" || data == "off" => {
                let enabled = data == "on";
                let label = if enabled { "enabled" } else { "disabled" };
                Ok(
                    confirm_to_menu(format!("Long-term memory {}.", label), session)
                        .with_effects(vec![WizardEffect::SetMemoryEnabled(enabled)]),
                )
            }
            WizardInput::Choice(data) if data == "back" => {
                Ok(WizardStep::goto(WizardState::MainMenu, session))
            }
            _ => Err(invalid("Please pick one of the options.")),
        },
        WizardState::DeleteMenu => advance_delete_menu(input),
        WizardState::AwaitingGeneration { target } => match input {
            WizardInput::Choice(data) if data == "back" => {
                Ok(WizardStep::goto(list_state_for(target), session))
            }
            _ => Err(invalid(
                "Still working on it. Give me a moment, press Back, or /cancel.",
            )),
        },
        WizardState::ReviewGenerated { target, name, text } => match input {
            WizardInput::Choice(data) if data == "use" => {
                let effects = match target {
                    GenerationTarget::Persona { .. } => {
                        let name = name.clone().unwrap_or_else(|| "Generated".to_string());
                        vec![
                            WizardEffect::SaveCustomPersona {
                                name: name.clone(),
                                prompt: text.clone(),
                            },
                            WizardEffect::SetPersona(PersonaChoice::Custom {
                                name,
                                prompt: text.clone(),
                            }),
                        ]
                    }
                    GenerationTarget::Scene { .. } => {
                        vec![WizardEffect::SetScene(SceneChoice::Custom {
                            text: text.clone(),
                        })]
                    }
                };
                let what = match target {
                    GenerationTarget::Persona { .. } => "persona",
                    GenerationTarget::Scene { .. } => "scene",
                };
                Ok(
                    confirm_to_menu(format!("The generated {} is now active!", what), session)
                        .with_effects(effects),
                )
            }
            WizardInput::Choice(data) if data == "back" => {
                Ok(WizardStep::goto(list_state_for(target), session))
            }
            _ => Err(invalid("Use the buttons to accept or discard the result.")),
        },
    }
}

fn advance_main_menu(
    input: &WizardInput,
    session: &ChatSession,
) -> Result<WizardStep, CoreError> {
    let WizardInput::Choice(data) = input else {
        return Err(invalid("Please use the menu buttons."));
    };

    match data.as_str() {
        "name" => Ok(WizardStep::goto(
            WizardState::AwaitingName { onboarding: false },
            session,
        )),
        "profile" => Ok(WizardStep::goto(
            WizardState::AwaitingProfile { onboarding: false },
            session,
        )),
        "persona" => Ok(WizardStep::goto(WizardState::PersonaList, session)),
        "scene" => Ok(WizardStep::goto(WizardState::SceneList, session)),
        "memory" => Ok(WizardStep::goto(WizardState::MemoryToggle, session)),
        "close" => Ok(WizardStep::stay_idle(Outbound::text("Setup closed."))),
        _ => Err(invalid("Please use the menu buttons.")),
    }
}

fn advance_persona_list(
    input: &WizardInput,
    session: &ChatSession,
) -> Result<WizardStep, CoreError> {
    let WizardInput::Choice(data) = input else {
        return Err(invalid("Please pick a persona from the menu."));
    };

    match data.as_str() {
        "generate" => Ok(WizardStep::goto(WizardState::PersonaGenrePick, session)),
        "custom" => Ok(WizardStep::goto(WizardState::PersonaCustomName, session)),
        "back" => Ok(WizardStep::goto(WizardState::MainMenu, session)),
        other => {
            let Some(id) = other.strip_prefix("pick_") else {
                return Err(invalid("Please pick a persona from the menu."));
            };
            let known = catalog::find_persona(id).is_some()
                || session.custom_personas.contains_key(id);
            if !known {
                return Err(invalid("That persona is no longer available."));
            }
            let choice = PersonaChoice::Predefined { id: id.to_string() };
            let name = choice.display_name();
            Ok(
                confirm_to_menu(format!("Persona updated to {}.", name), session)
                    .with_effects(vec![WizardEffect::SetPersona(choice)]),
            )
        }
    }
}

fn advance_scene_list(
    input: &WizardInput,
    session: &ChatSession,
) -> Result<WizardStep, CoreError> {
    let WizardInput::Choice(data) = input else {
        return Err(invalid("Please pick a scene from the menu."));
    };

    match data.as_str() {
        "generate" => Ok(WizardStep::goto(WizardState::SceneGenrePick, session)),
        "custom" => Ok(WizardStep::goto(WizardState::SceneCustom, session)),
        "back" => Ok(WizardStep::goto(WizardState::MainMenu, session)),
        other => {
            let Some(id) = other.strip_prefix("pick_") else {
                return Err(invalid("Please pick a scene from the menu."));
            };
            let Some(scenery) = catalog::find_scenery(id) else {
                return Err(invalid("That scene is no longer available."));
            };
            let choice = SceneChoice::Predefined { id: id.to_string() };
            Ok(
                confirm_to_menu(format!("Scenery updated to {}.", scenery.name), session)
                    .with_effects(vec![WizardEffect::SetScene(choice)]),
            )
        }
    }
}

fn advance_delete_menu(input: &WizardInput) -> Result<WizardStep, CoreError> {
    let WizardInput::Choice(data) = input else {
        return Err(invalid("Please pick what to delete from the menu."));
    };

    let (effect, notice) = match data.as_str() {
        "profile" => (Some(WizardEffect::DeleteProfile), "User profile deleted."),
        "personas" => (
            Some(WizardEffect::DeleteCustomPersonas),
            "All custom personas deleted.",
        ),
        "history" => (
            Some(WizardEffect::DeleteHistory),
            "This chat's history and memory deleted.",
        ),
        "all" => (
            Some(WizardEffect::DeleteAll),
            "All user and chat data has been deleted.",
        ),
        "cancel" => (None, "Deletion cancelled."),
        _ => return Err(invalid("Please pick what to delete from the menu.")),
    };

    Ok(WizardStep::stay_idle(Outbound::text(notice))
        .with_effects(effect.into_iter().collect()))
}

/// Feed a finished generation back into the wizard.
///
/// Only meaningful while the state is `AwaitingGeneration`; the transition
/// is deterministic on the outcome.
pub fn generation_finished(
    state: &WizardState,
    outcome: GenerationOutcome,
    session: &ChatSession,
) -> WizardStep {
    let WizardState::AwaitingGeneration { target } = state else {
        // A late result after cancel/restart has nothing to resume.
        return WizardStep::stay_idle(Outbound::text(""));
    };

    match outcome {
        GenerationOutcome::Persona { name, prompt } => {
            let next = WizardState::ReviewGenerated {
                target: target.clone(),
                name: Some(name.clone()),
                text: prompt.clone(),
            };
            let reply = Outbound::with_choices(
                format!(
                    "I've created this persona for you:\n\nName: {}\n\nPrompt:\n{}",
                    name, prompt
                ),
                vec![
                    vec![Choice::new("✅ Use This Persona", "use")],
                    vec![Choice::new("« Back to Persona Menu", "back")],
                ],
            );
            WizardStep::goto(next, session).with_reply(reply)
        }
        GenerationOutcome::Scene { text } => {
            let next = WizardState::ReviewGenerated {
                target: target.clone(),
                name: None,
                text: text.clone(),
            };
            let reply = Outbound::with_choices(
                format!("Generated Scene:\n\n{}", text),
                vec![
                    vec![Choice::new("✅ Use This Scene", "use")],
                    vec![Choice::new("« Back to Scenery Menu", "back")],
                ],
            );
            WizardStep::goto(next, session).with_reply(reply)
        }
        GenerationOutcome::Failed { notice } => {
            let back = list_state_for(target);
            let mut reply = prompt(&back, session);
            reply.text = format!("{}\n\n{}", notice, reply.text);
            WizardStep::goto(back, session).with_reply(reply)
        }
    }
}

fn list_state_for(target: &GenerationTarget) -> WizardState {
    match target {
        GenerationTarget::Persona { .. } => WizardState::PersonaList,
        GenerationTarget::Scene { .. } => WizardState::SceneList,
    }
}

fn confirm_to_menu(confirmation: String, session: &ChatSession) -> WizardStep {
    let menu = prompt(&WizardState::MainMenu, session);
    let reply = Outbound {
        text: format!("{}\n\n{}", confirmation, menu.text),
        choices: menu.choices,
    };
    WizardStep {
        next: Some(WizardState::MainMenu),
        effects: Vec::new(),
        reply,
    }
}

/// Render the prompt for a state, used on entry and on re-prompt after
/// invalid input.
pub fn prompt(state: &WizardState, session: &ChatSession) -> Outbound {
    match state {
        WizardState::MainMenu => {
            let name = session.user_name.clone().unwrap_or_else(|| "Not Set".into());
            let persona = session.persona.display_name();
            let scene = session.scene.display_name();
            let memory = if session.memory_enabled {
                "Enabled"
            } else {
                "Disabled"
            };
            Outbound::with_choices(
                "⚙️ Setup Hub\n\nChoose an option to configure:",
                vec![
                    vec![
                        Choice::new(format!("👤 Name: {}", name), "name"),
                        Choice::new("📝 Profile", "profile"),
                    ],
                    vec![
                        Choice::new(format!("🎭 Persona: {}", persona), "persona"),
                        Choice::new(format!("🏞️ Scenery: {}", scene), "scene"),
                    ],
                    vec![Choice::new(format!("🧠 Memory: {}", memory), "memory")],
                    vec![Choice::new("Close", "close")],
                ],
            )
        }
        WizardState::AwaitingName { onboarding } => {
            if *onboarding {
                Outbound::text(
                    "Let's create your character. What is their name? Send it as your \
                     next message.",
                )
            } else {
                Outbound::text("Please send your new name as a message.")
            }
        }
        WizardState::AwaitingProfile { onboarding } => {
            if *onboarding {
                Outbound::text("Got it. Now, please describe your character.")
            } else {
                Outbound::text("Please send your new profile description as a message.")
            }
        }
        WizardState::PersonaList => {
            let mut rows = vec![
                vec![Choice::new("🎲 Surprise Me!", "generate")],
                vec![Choice::new("✨ Create New Custom Persona", "custom")],
            ];
            for persona in personas() {
                rows.push(vec![Choice::new(
                    format!("{} - {}", persona.name, persona.description),
                    format!("pick_{}", persona.id),
                )]);
            }
            for name in session.custom_personas.keys() {
                rows.push(vec![Choice::new(
                    format!("✨ {} - Custom", name),
                    format!("pick_{}", name),
                )]);
            }
            rows.push(vec![Choice::new("« Back to Setup", "back")]);
            Outbound::with_choices(
                "Choose my persona, or let me generate/create one for you:",
                rows,
            )
        }
        WizardState::PersonaCustomName => {
            Outbound::text("Please send the name for your new custom persona.")
        }
        WizardState::PersonaCustomPrompt { .. } => Outbound::text(
            "Great. Now, send the persona prompt (e.g. 'You are a grumpy dwarf...').",
        ),
        WizardState::PersonaGenrePick => {
            let rows = persona_categories()
                .iter()
                .map(|(id, label)| vec![Choice::new(*label, *id)])
                .chain(std::iter::once(vec![Choice::new("« Back", "back")]))
                .collect();
            Outbound::with_choices(
                "Please choose a category for your surprise persona:",
                rows,
            )
        }
        WizardState::SceneList => {
            let mut rows = vec![vec![Choice::new("🎲 Surprise Me!", "generate")]];
            for scenery in sceneries() {
                rows.push(vec![Choice::new(
                    scenery.name,
                    format!("pick_{}", scenery.id),
                )]);
            }
            rows.push(vec![Choice::new("✍️ Describe Your Own", "custom")]);
            rows.push(vec![Choice::new("« Back to Setup", "back")]);
            Outbound::with_choices("Choose a scene or let me generate one for you:", rows)
        }
        WizardState::SceneCustom => {
            Outbound::text("Please describe the scene for our story as a message.")
        }
        WizardState::SceneGenrePick => {
            let rows = scene_genres()
                .iter()
                .map(|(id, label)| vec![Choice::new(*label, *id)])
                .chain(std::iter::once(vec![Choice::new("« Back", "back")]))
                .collect();
            Outbound::with_choices(
                "Please choose a genre/archetype for the generated scene:",
                rows,
            )
        }
        WizardState::MemoryToggle => {
            let status = if session.memory_enabled {
                "enabled"
            } else {
                "disabled"
            };
            Outbound::with_choices(
                format!(
                    "Long-term memory is currently {}. When enabled, I periodically \
                     distill our story into a durable summary I keep across sessions.",
                    status
                ),
                vec![
                    vec![
                        Choice::new("Enable", "on"),
                        Choice::new("Disable", "off"),
                    ],
                    vec![Choice::new("« Back", "back")],
                ],
            )
        }
        WizardState::DeleteMenu => Outbound::with_choices(
            "This is a destructive action. Select data to permanently delete:",
            vec![
                vec![Choice::new("👤 My Profile (Name/Desc)", "profile")],
                vec![Choice::new("✨ My Custom Personas", "personas")],
                vec![Choice::new("💬 This Chat's History", "history")],
                vec![Choice::new("⚠️ ALL MY DATA (Full Reset)", "all")],
                vec![Choice::new("❌ Cancel", "cancel")],
            ],
        ),
        WizardState::AwaitingGeneration { target } => {
            let what = match target {
                GenerationTarget::Persona { .. } => "persona",
                GenerationTarget::Scene { .. } => "scene",
            };
            Outbound::with_choices(
                format!(
                    "Your {} request is in the queue. I'll send it when it's ready.",
                    what
                ),
                vec![vec![Choice::new("« Back", "back")]],
            )
        }
        WizardState::ReviewGenerated { .. } => Outbound::with_choices(
            "Use the buttons to accept or discard the generated result.",
            vec![vec![
                Choice::new("✅ Use It", "use"),
                Choice::new("« Back", "back"),
            ]],
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChatSession;

    fn session() -> ChatSession {
        ChatSession::new_default(7, true)
    }

    fn all_states() -> Vec<WizardState> {
        vec![
            WizardState::MainMenu,
            WizardState::AwaitingName { onboarding: false },
            WizardState::AwaitingProfile { onboarding: true },
            WizardState::PersonaList,
            WizardState::PersonaCustomName,
            WizardState::PersonaCustomPrompt {
                name: "Morgan".into(),
            },
            WizardState::PersonaGenrePick,
            WizardState::SceneList,
            WizardState::SceneCustom,
            WizardState::SceneGenrePick,
            WizardState::MemoryToggle,
            WizardState::DeleteMenu,
            WizardState::AwaitingGeneration {
                target: GenerationTarget::Scene {
                    genre: "noir".into(),
                },
            },
            WizardState::ReviewGenerated {
                target: GenerationTarget::Persona {
                    category: "rogue".into(),
                },
                name: Some("Vex".into()),
                text: "You are role-playing as Vex.".into(),
            },
        ]
    }

    #[test]
    fn cancel_exits_from_every_state() {
        let session = session();
        for state in all_states() {
            let step = advance(&state, &WizardInput::Cancel, &session)
                .expect("cancel always accepted");
            assert!(step.next.is_none(), "cancel from {:?} must exit", state);
            assert!(step.effects.is_empty());
        }
    }

    #[test]
    fn invalid_input_keeps_state_and_surfaces_a_hint() {
        let session = session();
        let err = advance(
            &WizardState::MainMenu,
            &WizardInput::Text("hello".into()),
            &session,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidWizardInput(_)));

        let err = advance(
            &WizardState::PersonaList,
            &WizardInput::Choice("pick_nonexistent".into()),
            &session,
        )
        .unwrap_err();
        assert!(err.to_string().contains("no longer available"));
    }

    #[test]
    fn main_menu_routes_to_each_section() {
        let session = session();
        let cases = [
            ("name", WizardState::AwaitingName { onboarding: false }),
            ("persona", WizardState::PersonaList),
            ("scene", WizardState::SceneList),
            ("memory", WizardState::MemoryToggle),
        ];
        for (data, expected) in cases {
            let step = advance(
                &WizardState::MainMenu,
                &WizardInput::Choice(data.into()),
                &session,
            )
            .expect("valid menu choice");
            assert_eq!(step.next.as_ref(), Some(&expected));
        }
    }

    #[test]
    fn picking_a_predefined_persona_sets_it_and_returns_to_menu() {
        let session = session();
        let step = advance(
            &WizardState::PersonaList,
            &WizardInput::Choice("pick_storyteller".into()),
            &session,
        )
        .expect("valid persona pick");
        assert_eq!(step.next, Some(WizardState::MainMenu));
        assert_eq!(
            step.effects,
            vec![WizardEffect::SetPersona(PersonaChoice::Predefined {
                id: "storyteller".into()
            })]
        );
        assert!(step.reply.text.contains("Persona updated to Storyteller"));
    }

    #[test]
    fn custom_persona_flow_carries_the_draft_name() {
        let session = session();
        let step = advance(
            &WizardState::PersonaCustomName,
            &WizardInput::Text("Morgan".into()),
            &session,
        )
        .expect("name accepted");
        let next = step.next.expect("moves to prompt entry");
        assert_eq!(
            next,
            WizardState::PersonaCustomPrompt {
                name: "Morgan".into()
            }
        );

        let step = advance(
            &next,
            &WizardInput::Text("You are a grumpy dwarf.".into()),
            &session,
        )
        .expect("prompt accepted");
        assert!(step.effects.iter().any(|e| matches!(
            e,
            WizardEffect::SaveCustomPersona { name, .. } if name == "Morgan"
        )));
    }

    #[test]
    fn genre_pick_requests_generation_and_enters_waiting() {
        let session = session();
        let step = advance(
            &WizardState::SceneGenrePick,
            &WizardInput::Choice("noir".into()),
            &session,
        )
        .expect("genre accepted");
        assert!(matches!(
            step.next,
            Some(WizardState::AwaitingGeneration {
                target: GenerationTarget::Scene { .. }
            })
        ));
        assert_eq!(
            step.effects,
            vec![WizardEffect::RequestGeneration(GenerationTarget::Scene {
                genre: "noir".into()
            })]
        );
    }

    #[test]
    fn waiting_state_rejects_chatter_but_allows_back() {
        let session = session();
        let waiting = WizardState::AwaitingGeneration {
            target: GenerationTarget::Persona {
                category: "rogue".into(),
            },
        };
        let err = advance(&waiting, &WizardInput::Text("done yet?".into()), &session)
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidWizardInput(_)));

        let step = advance(&waiting, &WizardInput::Choice("back".into()), &session)
            .expect("back accepted");
        assert_eq!(step.next, Some(WizardState::PersonaList));
    }

    #[test]
    fn generation_success_moves_to_review_and_accept_applies_effects() {
        let session = session();
        let waiting = WizardState::AwaitingGeneration {
            target: GenerationTarget::Scene {
                genre: "noir".into(),
            },
        };
        let step = generation_finished(
            &waiting,
            GenerationOutcome::Scene {
                text: "Rain over the docks.".into(),
            },
            &session,
        );
        let review = step.next.expect("review state");
        assert!(matches!(review, WizardState::ReviewGenerated { .. }));
        assert!(step.reply.text.contains("Rain over the docks."));

        let accept = advance(&review, &WizardInput::Choice("use".into()), &session)
            .expect("use accepted");
        assert_eq!(
            accept.effects,
            vec![WizardEffect::SetScene(SceneChoice::Custom {
                text: "Rain over the docks.".into()
            })]
        );
        assert_eq!(accept.next, Some(WizardState::MainMenu));
    }

    #[test]
    fn generation_failure_returns_to_the_list_with_a_notice() {
        let session = session();
        let waiting = WizardState::AwaitingGeneration {
            target: GenerationTarget::Persona {
                category: "rogue".into(),
            },
        };
        let step = generation_finished(
            &waiting,
            GenerationOutcome::Failed {
                notice: "Sorry, I couldn't generate a persona.".into(),
            },
            &session,
        );
        assert_eq!(step.next, Some(WizardState::PersonaList));
        assert!(step.reply.text.contains("couldn't generate"));
    }

    #[test]
    fn delete_menu_maps_choices_to_effects() {
        let step = advance_delete_menu(&WizardInput::Choice("all".into()))
            .expect("delete all accepted");
        assert_eq!(step.effects, vec![WizardEffect::DeleteAll]);
        assert!(step.next.is_none());

        let step = advance_delete_menu(&WizardInput::Choice("cancel".into()))
            .expect("cancel accepted");
        assert!(step.effects.is_empty());
    }

    #[test]
    fn wizard_state_roundtrips_through_serde_with_draft_data() {
        for state in all_states() {
            let json = serde_json::to_string(&state).expect("serialize state");
            let parsed: WizardState = serde_json::from_str(&json).expect("deserialize state");
            assert_eq!(parsed, state);
        }
    }
}
