use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::CoreError;

/// A predefined persona the user can pick from the setup menu.
#[derive(Debug, Clone)]
pub struct Persona {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub prompt: &'static str,
}

/// A predefined scene backdrop.
#[derive(Debug, Clone)]
pub struct Scenery {
    pub id: &'static str,
    pub name: &'static str,
    pub text: &'static str,
}

pub const DEFAULT_PERSONA_ID: &str = "assistant";
pub const DEFAULT_SCENE_ID: &str = "none";

/// The active persona for a chat: either a catalog id or a custom
/// definition (hand-written or model-generated).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersonaChoice {
    Predefined { id: String },
    Custom { name: String, prompt: String },
}

impl PersonaChoice {
    pub fn default_choice() -> Self {
        PersonaChoice::Predefined {
            id: DEFAULT_PERSONA_ID.to_string(),
        }
    }

    /// Display name, falling back to the id for unknown catalog entries.
    pub fn display_name(&self) -> String {
        match self {
            PersonaChoice::Predefined { id } => find_persona(id)
                .map(|p| p.name.to_string())
                .unwrap_or_else(|| id.clone()),
            PersonaChoice::Custom { name, .. } => name.clone(),
        }
    }

    /// Resolve to the system-prompt text, consulting the user's custom
    /// persona library for ids that are not in the static catalog.
    pub fn resolve_prompt(&self, custom_personas: &BTreeMap<String, String>) -> String {
        match self {
            PersonaChoice::Predefined { id } => {
                if let Some(persona) = find_persona(id) {
                    persona.prompt.to_string()
                } else if let Some(prompt) = custom_personas.get(id) {
                    prompt.clone()
                } else {
                    default_persona().prompt.to_string()
                }
            }
            PersonaChoice::Custom { prompt, .. } => prompt.clone(),
        }
    }
}

/// The active scene: a catalog id or free text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SceneChoice {
    Predefined { id: String },
    Custom { text: String },
}

impl SceneChoice {
    pub fn default_choice() -> Self {
        SceneChoice::Predefined {
            id: DEFAULT_SCENE_ID.to_string(),
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            SceneChoice::Predefined { id } => find_scenery(id)
                .map(|s| s.name.to_string())
                .unwrap_or_else(|| id.clone()),
            SceneChoice::Custom { .. } => "Custom".to_string(),
        }
    }

    pub fn resolve_text(&self) -> String {
        match self {
            SceneChoice::Predefined { id } => find_scenery(id)
                .map(|s| s.text.to_string())
                .unwrap_or_else(|| default_scenery().text.to_string()),
            SceneChoice::Custom { text } => text.clone(),
        }
    }
}

pub fn personas() -> &'static [Persona] {
    &[
        Persona {
            id: "assistant",
            name: "Helpful Assistant",
            description: "Friendly, knowledgeable, always on your side",
            prompt: "You are role-playing as a helpful, friendly assistant. You answer \
                     questions clearly, offer suggestions, and keep the conversation warm \
                     and engaging. You stay in character at all times.",
        },
        Persona {
            id: "storyteller",
            name: "Storyteller",
            description: "Narrates an evolving adventure around you",
            prompt: "You are role-playing as a master storyteller and game master. You \
                     narrate an evolving story in vivid second person, react to the user's \
                     choices, and keep scenes concrete and sensory. You never break the \
                     narrative frame.",
        },
        Persona {
            id: "detective",
            name: "Detective",
            description: "A sharp-eyed investigator with a dry wit",
            prompt: "You are role-playing as a seasoned detective with a dry sense of \
                     humor. You notice details others miss, think out loud in short \
                     deductive steps, and draw the user into solving cases with you. You \
                     stay in character at all times.",
        },
        Persona {
            id: "sage",
            name: "Wandering Sage",
            description: "Patient mentor full of stories and lore",
            prompt: "You are role-playing as a wandering sage: patient, curious, and full \
                     of stories from distant places. You teach through questions and small \
                     parables, and you treat the user as a traveling companion. You stay \
                     in character at all times.",
        },
    ]
}

pub fn sceneries() -> &'static [Scenery] {
    &[
        Scenery {
            id: "none",
            name: "No Scene",
            text: "No particular scene; an open-ended conversation.",
        },
        Scenery {
            id: "tavern",
            name: "Seaside Tavern",
            text: "A creaking seaside tavern at dusk. Lanterns sway from the rafters, the \
                   air smells of salt and woodsmoke, and sailors murmur over their mugs \
                   while rain taps the windows.",
        },
        Scenery {
            id: "station",
            name: "Orbital Station",
            text: "A quiet observation deck on an orbital station. Earth turns slowly \
                   beyond the viewport, status panels blink in the half-dark, and the hum \
                   of recyclers fills the silence between announcements.",
        },
        Scenery {
            id: "forest",
            name: "Ancient Forest",
            text: "A moss-covered clearing deep in an ancient forest. Shafts of green \
                   light fall through the canopy, somewhere water runs over stones, and \
                   ruins of an older age lie half-buried under ferns.",
        },
    ]
}

pub fn find_persona(id: &str) -> Option<&'static Persona> {
    personas().iter().find(|p| p.id == id)
}

pub fn find_scenery(id: &str) -> Option<&'static Scenery> {
    sceneries().iter().find(|s| s.id == id)
}

fn default_persona() -> &'static Persona {
    find_persona(DEFAULT_PERSONA_ID).expect("default persona present in catalog")
}

fn default_scenery() -> &'static Scenery {
    find_scenery(DEFAULT_SCENE_ID).expect("default scenery present in catalog")
}

// ─── On-demand generation ────────────────────────────────────────────────────

pub fn scene_genres() -> &'static [(&'static str, &'static str)] {
    &[
        ("fantasy", "Fantasy"),
        ("scifi", "Sci-Fi"),
        ("cyberpunk", "Cyberpunk"),
        ("horror", "Horror"),
        ("noir", "Historical/Noir"),
        ("modern", "Modern"),
        ("surreal", "Surreal/Bizarre"),
        ("random", "Completely Random"),
    ]
}

pub fn persona_categories() -> &'static [(&'static str, &'static str)] {
    &[
        ("friendly", "Helpful / Friendly"),
        ("heroic", "Adventurous / Heroic"),
        ("rogue", "Mystery / Rogue"),
        ("info", "Informative Expert"),
        ("random", "Surprise Me"),
    ]
}

pub fn scene_genre_label(id: &str) -> Option<&'static str> {
    scene_genres()
        .iter()
        .find(|(genre, _)| *genre == id)
        .map(|(_, label)| *label)
}

pub fn persona_category_label(id: &str) -> Option<&'static str> {
    persona_categories()
        .iter()
        .find(|(category, _)| *category == id)
        .map(|(_, label)| *label)
}

/// Build the one-shot prompt for generating a scene backdrop.
pub fn build_scene_prompt(genre: &str) -> String {
    let base = "You are a game master describing a location. Describe a unique \
                environment. Focus on the physical place, its atmosphere, sights, and \
                sounds. Do NOT include any people, characters, creatures, or ongoing \
                events. The description should be a neutral backdrop for a story to \
                begin, in at most 120 words.";

    let requirement = match genre {
        "random" => "The genre can be anything, from fantasy to sci-fi to modern.".to_string(),
        other => {
            let label = scene_genre_label(other).unwrap_or(other);
            format!("The genre of the environment must be: {}.", label)
        }
    };

    format!("{}\n\nRequirement:\n{}", base, requirement)
}

/// Build the one-shot prompt for generating a persona definition.
///
/// The reply format is parsed by [`parse_generated_persona`]; the two must
/// stay in sync.
pub fn build_persona_prompt(category: &str) -> String {
    let base = "You are a persona generator for an AI role-playing chatbot. Your \
                response MUST follow this format exactly:\n\
                NAME: [A single, unique character name]\n\
                ###\n\
                PROMPT: [The full system prompt for the character.]\n\
                The prompt must start with 'You are role-playing as [Name]...'. Define \
                the character's personality, capabilities, and a brief backstory. The \
                prompt must end with the instruction: 'You stay in character at all \
                times.'";

    let requirement = match category {
        "friendly" => {
            "The persona should be friendly, helpful, and suitable for general \
             conversation or lighthearted adventure."
        }
        "heroic" => {
            "The persona must be heroic and action-oriented, suitable for an adventure \
             or quest. They should be brave, skilled in survival, and have a clear goal \
             or moral code."
        }
        "rogue" => {
            "The persona must be mysterious and cunning, suitable for a story of \
             intrigue or detection. They could be a detective, a spy, or a thief with a \
             secretive nature."
        }
        "info" => {
            "The persona must be an expert in a specific, interesting field (like a \
             historian, a scientist, a mechanic). They should be knowledgeable and eager \
             to share information in character."
        }
        _ => "Any tone and archetype goes; pick something unexpected but coherent.",
    };

    format!("{}\n\nCategory Requirement:\n{}", base, requirement)
}

/// Parse a generated persona reply into (name, prompt).
pub fn parse_generated_persona(reply: &str) -> Result<(String, String), CoreError> {
    let re = Regex::new(r"(?s)NAME:\s*(.+?)\s*###\s*PROMPT:\s*(.+)").expect("static regex");
    let captures = re.captures(reply.trim()).ok_or_else(|| {
        CoreError::InvalidWizardInput(
            "The AI returned an invalid persona format. Please try again.".to_string(),
        )
    })?;

    let name = captures[1].trim().to_string();
    let prompt = captures[2].trim().to_string();
    if name.is_empty() || prompt.is_empty() {
        return Err(CoreError::InvalidWizardInput(
            "The AI returned an empty persona. Please try again.".to_string(),
        ));
    }
    Ok((name, prompt))
}
