use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use crate::catalog::{PersonaChoice, SceneChoice};
use crate::wizard::WizardState;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "assistant" => Role::Assistant,
            _ => Role::User,
        }
    }
}

/// One message exchange unit in a chat's history. Append-only; rowid order
/// is the only ordering guarantee.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// The single long-term memory record for a chat.
///
/// `watermark` is the accepted-turn count the summary already accounts for;
/// it never moves backwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSummary {
    pub summary_text: String,
    pub watermark: u64,
    pub updated_at: DateTime<Utc>,
}

/// Per-chat durable state: persona, scene, the user's character, the memory
/// toggle, the consolidation counter and the wizard step (if one is active).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub chat_id: i64,
    pub user_name: Option<String>,
    pub user_profile: Option<String>,
    pub persona: PersonaChoice,
    pub scene: SceneChoice,
    pub custom_personas: BTreeMap<String, String>,
    pub memory_enabled: bool,
    pub turns_since_consolidation: u32,
    pub wizard_state: Option<WizardState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn new_default(chat_id: i64, memory_enabled: bool) -> Self {
        let now = Utc::now();
        Self {
            chat_id,
            user_name: None,
            user_profile: None,
            persona: PersonaChoice::default_choice(),
            scene: SceneChoice::default_choice(),
            custom_personas: BTreeMap::new(),
            memory_enabled,
            turns_since_consolidation: 0,
            wizard_state: None,
            created_at: now,
            updated_at: now,
        }
    }
}

pub struct HistoryStore {
    conn: Mutex<Connection>,
}

impl HistoryStore {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Create the database schema
    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS turns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_turns_chat_id ON turns(chat_id, id ASC)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS memory_summaries (
                chat_id INTEGER PRIMARY KEY,
                summary TEXT NOT NULL,
                watermark INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS chat_sessions (
                chat_id INTEGER PRIMARY KEY,
                user_name TEXT,
                user_profile TEXT,
                persona_json TEXT NOT NULL,
                scene_json TEXT NOT NULL,
                custom_personas_json TEXT NOT NULL,
                memory_enabled INTEGER NOT NULL,
                turns_since_consolidation INTEGER NOT NULL DEFAULT 0,
                wizard_state_json TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────
    // Turns
    // ────────────────────────────────────────────────────────────────────

    /// Append a single turn to a chat's history.
    pub fn append_turn(&self, chat_id: i64, role: Role, content: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO turns (chat_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![chat_id, role.as_db_str(), content, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// The last `n` turns in insertion order.
    pub fn fetch_recent(&self, chat_id: i64, n: usize) -> Result<Vec<Turn>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT role, content, created_at FROM (
                 SELECT id, role, content, created_at FROM turns
                 WHERE chat_id = ?1
                 ORDER BY id DESC
                 LIMIT ?2
             ) ORDER BY id ASC",
        )?;

        let turns = stmt
            .query_map(params![chat_id, n as i64], Self::map_turn_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(turns)
    }

    /// Turns after the first `offset` ones, in insertion order. Used to pull
    /// the raw window a consolidation has not yet covered.
    pub fn fetch_after(&self, chat_id: i64, offset: u64) -> Result<Vec<Turn>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT role, content, created_at FROM turns
             WHERE chat_id = ?1
             ORDER BY id ASC
             LIMIT -1 OFFSET ?2",
        )?;

        let turns = stmt
            .query_map(params![chat_id, offset as i64], Self::map_turn_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(turns)
    }

    fn map_turn_row(row: &rusqlite::Row<'_>) -> std::result::Result<Turn, rusqlite::Error> {
        Ok(Turn {
            role: Role::from_db(&row.get::<_, String>(0)?),
            content: row.get(1)?,
            created_at: row.get::<_, String>(2)?.parse().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    2,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
        })
    }

    /// Total turns stored for a chat.
    pub fn count_turns(&self, chat_id: i64) -> Result<u64> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM turns WHERE chat_id = ?1",
            [chat_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Remove the trailing user/assistant pair (or lone trailing turn) so a
    /// regeneration can replay from the same prior context.
    pub fn delete_last_exchange(&self, chat_id: i64, count: usize) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "DELETE FROM turns WHERE id IN (
                 SELECT id FROM turns WHERE chat_id = ?1 ORDER BY id DESC LIMIT ?2
             )",
            params![chat_id, count as i64],
        )?;
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────
    // Memory summary
    // ────────────────────────────────────────────────────────────────────

    /// Retrieve the long-term memory summary for a chat.
    pub fn get_summary(&self, chat_id: i64) -> Result<Option<StoredSummary>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT summary, watermark, updated_at FROM memory_summaries WHERE chat_id = ?1",
            [chat_id],
            |row| {
                Ok(StoredSummary {
                    summary_text: row.get(0)?,
                    watermark: row.get::<_, i64>(1)? as u64,
                    updated_at: row.get::<_, String>(2)?.parse().map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            2,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?,
                })
            },
        );

        match result {
            Ok(summary) => Ok(Some(summary)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Store a summary, advancing the watermark.
    ///
    /// The watermark is monotonic: a write carrying a watermark at or below
    /// the stored one is ignored and `false` is returned. This is the
    /// enforcement point that makes duplicate consolidation triggers a no-op.
    pub fn set_summary(&self, chat_id: i64, summary: &str, watermark: u64) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "INSERT INTO memory_summaries (chat_id, summary, watermark, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(chat_id) DO UPDATE SET
                 summary = excluded.summary,
                 watermark = excluded.watermark,
                 updated_at = excluded.updated_at
             WHERE excluded.watermark > memory_summaries.watermark",
            params![chat_id, summary, watermark as i64, Utc::now().to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    // ────────────────────────────────────────────────────────────────────
    // Sessions
    // ────────────────────────────────────────────────────────────────────

    /// Load the session record for a chat, if one exists.
    pub fn load_session(&self, chat_id: i64) -> Result<Option<ChatSession>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT user_name, user_profile, persona_json, scene_json,
                    custom_personas_json, memory_enabled, turns_since_consolidation,
                    wizard_state_json, created_at, updated_at
             FROM chat_sessions WHERE chat_id = ?1",
            [chat_id],
            |row| {
                let persona_json: String = row.get(2)?;
                let scene_json: String = row.get(3)?;
                let custom_json: String = row.get(4)?;
                let wizard_json: Option<String> = row.get(7)?;

                Ok(ChatSession {
                    chat_id,
                    user_name: row.get(0)?,
                    user_profile: row.get(1)?,
                    persona: serde_json::from_str(&persona_json).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            2,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?,
                    scene: serde_json::from_str(&scene_json).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            3,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?,
                    custom_personas: serde_json::from_str(&custom_json).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            4,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?,
                    memory_enabled: row.get::<_, i64>(5)? != 0,
                    turns_since_consolidation: row.get::<_, i64>(6)? as u32,
                    wizard_state: match wizard_json {
                        Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(
                                7,
                                rusqlite::types::Type::Text,
                                Box::new(e),
                            )
                        })?),
                        None => None,
                    },
                    created_at: row.get::<_, String>(8)?.parse().map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            8,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?,
                    updated_at: row.get::<_, String>(9)?.parse().map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            9,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?,
                })
            },
        );

        match result {
            Ok(session) => Ok(Some(session)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Load the session or create a default one in memory (not yet saved).
    pub fn session_or_default(&self, chat_id: i64, memory_default: bool) -> Result<ChatSession> {
        Ok(self
            .load_session(chat_id)?
            .unwrap_or_else(|| ChatSession::new_default(chat_id, memory_default)))
    }

    /// Persist a session as a single atomic write.
    pub fn save_session(&self, session: &ChatSession) -> Result<()> {
        let persona_json =
            serde_json::to_string(&session.persona).context("Failed to serialize persona")?;
        let scene_json =
            serde_json::to_string(&session.scene).context("Failed to serialize scene")?;
        let custom_json = serde_json::to_string(&session.custom_personas)
            .context("Failed to serialize custom personas")?;
        let wizard_json = session
            .wizard_state
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize wizard state")?;

        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO chat_sessions
             (chat_id, user_name, user_profile, persona_json, scene_json,
              custom_personas_json, memory_enabled, turns_since_consolidation,
              wizard_state_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                session.chat_id,
                session.user_name,
                session.user_profile,
                persona_json,
                scene_json,
                custom_json,
                session.memory_enabled as i64,
                session.turns_since_consolidation as i64,
                wizard_json,
                session.created_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────
    // Deletion
    // ────────────────────────────────────────────────────────────────────

    /// Delete the chat's turns and summary, and reset the consolidation
    /// counter; session settings (persona, name, toggle) survive.
    pub fn clear_history(&self, chat_id: i64) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM turns WHERE chat_id = ?1", [chat_id])?;
        tx.execute("DELETE FROM memory_summaries WHERE chat_id = ?1", [chat_id])?;
        tx.execute(
            "UPDATE chat_sessions SET turns_since_consolidation = 0, updated_at = ?2
             WHERE chat_id = ?1",
            params![chat_id, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        tracing::info!("History and memory cleared for chat {}", chat_id);
        Ok(())
    }

    /// Full cascade delete: turns, summary and the session record.
    pub fn delete_chat(&self, chat_id: i64) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM turns WHERE chat_id = ?1", [chat_id])?;
        tx.execute("DELETE FROM memory_summaries WHERE chat_id = ?1", [chat_id])?;
        tx.execute("DELETE FROM chat_sessions WHERE chat_id = ?1", [chat_id])?;
        tx.commit()?;
        tracing::info!("All data deleted for chat {}", chat_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wizard::WizardState;
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("reverie_{}_{}.db", name, uuid::Uuid::new_v4()));
        path
    }

    #[test]
    fn turns_append_and_fetch_in_insertion_order() {
        let path = temp_db_path("turn_order");
        let store = HistoryStore::new(&path).expect("db init");

        for i in 0..6 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            store
                .append_turn(7, role, &format!("message {}", i))
                .expect("append turn");
        }
        store
            .append_turn(99, Role::User, "other chat")
            .expect("append other chat");

        let recent = store.fetch_recent(7, 4).expect("fetch recent");
        assert_eq!(recent.len(), 4);
        assert_eq!(recent[0].content, "message 2");
        assert_eq!(recent[3].content, "message 5");
        assert_eq!(recent[3].role, Role::Assistant);

        assert_eq!(store.count_turns(7).expect("count"), 6);
        assert_eq!(store.count_turns(99).expect("count other"), 1);

        let tail = store.fetch_after(7, 4).expect("fetch after");
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].content, "message 4");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn delete_last_exchange_trims_the_trailing_pair() {
        let path = temp_db_path("delete_exchange");
        let store = HistoryStore::new(&path).expect("db init");

        store.append_turn(1, Role::User, "hello").expect("append");
        store
            .append_turn(1, Role::Assistant, "hi there")
            .expect("append");
        store.append_turn(1, Role::User, "again").expect("append");
        store
            .append_turn(1, Role::Assistant, "once more")
            .expect("append");

        store.delete_last_exchange(1, 2).expect("delete exchange");
        let remaining = store.fetch_recent(1, 10).expect("fetch");
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[1].content, "hi there");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn summary_watermark_is_monotonic() {
        let path = temp_db_path("watermark");
        let store = HistoryStore::new(&path).expect("db init");

        assert!(store
            .set_summary(5, "first summary", 10)
            .expect("initial set"));
        let stored = store.get_summary(5).expect("get").expect("exists");
        assert_eq!(stored.watermark, 10);

        // A replay of an already-passed watermark must not touch the row.
        assert!(!store
            .set_summary(5, "stale rewrite", 10)
            .expect("stale set"));
        assert!(!store.set_summary(5, "older rewrite", 3).expect("older set"));
        let stored = store.get_summary(5).expect("get").expect("exists");
        assert_eq!(stored.summary_text, "first summary");

        assert!(store.set_summary(5, "newer summary", 25).expect("advance"));
        let stored = store.get_summary(5).expect("get").expect("exists");
        assert_eq!(stored.summary_text, "newer summary");
        assert_eq!(stored.watermark, 25);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn session_roundtrips_with_wizard_state_and_drafts() {
        let path = temp_db_path("session_roundtrip");
        let store = HistoryStore::new(&path).expect("db init");

        let mut session = ChatSession::new_default(11, true);
        session.user_name = Some("Rin".to_string());
        session.user_profile = Some("A wandering cartographer.".to_string());
        session
            .custom_personas
            .insert("Morgan".to_string(), "You are Morgan.".to_string());
        session.wizard_state = Some(WizardState::PersonaCustomPrompt {
            name: "Vex".to_string(),
        });
        session.turns_since_consolidation = 9;

        store.save_session(&session).expect("save session");

        let loaded = store
            .load_session(11)
            .expect("load session")
            .expect("session exists");
        assert_eq!(loaded.user_name.as_deref(), Some("Rin"));
        assert_eq!(loaded.turns_since_consolidation, 9);
        assert_eq!(
            loaded.wizard_state,
            Some(WizardState::PersonaCustomPrompt {
                name: "Vex".to_string()
            })
        );
        assert_eq!(
            loaded.custom_personas.get("Morgan").map(String::as_str),
            Some("You are Morgan.")
        );

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn session_or_default_creates_an_unsaved_default() {
        let path = temp_db_path("session_default");
        let store = HistoryStore::new(&path).expect("db init");

        let session = store.session_or_default(42, false).expect("default session");
        assert_eq!(session.chat_id, 42);
        assert!(!session.memory_enabled);
        assert!(session.wizard_state.is_none());
        assert!(store.load_session(42).expect("load").is_none());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn clear_history_keeps_session_but_resets_counter() {
        let path = temp_db_path("clear_history");
        let store = HistoryStore::new(&path).expect("db init");

        let mut session = ChatSession::new_default(3, true);
        session.user_name = Some("Rin".to_string());
        session.turns_since_consolidation = 7;
        store.save_session(&session).expect("save session");
        store.append_turn(3, Role::User, "hello").expect("append");
        store.set_summary(3, "summary", 4).expect("set summary");

        store.clear_history(3).expect("clear history");

        assert_eq!(store.count_turns(3).expect("count"), 0);
        assert!(store.get_summary(3).expect("summary").is_none());
        let loaded = store.load_session(3).expect("load").expect("kept");
        assert_eq!(loaded.user_name.as_deref(), Some("Rin"));
        assert_eq!(loaded.turns_since_consolidation, 0);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn delete_chat_cascades_turns_summary_and_session() {
        let path = temp_db_path("delete_cascade");
        let store = HistoryStore::new(&path).expect("db init");

        store
            .save_session(&ChatSession::new_default(8, true))
            .expect("save session");
        store.append_turn(8, Role::User, "hello").expect("append");
        store.set_summary(8, "summary", 2).expect("set summary");

        store.delete_chat(8).expect("delete chat");

        assert_eq!(store.count_turns(8).expect("count"), 0);
        assert!(store.get_summary(8).expect("summary").is_none());
        assert!(store.load_session(8).expect("load").is_none());

        let _ = std::fs::remove_file(&path);
    }
}
