use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use tandem_core::ids::SessionId;
use tandem_core::messages::{Message, Role};
use tandem_core::session::{Session, TurnMarker};
use tandem_core::todos::TodoItem;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{json_column, RowReader};
use crate::SessionStore;

/// Lightweight listing row, without the message log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub turn_state: TurnMarker,
    pub turn_count: u32,
    pub message_count: usize,
    pub updated_at: DateTime<Utc>,
}

impl SessionSummary {
    pub fn of(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            turn_state: session.turn_state,
            turn_count: session.turn_count,
            message_count: session.messages.len(),
            updated_at: session.updated_at,
        }
    }
}

/// SQLite-backed [`SessionStore`]. A save rewrites the session row and its
/// full message log in one transaction, so summarization splices persist as-is.
#[derive(Clone)]
pub struct SqliteSessionStore {
    db: Database,
}

impl SqliteSessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn load(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, turn_state, turn_count, todos, created_at, updated_at
                 FROM sessions WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            let Some(row) = rows.next()? else {
                return Ok(None);
            };

            let r = RowReader::new(row, "sessions");
            let id = SessionId::from_raw(r.get::<String>(0, "id")?);
            let turn_state = r.parsed(1, "turn_state")?;
            let turn_count = r.get(2, "turn_count")?;
            let todos: Vec<TodoItem> = r.json(3, "todos")?;
            let created_at = r.time(4, "created_at")?;
            let updated_at = r.time(5, "updated_at")?;

            let mut stmt = conn.prepare(
                "SELECT payload FROM messages WHERE session_id = ?1 ORDER BY position ASC",
            )?;
            let payloads = stmt
                .query_map([id.as_str()], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            let messages = payloads
                .iter()
                .map(|raw| json_column::<Message>(raw, "messages", "payload"))
                .collect::<Result<Vec<_>, _>>()?;

            Ok(Some(Session {
                id,
                messages,
                todos,
                turn_state,
                turn_count,
                created_at,
                updated_at,
            }))
        })
    }

    fn save(&self, session: &Session) -> Result<(), StoreError> {
        let todos = serde_json::to_string(&session.todos)?;
        let payloads = session
            .messages
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;

        self.db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO sessions (id, turn_state, turn_count, todos, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    turn_state = excluded.turn_state,
                    turn_count = excluded.turn_count,
                    todos = excluded.todos,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    session.id.as_str(),
                    session.turn_state.as_str(),
                    session.turn_count,
                    todos,
                    session.created_at.to_rfc3339(),
                    session.updated_at.to_rfc3339(),
                ],
            )?;
            tx.execute(
                "DELETE FROM messages WHERE session_id = ?1",
                [session.id.as_str()],
            )?;
            {
                let mut insert = tx.prepare(
                    "INSERT INTO messages (id, session_id, position, role, payload)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for (position, (message, payload)) in
                    session.messages.iter().zip(&payloads).enumerate()
                {
                    insert.execute(rusqlite::params![
                        message.id.as_str(),
                        session.id.as_str(),
                        position as i64,
                        role_name(&message.role),
                        payload,
                    ])?;
                }
            }
            Ok(())
        })?;

        debug!(session_id = %session.id, messages = session.messages.len(), "session saved");
        Ok(())
    }

    fn delete(&self, id: &SessionId) -> Result<(), StoreError> {
        self.db.with_tx(|tx| {
            tx.execute("DELETE FROM messages WHERE session_id = ?1", [id.as_str()])?;
            let removed = tx.execute("DELETE FROM sessions WHERE id = ?1", [id.as_str()])?;
            if removed == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            Ok(())
        })
    }

    fn list(&self) -> Result<Vec<SessionSummary>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT s.id, s.turn_state, s.turn_count, s.updated_at,
                        (SELECT COUNT(*) FROM messages m WHERE m.session_id = s.id)
                 FROM sessions s ORDER BY s.updated_at DESC",
            )?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let r = RowReader::new(row, "sessions");
                let message_count: i64 = r.get(4, "message_count")?;
                out.push(SessionSummary {
                    id: SessionId::from_raw(r.get::<String>(0, "id")?),
                    turn_state: r.parsed(1, "turn_state")?,
                    turn_count: r.get(2, "turn_count")?,
                    message_count: message_count.max(0) as usize,
                    updated_at: r.time(3, "updated_at")?,
                });
            }
            Ok(out)
        })
    }
}

fn role_name(role: &Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
        Role::ToolResult => "tool_result",
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    #[instrument(skip(self), fields(session_id = %id))]
    async fn load_session(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        self.load(id)
    }

    #[instrument(skip(self, session), fields(session_id = %session.id))]
    async fn save_session(&self, session: &Session) -> Result<(), StoreError> {
        self.save(session)
    }

    #[instrument(skip(self), fields(session_id = %id))]
    async fn delete_session(&self, id: &SessionId) -> Result<(), StoreError> {
        self.delete(id)
    }

    #[instrument(skip(self))]
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, StoreError> {
        self.list()
    }
}
