pub mod database;
pub mod error;
pub mod memory;
pub mod row_helpers;
pub mod schema;
pub mod sessions;

use async_trait::async_trait;

use tandem_core::ids::SessionId;
use tandem_core::session::Session;

pub use database::Database;
pub use error::StoreError;
pub use memory::MemorySessionStore;
pub use sessions::{SessionSummary, SqliteSessionStore};

/// Durable home of session logs. Called by the engine at turn boundaries.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_session(&self, id: &SessionId) -> Result<Option<Session>, StoreError>;
    async fn save_session(&self, session: &Session) -> Result<(), StoreError>;
    async fn delete_session(&self, id: &SessionId) -> Result<(), StoreError>;
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, StoreError>;
}
