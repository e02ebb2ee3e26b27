//! Session memory
//!
//! Append-only per-session conversation log. Reads return entries oldest to
//! newest; `recent` is the bounded tail used to render context.

use crate::models::MemoryEntry;
use crate::Result;
use uuid::Uuid;

pub mod context_manager;
pub mod postgres;
pub mod store;

pub use context_manager::ContextManager;
pub use postgres::PgMemoryStore;
pub use store::InMemoryMemoryStore;

#[async_trait::async_trait]
pub trait MemoryStore: Send + Sync {
    async fn append(&self, entry: MemoryEntry) -> Result<()>;

    /// The `limit` most recent entries, oldest first.
    async fn recent(&self, session_id: Uuid, limit: usize) -> Result<Vec<MemoryEntry>>;

    /// Every entry for the session in timestamp order.
    async fn list(&self, session_id: Uuid) -> Result<Vec<MemoryEntry>>;
}
