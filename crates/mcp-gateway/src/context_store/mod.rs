//! Context store - session transcripts with TTL-based expiry
//!
//! One [`ContextStore`] interface, three interchangeable media:
//! - [`VolatileContextStore`]: in-process map, lazily swept
//! - [`RedisContextStore`]: external cache, expiry delegated to the server
//! - [`SqliteContextStore`]: embedded relational table, swept by timestamp
//!
//! The medium is chosen once at construction; callers only see the trait.
pub mod schema;
pub mod volatile;
pub mod redis_store;
pub mod sqlite_store;
pub mod session_lock;
pub use volatile::VolatileContextStore;
pub use redis_store::RedisContextStore;
pub use sqlite_store::SqliteContextStore;
pub use session_lock::{SessionGuard, SessionLocks};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::config::{Config, StorageKind};
use crate::error::GatewayResult;
use crate::memory::{Message, Transcript};

#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Short medium name for logs (`memory`, `redis`, `sqlite`).
    fn name(&self) -> &'static str;

    /// Transcript for `session_id`, refreshing its last access. Expired
    /// sessions are swept before the lookup.
    async fn get(&self, session_id: &str) -> GatewayResult<Option<Transcript>>;

    /// Creates or wholesale replaces the transcript and refreshes last access.
    async fn put(&self, session_id: &str, transcript: &[Message]) -> GatewayResult<()>;

    /// Whether a session existed and was removed.
    async fn delete(&self, session_id: &str) -> GatewayResult<bool>;

    /// Drops every session idle for longer than the TTL; returns how many.
    async fn sweep_expired(&self) -> GatewayResult<usize>;
}

/// Builds the store selected by `CONTEXT_STORAGE`.
pub async fn build_context_store(config: &Config) -> GatewayResult<Arc<dyn ContextStore>> {
    let ttl = config.context_ttl();
    let store: Arc<dyn ContextStore> = match config.storage {
        StorageKind::Volatile => Arc::new(VolatileContextStore::new(ttl)),
        StorageKind::ExternalCache => Arc::new(RedisContextStore::connect(&config.redis_url, ttl).await?),
        StorageKind::EmbeddedRelational => Arc::new(SqliteContextStore::open(&config.sqlite_path, ttl)?),
    };
    info!("Context store '{}' ready (ttl {}s)", store.name(), ttl.as_secs());
    Ok(store)
}
