use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::info;

use super::ContextStore;
use crate::error::{GatewayError, GatewayResult};
use crate::memory::{Message, Transcript};

const KEY_PREFIX: &str = "context:";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// External cache store. Expiry is the server's job: every write sets the
/// key's TTL and every read re-arms it.
pub struct RedisContextStore {
    connection: ConnectionManager,
    ttl_seconds: u64,
}

fn session_key(session_id: &str) -> String {
    format!("{}{}", KEY_PREFIX, session_id)
}

/// Same JSON list of `{role, content}` the SQLite medium keeps in its `context` column.
fn encode(transcript: &[Message]) -> GatewayResult<String> {
    serde_json::to_string(transcript).map_err(GatewayError::storage)
}

fn decode(session_id: &str, raw: &str) -> GatewayResult<Transcript> {
    serde_json::from_str::<Transcript>(raw)
        .map_err(|e| GatewayError::storage(format!("corrupt context for session {}: {}", session_id, e)))
}

/// `SET key payload EX ttl`: write and expiry in one command.
fn write_cmd(key: &str, payload: String, ttl_seconds: u64) -> redis::Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(payload).arg("EX").arg(ttl_seconds);
    cmd
}

/// `GET` plus `EXPIRE` in one transaction, so a read re-arms the TTL.
fn read_and_refresh(key: &str, ttl_seconds: u64) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("GET")
        .arg(key)
        .cmd("EXPIRE")
        .arg(key)
        .arg(ttl_seconds);
    pipe
}

impl RedisContextStore {
    pub async fn connect(url: &str, ttl: Duration) -> GatewayResult<Self> {
        info!("Connecting context store to Redis at {}", url);
        let client = redis::Client::open(url)?;
        let connection = tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| GatewayError::storage(format!("timed out connecting to {}", url)))??;

        Ok(Self {
            connection,
            ttl_seconds: ttl.as_secs().max(1),
        })
    }
}

#[async_trait]
impl ContextStore for RedisContextStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, session_id: &str) -> GatewayResult<Option<Transcript>> {
        let key = session_key(session_id);
        let mut conn = self.connection.clone();

        let (raw, _armed): (Option<String>, i64) = read_and_refresh(&key, self.ttl_seconds)
            .query_async(&mut conn)
            .await?;

        raw.map(|raw| decode(session_id, &raw)).transpose()
    }

    async fn put(&self, session_id: &str, transcript: &[Message]) -> GatewayResult<()> {
        let payload = encode(transcript)?;
        let mut conn = self.connection.clone();

        write_cmd(&session_key(session_id), payload, self.ttl_seconds)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> GatewayResult<bool> {
        let mut conn = self.connection.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(session_key(session_id))
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    /// Keys carry their own TTL, so there is nothing to sweep.
    async fn sweep_expired(&self) -> GatewayResult<usize> {
        Ok(0)
    }
}
