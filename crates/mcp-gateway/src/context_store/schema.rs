//! SQLite table layout. The `context` column holds the same bare JSON message
//! list that Redis stores under `context:<session_id>`.

pub const SCHEMA_SQL: &str = "
-- Session transcripts, one row per session
CREATE TABLE IF NOT EXISTS contexts (
    session_id TEXT PRIMARY KEY,
    context TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);
-- Expiry sweeps scan by timestamp
CREATE INDEX IF NOT EXISTS idx_contexts_timestamp ON contexts (timestamp);
";

/// Current wall clock in epoch seconds.
pub fn now_epoch_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}
