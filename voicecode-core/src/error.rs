//! Error kinds for the core (§7). Each variant maps to exactly one wire-level
//! surfacing rule; the mapping lives at the dispatch boundary, not here.
//!
//! Busy, auth-failure, agent-failure, and orchestration-failure are all
//! surfaced as their own typed `ServerMessage` variants (`SessionLocked`,
//! `AuthError`, `Error`, `RecipeExited`) straight from the call site that
//! detects them, so they never round-trip through this enum.

pub type Result<T> = std::result::Result<T, CoreErr>;

#[derive(thiserror::Error, Debug)]
pub enum CoreErr {
    /// Malformed JSON, a missing required field, or mutually-exclusive
    /// fields both set. Surfaced as `error {message}` without closing the
    /// channel (§7 ProtocolError).
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Notify(#[from] notify::Error),
}
