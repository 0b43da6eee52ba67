//! Business logic for the voicecode daemon: connection state, session
//! indexing and replication, per-session locking, agent invocation and the
//! recipe orchestrator. The binary crate (`voicecode-server`) wires these
//! together over a TCP listener; everything here is transport-agnostic.

pub mod agent_invoker;
pub mod auth;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod lock_table;
pub mod pairing;
pub mod project_commands;
pub mod recipe;
pub mod resources;
pub mod session_index;
pub mod watcher;
pub mod workstream;

pub use config::Config;
pub use config::ConfigOverrides;
pub use error::CoreErr;
pub use error::Result;
