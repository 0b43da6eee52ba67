//! Wire format shared between the daemon and its clients: the framed
//! message envelope, the snake_case/internal key conversion, and the
//! session/resource payload types that appear inside it.

pub mod commands;
pub mod messages;
pub mod session;
pub mod wire;

pub use messages::ClientMessage;
pub use messages::ServerMessage;
pub use session::MessageRecord;
pub use session::SessionSummary;
