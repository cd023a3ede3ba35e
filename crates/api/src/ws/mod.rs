//! WebSocket transport for progress events.
//!
//! Connections are registered with the [`RoomHub`](spheroseg_events::RoomHub),
//! which owns room membership; this module only moves frames between sockets
//! and hub channels.

mod handler;
mod heartbeat;

pub use handler::{ws_handler, WsParams};
pub use heartbeat::start_heartbeat;
