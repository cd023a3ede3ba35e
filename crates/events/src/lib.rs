//! Real-time progress delivery.
//!
//! - [`RoomHub`]: transport-agnostic connection registry with per-project
//!   rooms. The WebSocket layer registers sockets here and drains their
//!   outbound channels.
//! - [`ProgressBroadcaster`]: turns segmentation status changes into wire
//!   events, emitting transitions immediately and coalescing repeated
//!   progress ticks through a bounded per-room throttle.
//! - [`messages`]: wire event names and payload shapes.

pub mod broadcaster;
pub mod messages;
pub mod rooms;
mod throttle;

pub use broadcaster::{BroadcastConfig, ProgressBroadcaster};
pub use messages::{OutboundMessage, ProgressUpdate, ServiceStatus};
pub use rooms::RoomHub;
