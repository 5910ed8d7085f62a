//! Network Layer
//!
//! WebSocket gateway, room and session lifecycle, timers and the wire
//! protocol. All game rules live in `game/`; this layer only routes,
//! schedules and serializes.

pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod timers;

pub use protocol::{ClientMessage, ServerMessage};
pub use registry::{RegistryError, Room, RoomRegistry};
pub use server::{GameServer, GatewayError, ServerConfig};
pub use session::{Session, SessionError, SessionMap};
pub use timers::{TimerKind, TimerTable};
