//! # Type Royale Match Server
//!
//! Authoritative coordination core for two-player typing battles.
//! The server owns HP, ammo, shields and win conditions; clients are
//! untrusted event sources that may lag, disconnect and reconnect.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  TYPE ROYALE SERVER                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  game/           - Match logic (transport-agnostic)          │
//! │  ├── words.rs    - Tiered word pool                          │
//! │  ├── state.rs    - Room and player battle state              │
//! │  └── actions.rs  - Action validation and application         │
//! │                                                              │
//! │  network/        - Networking and lifecycle                  │
//! │  ├── protocol.rs - Wire message types                        │
//! │  ├── registry.rs - Room registry and lifecycle               │
//! │  ├── session.rs  - Stable identity across reconnects         │
//! │  ├── timers.rs   - Cancellable scheduled transitions         │
//! │  └── server.rs   - WebSocket connection gateway              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Authority Guarantee
//!
//! Every mutating broadcast carries the resulting **absolute** value
//! (never a delta): clients apply optimistic local updates and must be
//! overridden by server truth. All mutations to a given room are
//! serialized under that room's lock, and broadcasts are emitted in
//! acceptance order. Rooms are fully independent of each other.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod game;
pub mod network;

// Re-export commonly used types
pub use game::state::{MatchState, PlayerState, PlayerSlot, RoomStatus, WinReason};
pub use game::words::{Tier, WordPool};
pub use network::protocol::{ClientMessage, ServerMessage};
pub use network::registry::RoomRegistry;
pub use network::server::{GameServer, ServerConfig};
pub use network::session::SessionMap;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
