//! Game Logic Module
//!
//! Match state and the rules that mutate it. Transport-agnostic:
//! everything here operates on plain data and returns reports that the
//! network layer converts to wire events.
//!
//! ## Module Structure
//!
//! - `words`: tiered word pool and per-match sampling
//! - `state`: room status, player battle state, match outcome
//! - `actions`: validation and application of player actions

pub mod actions;
pub mod state;
pub mod words;

// Re-export key types
pub use actions::{ActionError, AttackReport, LossClaim, ReadyUpdate, ShieldReport};
pub use state::{MatchOutcome, MatchState, PlayerSlot, PlayerState, RoomStatus, WinReason};
pub use words::{Tier, WordAssignments, WordPool};
