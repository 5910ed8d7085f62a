//! Match State Definitions
//!
//! Room status, per-player battle stats and the terminal outcome.
//! Mutation goes through `game::actions`; this module only provides
//! invariant-preserving primitives (hp and ammo are saturating and can
//! never leave their `0..=max` ranges).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::game::words::{WordAssignments, WordPool};

/// Full health of a tower.
pub const MAX_HP: u32 = 100;

/// Full ammunition of a player.
pub const MAX_AMMO: u32 = 50;

/// Players per room.
pub const ROOM_CAPACITY: usize = 2;

// =============================================================================
// SLOTS AND STATUS
// =============================================================================

/// Opaque in-match player identifier.
///
/// Slot order is join order: the host is always `Player1`. The slot
/// name doubles as the wire identifier (`player1` / `player2`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerSlot {
    /// First slot (host).
    Player1,
    /// Second slot (guest).
    Player2,
}

impl PlayerSlot {
    /// The other slot.
    pub fn opponent(self) -> PlayerSlot {
        match self {
            PlayerSlot::Player1 => PlayerSlot::Player2,
            PlayerSlot::Player2 => PlayerSlot::Player1,
        }
    }

    /// Wire name of the slot.
    pub fn as_str(self) -> &'static str {
        match self {
            PlayerSlot::Player1 => "player1",
            PlayerSlot::Player2 => "player2",
        }
    }

    /// Index into the room's player list.
    pub fn index(self) -> usize {
        match self {
            PlayerSlot::Player1 => 0,
            PlayerSlot::Player2 => 1,
        }
    }

    /// Slot for a player-list index.
    pub fn from_index(index: usize) -> Option<PlayerSlot> {
        match index {
            0 => Some(PlayerSlot::Player1),
            1 => Some(PlayerSlot::Player2),
            _ => None,
        }
    }
}

/// Room lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    /// Waiting for players to join and ready up.
    Lobby,
    /// Match in progress.
    Playing,
    /// Match over. Terminal: no further mutating actions.
    Finished,
}

impl RoomStatus {
    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            RoomStatus::Lobby => "lobby",
            RoomStatus::Playing => "playing",
            RoomStatus::Finished => "finished",
        }
    }
}

/// Why the match ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WinReason {
    /// The loser's HP reached zero.
    #[serde(rename = "tower destroyed")]
    TowerDestroyed,
    /// The loser ran out of ammo with the winner still standing.
    #[serde(rename = "out of ammo")]
    OutOfAmmo,
    /// The loser left, or never returned within the grace window.
    #[serde(rename = "opponent forfeited")]
    OpponentForfeited,
}

impl WinReason {
    /// Wire text of the reason.
    pub fn as_str(self) -> &'static str {
        match self {
            WinReason::TowerDestroyed => "tower destroyed",
            WinReason::OutOfAmmo => "out of ammo",
            WinReason::OpponentForfeited => "opponent forfeited",
        }
    }
}

/// Terminal result of a match.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchOutcome {
    /// Winning slot.
    pub winner: PlayerSlot,
    /// Why the match ended.
    pub reason: WinReason,
    /// When the match ended.
    pub ended_at: DateTime<Utc>,
}

// =============================================================================
// PLAYER STATE
// =============================================================================

/// Authoritative battle stats of one player in one room.
#[derive(Clone, Debug)]
pub struct PlayerState {
    /// Stable client-generated identity.
    pub user_id: String,
    /// Display name.
    pub username: String,
    /// Current health, `0..=MAX_HP`.
    pub hp: u32,
    /// Current ammunition, `0..=MAX_AMMO`.
    pub ammo: u32,
    /// Whether a shield is raised. Cleared by absorbing exactly one
    /// attack or by timer expiry, whichever happens first.
    pub shield_active: bool,
    /// Whether a live connection is currently bound to this player.
    pub connected: bool,
    /// Lobby ready flag.
    pub ready: bool,
    /// Current target word per tier. `None` until the match starts.
    pub words: Option<WordAssignments>,
}

impl PlayerState {
    /// Create a player at full initial values.
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            hp: MAX_HP,
            ammo: MAX_AMMO,
            shield_active: false,
            connected: true,
            ready: false,
            words: None,
        }
    }

    /// Reset to full battle values at match start.
    pub fn reset_for_match(&mut self, words: WordAssignments) {
        self.hp = MAX_HP;
        self.ammo = MAX_AMMO;
        self.shield_active = false;
        self.words = Some(words);
    }

    /// Apply damage, returning the resulting HP. Saturates at zero.
    pub fn take_damage(&mut self, damage: u32) -> u32 {
        self.hp = self.hp.saturating_sub(damage);
        self.hp
    }

    /// Spend one round of ammo, returning the remainder. Saturates at
    /// zero.
    pub fn spend_ammo(&mut self) -> u32 {
        self.ammo = self.ammo.saturating_sub(1);
        self.ammo
    }
}

// =============================================================================
// MATCH STATE
// =============================================================================

/// The authoritative state of one room's match.
///
/// Membership is identity-based: players are looked up by `user_id`,
/// never by a transport handle, so state survives reconnection.
#[derive(Clone, Debug)]
pub struct MatchState {
    /// Lifecycle status.
    pub status: RoomStatus,
    /// Players in slot order (index 0 = `Player1` = host).
    pub players: Vec<PlayerState>,
    /// The match's sampled word pool. `None` until the match starts.
    pub pool: Option<WordPool>,
    /// When the match started.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal result, kept for late delivery.
    pub outcome: Option<MatchOutcome>,
}

impl MatchState {
    /// Create an empty lobby.
    pub fn new() -> Self {
        Self {
            status: RoomStatus::Lobby,
            players: Vec::with_capacity(ROOM_CAPACITY),
            pool: None,
            started_at: None,
            outcome: None,
        }
    }

    /// Add a player. Returns the assigned slot, or `None` if the room
    /// is already full.
    pub fn add_player(&mut self, user_id: &str, username: &str) -> Option<PlayerSlot> {
        if self.players.len() >= ROOM_CAPACITY {
            return None;
        }
        self.players.push(PlayerState::new(user_id, username));
        PlayerSlot::from_index(self.players.len() - 1)
    }

    /// Remove a player by identity, returning their state.
    pub fn remove_player(&mut self, user_id: &str) -> Option<PlayerState> {
        let idx = self.players.iter().position(|p| p.user_id == user_id)?;
        Some(self.players.remove(idx))
    }

    /// Slot of a player by identity.
    pub fn slot_of(&self, user_id: &str) -> Option<PlayerSlot> {
        self.players
            .iter()
            .position(|p| p.user_id == user_id)
            .and_then(PlayerSlot::from_index)
    }

    /// Player in a slot.
    pub fn player(&self, slot: PlayerSlot) -> Option<&PlayerState> {
        self.players.get(slot.index())
    }

    /// Mutable player in a slot.
    pub fn player_mut(&mut self, slot: PlayerSlot) -> Option<&mut PlayerState> {
        self.players.get_mut(slot.index())
    }

    /// Whether both slots are taken.
    pub fn is_full(&self) -> bool {
        self.players.len() == ROOM_CAPACITY
    }

    /// Whether the room has no players left.
    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Whether every present player has readied up.
    pub fn all_ready(&self) -> bool {
        !self.players.is_empty() && self.players.iter().all(|p| p.ready)
    }
}

impl Default for MatchState {
    fn default() -> Self {
        Self::new()
    }
}
