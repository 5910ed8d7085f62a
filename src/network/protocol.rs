//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Messages are JSON with an `event` discriminator and camelCase
//! payload fields, matching the client contract exactly. Every
//! mutating broadcast carries resulting absolute values, never deltas.

use serde::{Deserialize, Serialize};

use crate::game::state::{MatchState, PlayerSlot, RoomStatus, WinReason};
use crate::game::words::{Tier, WordAssignments};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Create a room and become its host.
    #[serde(rename_all = "camelCase")]
    CreateRoom {
        /// Display name.
        username: String,
        /// Client-persisted stable identity.
        user_id: String,
    },

    /// Join an existing room by its code.
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        /// Room code to join.
        room_id: String,
        /// Display name.
        username: String,
        /// Client-persisted stable identity.
        user_id: String,
    },

    /// Reconnect to a room after a transport drop or page reload.
    #[serde(rename_all = "camelCase")]
    RejoinRoom {
        /// Room code to rejoin.
        room_id: String,
        /// Display name.
        username: String,
        /// Client-persisted stable identity.
        user_id: String,
        /// The client's last known game status (informational).
        #[serde(default)]
        game_status: Option<String>,
    },

    /// Ready up in the lobby.
    #[serde(rename_all = "camelCase")]
    PlayerReady {
        /// Room code.
        room_id: String,
    },

    /// Submit an attack with a typed word.
    #[serde(rename_all = "camelCase")]
    SendAttack {
        /// Room code.
        room_id: String,
        /// Card tier: `easy`, `medium` or `hard`.
        attack_type: String,
        /// The word the player typed.
        typed_word: String,
    },

    /// Raise a shield with a typed word.
    #[serde(rename_all = "camelCase")]
    ActivateShield {
        /// Room code.
        room_id: String,
        /// The word the player typed.
        typed_word: String,
    },

    /// Claim a loss (the client believes it is out of ammo).
    #[serde(rename_all = "camelCase")]
    PlayerLose {
        /// Room code.
        room_id: String,
    },

    /// Leave the room for good.
    #[serde(rename_all = "camelCase")]
    LeaveRoom {
        /// Room code.
        room_id: String,
    },
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Room created; the sender is its host.
    #[serde(rename_all = "camelCase")]
    RoomCreated {
        /// The shareable room code.
        room_id: String,
    },

    /// Current room roster.
    RoomUpdate {
        /// Players in slot order.
        players: Vec<PlayerSummary>,
    },

    /// A create/join request failed.
    JoinRoomError {
        /// Human-readable reason.
        message: String,
    },

    /// Lobby ready flags changed.
    PlayerReadyUpdate {
        /// Ready flags in slot order.
        players: Vec<ReadySummary>,
    },

    /// The match started. Sent per player: `your_player_id` and the
    /// word assignments inside `game_state` are recipient-specific.
    #[serde(rename_all = "camelCase")]
    GameStart {
        /// The match's shared word list.
        words: Vec<String>,
        /// The recipient's opaque in-match identifier.
        your_player_id: PlayerSlot,
        /// Authoritative room snapshot.
        game_state: GameStateView,
    },

    /// The recipient was hit (or their shield absorbed a hit).
    #[serde(rename_all = "camelCase")]
    ReceiveAttack {
        /// Present and `true` when a shield absorbed the hit.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        blocked: Option<bool>,
        /// The recipient's resulting HP (authoritative).
        target_hp: u32,
    },

    /// An attack was accepted; fired to the whole room for effects.
    AttackLaunched {
        /// Attacking slot.
        from: PlayerSlot,
    },

    /// Authoritative HP of the hit player, fired to the whole room so
    /// the attacker's enemy display needs no local arithmetic.
    #[serde(rename_all = "camelCase")]
    AttackImpact {
        /// The slot that was hit.
        target_player_id: PlayerSlot,
        /// That slot's resulting HP.
        target_hp: u32,
    },

    /// The opponent raised a shield.
    EnemyShieldActive,

    /// The sender's shield action was accepted.
    ShieldActivated,

    /// Fresh target word for one tier, sent only to its owner after an
    /// accepted action of that tier.
    WordAssignment {
        /// The rotated tier.
        tier: Tier,
        /// The new target word.
        word: String,
    },

    /// Terminal match result.
    #[serde(rename_all = "camelCase")]
    MatchResult {
        /// Winning slot.
        winner: PlayerSlot,
        /// Why the match ended.
        reason: WinReason,
        /// Final stats of both slots.
        final_state: FinalState,
        /// Server-generated match identifier.
        match_id: String,
    },

    /// A player is gone for good (grace window expired).
    PlayerDisconnected {
        /// Human-readable notice.
        message: String,
    },

    /// The opponent's transport dropped; they may still return.
    PlayerTemporarilyDisconnected,

    /// The opponent returned within the grace window.
    PlayerReconnected,

    /// Reconnection accepted: full authoritative snapshot.
    #[serde(rename_all = "camelCase")]
    RejoinSuccess {
        /// Room code.
        room_id: String,
        /// The recipient's slot.
        player_id: PlayerSlot,
        /// Authoritative room snapshot.
        game_state: GameStateView,
        /// The recipient's own battle state.
        player_state: PlayerStateView,
        /// The opponent's visible state, if an opponent is present.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        enemy_state: Option<EnemyStateView>,
    },

    /// Reconnection rejected; the client falls back to the lobby.
    RejoinFailed {
        /// Human-readable reason.
        message: String,
    },

    /// An action was rejected. Sent only to the initiating connection.
    InvalidAction {
        /// Human-readable reason.
        message: String,
    },
}

// =============================================================================
// PAYLOAD VIEWS
// =============================================================================

/// Roster entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerSummary {
    /// Display name.
    pub username: String,
}

/// Roster entry with ready flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadySummary {
    /// Display name.
    pub username: String,
    /// Lobby ready flag.
    pub ready: bool,
}

/// Authoritative room snapshot carried by `game_start` and
/// `rejoin_success`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStateView {
    /// Room code.
    pub room_id: String,
    /// Lifecycle status.
    pub status: RoomStatus,
    /// Players in slot order.
    pub players: Vec<PlayerSummary>,
    /// Recipient's current target words, when recipient-specific.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignments: Option<AssignmentView>,
}

/// One player's target words, per tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentView {
    /// Easy-tier target.
    pub easy: String,
    /// Medium-tier target.
    pub medium: String,
    /// Hard-tier target.
    pub hard: String,
    /// Shield-tier target.
    pub shield: String,
}

impl From<&WordAssignments> for AssignmentView {
    fn from(words: &WordAssignments) -> Self {
        Self {
            easy: words.easy.to_string(),
            medium: words.medium.to_string(),
            hard: words.hard.to_string(),
            shield: words.shield.to_string(),
        }
    }
}

/// Shield flag wrapper, matching the client's `shield.active` shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShieldView {
    /// Whether the shield is raised.
    pub active: bool,
}

/// The recipient's own state in `rejoin_success`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerStateView {
    /// Current HP.
    pub hp: u32,
    /// Current ammo.
    pub ammo: u32,
    /// Shield state.
    pub shield: ShieldView,
    /// Current target words, when the match is running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignments: Option<AssignmentView>,
}

/// The opponent's visible state in `rejoin_success`. Ammo and target
/// words are withheld.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnemyStateView {
    /// Display name.
    pub username: String,
    /// Current HP.
    pub hp: u32,
    /// Shield state.
    pub shield: ShieldView,
}

/// Final stats of both slots in `match_result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalState {
    /// Host slot stats.
    pub player1: FinalPlayer,
    /// Guest slot stats.
    pub player2: FinalPlayer,
}

/// One slot's final stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalPlayer {
    /// Display name.
    pub username: String,
    /// Final HP.
    pub hp: u32,
    /// Final ammo.
    pub ammo: u32,
}

// =============================================================================
// SNAPSHOT BUILDERS
// =============================================================================

/// Room snapshot, optionally carrying one slot's word assignments.
pub fn game_state_view(state: &MatchState, room_id: &str, for_slot: Option<PlayerSlot>) -> GameStateView {
    let assignments = for_slot
        .and_then(|slot| state.player(slot))
        .and_then(|p| p.words.as_ref())
        .map(AssignmentView::from);
    GameStateView {
        room_id: room_id.to_string(),
        status: state.status,
        players: state
            .players
            .iter()
            .map(|p| PlayerSummary {
                username: p.username.clone(),
            })
            .collect(),
        assignments,
    }
}

/// The `rejoin_success` snapshot for one slot.
pub fn rejoin_snapshot(state: &MatchState, room_id: &str, slot: PlayerSlot) -> Option<ServerMessage> {
    let me = state.player(slot)?;
    let enemy = state.player(slot.opponent());
    Some(ServerMessage::RejoinSuccess {
        room_id: room_id.to_string(),
        player_id: slot,
        game_state: game_state_view(state, room_id, None),
        player_state: PlayerStateView {
            hp: me.hp,
            ammo: me.ammo,
            shield: ShieldView {
                active: me.shield_active,
            },
            assignments: me.words.as_ref().map(AssignmentView::from),
        },
        enemy_state: enemy.map(|e| EnemyStateView {
            username: e.username.clone(),
            hp: e.hp,
            shield: ShieldView {
                active: e.shield_active,
            },
        }),
    })
}

/// The `match_result` broadcast for a finished room.
pub fn match_result(state: &MatchState, match_id: &str) -> Option<ServerMessage> {
    let outcome = state.outcome.as_ref()?;
    let final_player = |slot: PlayerSlot| {
        state
            .player(slot)
            .map(|p| FinalPlayer {
                username: p.username.clone(),
                hp: p.hp,
                ammo: p.ammo,
            })
            .unwrap_or_else(|| FinalPlayer {
                username: String::new(),
                hp: 0,
                ammo: 0,
            })
    };
    Some(ServerMessage::MatchResult {
        winner: outcome.winner,
        reason: outcome.reason,
        final_state: FinalState {
            player1: final_player(PlayerSlot::Player1),
            player2: final_player(PlayerSlot::Player2),
        },
        match_id: match_id.to_string(),
    })
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
