//! Room Registry
//!
//! Maps shareable room codes to live rooms and owns room lifecycle:
//! creation with collision-checked codes, identity-based join (and its
//! reconnection idempotence), leave with mid-match forfeiture, and the
//! sweep that reclaims empty or finished-and-idle rooms.
//!
//! A room's outbound senders are transient routing handles refreshed
//! on every (re)bind; membership itself is the `userId` list inside
//! `MatchState`, which is what survives reconnection.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::game::state::{MatchOutcome, MatchState, PlayerSlot, RoomStatus, WinReason};
use crate::network::protocol::{self, PlayerSummary, ServerMessage};
use crate::network::session::Outbound;

/// Length of a room code.
pub const CODE_LENGTH: usize = 6;

/// Room-code alphabet. Uppercase, with easily confused characters
/// (`I`, `O`, `0`, `1`) left out.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Attempts before the code space is declared exhausted.
const MAX_CODE_ATTEMPTS: usize = 64;

/// Room lifecycle failures. Reported only to the initiating
/// connection; the display text is the client-facing message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No live room under that code.
    #[error("Room not found")]
    RoomNotFound,

    /// Both slots are taken and the joiner is not a member.
    #[error("Room is full")]
    RoomFull,

    /// The operation does not apply in the room's current status.
    #[error("{0}")]
    InvalidState(&'static str),

    /// Could not allocate a unique room code.
    #[error("No room codes available")]
    CapacityError,
}

/// How a join request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// A fresh player took a slot.
    Joined,
    /// The joiner was already a member; the join re-bound their
    /// connection (reconnection path).
    Rejoined,
}

/// Result of a join.
#[derive(Debug, Clone, Copy)]
pub struct JoinReport {
    /// Whether the join was fresh or a re-bind.
    pub kind: JoinKind,
    /// The joiner's slot.
    pub slot: PlayerSlot,
}

/// Result of a leave.
#[derive(Debug, Clone)]
pub enum LeaveReport {
    /// The leaver abandoned a running match; the stay-behind won.
    Forfeited(MatchOutcome),
    /// The leaver was removed from a lobby or finished room.
    Left {
        /// Whether the room is now empty (caller schedules deletion).
        now_empty: bool,
    },
}

// =============================================================================
// ROOM
// =============================================================================

/// One match's container.
#[derive(Debug)]
pub struct Room {
    /// Shareable room code.
    pub code: String,
    /// Server-generated match identifier.
    pub match_id: Uuid,
    /// Identity of the current host.
    pub host_user_id: String,
    /// The authoritative match state.
    pub state: MatchState,
    /// When the room was created.
    pub created_at: Instant,
    /// When the match finished, for linger-based cleanup.
    pub finished_at: Option<Instant>,
    /// Per-slot outbound channels (transient, refreshed on bind).
    senders: [Option<Outbound>; 2],
}

impl Room {
    fn new(code: String, host_user_id: &str) -> Self {
        Self {
            code,
            match_id: Uuid::new_v4(),
            host_user_id: host_user_id.to_string(),
            state: MatchState::new(),
            created_at: Instant::now(),
            finished_at: None,
            senders: [None, None],
        }
    }

    /// Attach a live outbound channel to a slot.
    pub fn bind_sender(&mut self, slot: PlayerSlot, sender: Outbound) {
        self.senders[slot.index()] = Some(sender);
    }

    /// Detach a slot's outbound channel on disconnect.
    pub fn clear_sender(&mut self, slot: PlayerSlot) {
        self.senders[slot.index()] = None;
    }

    /// Send to one slot. Sends never block or await; a dead receiver
    /// is ignored.
    pub fn send_to(&self, slot: PlayerSlot, message: ServerMessage) {
        if let Some(sender) = &self.senders[slot.index()] {
            let _ = sender.send(message);
        }
    }

    /// Send to the slot's opponent.
    pub fn send_opponent(&self, slot: PlayerSlot, message: ServerMessage) {
        self.send_to(slot.opponent(), message);
    }

    /// Send to every bound slot.
    pub fn broadcast(&self, message: ServerMessage) {
        for sender in self.senders.iter().flatten() {
            let _ = sender.send(message.clone());
        }
    }

    /// Record the finish instant for linger-based cleanup.
    pub fn mark_finished(&mut self) {
        if self.finished_at.is_none() {
            self.finished_at = Some(Instant::now());
        }
    }

    /// Drop a member, compacting slots and senders and transferring
    /// host if needed. Broadcasts the shrunk roster while the room is
    /// still a live lobby. Returns whether the room is now empty, or
    /// `None` for a non-member.
    pub fn remove_member(&mut self, user_id: &str) -> Option<bool> {
        let slot = self.state.slot_of(user_id)?;
        self.state.remove_player(user_id);
        self.senders[slot.index()] = None;
        if slot == PlayerSlot::Player1 {
            // The remaining player shifts into the host slot.
            self.senders[0] = self.senders[1].take();
        }
        if self.host_user_id == user_id {
            if let Some(player) = self.state.players.first() {
                self.host_user_id = player.user_id.clone();
            }
        }
        let now_empty = self.state.is_empty();
        if !now_empty && self.state.status == RoomStatus::Lobby {
            let roster = self.roster();
            self.broadcast(ServerMessage::RoomUpdate { players: roster });
        }
        Some(now_empty)
    }

    /// Current roster, in slot order.
    pub fn roster(&self) -> Vec<PlayerSummary> {
        self.state
            .players
            .iter()
            .map(|p| PlayerSummary {
                username: p.username.clone(),
            })
            .collect()
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// All live rooms, keyed by code.
pub struct RoomRegistry {
    rooms: RwLock<BTreeMap<String, Arc<RwLock<Room>>>>,
}

impl RoomRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create a room with the caller as host and sole player. Sends
    /// `room_created` and the initial roster to the host.
    pub async fn create_room(
        &self,
        host_user_id: &str,
        host_username: &str,
        sender: Outbound,
    ) -> Result<(String, Arc<RwLock<Room>>), RegistryError> {
        let mut rooms = self.rooms.write().await;

        let mut rng = rand::thread_rng();
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = generate_code(&mut rng);
            if rooms.contains_key(&code) {
                continue;
            }

            let mut room = Room::new(code.clone(), host_user_id);
            room.state.add_player(host_user_id, host_username);
            room.bind_sender(PlayerSlot::Player1, sender);
            room.send_to(
                PlayerSlot::Player1,
                ServerMessage::RoomCreated {
                    room_id: code.clone(),
                },
            );
            room.send_to(
                PlayerSlot::Player1,
                ServerMessage::RoomUpdate {
                    players: room.roster(),
                },
            );

            let room = Arc::new(RwLock::new(room));
            rooms.insert(code.clone(), room.clone());
            info!(room = %code, host = %host_username, "room created");
            return Ok((code, room));
        }

        Err(RegistryError::CapacityError)
    }

    /// Join a room by code, or re-bind a connection for a userId that
    /// is already a member (reconnection idempotence). Broadcasts the
    /// updated roster.
    pub async fn join_room(
        &self,
        code: &str,
        user_id: &str,
        username: &str,
        sender: Outbound,
    ) -> Result<(Arc<RwLock<Room>>, JoinReport), RegistryError> {
        let room = self.get(code).await.ok_or(RegistryError::RoomNotFound)?;
        let mut guard = room.write().await;

        if let Some(slot) = guard.state.slot_of(user_id) {
            // Already a member: a replayed join must succeed and only
            // refresh the connection.
            guard.bind_sender(slot, sender);
            if let Some(player) = guard.state.player_mut(slot) {
                player.connected = true;
            }
            let roster = guard.roster();
            guard.broadcast(ServerMessage::RoomUpdate { players: roster });
            debug!(room = %code, user = %username, "member re-joined");
            drop(guard);
            return Ok((
                room,
                JoinReport {
                    kind: JoinKind::Rejoined,
                    slot,
                },
            ));
        }

        if guard.state.status == RoomStatus::Finished {
            return Err(RegistryError::InvalidState("Match already finished"));
        }
        if guard.state.is_full() {
            return Err(RegistryError::RoomFull);
        }

        let slot = guard
            .state
            .add_player(user_id, username)
            .ok_or(RegistryError::RoomFull)?;
        guard.bind_sender(slot, sender);
        let roster = guard.roster();
        guard.broadcast(ServerMessage::RoomUpdate { players: roster });
        info!(room = %code, user = %username, "player joined");
        drop(guard);

        Ok((
            room,
            JoinReport {
                kind: JoinKind::Joined,
                slot,
            },
        ))
    }

    /// Remove a player for good. Mid-match this forfeits in favor of
    /// the stay-behind and broadcasts the result; in a lobby it
    /// shrinks the roster (transferring host if needed).
    pub async fn leave_room(
        &self,
        code: &str,
        user_id: &str,
    ) -> Result<(Arc<RwLock<Room>>, LeaveReport), RegistryError> {
        let room = self.get(code).await.ok_or(RegistryError::RoomNotFound)?;
        let mut guard = room.write().await;

        let slot = guard
            .state
            .slot_of(user_id)
            .ok_or(RegistryError::InvalidState("You are not in this room"))?;

        let report = match guard.state.status {
            RoomStatus::Playing => {
                // The stay-behind wins by forfeit. The leaver's stats
                // stay in place for the final scoreboard.
                let outcome = guard
                    .state
                    .forfeit(slot, WinReason::OpponentForfeited)
                    .ok_or(RegistryError::InvalidState("Match already finished"))?;
                guard.mark_finished();
                if let Some(player) = guard.state.player_mut(slot) {
                    player.connected = false;
                }
                guard.clear_sender(slot);
                let match_id = guard.match_id.to_string();
                if let Some(result) = protocol::match_result(&guard.state, &match_id) {
                    guard.broadcast(result);
                }
                info!(room = %code, user = %user_id, "player forfeited by leaving");
                LeaveReport::Forfeited(outcome)
            }
            RoomStatus::Lobby | RoomStatus::Finished => {
                let now_empty = guard.remove_member(user_id).unwrap_or(false);
                debug!(room = %code, user = %user_id, now_empty, "player left");
                LeaveReport::Left { now_empty }
            }
        };

        drop(guard);
        Ok((room, report))
    }

    /// Look up a room by code.
    pub async fn get(&self, code: &str) -> Option<Arc<RwLock<Room>>> {
        let rooms = self.rooms.read().await;
        rooms.get(code).cloned()
    }

    /// Delete a room.
    pub async fn remove(&self, code: &str) -> Option<Arc<RwLock<Room>>> {
        let mut rooms = self.rooms.write().await;
        rooms.remove(code)
    }

    /// Number of live rooms.
    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Whether no rooms are live.
    pub async fn is_empty(&self) -> bool {
        self.rooms.read().await.is_empty()
    }

    /// Reclaim rooms that are empty past `empty_grace` or finished
    /// past `linger`. Returns the deleted codes so the caller can
    /// release their timers and sessions.
    pub async fn sweep(&self, empty_grace: Duration, linger: Duration) -> Vec<String> {
        let candidates: Vec<Arc<RwLock<Room>>> = {
            let rooms = self.rooms.read().await;
            rooms.values().cloned().collect()
        };

        let mut expired = Vec::new();
        for room in candidates {
            let room = room.read().await;
            let idle_empty = room.state.is_empty() && room.created_at.elapsed() >= empty_grace;
            let lingered = room
                .finished_at
                .map(|at| at.elapsed() >= linger)
                .unwrap_or(false);
            if idle_empty || lingered {
                expired.push(room.code.clone());
            }
        }

        let mut rooms = self.rooms.write().await;
        let mut removed = Vec::new();
        for code in expired {
            if rooms.remove(&code).is_some() {
                info!(room = %code, "room swept");
                removed.push(code);
            }
        }
        removed
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_code<R: Rng>(rng: &mut R) -> String {
    (0..CODE_LENGTH)
        .map(|_| {
            let idx = rng.gen_range(0..CODE_ALPHABET.len());
            CODE_ALPHABET[idx] as char
        })
        .collect()
}
