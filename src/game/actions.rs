//! Action Validation and Application
//!
//! The match state machine: every player action is validated against
//! the current `MatchState` and either rejected without mutation or
//! applied atomically, returning a report the network layer converts
//! to wire events. Reports carry resulting absolute values only.

use chrono::Utc;
use rand::Rng;

use crate::game::state::{MatchOutcome, MatchState, PlayerSlot, RoomStatus, WinReason};
use crate::game::words::{Tier, WordPool};

/// Rejection of a player action. Reported only to the initiating
/// connection; never broadcast, never mutates shared state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    /// Action attempted while the room is in the wrong status.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Action rejected by validation (wrong word, zero ammo, unknown
    /// card type, shield already active).
    #[error("invalid action: {0}")]
    InvalidAction(&'static str),
}

/// One player's lobby ready flag, for `player_ready_update`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyFlag {
    /// Display name.
    pub username: String,
    /// Ready state.
    pub ready: bool,
}

/// Result of a ready action.
#[derive(Debug, Clone)]
pub struct ReadyUpdate {
    /// Ready flags of all present players, in slot order.
    pub players: Vec<ReadyFlag>,
    /// Set when this ready action started the match.
    pub started: Option<MatchStart>,
}

/// Data produced by the `Lobby -> Playing` transition.
#[derive(Debug, Clone)]
pub struct MatchStart {
    /// The match's sampled word list (attack tiers, flat).
    pub words: Vec<&'static str>,
}

/// Result of an accepted attack.
#[derive(Debug, Clone)]
pub struct AttackReport {
    /// Who attacked.
    pub attacker: PlayerSlot,
    /// Who was hit.
    pub target: PlayerSlot,
    /// Tier of the attack card.
    pub tier: Tier,
    /// Whether a shield absorbed the hit entirely.
    pub blocked: bool,
    /// Damage constant of the tier (informational; zero HP was lost if
    /// `blocked`).
    pub damage: u32,
    /// The target's resulting HP (authoritative).
    pub target_hp: u32,
    /// The attacker's resulting ammo (authoritative).
    pub attacker_ammo: u32,
    /// Fresh target word assigned to the attacker for this tier.
    pub next_word: &'static str,
    /// Set when this attack ended the match.
    pub ended: Option<MatchOutcome>,
}

/// Result of an accepted shield action.
#[derive(Debug, Clone)]
pub struct ShieldReport {
    /// Who raised the shield.
    pub slot: PlayerSlot,
    /// The player's resulting ammo (authoritative).
    pub ammo: u32,
    /// Fresh shield-tier target word.
    pub next_word: &'static str,
    /// Set when spending the last round ended the match.
    pub ended: Option<MatchOutcome>,
}

/// Result of a `player_lose` claim.
#[derive(Debug, Clone)]
pub enum LossClaim {
    /// The claim ended the match now.
    Ended(MatchOutcome),
    /// The match was already over; re-deliver the stored result.
    AlreadyEnded,
}

impl MatchState {
    /// Mark a player ready. When both players are present and ready,
    /// the match starts: a fresh pool is sampled, both players reset
    /// to full values and each gets one target word per tier.
    pub fn mark_ready<R: Rng>(
        &mut self,
        user_id: &str,
        rng: &mut R,
    ) -> Result<ReadyUpdate, ActionError> {
        if self.status != RoomStatus::Lobby {
            return Err(ActionError::InvalidState("room is not in the lobby"));
        }
        let slot = self
            .slot_of(user_id)
            .ok_or(ActionError::InvalidAction("you are not a player in this room"))?;
        if let Some(player) = self.player_mut(slot) {
            player.ready = true;
        }

        let started = if self.is_full() && self.all_ready() {
            Some(self.begin_match(rng))
        } else {
            None
        };

        Ok(ReadyUpdate {
            players: self
                .players
                .iter()
                .map(|p| ReadyFlag {
                    username: p.username.clone(),
                    ready: p.ready,
                })
                .collect(),
            started,
        })
    }

    /// Transition `Lobby -> Playing`. Callers must have validated the
    /// preconditions (full room, everyone ready).
    fn begin_match<R: Rng>(&mut self, rng: &mut R) -> MatchStart {
        let pool = WordPool::sample(rng);
        for player in &mut self.players {
            let words = pool.draw_assignments(rng);
            player.reset_for_match(words);
        }
        let words = pool.words();
        self.pool = Some(pool);
        self.status = RoomStatus::Playing;
        self.started_at = Some(Utc::now());
        MatchStart { words }
    }

    /// Validate and apply an attack.
    ///
    /// The typed word must match the word most recently assigned to
    /// the sender for the card's tier, byte-for-byte. Case matters.
    pub fn submit_attack<R: Rng>(
        &mut self,
        user_id: &str,
        card_type: &str,
        typed_word: &str,
        rng: &mut R,
    ) -> Result<AttackReport, ActionError> {
        if self.status != RoomStatus::Playing {
            return Err(ActionError::InvalidState("match is not in progress"));
        }
        let slot = self
            .slot_of(user_id)
            .ok_or(ActionError::InvalidAction("you are not a player in this room"))?;
        let tier =
            Tier::parse_attack(card_type).ok_or(ActionError::InvalidAction("unknown card type"))?;

        let attacker = self
            .player(slot)
            .ok_or(ActionError::InvalidAction("you are not a player in this room"))?;
        if attacker.ammo == 0 {
            return Err(ActionError::InvalidAction("out of ammo"));
        }
        let assigned = attacker
            .words
            .as_ref()
            .map(|w| w.get(tier))
            .ok_or(ActionError::InvalidState("match is not in progress"))?;
        if typed_word != assigned {
            return Err(ActionError::InvalidAction(
                "typed word does not match your current word",
            ));
        }

        // Accepted: everything below mutates.
        let next_word = match &self.pool {
            Some(pool) => pool.draw(tier, rng),
            None => assigned,
        };
        let damage = tier.damage();

        let attacker_ammo = {
            let Some(attacker) = self.player_mut(slot) else {
                return Err(ActionError::InvalidAction("you are not a player in this room"));
            };
            let ammo = attacker.spend_ammo();
            if let Some(words) = attacker.words.as_mut() {
                words.set(tier, next_word);
            }
            ammo
        };

        let target_slot = slot.opponent();
        let (blocked, target_hp) = {
            let Some(target) = self.player_mut(target_slot) else {
                return Err(ActionError::InvalidState("match is not in progress"));
            };
            if target.shield_active {
                // Fully absorbed; the shield is consumed.
                target.shield_active = false;
                (true, target.hp)
            } else {
                (false, target.take_damage(damage))
            }
        };

        let ended = if target_hp == 0 {
            Some(self.finish(slot, WinReason::TowerDestroyed))
        } else if attacker_ammo == 0 {
            Some(self.finish(target_slot, WinReason::OutOfAmmo))
        } else {
            None
        };

        Ok(AttackReport {
            attacker: slot,
            target: target_slot,
            tier,
            blocked,
            damage,
            target_hp,
            attacker_ammo,
            next_word,
            ended,
        })
    }

    /// Validate and apply a shield action.
    pub fn submit_shield<R: Rng>(
        &mut self,
        user_id: &str,
        typed_word: &str,
        rng: &mut R,
    ) -> Result<ShieldReport, ActionError> {
        if self.status != RoomStatus::Playing {
            return Err(ActionError::InvalidState("match is not in progress"));
        }
        let slot = self
            .slot_of(user_id)
            .ok_or(ActionError::InvalidAction("you are not a player in this room"))?;

        let player = self
            .player(slot)
            .ok_or(ActionError::InvalidAction("you are not a player in this room"))?;
        if player.ammo == 0 {
            return Err(ActionError::InvalidAction("out of ammo"));
        }
        if player.shield_active {
            return Err(ActionError::InvalidAction("shield is already active"));
        }
        let assigned = player
            .words
            .as_ref()
            .map(|w| w.get(Tier::Shield))
            .ok_or(ActionError::InvalidState("match is not in progress"))?;
        if typed_word != assigned {
            return Err(ActionError::InvalidAction(
                "typed word does not match your current word",
            ));
        }

        let next_word = match &self.pool {
            Some(pool) => pool.draw(Tier::Shield, rng),
            None => assigned,
        };

        let ammo = {
            let Some(player) = self.player_mut(slot) else {
                return Err(ActionError::InvalidAction("you are not a player in this room"));
            };
            player.shield_active = true;
            if let Some(words) = player.words.as_mut() {
                words.set(Tier::Shield, next_word);
            }
            player.spend_ammo()
        };

        let ended = if ammo == 0 {
            Some(self.finish(slot.opponent(), WinReason::OutOfAmmo))
        } else {
            None
        };

        Ok(ShieldReport {
            slot,
            ammo,
            next_word,
            ended,
        })
    }

    /// Clear a shield on timer expiry. Idempotent: returns `false`
    /// when the shield was already consumed or the match is over.
    pub fn expire_shield(&mut self, slot: PlayerSlot) -> bool {
        if self.status != RoomStatus::Playing {
            return false;
        }
        match self.player_mut(slot) {
            Some(player) if player.shield_active => {
                player.shield_active = false;
                true
            }
            _ => false,
        }
    }

    /// Forfeit a playing match on behalf of `slot` (explicit leave or
    /// disconnect-grace expiry). No-op outside `Playing`.
    pub fn forfeit(&mut self, slot: PlayerSlot, reason: WinReason) -> Option<MatchOutcome> {
        if self.status != RoomStatus::Playing {
            return None;
        }
        Some(self.finish(slot.opponent(), reason))
    }

    /// Handle a client's loss claim (`player_lose`). The claim is
    /// truth-checked: a sender that is genuinely out of ammo loses
    /// "out of ammo"; anything else is treated as a forfeit.
    pub fn claim_loss(&mut self, user_id: &str) -> Result<LossClaim, ActionError> {
        let slot = self
            .slot_of(user_id)
            .ok_or(ActionError::InvalidAction("you are not a player in this room"))?;
        match self.status {
            RoomStatus::Lobby => Err(ActionError::InvalidState("match has not started")),
            RoomStatus::Finished => Ok(LossClaim::AlreadyEnded),
            RoomStatus::Playing => {
                let out_of_ammo = self.player(slot).map(|p| p.ammo == 0).unwrap_or(false);
                let reason = if out_of_ammo {
                    WinReason::OutOfAmmo
                } else {
                    WinReason::OpponentForfeited
                };
                Ok(LossClaim::Ended(self.finish(slot.opponent(), reason)))
            }
        }
    }

    /// Transition to `Finished` and record the outcome.
    fn finish(&mut self, winner: PlayerSlot, reason: WinReason) -> MatchOutcome {
        let outcome = MatchOutcome {
            winner,
            reason,
            ended_at: Utc::now(),
        };
        self.status = RoomStatus::Finished;
        self.outcome = Some(outcome.clone());
        outcome
    }
}
