//! Tiered Word Pool
//!
//! Static word table partitioned by difficulty. Tier is derived from
//! word length: <=4 easy, 5-7 medium, >=8 hard. Words of <=6 characters
//! are additionally eligible for the shield tier. Each match samples a
//! fresh working set so two rooms never share the same words.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Words drawn per tier when sampling a match pool.
const EASY_PER_MATCH: usize = 8;
const MEDIUM_PER_MATCH: usize = 8;
const HARD_PER_MATCH: usize = 6;

/// Maximum word length for shield eligibility.
const SHIELD_MAX_LEN: usize = 6;

/// The static word table. All ASCII, lowercase.
pub const WORDS: &[&str] = &[
    // <=4 characters: easy
    "fire", "mage", "orb", "ice", "rune", "wand", "hex", "bolt", "mist", "fang",
    "ash", "gale", "imp", "dust", "vex", "zap",
    // 5-7 characters: medium
    "magic", "spell", "ember", "frost", "storm", "raven", "golem", "sigil",
    "charm", "curse", "wizard", "dragon", "wraith", "arcane", "potion",
    "scroll", "shadow", "phoenix", "crystal", "tempest", "warlock", "griffin",
    // >=8 characters: hard
    "fireball", "sorcerer", "obsidian", "talisman", "elemental", "maelstrom",
    "leviathan", "summoning", "pyromancer", "apparition", "incantation",
    "necromancer", "enchantment", "thunderclap", "catastrophe",
    "conflagration", "metamorphosis",
];

/// Word difficulty tier.
///
/// Attack cards map to `Easy`/`Medium`/`Hard`; `Shield` is the
/// defensive tier fed by short words.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Words of up to 4 characters. Damage 10.
    Easy,
    /// Words of 5-7 characters. Damage 35.
    Medium,
    /// Words of 8+ characters. Damage 80.
    Hard,
    /// Words of up to 6 characters, used to raise a shield.
    Shield,
}

impl Tier {
    /// Damage dealt by an accepted attack of this tier.
    pub fn damage(self) -> u32 {
        match self {
            Tier::Easy => 10,
            Tier::Medium => 35,
            Tier::Hard => 80,
            Tier::Shield => 0,
        }
    }

    /// Parse a client-supplied attack card type. `shield` is not a
    /// valid attack and parses to `None`.
    pub fn parse_attack(s: &str) -> Option<Tier> {
        match s {
            "easy" => Some(Tier::Easy),
            "medium" => Some(Tier::Medium),
            "hard" => Some(Tier::Hard),
            _ => None,
        }
    }

    /// Wire name of the tier.
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Easy => "easy",
            Tier::Medium => "medium",
            Tier::Hard => "hard",
            Tier::Shield => "shield",
        }
    }
}

/// Attack tier of a word, derived from its length.
pub fn tier_of(word: &str) -> Tier {
    match word.len() {
        0..=4 => Tier::Easy,
        5..=7 => Tier::Medium,
        _ => Tier::Hard,
    }
}

/// Whether a word may also serve in the shield tier.
pub fn shield_eligible(word: &str) -> bool {
    word.len() <= SHIELD_MAX_LEN
}

/// One player's current target word per tier.
///
/// Validation always compares against the most recently assigned word
/// for the tier of the attempted action, byte-for-byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WordAssignments {
    /// Current easy-tier target.
    pub easy: &'static str,
    /// Current medium-tier target.
    pub medium: &'static str,
    /// Current hard-tier target.
    pub hard: &'static str,
    /// Current shield-tier target.
    pub shield: &'static str,
}

impl WordAssignments {
    /// Target word for a tier.
    pub fn get(&self, tier: Tier) -> &'static str {
        match tier {
            Tier::Easy => self.easy,
            Tier::Medium => self.medium,
            Tier::Hard => self.hard,
            Tier::Shield => self.shield,
        }
    }

    /// Replace the target word for a tier.
    pub fn set(&mut self, tier: Tier, word: &'static str) {
        match tier {
            Tier::Easy => self.easy = word,
            Tier::Medium => self.medium = word,
            Tier::Hard => self.hard = word,
            Tier::Shield => self.shield = word,
        }
    }
}

/// The working word set of one match.
///
/// Shield words are a subset of the sampled easy/medium words, so the
/// flat list sent in `game_start` covers every word a player can be
/// asked to type.
#[derive(Clone, Debug)]
pub struct WordPool {
    easy: Vec<&'static str>,
    medium: Vec<&'static str>,
    hard: Vec<&'static str>,
    shield: Vec<&'static str>,
}

impl WordPool {
    /// Sample a fresh pool from the static table.
    pub fn sample<R: Rng>(rng: &mut R) -> Self {
        let easy: Vec<&'static str> = WORDS
            .iter()
            .filter(|w| tier_of(w) == Tier::Easy)
            .copied()
            .collect::<Vec<_>>()
            .choose_multiple(rng, EASY_PER_MATCH)
            .copied()
            .collect();
        let medium: Vec<&'static str> = WORDS
            .iter()
            .filter(|w| tier_of(w) == Tier::Medium)
            .copied()
            .collect::<Vec<_>>()
            .choose_multiple(rng, MEDIUM_PER_MATCH)
            .copied()
            .collect();
        let hard: Vec<&'static str> = WORDS
            .iter()
            .filter(|w| tier_of(w) == Tier::Hard)
            .copied()
            .collect::<Vec<_>>()
            .choose_multiple(rng, HARD_PER_MATCH)
            .copied()
            .collect();

        let shield: Vec<&'static str> = easy
            .iter()
            .chain(medium.iter())
            .filter(|w| shield_eligible(w))
            .copied()
            .collect();

        Self {
            easy,
            medium,
            hard,
            shield,
        }
    }

    /// Draw a target word for a tier, uniformly.
    pub fn draw<R: Rng>(&self, tier: Tier, rng: &mut R) -> &'static str {
        let pool = match tier {
            Tier::Easy => &self.easy,
            Tier::Medium => &self.medium,
            Tier::Hard => &self.hard,
            Tier::Shield => &self.shield,
        };
        // Every tier pool is non-empty by construction.
        pool.choose(rng).copied().unwrap_or("rune")
    }

    /// Draw one target word per tier for a player.
    pub fn draw_assignments<R: Rng>(&self, rng: &mut R) -> WordAssignments {
        WordAssignments {
            easy: self.draw(Tier::Easy, rng),
            medium: self.draw(Tier::Medium, rng),
            hard: self.draw(Tier::Hard, rng),
            shield: self.draw(Tier::Shield, rng),
        }
    }

    /// Flat list of attack-tier words, as shipped in `game_start`.
    pub fn words(&self) -> Vec<&'static str> {
        self.easy
            .iter()
            .chain(self.medium.iter())
            .chain(self.hard.iter())
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_of_by_length() {
        assert_eq!(tier_of("orb"), Tier::Easy);
        assert_eq!(tier_of("fire"), Tier::Easy);
        assert_eq!(tier_of("magic"), Tier::Medium);
        assert_eq!(tier_of("phoenix"), Tier::Medium);
        assert_eq!(tier_of("fireball"), Tier::Hard);
        assert_eq!(tier_of("conflagration"), Tier::Hard);
    }

    #[test]
    fn test_shield_eligibility() {
        assert!(shield_eligible("orb"));
        assert!(shield_eligible("wizard"));
        assert!(!shield_eligible("phoenix"));
        assert!(!shield_eligible("fireball"));
    }

    #[test]
    fn test_table_has_enough_words_per_tier() {
        let easy = WORDS.iter().filter(|w| tier_of(w) == Tier::Easy).count();
        let medium = WORDS.iter().filter(|w| tier_of(w) == Tier::Medium).count();
        let hard = WORDS.iter().filter(|w| tier_of(w) == Tier::Hard).count();
        assert!(easy >= EASY_PER_MATCH);
        assert!(medium >= MEDIUM_PER_MATCH);
        assert!(hard >= HARD_PER_MATCH);
    }

    #[test]
    fn test_sample_fills_all_tiers() {
        let mut rng = rand::thread_rng();
        let pool = WordPool::sample(&mut rng);
        assert_eq!(pool.easy.len(), EASY_PER_MATCH);
        assert_eq!(pool.medium.len(), MEDIUM_PER_MATCH);
        assert_eq!(pool.hard.len(), HARD_PER_MATCH);
        // All easy words are shield-eligible, so the shield tier can
        // never be empty.
        assert!(pool.shield.len() >= EASY_PER_MATCH);
    }

    #[test]
    fn test_shield_words_are_subset_of_shipped_words() {
        let mut rng = rand::thread_rng();
        let pool = WordPool::sample(&mut rng);
        let all = pool.words();
        for word in &pool.shield {
            assert!(all.contains(word));
        }
    }

    #[test]
    fn test_draw_matches_tier() {
        let mut rng = rand::thread_rng();
        let pool = WordPool::sample(&mut rng);
        for _ in 0..32 {
            assert_eq!(tier_of(pool.draw(Tier::Easy, &mut rng)), Tier::Easy);
            assert_eq!(tier_of(pool.draw(Tier::Medium, &mut rng)), Tier::Medium);
            assert_eq!(tier_of(pool.draw(Tier::Hard, &mut rng)), Tier::Hard);
            assert!(shield_eligible(pool.draw(Tier::Shield, &mut rng)));
        }
    }

    #[test]
    fn test_parse_attack_rejects_shield_and_unknown() {
        assert_eq!(Tier::parse_attack("easy"), Some(Tier::Easy));
        assert_eq!(Tier::parse_attack("medium"), Some(Tier::Medium));
        assert_eq!(Tier::parse_attack("hard"), Some(Tier::Hard));
        assert_eq!(Tier::parse_attack("shield"), None);
        assert_eq!(Tier::parse_attack("EASY"), None);
        assert_eq!(Tier::parse_attack(""), None);
    }

    #[test]
    fn test_damage_table() {
        assert_eq!(Tier::Easy.damage(), 10);
        assert_eq!(Tier::Medium.damage(), 35);
        assert_eq!(Tier::Hard.damage(), 80);
    }

    #[test]
    fn test_assignments_get_set() {
        let mut rng = rand::thread_rng();
        let pool = WordPool::sample(&mut rng);
        let mut assignments = pool.draw_assignments(&mut rng);
        assignments.set(Tier::Hard, "maelstrom");
        assert_eq!(assignments.get(Tier::Hard), "maelstrom");
        assert_eq!(tier_of(assignments.get(Tier::Easy)), Tier::Easy);
    }
}
