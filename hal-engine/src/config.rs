//! Tunable constants for the engagement engine.
//!
//! Every field has a serde default equal to the reference tuning, so an empty
//! `[engine]` table yields a working configuration.

use crate::clock::{Dice, SeededDice, ThreadDice};
use crate::error::{EngineError, Result};
use crate::keywords::KeywordMatcher;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Inclusive whole-second bounds, written as `[low, high]` in TOML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SecondsRange(pub u64, pub u64);

impl SecondsRange {
    pub fn low(&self) -> u64 {
        self.0
    }

    pub fn high(&self) -> u64 {
        self.1
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Phrase -> rudeness level. Phrases containing `\b` are regular expressions.
    #[serde(default = "default_mute_phrases")]
    pub mute_phrases: BTreeMap<String, u32>,
    #[serde(default = "default_unmute_phrases")]
    pub unmute_phrases: Vec<String>,
    /// Whole-word tokens that address the agent by name.
    #[serde(default = "default_address_tokens")]
    pub address_tokens: Vec<String>,
    /// Mute phrases only count when the agent is addressed.
    #[serde(default = "default_require_address")]
    pub require_address: bool,
    #[serde(default = "default_min_words")]
    pub min_words: usize,
    #[serde(default = "default_addressed_wait_secs")]
    pub addressed_wait_secs: SecondsRange,
    #[serde(default = "default_ambient_wait_secs")]
    pub ambient_wait_secs: SecondsRange,
    #[serde(default = "default_decay_period_secs")]
    pub decay_period_secs: u64,
    #[serde(default = "default_decay_amount")]
    pub decay_amount: i64,
    /// Added on top of a matched phrase's severity. At least 1, so every
    /// match leaves the channel muted.
    #[serde(default = "default_severity_bonus")]
    pub severity_bonus: i64,
    #[serde(default = "default_quiet_emoji")]
    pub quiet_emoji: String,
    #[serde(default = "default_reaction_mute_severity")]
    pub reaction_mute_severity: u32,
    #[serde(default = "default_acknowledge_emoji")]
    pub acknowledge_emoji: String,
    #[serde(default = "default_episode_divisor")]
    pub episode_divisor: u32,
    #[serde(default = "default_episode_window_secs")]
    pub episode_window_secs: u64,
    /// Seed for reproducible draws. Unset means thread-local entropy.
    #[serde(default)]
    pub rng_seed: Option<u64>,
}

fn default_mute_phrases() -> BTreeMap<String, u32> {
    [
        ("quiet down", 1),
        (r"\bs+h+\b", 1),
        (r"\bs*h+u+s+h+", 1),
        ("be quiet", 2),
        ("zip it", 3),
        ("stop talking", 3),
        ("put a sock in it", 4),
        ("go away", 4),
        ("shut up", 5),
        ("fuck off", 6),
        ("drop dead", 6),
    ]
    .into_iter()
    .map(|(phrase, severity)| (phrase.to_string(), severity))
    .collect()
}

fn default_unmute_phrases() -> Vec<String> {
    ["come back", "i didnt mean it", "i didnt mean that", "you can talk"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_address_tokens() -> Vec<String> {
    vec!["hal".to_string()]
}

fn default_require_address() -> bool {
    true
}

fn default_min_words() -> usize {
    3
}

fn default_addressed_wait_secs() -> SecondsRange {
    SecondsRange(1, 4)
}

fn default_ambient_wait_secs() -> SecondsRange {
    SecondsRange(5, 12)
}

fn default_decay_period_secs() -> u64 {
    15 * 60
}

fn default_decay_amount() -> i64 {
    -1
}

fn default_severity_bonus() -> i64 {
    1
}

fn default_quiet_emoji() -> String {
    "\u{1f92b}".to_string()
}

fn default_reaction_mute_severity() -> u32 {
    3
}

fn default_acknowledge_emoji() -> String {
    "\u{1f44d}".to_string()
}

fn default_episode_divisor() -> u32 {
    3
}

fn default_episode_window_secs() -> u64 {
    90
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mute_phrases: default_mute_phrases(),
            unmute_phrases: default_unmute_phrases(),
            address_tokens: default_address_tokens(),
            require_address: default_require_address(),
            min_words: default_min_words(),
            addressed_wait_secs: default_addressed_wait_secs(),
            ambient_wait_secs: default_ambient_wait_secs(),
            decay_period_secs: default_decay_period_secs(),
            decay_amount: default_decay_amount(),
            severity_bonus: default_severity_bonus(),
            quiet_emoji: default_quiet_emoji(),
            reaction_mute_severity: default_reaction_mute_severity(),
            acknowledge_emoji: default_acknowledge_emoji(),
            episode_divisor: default_episode_divisor(),
            episode_window_secs: default_episode_window_secs(),
            rng_seed: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, range) in [
            ("addressed_wait_secs", self.addressed_wait_secs),
            ("ambient_wait_secs", self.ambient_wait_secs),
        ] {
            if range.low() > range.high() {
                return Err(EngineError::InvalidConfig(format!(
                    "engine.{name} must be [low, high] with low <= high"
                )));
            }
        }
        if self.addressed_wait_secs.high() >= self.ambient_wait_secs.low() {
            return Err(EngineError::InvalidConfig(
                "engine.addressed_wait_secs must end before engine.ambient_wait_secs begins"
                    .to_string(),
            ));
        }
        if self.min_words == 0 {
            return Err(EngineError::InvalidConfig(
                "engine.min_words must be > 0".to_string(),
            ));
        }
        if self.decay_period_secs == 0 {
            return Err(EngineError::InvalidConfig(
                "engine.decay_period_secs must be > 0".to_string(),
            ));
        }
        if self.decay_amount >= 0 {
            return Err(EngineError::InvalidConfig(
                "engine.decay_amount must be < 0".to_string(),
            ));
        }
        if self.severity_bonus < 1 {
            return Err(EngineError::InvalidConfig(
                "engine.severity_bonus must be >= 1".to_string(),
            ));
        }
        if self.episode_divisor == 0 {
            return Err(EngineError::InvalidConfig(
                "engine.episode_divisor must be > 0".to_string(),
            ));
        }
        if self.address_tokens.iter().any(|t| t.trim().is_empty()) {
            return Err(EngineError::InvalidConfig(
                "engine.address_tokens must not contain blank tokens".to_string(),
            ));
        }
        KeywordMatcher::new(&self.mute_phrases, &self.unmute_phrases)?;
        Ok(())
    }

    /// Seeded dice when `rng_seed` is set, thread-local entropy otherwise.
    pub fn dice(&self) -> Arc<dyn Dice> {
        match self.rng_seed {
            Some(seed) => Arc::new(SeededDice::new(seed)),
            None => Arc::new(ThreadDice),
        }
    }

    pub fn decay_period(&self) -> Duration {
        Duration::from_secs(self.decay_period_secs)
    }

    pub fn episode_window(&self) -> Duration {
        Duration::from_secs(self.episode_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_uses_reference_tuning() {
        let cfg: EngineConfig = toml::from_str("").expect("parse empty engine table");
        assert_eq!(cfg.min_words, 3);
        assert_eq!(cfg.addressed_wait_secs, SecondsRange(1, 4));
        assert_eq!(cfg.ambient_wait_secs, SecondsRange(5, 12));
        assert_eq!(cfg.decay_period_secs, 900);
        assert_eq!(cfg.mute_phrases.get("shut up"), Some(&5));
        cfg.validate().expect("defaults validate");
    }

    #[test]
    fn ranges_parse_from_arrays() {
        let cfg: EngineConfig = toml::from_str(
            r#"
addressed_wait_secs = [2, 3]
ambient_wait_secs = [9, 25]
"#,
        )
        .expect("parse ranges");
        assert_eq!(cfg.ambient_wait_secs.high(), 25);
        cfg.validate().expect("valid ranges");
    }

    #[test]
    fn overlapping_wait_ranges_are_rejected() {
        let cfg = EngineConfig {
            addressed_wait_secs: SecondsRange(1, 6),
            ..EngineConfig::default()
        };
        let err = cfg.validate().expect_err("overlap should fail");
        assert!(err.to_string().contains("addressed_wait_secs"));
    }

    #[test]
    fn non_negative_decay_is_rejected() {
        let cfg = EngineConfig {
            decay_amount: 0,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn non_positive_severity_bonus_is_rejected() {
        for severity_bonus in [0, -5] {
            let cfg = EngineConfig {
                severity_bonus,
                ..EngineConfig::default()
            };
            let err = cfg.validate().expect_err("bonus below 1");
            assert!(err.to_string().contains("severity_bonus"));
        }
    }

    #[test]
    fn seeded_configs_draw_reproducibly() {
        let cfg = EngineConfig {
            rng_seed: Some(9),
            ..EngineConfig::default()
        };
        let (a, b) = (cfg.dice(), cfg.dice());
        assert_eq!(a.roll(), b.roll());
        assert_eq!(
            a.uniform_secs(cfg.ambient_wait_secs),
            b.uniform_secs(cfg.ambient_wait_secs)
        );
    }

    #[test]
    fn malformed_pattern_fails_validation() {
        let mut cfg = EngineConfig::default();
        cfg.mute_phrases.insert(r"\b[oops".to_string(), 1);
        let err = cfg.validate().expect_err("bad pattern");
        assert!(matches!(err, EngineError::InvalidPhrase { .. }));
    }
}
