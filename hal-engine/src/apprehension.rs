//! Per-channel mute levels.
//!
//! A channel with no entry is unmuted. Entries only ever hold levels >= 1:
//! any operation that would leave a level below 1 removes the entry instead,
//! so absence is the single canonical unmuted state.

use dashmap::DashMap;
use hal_channels::ChannelId;

#[derive(Debug)]
pub struct ApprehensionStore {
    levels: DashMap<ChannelId, i64>,
    severity_bonus: i64,
}

impl ApprehensionStore {
    pub fn new(severity_bonus: i64) -> Self {
        Self {
            levels: DashMap::new(),
            severity_bonus,
        }
    }

    /// Adds `severity + bonus` to the channel's level and returns the new level.
    pub fn record_match(&self, channel_id: &ChannelId, severity: u32) -> i64 {
        let delta = i64::from(severity) + self.severity_bonus;
        let mut entry = self.levels.entry(channel_id.clone()).or_insert(0);
        *entry = entry.saturating_add(delta);
        let level = *entry;
        drop(entry);
        if level < 1 {
            self.levels.remove_if(channel_id, |_, v| *v < 1);
            return 0;
        }
        level
    }

    /// Immediate unmute. Returns whether the channel had been muted.
    pub fn record_reset(&self, channel_id: &ChannelId) -> bool {
        self.levels.remove(channel_id).is_some()
    }

    pub fn is_muted(&self, channel_id: &ChannelId) -> bool {
        self.level(channel_id) >= 1
    }

    pub fn level(&self, channel_id: &ChannelId) -> i64 {
        self.levels.get(channel_id).map(|v| *v).unwrap_or(0)
    }

    /// Applies `amount` to every level and drops entries that fall below 1.
    /// Returns how many channels became unmuted.
    pub fn decay_all(&self, amount: i64) -> usize {
        let mut evicted = 0;
        self.levels.retain(|channel_id, level| {
            *level = level.saturating_add(amount);
            let keep = *level >= 1;
            if !keep {
                tracing::debug!(channel_id = %channel_id, "apprehension fully decayed");
                evicted += 1;
            }
            keep
        });
        evicted
    }

    /// Drops every listed channel. Returns how many were muted.
    pub fn evict_guild(&self, channel_ids: &[ChannelId]) -> usize {
        channel_ids
            .iter()
            .filter(|channel_id| self.levels.remove(*channel_id).is_some())
            .count()
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Muted channels and their levels, ordered by channel id.
    pub fn snapshot(&self) -> Vec<(ChannelId, i64)> {
        let mut out: Vec<(ChannelId, i64)> = self
            .levels
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        out.sort();
        out
    }
}
