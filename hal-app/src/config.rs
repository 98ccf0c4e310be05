//! Lil Hal configuration loader.

use anyhow::Result;
use hal_engine::{EngineConfig, SecondsRange};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LilHalConfig {
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub social: SocialConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscordConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    /// Gateway intents bitfield. Unset keeps the adapter's default.
    #[serde(default)]
    pub intents: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SocialConfig {
    #[serde(default = "default_greet_on_guild_join")]
    pub greet_on_guild_join: bool,
    /// Greet in the first text channel whose name contains this.
    #[serde(default = "default_greeting_channel_keyword")]
    pub greeting_channel_keyword: String,
    #[serde(default = "default_greeting_pause_secs")]
    pub greeting_pause_secs: SecondsRange,
    #[serde(default = "default_introduce_on_guild_join")]
    pub introduce_on_guild_join: bool,
    #[serde(default = "default_intro_channel_keyword")]
    pub intro_channel_keyword: String,
    #[serde(default = "default_intro_text")]
    pub intro_text: String,
    #[serde(default = "default_intro_pause_secs")]
    pub intro_pause_secs: SecondsRange,
    #[serde(default = "default_greet_new_members")]
    pub greet_new_members: bool,
    /// How long a newcomer's first message still earns a hello.
    #[serde(default = "default_new_member_window_secs")]
    pub new_member_window_secs: u64,
}

fn default_greet_on_guild_join() -> bool {
    true
}

fn default_greeting_channel_keyword() -> String {
    "general".to_string()
}

fn default_greeting_pause_secs() -> SecondsRange {
    SecondsRange(5, 15)
}

fn default_introduce_on_guild_join() -> bool {
    true
}

fn default_intro_channel_keyword() -> String {
    "intro".to_string()
}

fn default_intro_text() -> String {
    "Hal\nHe/It\nI can quiet down when you tell me.".to_string()
}

fn default_intro_pause_secs() -> SecondsRange {
    SecondsRange(20, 25)
}

fn default_greet_new_members() -> bool {
    true
}

fn default_new_member_window_secs() -> u64 {
    60 * 60
}

impl Default for SocialConfig {
    fn default() -> Self {
        Self {
            greet_on_guild_join: default_greet_on_guild_join(),
            greeting_channel_keyword: default_greeting_channel_keyword(),
            greeting_pause_secs: default_greeting_pause_secs(),
            introduce_on_guild_join: default_introduce_on_guild_join(),
            intro_channel_keyword: default_intro_channel_keyword(),
            intro_text: default_intro_text(),
            intro_pause_secs: default_intro_pause_secs(),
            greet_new_members: default_greet_new_members(),
            new_member_window_secs: default_new_member_window_secs(),
        }
    }
}

impl SocialConfig {
    pub fn new_member_window(&self) -> Duration {
        Duration::from_secs(self.new_member_window_secs)
    }
}

impl LilHalConfig {
    pub async fn load(path: Option<PathBuf>) -> Result<Self> {
        Ok(Self::load_with_path(path).await?.0)
    }

    pub async fn load_with_path(path: Option<PathBuf>) -> Result<(Self, PathBuf)> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg = Self::parse(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DISCORD_BOT_TOKEN") {
            if !v.trim().is_empty() {
                self.discord.bot_token = v;
                self.discord.enabled = true;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.discord.enabled && self.discord.bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "discord.bot_token is required when discord.enabled = true"
            ));
        }
        for (name, pause) in [
            ("greeting_pause_secs", self.social.greeting_pause_secs),
            ("intro_pause_secs", self.social.intro_pause_secs),
        ] {
            if pause.low() > pause.high() {
                return Err(anyhow::anyhow!(
                    "social.{name} must be [low, high] with low <= high"
                ));
            }
        }
        if self.social.greet_on_guild_join && self.social.greeting_channel_keyword.trim().is_empty()
        {
            return Err(anyhow::anyhow!(
                "social.greeting_channel_keyword must not be empty"
            ));
        }
        if self.social.introduce_on_guild_join
            && (self.social.intro_channel_keyword.trim().is_empty()
                || self.social.intro_text.trim().is_empty())
        {
            return Err(anyhow::anyhow!(
                "social.intro_channel_keyword and social.intro_text must not be empty"
            ));
        }
        if self.social.greet_new_members && self.social.new_member_window_secs == 0 {
            return Err(anyhow::anyhow!(
                "social.new_member_window_secs must be > 0"
            ));
        }
        self.engine.validate()?;
        Ok(())
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".lilhal").join("config.toml")
}
