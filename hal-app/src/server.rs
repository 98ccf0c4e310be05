//! Process wiring for `serve`, `doctor` and `send`.

use crate::config::LilHalConfig;
use crate::dialogue::Catchphrases;
use crate::gateway::Gateway;
use crate::voice::ChannelVoice;
use anyhow::Result;
use hal_channels::{ChannelId, ChatAdapter, DiscordAdapter, OutboundMessage};
use hal_engine::{EngagementEngine, KeywordMatcher, TokioClock};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const INBOUND_QUEUE_CAPACITY: usize = 256;

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = LilHalConfig::load_with_path(config_path).await?;
    let matcher = KeywordMatcher::new(&cfg.engine.mute_phrases, &cfg.engine.unmute_phrases)?;
    tracing::info!(
        config_path = %path.display(),
        discord_enabled = cfg.discord.enabled,
        mute_phrases = matcher.mute_phrase_count(),
        unmute_phrases = matcher.unmute_phrase_count(),
        address_tokens = ?cfg.engine.address_tokens,
        addressed_wait_secs = ?cfg.engine.addressed_wait_secs,
        ambient_wait_secs = ?cfg.engine.ambient_wait_secs,
        decay_period_secs = cfg.engine.decay_period_secs,
        greet_on_guild_join = cfg.social.greet_on_guild_join,
        "config ok"
    );
    Ok(())
}

pub async fn send_one_shot(config_path: Option<PathBuf>, channel: &str, message: &str) -> Result<()> {
    let cfg = LilHalConfig::load(config_path).await?;
    let adapter = build_discord_adapter(&cfg)?;
    adapter
        .send(&ChannelId::new(channel), OutboundMessage::text(message))
        .await?;
    tracing::info!(channel_id = %channel, "message sent");
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = LilHalConfig::load_with_path(config_path).await?;
    let adapter: Arc<dyn ChatAdapter> = Arc::new(build_discord_adapter(&cfg)?);
    let dice = cfg.engine.dice();

    let voice = Arc::new(ChannelVoice::new(adapter.clone(), dice.clone()));
    let engine = Arc::new(EngagementEngine::with_runtime(
        cfg.engine.clone(),
        voice.clone(),
        Arc::new(Catchphrases),
        Arc::new(TokioClock),
        dice.clone(),
    )?);
    engine.spawn_decay().await;

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
    let gateway = Arc::new(Gateway::new(
        cfg.social.clone(),
        engine.clone(),
        voice,
        dice,
        inbound_rx,
    ));
    let shutdown = CancellationToken::new();
    let mut gateway_handle = gateway.start(shutdown.child_token());

    adapter.start(inbound_tx).await?;
    tracing::info!(
        config_path = %cfg_path.display(),
        platform = adapter.platform(),
        "lilhal serving"
    );

    tokio::select! {
        signal = termination_signal() => {
            tracing::warn!(signal, "stopping lilhal");
        }
        result = &mut gateway_handle => {
            if let Err(e) = result {
                tracing::error!(error = %e, "gateway task join failed");
            }
            tracing::warn!("gateway stopped; shutting down");
        }
    }

    shutdown.cancel();
    engine.shutdown().await;
    if !gateway_handle.is_finished() {
        match gateway_handle.await {
            Ok(()) => tracing::info!("gateway shutdown completed"),
            Err(e) => tracing::error!(error = %e, "gateway task join failed during shutdown"),
        }
    }
    Ok(())
}

fn build_discord_adapter(cfg: &LilHalConfig) -> Result<DiscordAdapter> {
    if !cfg.discord.enabled {
        return Err(anyhow::anyhow!(
            "discord is not enabled; set DISCORD_BOT_TOKEN or [discord] enabled = true"
        ));
    }
    let mut adapter = DiscordAdapter::new(&cfg.discord.bot_token)?;
    if let Some(intents) = cfg.discord.intents {
        adapter = adapter.with_gateway_intents(intents);
    }
    Ok(adapter)
}

/// Resolves with the name of the first termination signal. A listener that
/// cannot be installed never resolves, leaving the other one in charge.
async fn termination_signal() -> &'static str {
    let interrupt = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "ctrl-c",
            Err(e) => {
                tracing::error!(error = %e, "ctrl-c listener unavailable");
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                "SIGTERM"
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM listener unavailable");
                std::future::pending().await
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    tokio::select! {
        name = interrupt => name,
        name = terminate => name,
    }
}
