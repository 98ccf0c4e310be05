//! One-shot "join in" coordination per channel.
//!
//! Several trigger signals that point at the same external event share one
//! live [`Episode`]. Each `call` raises the firing odds (`calls / divisor`),
//! and the callback runs at most once per episode. The episode leaves the live
//! map when its completion future resolves, which lets the next trigger start
//! a fresh one.

use crate::clock::Dice;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::BoxFuture;
use hal_channels::ChannelId;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type EpisodeCallback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct EpisodeState {
    calls: u32,
    callback: Option<EpisodeCallback>,
}

pub struct Episode {
    channel_id: ChannelId,
    state: Mutex<EpisodeState>,
    dice: Arc<dyn Dice>,
    divisor: f64,
    disposed: CancellationToken,
}

impl std::fmt::Debug for Episode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Episode")
            .field("channel_id", &self.channel_id)
            .field("calls", &self.calls())
            .field("fired", &self.fired())
            .finish()
    }
}

impl Episode {
    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn calls(&self) -> u32 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).calls
    }

    pub fn fired(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .callback
            .is_none()
    }

    /// Registers one trigger. Returns the spawned callback task when this call fired it.
    pub fn call(&self) -> Option<JoinHandle<()>> {
        let callback = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.calls = state.calls.saturating_add(1);
            state.callback.as_ref()?;
            let odds = f64::from(state.calls) / self.divisor;
            let roll = self.dice.roll();
            if roll >= odds {
                tracing::debug!(
                    channel_id = %self.channel_id,
                    calls = state.calls,
                    roll,
                    odds,
                    "episode call did not fire"
                );
                return None;
            }
            state.callback.take()?
        };
        tracing::debug!(channel_id = %self.channel_id, "episode fired");
        Some(tokio::spawn(callback()))
    }

    /// Resolves once the episode has been removed from the live map.
    pub async fn disposed(&self) {
        self.disposed.cancelled().await;
    }
}

pub struct EpisodeCoordinator {
    live: Arc<DashMap<ChannelId, Arc<Episode>>>,
    dice: Arc<dyn Dice>,
    divisor: u32,
}

impl EpisodeCoordinator {
    pub fn new(dice: Arc<dyn Dice>, divisor: u32) -> Self {
        Self {
            live: Arc::new(DashMap::new()),
            dice,
            divisor: divisor.max(1),
        }
    }

    /// Returns the channel's live episode, or starts one with `callback` and a
    /// disposal task that awaits `completion`. For an existing episode both
    /// arguments are dropped unused. Must run inside a tokio runtime.
    pub fn get<F, Fut, S>(&self, channel_id: &ChannelId, callback: F, completion: S) -> Arc<Episode>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        S: Future<Output = ()> + Send + 'static,
    {
        let episode = match self.live.entry(channel_id.clone()) {
            Entry::Occupied(occupied) => return occupied.get().clone(),
            Entry::Vacant(vacant) => {
                let callback: EpisodeCallback =
                    Box::new(move || -> BoxFuture<'static, ()> { Box::pin(callback()) });
                let episode = Arc::new(Episode {
                    channel_id: channel_id.clone(),
                    state: Mutex::new(EpisodeState {
                        calls: 0,
                        callback: Some(callback),
                    }),
                    dice: self.dice.clone(),
                    divisor: f64::from(self.divisor),
                    disposed: CancellationToken::new(),
                });
                vacant.insert(episode.clone());
                episode
            }
        };

        tracing::debug!(channel_id = %channel_id, "episode started");
        let live = self.live.clone();
        let disposing = episode.clone();
        tokio::spawn(async move {
            completion.await;
            live.remove_if(&disposing.channel_id, |_, current| {
                Arc::ptr_eq(current, &disposing)
            });
            tracing::debug!(
                channel_id = %disposing.channel_id,
                calls = disposing.calls(),
                fired = disposing.fired(),
                "episode disposed"
            );
            disposing.disposed.cancel();
        });
        episode
    }

    pub fn is_live(&self, channel_id: &ChannelId) -> bool {
        self.live.contains_key(channel_id)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}
