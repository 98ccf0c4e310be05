use hal_channels::ChannelId;
use hal_engine::ReplySource;
use rand::Rng;
use rand::seq::SliceRandom;

const CATCHPHRASES: &[&str] = &["Hmm.", "Yes.", "Interesting."];
const RARE_CATCHPHRASE: &str = "Oh.";
const RARE_ODDS: u32 = 200;

pub const GREETING: &str = "Hello.";

/// One of the agent's catchphrases. One reply in two hundred is the rare one.
pub fn catchphrase<R: Rng + ?Sized>(rng: &mut R) -> &'static str {
    if rng.gen_range(0..RARE_ODDS) == 0 {
        return RARE_CATCHPHRASE;
    }
    CATCHPHRASES.choose(rng).copied().unwrap_or(CATCHPHRASES[0])
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Catchphrases;

impl ReplySource for Catchphrases {
    fn compose(&self, _channel_id: &ChannelId) -> String {
        catchphrase(&mut rand::thread_rng()).to_string()
    }
}
