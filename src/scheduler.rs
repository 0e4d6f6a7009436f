//! Decides when an occupant speaks, and publishes what survives cleanup.
//!
//! Three triggers feed the completion client: a randomized periodic tick, a
//! low-probability ambient reply to any real chat line, and a mention reply
//! when a message names an active occupant. Every trigger passes through the
//! per-speaker cooldown gate, and every utterance waits out a typing delay
//! before it is committed, re-checking that the speaker is still present.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use tokio::time::{sleep, Duration};

use crate::chat_log::ChatLog;
use crate::completion::CompletionClient;
use crate::config::Config;
use crate::host::Broadcaster;
use crate::population::Population;
use crate::sanitize;

/// A speaker picked again within this window stays quiet.
const SPEAKER_COOLDOWN_MS: i64 = 15_000;

const PERIODIC_SPEAK_CHANCE: f64 = 0.35;
const AMBIENT_REPLY_CHANCE: f64 = 0.15;
const MENTION_REPLY_CHANCE: f64 = 0.30;

/// Typing-speed model for the commit delay.
const COMMIT_DELAY_PER_CHAR_MS: u64 = 240;

pub struct SpeakerCooldowns {
    last_spoke_ms: DashMap<String, i64>,
}

impl SpeakerCooldowns {
    pub fn new() -> Self {
        Self {
            last_spoke_ms: DashMap::new(),
        }
    }

    /// Check-and-stamp in one per-key operation, so concurrent triggers for
    /// the same speaker cannot both pass the gate.
    pub fn try_acquire(&self, speaker: &str) -> bool {
        self.try_acquire_at(speaker, Utc::now().timestamp_millis())
    }

    fn try_acquire_at(&self, speaker: &str, now_ms: i64) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.last_spoke_ms.entry(speaker.to_string()) {
            Entry::Occupied(mut occupied) => {
                if now_ms - *occupied.get() < SPEAKER_COOLDOWN_MS {
                    return false;
                }
                occupied.insert(now_ms);
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now_ms);
                true
            }
        }
    }
}

impl Default for SpeakerCooldowns {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ChatScheduler {
    config: Arc<Config>,
    log: Arc<ChatLog>,
    population: Arc<Population>,
    completion: Arc<CompletionClient>,
    broadcast: Arc<dyn Broadcaster>,
    cooldowns: SpeakerCooldowns,
}

impl ChatScheduler {
    pub fn new(
        config: Arc<Config>,
        log: Arc<ChatLog>,
        population: Arc<Population>,
        completion: Arc<CompletionClient>,
        broadcast: Arc<dyn Broadcaster>,
    ) -> Self {
        Self {
            config,
            log,
            population,
            completion,
            broadcast,
            cooldowns: SpeakerCooldowns::new(),
        }
    }

    /// Randomized ambient chatter loop; runs until the task is dropped.
    pub async fn run_periodic(self: Arc<Self>) {
        loop {
            let delay_ms = rand::thread_rng().gen_range(5_000..40_000);
            sleep(Duration::from_millis(delay_ms)).await;

            if !rand::thread_rng().gen_bool(PERIODIC_SPEAK_CHANCE) {
                continue;
            }
            if let Some(speaker) = self.population.pick_random_speaker() {
                self.spawn_speech(speaker, Duration::ZERO);
            }
        }
    }

    /// React to a real chat line: record it, then maybe reply.
    pub fn on_chat_message(self: &Arc<Self>, sender: &str, text: &str) {
        self.log.append(format!("<{}> {}", sender, text));

        let mut rng = rand::thread_rng();

        if rng.gen_bool(AMBIENT_REPLY_CHANCE) {
            if let Some(speaker) = self.population.pick_random_speaker() {
                let delay = reply_trigger_delay(&mut rng);
                self.spawn_speech(speaker, delay);
            }
            return;
        }

        // The first named occupant consumes the mention whether or not the
        // probability roll lets it answer.
        if let Some(speaker) = first_mentioned(&self.population.active_names(), text) {
            if rng.gen_bool(MENTION_REPLY_CHANCE) {
                let delay = reply_trigger_delay(&mut rng);
                self.spawn_speech(speaker, delay);
            }
        }
    }

    fn spawn_speech(self: &Arc<Self>, speaker: String, trigger_delay: Duration) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            if !trigger_delay.is_zero() {
                sleep(trigger_delay).await;
            }
            scheduler.speak(&speaker).await;
        });
    }

    /// One full utterance attempt for `speaker`. Silent on every failure.
    async fn speak(&self, speaker: &str) {
        if !self.cooldowns.try_acquire(speaker) {
            tracing::debug!("'{}' spoke too recently; staying quiet", speaker);
            return;
        }
        let identity = match self.config.occupants.get(speaker) {
            Some(identity) => identity,
            None => return,
        };

        let context = self.log.snapshot();
        let raw = match self.completion.generate(speaker, identity, &context).await {
            Some(raw) => raw,
            None => return,
        };

        let line = sanitize::clean(&raw, speaker);
        if line.is_empty() || line.len() > sanitize::MAX_DISPLAY_LEN {
            tracing::debug!("Generated line for '{}' unusable after cleanup", speaker);
            return;
        }

        let delay_ms = commit_delay_ms(line.len(), &mut rand::thread_rng());
        sleep(Duration::from_millis(delay_ms)).await;

        // The speaker may have been evicted while "typing".
        if !self.population.is_active(speaker) {
            tracing::debug!("'{}' left before the line was committed; dropping it", speaker);
            return;
        }

        let rendered = format!("<{}> {}", speaker, line);
        self.log.append(rendered.clone());
        self.broadcast.publish(&rendered).await;
    }
}

/// Short randomized pause before a reply is even attempted.
fn reply_trigger_delay(rng: &mut impl Rng) -> Duration {
    Duration::from_millis(rng.gen_range(1_000..3_000))
}

/// Reading-and-typing time for a line of this length, with up to 25% jitter.
fn commit_delay_ms(len: usize, rng: &mut impl Rng) -> u64 {
    let base = len as u64 * COMMIT_DELAY_PER_CHAR_MS;
    base + rng.gen_range(0..(base / 4).max(1))
}

/// First active occupant whose name appears in the message, case-insensitive.
fn first_mentioned(active_names: &[String], text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    active_names
        .iter()
        .find(|name| lower.contains(&name.to_lowercase()))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_gate_blocks_inside_window() {
        let cooldowns = SpeakerCooldowns::new();
        assert!(cooldowns.try_acquire_at("Steve", 1_000));
        assert!(!cooldowns.try_acquire_at("Steve", 1_000 + SPEAKER_COOLDOWN_MS - 1));
        assert!(cooldowns.try_acquire_at("Steve", 1_000 + SPEAKER_COOLDOWN_MS));
    }

    #[test]
    fn cooldown_is_per_speaker() {
        let cooldowns = SpeakerCooldowns::new();
        assert!(cooldowns.try_acquire_at("Steve", 0));
        assert!(cooldowns.try_acquire_at("Alex", 1));
    }

    #[test]
    fn acquiring_restamps_the_window() {
        let cooldowns = SpeakerCooldowns::new();
        assert!(cooldowns.try_acquire_at("Steve", 0));
        assert!(cooldowns.try_acquire_at("Steve", 20_000));
        // The second acquisition moved the window forward.
        assert!(!cooldowns.try_acquire_at("Steve", 30_000));
    }

    #[test]
    fn mention_scan_is_case_insensitive_and_first_match_wins() {
        let names = vec!["Alex".to_string(), "Steve".to_string()];
        assert_eq!(
            first_mentioned(&names, "hey STEVE got a sec?"),
            Some("Steve".to_string())
        );
        assert_eq!(
            first_mentioned(&names, "alex and steve both here?"),
            Some("Alex".to_string())
        );
        assert_eq!(first_mentioned(&names, "anyone home?"), None);
        assert_eq!(first_mentioned(&[], "steve?"), None);
    }

    #[test]
    fn commit_delay_scales_with_length_and_bounds_jitter() {
        let mut rng = rand::thread_rng();
        for len in [1, 40, 240] {
            let base = len as u64 * COMMIT_DELAY_PER_CHAR_MS;
            for _ in 0..50 {
                let delay = commit_delay_ms(len, &mut rng);
                assert!(delay >= base);
                assert!(delay < base + (base / 4).max(1));
            }
        }
    }

    #[test]
    fn reply_trigger_delay_is_one_to_three_seconds() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let delay = reply_trigger_delay(&mut rng);
            assert!(delay >= Duration::from_millis(1_000));
            assert!(delay < Duration::from_millis(3_000));
        }
    }
}
