//! Occupancy state machine for the synthetic roster.
//!
//! A randomized tick churns occupants in and out against the configured
//! budget. Removal always wins once occupancy crosses the threshold; below
//! it, a weighted dice roll decides between admitting, evicting, and doing
//! nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::seq::SliceRandom;
use rand::Rng;
use uuid::Uuid;

use crate::chat_log::ChatLog;
use crate::config::Config;
use crate::host::{Broadcaster, PresenceEntry, PresenceSink};

const OCCUPANCY_THRESHOLD: f64 = 0.85;

/// d100 bands: < ADMIT admits, < EVICT evicts, the rest is a no-op.
const ADMIT_BAND: u32 = 35;
const EVICT_BAND: u32 = 73;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Churn {
    Admit,
    Evict,
    Idle,
}

/// Pure churn decision for one tick, so tests can inject the roll.
fn decide(real: usize, fake: usize, budget: usize, unused: usize, roll: u32) -> Churn {
    let occupancy = (real + fake) as f64 / budget as f64;
    if occupancy >= OCCUPANCY_THRESHOLD {
        return if fake > 0 { Churn::Evict } else { Churn::Idle };
    }

    if roll < ADMIT_BAND {
        let projected = (real + fake + 1) as f64 / budget as f64;
        if unused > 0 && projected < OCCUPANCY_THRESHOLD {
            Churn::Admit
        } else {
            Churn::Idle
        }
    } else if roll < EVICT_BAND {
        if fake > 0 {
            Churn::Evict
        } else {
            Churn::Idle
        }
    } else {
        Churn::Idle
    }
}

/// Merged roster view for list/ping-style display.
pub struct Roster {
    pub names: Vec<String>,
    pub total: usize,
    pub budget: usize,
}

pub struct Population {
    config: Arc<Config>,
    log: Arc<ChatLog>,
    presence: Arc<dyn PresenceSink>,
    broadcast: Arc<dyn Broadcaster>,
    active: Mutex<HashMap<String, Uuid>>,
}

impl Population {
    pub fn new(
        config: Arc<Config>,
        log: Arc<ChatLog>,
        presence: Arc<dyn PresenceSink>,
        broadcast: Arc<dyn Broadcaster>,
    ) -> Self {
        Self {
            config,
            log,
            presence,
            broadcast,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.lock_active().contains_key(name)
    }

    pub fn active_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock_active().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn pick_random_speaker(&self) -> Option<String> {
        let names = self.active_names();
        names.choose(&mut rand::thread_rng()).cloned()
    }

    /// One churn step against the real participant count observed now.
    pub async fn tick(&self, real_count: usize) {
        let (churn, candidate) = {
            let active = self.lock_active();
            let fake = active.len();
            let unused: Vec<&String> = self
                .config
                .occupants
                .keys()
                .filter(|name| !active.contains_key(*name))
                .collect();

            let mut rng = rand::thread_rng();
            let roll = rng.gen_range(0..100);
            let churn = decide(real_count, fake, self.config.max_players, unused.len(), roll);

            let candidate = match churn {
                Churn::Admit => unused.choose(&mut rng).map(|name| (*name).clone()),
                Churn::Evict => {
                    let names: Vec<&String> = active.keys().collect();
                    names.choose(&mut rng).map(|name| (*name).clone())
                }
                Churn::Idle => None,
            };
            (churn, candidate)
        };

        match (churn, candidate) {
            (Churn::Admit, Some(name)) => self.admit(&name).await,
            (Churn::Evict, Some(name)) => self.evict(&name, true).await,
            _ => {}
        }
    }

    async fn admit(&self, name: &str) {
        let identity = match self.config.occupants.get(name) {
            Some(identity) => identity,
            None => return,
        };
        let session_id = Uuid::new_v4();
        {
            let mut active = self.lock_active();
            if active.contains_key(name) {
                return;
            }
            active.insert(name.to_string(), session_id);
        }
        let entry = PresenceEntry {
            name: name.to_string(),
            session_id,
            texture: identity.texture.clone(),
            signature: identity.signature.clone(),
            latency_ms: fake_latency_ms(&mut rand::thread_rng()),
        };

        tracing::info!("Occupant '{}' admitted (session {})", name, session_id);
        let announcement = format!("{} joined the session", name);
        self.log.append(announcement.clone());
        self.broadcast.publish(&announcement).await;
        self.presence.show(entry).await;
    }

    async fn evict(&self, name: &str, announce: bool) {
        let session_id = {
            let mut active = self.lock_active();
            match active.remove(name) {
                Some(id) => id,
                None => return,
            }
        };

        tracing::info!("Occupant '{}' removed (session {})", name, session_id);
        if announce {
            let announcement = format!("{} left the session", name);
            self.log.append(announcement.clone());
            self.broadcast.publish(&announcement).await;
        }
        self.presence.hide(session_id).await;
    }

    /// Replay presence for a real participant that just connected, so the
    /// newcomer sees the whole synthetic roster.
    pub async fn sync_to_newcomer(&self) {
        let entries: Vec<PresenceEntry> = {
            let active = self.lock_active();
            let mut rng = rand::thread_rng();
            active
                .iter()
                .filter_map(|(name, session_id)| {
                    self.config.occupants.get(name).map(|identity| PresenceEntry {
                        name: name.clone(),
                        session_id: *session_id,
                        texture: identity.texture.clone(),
                        signature: identity.signature.clone(),
                        latency_ms: fake_latency_ms(&mut rng),
                    })
                })
                .collect()
        };

        for entry in entries {
            self.presence.show(entry).await;
        }
    }

    /// Merged real + fake roster, with fake entries capped so the displayed
    /// total never exceeds the budget.
    pub fn roster(&self, real_names: &[String]) -> Roster {
        let allowed_fake = self.config.max_players.saturating_sub(real_names.len());
        let mut names = real_names.to_vec();
        names.extend(self.active_names().into_iter().take(allowed_fake));
        Roster {
            total: names.len(),
            names,
            budget: self.config.max_players,
        }
    }

    /// Drop every active occupant without leave announcements.
    pub async fn shutdown(&self) {
        for name in self.active_names() {
            self.evict(&name, false).await;
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<String, Uuid>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A plausible-looking connection latency: usually a good one.
fn fake_latency_ms(rng: &mut impl Rng) -> u32 {
    if rng.gen_range(0..4) > 0 {
        rng.gen_range(0..150)
    } else {
        rng.gen_range(150..300)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct RecordingPresence {
        shown: StdMutex<Vec<PresenceEntry>>,
        hidden: StdMutex<Vec<Uuid>>,
    }

    impl RecordingPresence {
        fn new() -> Self {
            Self {
                shown: StdMutex::new(Vec::new()),
                hidden: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PresenceSink for RecordingPresence {
        async fn show(&self, entry: PresenceEntry) {
            self.shown.lock().unwrap().push(entry);
        }

        async fn hide(&self, session_id: Uuid) {
            self.hidden.lock().unwrap().push(session_id);
        }
    }

    struct RecordingBroadcast {
        lines: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl Broadcaster for RecordingBroadcast {
        async fn publish(&self, line: &str) {
            self.lines.lock().unwrap().push(line.to_string());
        }
    }

    fn population() -> (Arc<Population>, Arc<RecordingPresence>, Arc<RecordingBroadcast>) {
        let mut config = Config::default();
        config.max_players = 10;
        let presence = Arc::new(RecordingPresence::new());
        let broadcast = Arc::new(RecordingBroadcast {
            lines: StdMutex::new(Vec::new()),
        });
        let pop = Arc::new(Population::new(
            Arc::new(config),
            Arc::new(ChatLog::new()),
            presence.clone(),
            broadcast.clone(),
        ));
        (pop, presence, broadcast)
    }

    #[test]
    fn over_threshold_always_evicts() {
        // budget 10, real 8, fake 1 -> occupancy 0.9: every roll evicts.
        for roll in [0, 34, 35, 72, 73, 99] {
            assert_eq!(decide(8, 1, 10, 5, roll), Churn::Evict);
        }
    }

    #[test]
    fn over_threshold_with_no_fakes_idles() {
        assert_eq!(decide(9, 0, 10, 5, 0), Churn::Idle);
    }

    #[test]
    fn admit_band_admits_below_threshold() {
        assert_eq!(decide(2, 1, 10, 5, 0), Churn::Admit);
        assert_eq!(decide(2, 1, 10, 5, 34), Churn::Admit);
    }

    #[test]
    fn admission_never_projects_past_threshold() {
        // budget 10, real 6, fake 2: projected (9)/10 = 0.9 >= 0.85.
        assert_eq!(decide(6, 2, 10, 5, 0), Churn::Idle);
        // One fewer occupant and the projection clears the bar.
        assert_eq!(decide(6, 1, 10, 5, 0), Churn::Admit);
    }

    #[test]
    fn admit_band_idles_when_no_identities_left() {
        assert_eq!(decide(2, 1, 10, 0, 0), Churn::Idle);
    }

    #[test]
    fn evict_band_and_idle_band() {
        assert_eq!(decide(2, 1, 10, 5, 35), Churn::Evict);
        assert_eq!(decide(2, 1, 10, 5, 72), Churn::Evict);
        assert_eq!(decide(2, 0, 10, 5, 40), Churn::Idle);
        assert_eq!(decide(2, 1, 10, 5, 73), Churn::Idle);
        assert_eq!(decide(2, 1, 10, 5, 99), Churn::Idle);
    }

    #[tokio::test]
    async fn admit_announces_and_shows_presence() {
        let (pop, presence, broadcast) = population();
        pop.admit("Steve").await;

        assert!(pop.is_active("Steve"));
        assert_eq!(broadcast.lines.lock().unwrap()[0], "Steve joined the session");
        let shown = presence.shown.lock().unwrap();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].name, "Steve");
        assert_eq!(shown[0].texture, "defaultTexture");
        assert!(shown[0].latency_ms < 300);
    }

    #[tokio::test]
    async fn evict_hides_the_admitted_session() {
        let (pop, presence, broadcast) = population();
        pop.admit("Steve").await;
        let session_id = presence.shown.lock().unwrap()[0].session_id;

        pop.evict("Steve", true).await;
        assert!(!pop.is_active("Steve"));
        assert_eq!(presence.hidden.lock().unwrap()[0], session_id);
        assert_eq!(broadcast.lines.lock().unwrap()[1], "Steve left the session");
    }

    #[tokio::test]
    async fn shutdown_is_silent() {
        let (pop, presence, broadcast) = population();
        pop.admit("Steve").await;
        pop.shutdown().await;

        assert!(pop.active_names().is_empty());
        assert_eq!(presence.hidden.lock().unwrap().len(), 1);
        let lines = broadcast.lines.lock().unwrap();
        assert!(!lines.iter().any(|l| l.contains("left")));
    }

    #[tokio::test]
    async fn newcomer_sync_replays_active_roster() {
        let (pop, presence, _broadcast) = population();
        pop.admit("Steve").await;
        presence.shown.lock().unwrap().clear();

        pop.sync_to_newcomer().await;
        let shown = presence.shown.lock().unwrap();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].name, "Steve");
    }

    #[tokio::test]
    async fn roster_caps_fake_entries_at_budget() {
        let (pop, _presence, _broadcast) = population();
        pop.admit("Steve").await;

        let real: Vec<String> = (0..10).map(|i| format!("real{}", i)).collect();
        let roster = pop.roster(&real);
        assert_eq!(roster.total, 10);
        assert_eq!(roster.budget, 10);
        assert!(!roster.names.iter().any(|n| n == "Steve"));

        let few_real = vec!["Ana".to_string()];
        let roster = pop.roster(&few_real);
        assert_eq!(roster.total, 2);
        assert!(roster.names.iter().any(|n| n == "Steve"));
    }

    #[tokio::test]
    async fn forced_eviction_scenario_at_budget_ten() {
        // budget 10, real 8, fake 1 -> the single fake must go.
        let (pop, _presence, _broadcast) = population();
        pop.admit("Steve").await;
        pop.tick(8).await;
        assert!(pop.active_names().is_empty());
    }

    #[test]
    fn fake_latency_stays_in_range() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            assert!(fake_latency_ms(&mut rng) < 300);
        }
    }
}
