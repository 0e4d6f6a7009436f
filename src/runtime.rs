//! Wires the components together and drives them.
//!
//! Two timer tasks (population churn, periodic chatter) plus a reactive loop
//! over inbound host events. Generation work is spawned off both, so neither
//! timer cadence ever waits on provider I/O.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use rand::Rng;
use tokio::time::{sleep, Duration};

use crate::chat_log::ChatLog;
use crate::completion::CompletionClient;
use crate::config::Config;
use crate::host::{Broadcaster, HostEvent, PresenceSink};
use crate::model_health::ModelHealth;
use crate::population::{Population, Roster};
use crate::scheduler::ChatScheduler;

pub struct Runtime {
    pub config: Arc<Config>,
    pub log: Arc<ChatLog>,
    pub population: Arc<Population>,
    scheduler: Option<Arc<ChatScheduler>>,
    real_participants: Mutex<HashSet<String>>,
}

impl Runtime {
    pub fn bootstrap(
        config: Config,
        presence: Arc<dyn PresenceSink>,
        broadcast: Arc<dyn Broadcaster>,
    ) -> Self {
        let mut config = config;
        if config.enable_chat && config.api_key.is_empty() {
            tracing::warn!("Chat is enabled but no API key is configured; disabling chat");
            config.enable_chat = false;
        }
        let config = Arc::new(config);

        let log = Arc::new(ChatLog::new());
        let population = Arc::new(Population::new(
            config.clone(),
            log.clone(),
            presence,
            broadcast.clone(),
        ));

        let scheduler = config.enable_chat.then(|| {
            let health = Arc::new(ModelHealth::new());
            let completion = Arc::new(CompletionClient::new(&config, health));
            Arc::new(ChatScheduler::new(
                config.clone(),
                log.clone(),
                population.clone(),
                completion,
                broadcast,
            ))
        });

        tracing::info!(
            "Runtime ready: {} configured occupants, budget {}, chat {}",
            config.occupants.len(),
            config.max_players,
            if scheduler.is_some() { "on" } else { "off" }
        );

        Self {
            config,
            log,
            population,
            scheduler,
            real_participants: Mutex::new(HashSet::new()),
        }
    }

    /// Run until the host event channel closes, then clear the roster.
    pub async fn run(self: Arc<Self>, events: flume::Receiver<HostEvent>) {
        let runtime = Arc::clone(&self);
        tokio::spawn(async move {
            loop {
                let delay_ms = rand::thread_rng().gen_range(3_000..12_000);
                sleep(Duration::from_millis(delay_ms)).await;
                runtime.population.tick(runtime.real_count()).await;
            }
        });

        if let Some(scheduler) = &self.scheduler {
            tokio::spawn(Arc::clone(scheduler).run_periodic());
        }

        while let Ok(event) = events.recv_async().await {
            self.handle_event(event).await;
        }

        tracing::info!("Host event channel closed; clearing the synthetic roster");
        self.population.shutdown().await;
    }

    async fn handle_event(&self, event: HostEvent) {
        match event {
            HostEvent::ParticipantJoined { name } => {
                self.lock_participants().insert(name.clone());
                self.log.append(format!("{} joined the session", name));
                self.population.sync_to_newcomer().await;
            }
            HostEvent::ParticipantLeft { name } => {
                self.lock_participants().remove(&name);
                self.log.append(format!("{} left the session", name));
            }
            HostEvent::Chat { sender, text } => match &self.scheduler {
                Some(scheduler) => scheduler.on_chat_message(&sender, &text),
                None => self.log.append(format!("<{}> {}", sender, text)),
            },
        }
    }

    /// Merged roster for list/ping-style display.
    pub fn roster(&self) -> Roster {
        let mut real: Vec<String> = self.lock_participants().iter().cloned().collect();
        real.sort();
        self.population.roster(&real)
    }

    fn real_count(&self) -> usize {
        self.lock_participants().len()
    }

    fn lock_participants(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.real_participants.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{LogBroadcast, LogPresence};

    fn runtime() -> Arc<Runtime> {
        let mut config = Config::default();
        config.max_players = 10;
        Arc::new(Runtime::bootstrap(
            config,
            Arc::new(LogPresence),
            Arc::new(LogBroadcast),
        ))
    }

    #[tokio::test]
    async fn join_and_leave_track_real_count_and_announce() {
        let rt = runtime();
        rt.handle_event(HostEvent::ParticipantJoined {
            name: "Ana".to_string(),
        })
        .await;
        assert_eq!(rt.real_count(), 1);

        rt.handle_event(HostEvent::ParticipantLeft {
            name: "Ana".to_string(),
        })
        .await;
        assert_eq!(rt.real_count(), 0);

        let snapshot = rt.log.snapshot();
        assert_eq!(snapshot[0], "Ana joined the session");
        assert_eq!(snapshot[1], "Ana left the session");
    }

    #[tokio::test]
    async fn chat_is_logged_even_with_chat_disabled() {
        let rt = runtime();
        rt.handle_event(HostEvent::Chat {
            sender: "Ana".to_string(),
            text: "anyone on?".to_string(),
        })
        .await;
        assert_eq!(rt.log.snapshot(), vec!["<Ana> anyone on?"]);
    }

    #[tokio::test]
    async fn enabling_chat_without_a_key_disables_it() {
        let mut config = Config::default();
        config.enable_chat = true;
        let rt = Runtime::bootstrap(config, Arc::new(LogPresence), Arc::new(LogBroadcast));
        assert!(rt.scheduler.is_none());
    }

    #[tokio::test]
    async fn roster_merges_real_and_fake() {
        let rt = runtime();
        rt.handle_event(HostEvent::ParticipantJoined {
            name: "Ana".to_string(),
        })
        .await;

        let roster = rt.roster();
        assert_eq!(roster.budget, 10);
        assert!(roster.names.contains(&"Ana".to_string()));
    }
}
