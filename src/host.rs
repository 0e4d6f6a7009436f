//! Seams to the host session.
//!
//! The presence/roster protocol and the chat broadcast transport live outside
//! this crate; they are consumed through the traits here. Inbound host
//! activity arrives as [`HostEvent`]s over a channel.

use async_trait::async_trait;
use uuid::Uuid;

/// Activity in the host session that the core reacts to.
#[derive(Debug, Clone)]
pub enum HostEvent {
    ParticipantJoined { name: String },
    ParticipantLeft { name: String },
    Chat { sender: String, text: String },
}

/// Roster entry handed to the presence protocol when an occupant is shown.
#[derive(Debug, Clone)]
pub struct PresenceEntry {
    pub name: String,
    pub session_id: Uuid,
    pub texture: String,
    pub signature: String,
    /// Simulated connection latency so the entry looks like a real client.
    pub latency_ms: u32,
}

/// The host's presence/roster protocol: show or hide a synthetic occupant
/// for every connected real participant.
#[async_trait]
pub trait PresenceSink: Send + Sync {
    async fn show(&self, entry: PresenceEntry);
    async fn hide(&self, session_id: Uuid);
}

/// The host's chat transport: deliver one rendered line to everyone.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn publish(&self, line: &str);
}

/// Presence sink that only logs, for running the service standalone.
pub struct LogPresence;

#[async_trait]
impl PresenceSink for LogPresence {
    async fn show(&self, entry: PresenceEntry) {
        tracing::info!(
            "Presence: show '{}' (session {}, {}ms)",
            entry.name,
            entry.session_id,
            entry.latency_ms
        );
    }

    async fn hide(&self, session_id: Uuid) {
        tracing::info!("Presence: hide session {}", session_id);
    }
}

/// Broadcaster that only logs, for running the service standalone.
pub struct LogBroadcast;

#[async_trait]
impl Broadcaster for LogBroadcast {
    async fn publish(&self, line: &str) {
        tracing::info!("Broadcast: {}", line);
    }
}
