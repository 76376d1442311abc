//! Emergency episode record: one incident from trigger to terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::location::Location;
use crate::message::MessageBundle;
use crate::vitals::VitalsSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
    Triggered,
    CountingDown,
    Dialing,
    Completed,
    Cancelled,
}

impl EpisodeStatus {
    /// Terminal states keep the episode referenced only through the
    /// clearing grace window.
    pub fn is_terminal(self) -> bool {
        matches!(self, EpisodeStatus::Completed | EpisodeStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// Call initiated, outcome not yet known.
    Attempted,
    Completed,
    Failed,
}

/// One entry of the append-only `contacts_notified` log. Entries are
/// never removed or reordered within an episode, and each contact
/// appears at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactAttempt {
    pub contact_id: Uuid,
    pub name: String,
    pub phone: String,
    pub attempt_time: DateTime<Utc>,
    pub status: AttemptStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyEpisode {
    pub id: Uuid,
    pub start_time: DateTime<Utc>,
    /// Violation reasons that opened the episode, in evaluation order.
    pub reasons: Vec<String>,
    /// Vitals at trigger time.
    pub vitals: VitalsSnapshot,
    pub location: Option<Location>,
    pub status: EpisodeStatus,
    pub contacts_notified: Vec<ContactAttempt>,
    /// Seconds until auto-dial; non-increasing while counting down.
    pub countdown_seconds: u32,
    pub cancel_time: Option<DateTime<Utc>>,
    /// Bundle as dispatched, kept for the audit trail.
    pub bundle: Option<MessageBundle>,
}

impl EmergencyEpisode {
    pub fn new(reasons: Vec<String>, vitals: VitalsSnapshot, countdown_seconds: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            start_time: Utc::now(),
            reasons,
            vitals,
            location: None,
            status: EpisodeStatus::Triggered,
            contacts_notified: Vec::new(),
            countdown_seconds,
            cancel_time: None,
            bundle: None,
        }
    }
}
