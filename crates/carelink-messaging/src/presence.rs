/// Ephemeral typing state for one conversation view.
///
/// Entries carry an expiry so a peer whose "typing" heartbeats stop is not
/// shown as perpetually typing. Expiry is driven by a single shared sweep
/// timer owned by the composer — one timer per conversation view, not one per
/// participant.
use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use carelink_types::TypingEntry;

pub struct TypingTracker {
    ttl: TimeDelta,
    entries: BTreeMap<Uuid, TypingEntry>,
}

impl TypingTracker {
    pub fn new(ttl: TimeDelta) -> Self {
        Self {
            ttl,
            entries: BTreeMap::new(),
        }
    }

    /// Upsert a participant's typing state. Returns true when the visible set
    /// of typing participants changed.
    pub fn set_typing(&mut self, participant_id: Uuid, is_typing: bool, now: DateTime<Utc>) -> bool {
        if is_typing {
            let was_typing = self.is_typing(participant_id, now);
            self.entries.insert(
                participant_id,
                TypingEntry {
                    is_typing: true,
                    expires_at: now + self.ttl,
                },
            );
            !was_typing
        } else {
            let was_typing = self.is_typing(participant_id, now);
            self.entries.remove(&participant_id);
            was_typing
        }
    }

    /// Remove expired entries. Idempotent and a cheap no-op when empty.
    /// Returns true when the visible set changed.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        self.entries.len() != before
    }

    /// Participants currently typing, in stable (sorted) order.
    pub fn typing_participants(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.is_typing && entry.expires_at > now)
            .map(|(id, _)| *id)
            .collect()
    }

    fn is_typing(&self, participant_id: Uuid, now: DateTime<Utc>) -> bool {
        self.entries
            .get(&participant_id)
            .is_some_and(|entry| entry.is_typing && entry.expires_at > now)
    }
}
