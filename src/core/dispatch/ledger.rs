use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::core::message::MessageId;

#[derive(Debug, Default, Clone, Copy)]
struct Entry {
    claimed: bool,
    attempts: u32,
}

type Key = (String, MessageId);

/// In-memory record of messages this process has claimed for dispatch.
///
/// A claim is taken before the handling task is spawned, so two ticks (or a
/// tick and the trigger endpoint) can never both start the same message. It is
/// given back once the outcome is in the message log, which stays the authority
/// on whether a message still needs an answer. Failed messages keep their
/// attempt count until a human retry forgets them.
#[derive(Debug, Default)]
pub struct DispatchLedger {
    entries: Mutex<HashMap<Key, Entry>>,
}

impl DispatchLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Key, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claims `id`. Returns the attempt number (starting at 1), or `None` when
    /// the message is already claimed.
    pub fn try_claim(&self, project_id: &str, id: MessageId) -> Option<u32> {
        let mut entries = self.entries();
        let entry = entries.entry((project_id.to_string(), id)).or_default();
        if entry.claimed {
            return None;
        }
        entry.claimed = true;
        entry.attempts += 1;
        Some(entry.attempts)
    }

    /// Drops the claim but keeps the attempt count, so an automatic retry
    /// continues counting from where it left off.
    pub fn release_for_retry(&self, project_id: &str, id: MessageId) -> u32 {
        let mut entries = self.entries();
        match entries.get_mut(&(project_id.to_string(), id)) {
            Some(entry) => {
                entry.claimed = false;
                entry.attempts
            }
            None => 0,
        }
    }

    /// Forgets the message completely (human retry).
    pub fn release(&self, project_id: &str, id: MessageId) {
        self.entries().remove(&(project_id.to_string(), id));
    }

    pub fn contains(&self, project_id: &str, id: MessageId) -> bool {
        self.entries()
            .get(&(project_id.to_string(), id))
            .is_some_and(|entry| entry.claimed)
    }

    /// Dispatch attempts made so far, including a running one.
    pub fn attempts(&self, project_id: &str, id: MessageId) -> u32 {
        self.entries()
            .get(&(project_id.to_string(), id))
            .map_or(0, |entry| entry.attempts)
    }

    /// Number of currently claimed messages.
    pub fn len(&self) -> usize {
        self.entries().values().filter(|entry| entry.claimed).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets every message of one project (its chat was cleared).
    pub fn release_project(&self, project_id: &str) {
        self.entries().retain(|(project, _), _| project != project_id);
    }
}
