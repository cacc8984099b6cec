//! Bounded in-memory cache of ingestion statuses

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use uuid::Uuid;

use crate::domain::IngestionStatus;

#[derive(Debug)]
struct Entries {
    statuses: HashMap<Uuid, IngestionStatus>,
    order: VecDeque<Uuid>,
}

/// Recent episode statuses, oldest terminal entries evicted first.
/// Pending entries are never evicted.
#[derive(Debug)]
pub struct StatusTracker {
    capacity: usize,
    entries: Mutex<Entries>,
}

impl StatusTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(Entries {
                statuses: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Mark an episode pending; false if it already was
    pub fn mark_pending(&self, episode_id: Uuid) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.statuses.get(&episode_id) == Some(&IngestionStatus::Pending) {
            return false;
        }
        Self::insert(&mut entries, self.capacity, episode_id, IngestionStatus::Pending);
        true
    }

    pub fn record(&self, episode_id: Uuid, status: IngestionStatus) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Self::insert(&mut entries, self.capacity, episode_id, status);
    }

    pub fn get(&self, episode_id: Uuid) -> Option<IngestionStatus> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .statuses
            .get(&episode_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .statuses
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(entries: &mut Entries, capacity: usize, episode_id: Uuid, status: IngestionStatus) {
        if entries.statuses.insert(episode_id, status).is_none() {
            entries.order.push_back(episode_id);
        }

        let mut scanned = 0;
        while entries.statuses.len() > capacity && scanned < entries.order.len() {
            let Some(oldest) = entries.order.pop_front() else {
                break;
            };
            if entries.statuses.get(&oldest) == Some(&IngestionStatus::Pending) {
                entries.order.push_back(oldest);
                scanned += 1;
            } else {
                entries.statuses.remove(&oldest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_dedup() {
        let tracker = StatusTracker::new(10);
        let id = Uuid::new_v4();

        assert!(tracker.mark_pending(id));
        assert!(!tracker.mark_pending(id));

        tracker.record(id, IngestionStatus::CommittedFull);
        assert_eq!(tracker.get(id), Some(IngestionStatus::CommittedFull));
        assert!(tracker.mark_pending(id));
    }

    #[test]
    fn test_evicts_oldest_terminal_first() {
        let tracker = StatusTracker::new(2);
        let pending = Uuid::new_v4();
        let done = Uuid::new_v4();
        let newest = Uuid::new_v4();

        tracker.mark_pending(pending);
        tracker.record(done, IngestionStatus::CommittedFull);
        tracker.record(newest, IngestionStatus::CommittedFull);

        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.get(pending), Some(IngestionStatus::Pending));
        assert_eq!(tracker.get(done), None);
        assert!(tracker.get(newest).is_some());
    }

    #[test]
    fn test_all_pending_may_exceed_capacity() {
        let tracker = StatusTracker::new(1);
        tracker.mark_pending(Uuid::new_v4());
        tracker.mark_pending(Uuid::new_v4());
        assert_eq!(tracker.len(), 2);
    }
}
