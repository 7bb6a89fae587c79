//! Unread notification counter.
//!
//! Counts incoming notification events newer than the last reset. The
//! count and the newest counted timestamp are persisted.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::store::{KeyValueStore, keys};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counter {
    count: u64,
    last_reset: Option<u64>,
}

pub struct NotificationState {
    store: Arc<dyn KeyValueStore>,
    counter: Mutex<Counter>,
}

impl NotificationState {
    /// Restore persisted state from `store`.
    pub fn load(store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let count = store
            .get(keys::NOTIFICATION_COUNT)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let last_reset = store
            .get(keys::LAST_NOTIFICATION_TIMESTAMP)?
            .and_then(|v| v.parse().ok());
        Ok(Self {
            store,
            counter: Mutex::new(Counter { count, last_reset }),
        })
    }

    pub fn count(&self) -> u64 {
        self.counter.lock().count
    }

    /// Timestamp the counter was last reset at (seconds).
    pub fn last_reset(&self) -> Option<u64> {
        self.counter.lock().last_reset
    }

    /// Count a notification created at `created_at` if it is newer than
    /// the last reset. Returns whether it was counted.
    pub fn record(&self, created_at: u64) -> Result<bool> {
        let count = {
            let mut counter = self.counter.lock();
            if counter.last_reset.is_some_and(|reset| created_at <= reset) {
                return Ok(false);
            }
            counter.count += 1;
            counter.count
        };
        self.persist(count, created_at)?;
        Ok(true)
    }

    /// Zero the counter as of `now`.
    pub fn reset(&self, now: u64) -> Result<()> {
        *self.counter.lock() = Counter {
            count: 0,
            last_reset: Some(now),
        };
        self.persist(0, now)
    }

    fn persist(&self, count: u64, timestamp: u64) -> Result<()> {
        self.store
            .set(keys::NOTIFICATION_COUNT, &count.to_string())?;
        self.store
            .set(keys::LAST_NOTIFICATION_TIMESTAMP, &timestamp.to_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_counts_everything_before_first_reset() {
        let state = NotificationState::load(Arc::new(MemoryStore::new())).unwrap();
        assert!(state.record(10).unwrap());
        assert!(state.record(5).unwrap());
        assert_eq!(state.count(), 2);
    }

    #[test]
    fn test_only_newer_than_reset_counted() {
        let state = NotificationState::load(Arc::new(MemoryStore::new())).unwrap();
        state.reset(1000).unwrap();
        assert!(!state.record(999).unwrap());
        assert!(!state.record(1000).unwrap());
        assert!(state.record(1001).unwrap());
        assert_eq!(state.count(), 1);
        assert_eq!(state.last_reset(), Some(1000));
    }

    #[test]
    fn test_state_survives_reload() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let state = NotificationState::load(Arc::clone(&store)).unwrap();
        state.reset(100).unwrap();
        state.record(150).unwrap();
        state.record(160).unwrap();

        let reloaded = NotificationState::load(store).unwrap();
        assert_eq!(reloaded.count(), 2);
        assert_eq!(reloaded.last_reset(), Some(160));
    }
}
