//! Thread-safe record of fully written pieces

use std::collections::HashSet;

use parking_lot::Mutex;

use crate::torrent::{InfoHash, PieceIndex};

/// Identity of a piece across torrents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionKey {
    pub info_hash: InfoHash,
    pub index: PieceIndex,
}

impl CompletionKey {
    pub fn new(info_hash: InfoHash, index: PieceIndex) -> Self {
        Self { info_hash, index }
    }
}

#[derive(Debug, Default)]
struct CompletionState {
    complete: HashSet<CompletionKey>,
    closed: bool,
}

/// Set of pieces whose bytes are fully written and valid.
///
/// Nothing is persisted: a memory torrent starts empty on every open.
#[derive(Debug, Default)]
pub struct CompletionTracker {
    state: Mutex<CompletionState>,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks whether `key` is recorded as complete.
    pub fn get(&self, key: CompletionKey) -> bool {
        self.state.lock().complete.contains(&key)
    }

    /// Adds or removes `key`. Ignored once the tracker is closed.
    pub fn set(&self, key: CompletionKey, complete: bool) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }

        if complete {
            state.complete.insert(key);
        } else {
            state.complete.remove(&key);
        }
    }

    /// Number of complete pieces recorded for `info_hash`.
    pub fn completed_count(&self, info_hash: InfoHash) -> usize {
        self.state
            .lock()
            .complete
            .iter()
            .filter(|key| key.info_hash == info_hash)
            .count()
    }

    /// Drops every record and rejects further updates.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.complete.clear();
        state.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(hash: u8, index: u32) -> CompletionKey {
        CompletionKey::new(InfoHash::new([hash; 20]), PieceIndex::new(index))
    }

    #[test]
    fn test_set_and_get() {
        let tracker = CompletionTracker::new();
        assert!(!tracker.get(key(1, 0)));

        tracker.set(key(1, 0), true);
        assert!(tracker.get(key(1, 0)));
        assert!(!tracker.get(key(2, 0)));

        tracker.set(key(1, 0), false);
        assert!(!tracker.get(key(1, 0)));
    }

    #[test]
    fn test_completed_count_per_torrent() {
        let tracker = CompletionTracker::new();
        tracker.set(key(1, 0), true);
        tracker.set(key(1, 1), true);
        tracker.set(key(2, 0), true);

        assert_eq!(tracker.completed_count(InfoHash::new([1u8; 20])), 2);
        assert_eq!(tracker.completed_count(InfoHash::new([2u8; 20])), 1);
    }

    #[test]
    fn test_close_clears_and_ignores_updates() {
        let tracker = CompletionTracker::new();
        tracker.set(key(1, 5), true);

        tracker.close();
        tracker.close();
        assert!(!tracker.get(key(1, 5)));

        tracker.set(key(1, 6), true);
        assert!(!tracker.get(key(1, 6)));
    }
}
