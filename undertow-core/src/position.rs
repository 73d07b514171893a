//! Playback position notifications
//!
//! The playback layer publishes a [`PositionEvent`] whenever the read cursor
//! of a stream moves. Every open memory torrent subscribes independently and
//! filters events by its own info hash.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::torrent::InfoHash;

/// Read cursor update for one file of a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionEvent {
    pub info_hash: InfoHash,
    /// Absolute byte position of the cursor within the torrent
    pub position: u64,
    /// Absolute byte offset where the streamed file starts
    pub file_offset: u64,
    /// Length of the streamed file in bytes
    pub file_length: u64,
}

impl PositionEvent {
    /// Absolute byte offset one past the end of the streamed file.
    pub fn file_end(&self) -> u64 {
        self.file_offset.saturating_add(self.file_length)
    }
}

/// Process-wide position event stream.
///
/// Cloning the bus yields another handle to the same channel. Publishing
/// never blocks: subscribers that fall behind lose the oldest events, which
/// is harmless since each event re-describes the whole window.
#[derive(Debug, Clone)]
pub struct PositionBus {
    sender: broadcast::Sender<PositionEvent>,
}

impl PositionBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event to every current subscriber.
    ///
    /// Returns the number of subscribers that will see the event.
    pub fn publish(&self, event: PositionEvent) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                tracing::trace!(
                    "No subscribers for position {} of torrent {}",
                    event.position,
                    event.info_hash
                );
                0
            }
        }
    }

    /// Opens an independent subscription starting at the next published event.
    pub fn subscribe(&self) -> broadcast::Receiver<PositionEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for PositionBus {
    fn default() -> Self {
        Self::new(256)
    }
}
