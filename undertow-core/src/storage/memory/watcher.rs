//! Background eviction driven by playback position events

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::buffer_pool::BufferPool;
use crate::position::{PositionBus, PositionEvent};

/// Lifecycle of a [`PositionWatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Running,
    Closed,
}

/// Task that applies the playback window of one torrent.
///
/// Subscribes to the shared [`PositionBus`] on construction and sweeps the
/// pool for every event carrying the pool's info hash. Missed events are
/// harmless: each sweep evaluates the whole window from scratch.
#[derive(Debug)]
pub struct PositionWatcher {
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PositionWatcher {
    /// Subscribes to `bus` and starts the watcher task on the current runtime.
    pub(crate) fn spawn(
        pool: Arc<BufferPool>,
        bus: &PositionBus,
        runtime: &tokio::runtime::Handle,
    ) -> Self {
        let receiver = bus.subscribe();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = runtime.spawn(run_watcher(pool, receiver, shutdown_rx));

        Self {
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
        }
    }

    pub fn state(&self) -> WatcherState {
        let running = self
            .task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished());

        if running && self.shutdown_tx.lock().is_some() {
            WatcherState::Running
        } else {
            WatcherState::Closed
        }
    }

    /// Signals the task to stop without waiting for it.
    ///
    /// Later calls are no-ops.
    pub fn close(&self) {
        if let Some(shutdown_tx) = self.shutdown_tx.lock().take() {
            let _ = shutdown_tx.send(());
        }
    }

    /// Signals the task to stop and waits until it has exited.
    pub async fn shutdown(&self) {
        self.close();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for PositionWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_watcher(
    pool: Arc<BufferPool>,
    mut receiver: broadcast::Receiver<PositionEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let info_hash = pool.info_hash();
    debug!("Position watcher started for torrent {}", info_hash);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown_rx => break,

            event = receiver.recv() => match event {
                Ok(event) if event.info_hash == info_hash => {
                    pool.apply_position_window(event.position, event.file_end());
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Position watcher for torrent {} skipped {} events",
                        info_hash, skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    info!("Position watcher stopped for torrent {}", info_hash);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::MemoryStorageConfig;
    use crate::storage::memory::CompletionTracker;
    use crate::torrent::{InfoHash, PieceIndex, TorrentLayout};

    const PIECE_LENGTH: u32 = 16384;
    const PIECE_COUNT: u64 = 1000;

    fn create_pool(hash: u8) -> Arc<BufferPool> {
        let layout = TorrentLayout::new(
            InfoHash::new([hash; 20]),
            PIECE_LENGTH,
            PIECE_COUNT * u64::from(PIECE_LENGTH),
        )
        .unwrap();
        let config = MemoryStorageConfig::with_memory_budget(1_048_576);
        let pool = BufferPool::new(layout, &config, Arc::new(CompletionTracker::new())).unwrap();
        Arc::new(pool)
    }

    fn event(hash: u8, position: u64) -> PositionEvent {
        PositionEvent {
            info_hash: InfoHash::new([hash; 20]),
            position,
            file_offset: 0,
            file_length: PIECE_COUNT * u64::from(PIECE_LENGTH),
        }
    }

    fn spawn_watcher(pool: &Arc<BufferPool>, bus: &PositionBus) -> PositionWatcher {
        PositionWatcher::spawn(pool.clone(), bus, &tokio::runtime::Handle::current())
    }

    async fn wait_for_eviction(pool: &BufferPool, index: PieceIndex) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while pool.lookup(index).is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("piece was not evicted");
    }

    #[tokio::test]
    async fn test_watcher_evicts_on_matching_event() {
        let bus = PositionBus::new(16);
        let pool = create_pool(1);
        let watcher = spawn_watcher(&pool, &bus);
        assert_eq!(watcher.state(), WatcherState::Running);

        pool.allocate(PieceIndex::new(0)).unwrap();
        pool.allocate(PieceIndex::new(130)).unwrap();

        bus.publish(event(1, 2_000_000));
        wait_for_eviction(&pool, PieceIndex::new(0)).await;

        assert!(pool.lookup(PieceIndex::new(130)).is_some());
        watcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_watcher_ignores_other_torrents() {
        let bus = PositionBus::new(16);
        let pool = create_pool(1);
        let watcher = spawn_watcher(&pool, &bus);

        pool.allocate(PieceIndex::new(0)).unwrap();
        pool.allocate(PieceIndex::new(500)).unwrap();

        bus.publish(event(2, 2_000_000));
        bus.publish(event(1, 0));

        // Events arrive in order, so once piece 500 is gone the foreign event was seen
        wait_for_eviction(&pool, PieceIndex::new(500)).await;
        assert!(pool.lookup(PieceIndex::new(0)).is_some());
        watcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_eviction() {
        let bus = PositionBus::new(16);
        let pool = create_pool(1);
        let watcher = spawn_watcher(&pool, &bus);

        watcher.close();
        watcher.close();
        assert_eq!(watcher.state(), WatcherState::Closed);
        watcher.shutdown().await;
        assert_eq!(bus.subscriber_count(), 0);

        pool.allocate(PieceIndex::new(0)).unwrap();
        bus.publish(event(1, 2_000_000));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(pool.lookup(PieceIndex::new(0)).is_some());
        assert_eq!(watcher.state(), WatcherState::Closed);
    }
}
