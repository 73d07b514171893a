//! Memory storage backend and per-torrent handles

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use super::buffer_pool::{BufferPool, PoolStats};
use super::completion::CompletionTracker;
use super::piece_view::PieceView;
use super::watcher::{PositionWatcher, WatcherState};
use crate::config::MemoryStorageConfig;
use crate::position::PositionBus;
use crate::storage::{StorageBackend, StorageError, TorrentStorage};
use crate::torrent::{InfoHash, PieceIndex, TorrentLayout};

/// Storage backend keeping piece data in bounded memory.
///
/// One instance serves every torrent of the process; all of them listen on
/// the same [`PositionBus`].
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    config: MemoryStorageConfig,
    positions: PositionBus,
}

impl MemoryStorage {
    pub fn new(config: MemoryStorageConfig, positions: PositionBus) -> Self {
        Self { config, positions }
    }

    /// Creates a backend with its own position bus sized from `config`.
    pub fn with_config(config: MemoryStorageConfig) -> Self {
        let positions = PositionBus::new(config.position_channel_capacity);
        Self::new(config, positions)
    }

    pub fn config(&self) -> &MemoryStorageConfig {
        &self.config
    }

    /// Bus the playback layer publishes cursor moves on.
    pub fn positions(&self) -> &PositionBus {
        &self.positions
    }
}

impl StorageBackend for MemoryStorage {
    type Torrent = MemoryTorrent;

    /// Allocates the torrent's whole pool up front and starts its watcher.
    ///
    /// Must be called from within a Tokio runtime.
    fn open_torrent(&self, layout: TorrentLayout) -> Result<MemoryTorrent, StorageError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| StorageError::NoRuntime)?;

        if layout.piece_length == 0 {
            return Err(StorageError::InvalidLayout {
                reason: "piece length must be greater than zero".to_string(),
            });
        }

        let completion = Arc::new(CompletionTracker::new());
        let pool = Arc::new(BufferPool::new(layout, &self.config, completion.clone())?);
        let watcher = PositionWatcher::spawn(pool.clone(), &self.positions, &runtime);

        info!(
            "Opened memory storage for torrent {}: {} pieces of {} bytes, {} slots",
            layout.info_hash,
            layout.piece_count(),
            layout.piece_length,
            pool.capacity()
        );

        Ok(MemoryTorrent {
            pool,
            completion,
            watcher,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// Memory storage of one open torrent.
///
/// Dropping the handle closes it. Slots are freed once the last
/// [`PieceView`] handed out for this torrent is dropped as well.
#[derive(Debug)]
pub struct MemoryTorrent {
    pool: Arc<BufferPool>,
    completion: Arc<CompletionTracker>,
    watcher: PositionWatcher,
    closed: Arc<AtomicBool>,
}

impl MemoryTorrent {
    pub fn info_hash(&self) -> InfoHash {
        self.pool.info_hash()
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn watcher_state(&self) -> WatcherState {
        self.watcher.state()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the torrent and waits for its watcher task to exit.
    ///
    /// # Errors
    ///
    /// Same as [`TorrentStorage::close`].
    pub async fn shutdown(&self) -> Result<(), StorageError> {
        self.close()?;
        self.watcher.shutdown().await;
        Ok(())
    }
}

impl TorrentStorage for MemoryTorrent {
    type Piece = PieceView;

    fn piece(&self, index: PieceIndex) -> Result<PieceView, StorageError> {
        if self.is_closed() {
            return Err(StorageError::Closed {
                info_hash: self.info_hash(),
            });
        }

        let layout = self.pool.layout();
        if !layout.contains(index) {
            return Err(StorageError::PieceOutOfRange {
                index,
                piece_count: layout.piece_count(),
            });
        }

        Ok(PieceView::new(
            self.pool.clone(),
            self.closed.clone(),
            index,
            layout.piece_size(index),
        ))
    }

    fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.watcher.close();
        let released = self.pool.evict_all();
        self.completion.close();

        info!(
            "Closed memory storage for torrent {} ({} pieces released)",
            self.info_hash(),
            released
        );
        Ok(())
    }
}

impl Drop for MemoryTorrent {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
