//! Storage layer for torrent piece data.
//!
//! Defines the storage-backend contract the torrent engine talks to, and the
//! bounded in-memory implementation used while streaming.

pub mod memory;

pub use memory::{
    BufferPool, CompletionTracker, MemoryStorage, MemoryTorrent, PieceView, PoolStats,
    PositionWatcher, WatcherState,
};

use crate::torrent::{InfoHash, PieceIndex, TorrentLayout};

/// Entry point the engine calls once per torrent it opens.
pub trait StorageBackend: Send + Sync {
    /// Per-torrent handle returned by [`StorageBackend::open_torrent`].
    type Torrent: TorrentStorage;

    /// Prepares storage for a torrent with the given layout.
    ///
    /// # Errors
    ///
    /// - `StorageError::InvalidLayout` - If the layout cannot be stored
    /// - `StorageError::BudgetTooLarge` - If the memory budget cannot be sized into slots
    /// - `StorageError::AllocationFailed` - If the slots cannot be allocated
    /// - `StorageError::NoRuntime` - If background tasks cannot be started
    fn open_torrent(&self, layout: TorrentLayout) -> Result<Self::Torrent, StorageError>;
}

/// Storage of a single open torrent.
pub trait TorrentStorage: Send + Sync {
    /// Per-piece handle returned by [`TorrentStorage::piece`].
    type Piece: PieceStorage;

    /// Returns a handle for reading and writing `index`.
    ///
    /// # Errors
    ///
    /// - `StorageError::PieceOutOfRange` - If `index` is past the last piece
    fn piece(&self, index: PieceIndex) -> Result<Self::Piece, StorageError>;

    /// Releases the torrent's resources. Calling it more than once is allowed.
    ///
    /// # Errors
    ///
    /// Implementations may report failures releasing backing resources.
    fn close(&self) -> Result<(), StorageError>;
}

/// Byte access and completion state of one piece.
pub trait PieceStorage: Send + Sync {
    /// Copies bytes starting at `offset` into `buf`, returning the count copied.
    ///
    /// # Errors
    ///
    /// - `StorageError::NotReady` - If the piece holds no data yet
    /// - `StorageError::OffsetOutOfBounds` - If `offset` is past the piece end
    /// - `StorageError::Closed` - If the torrent was closed
    fn read_at(&self, buf: &mut [u8], offset: usize) -> Result<usize, StorageError>;

    /// Copies `buf` into the piece starting at `offset`, returning the count copied.
    ///
    /// # Errors
    ///
    /// - `StorageError::PoolExhausted` - If no slot is free; the data was dropped
    /// - `StorageError::NotReady` - If the piece kept losing its slot; the data was dropped
    /// - `StorageError::OffsetOutOfBounds` - If `offset` is past the piece end
    /// - `StorageError::Closed` - If the torrent was closed
    fn write_at(&self, buf: &[u8], offset: usize) -> Result<usize, StorageError>;

    /// Records that the piece is fully written and verified.
    ///
    /// # Errors
    ///
    /// - `StorageError::NotReady` - If the piece lost its data before being marked
    /// - `StorageError::Closed` - If the torrent was closed
    fn mark_complete(&self) -> Result<(), StorageError>;

    /// Clears the completion record of the piece.
    ///
    /// # Errors
    ///
    /// - `StorageError::Closed` - If the torrent was closed
    fn mark_not_complete(&self) -> Result<(), StorageError>;

    /// Checks whether the piece is recorded as complete.
    fn is_complete(&self) -> bool;
}

/// Errors that occur during storage operations.
///
/// `NotReady` and `PoolExhausted` are expected steady-state conditions while
/// streaming; callers retry them instead of treating them as failures.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Read of a piece that has no buffered data
    #[error("Piece {index} is not buffered yet")]
    NotReady {
        /// Index of the requested piece
        index: PieceIndex,
    },

    /// Every slot of the pool is assigned to another piece
    #[error("No free slot for piece {index}: all {capacity} slots in use")]
    PoolExhausted {
        /// Index of the piece whose write was dropped
        index: PieceIndex,
        /// Number of slots in the pool
        capacity: usize,
    },

    /// Piece index beyond the torrent's last piece
    #[error("Piece {index} out of range: torrent has {piece_count} pieces")]
    PieceOutOfRange {
        index: PieceIndex,
        piece_count: u32,
    },

    /// Offset past the end of the piece
    #[error("Offset {offset} is past the end of piece {index} ({length} bytes)")]
    OffsetOutOfBounds {
        index: PieceIndex,
        offset: usize,
        length: usize,
    },

    /// Torrent geometry the backend cannot hold
    #[error("Invalid torrent layout: {reason}")]
    InvalidLayout { reason: String },

    /// Malformed info hash text
    #[error("Invalid info hash: {reason}")]
    InvalidInfoHash { reason: String },

    /// Operation on a torrent after it was closed
    #[error("Storage for torrent {info_hash} is closed")]
    Closed { info_hash: InfoHash },

    /// Memory budget too large to be split into slots
    #[error("Memory budget of {budget} bytes cannot be split into {piece_length} byte slots")]
    BudgetTooLarge { budget: u64, piece_length: u32 },

    /// Eager allocation of the slot buffers failed
    #[error("Failed to allocate {capacity} slots of {piece_length} bytes")]
    AllocationFailed { capacity: usize, piece_length: u32 },

    /// Opening a torrent outside of a Tokio runtime
    #[error("No Tokio runtime available to run the position watcher")]
    NoRuntime,
}

impl StorageError {
    /// Checks whether the operation may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::NotReady { .. } | StorageError::PoolExhausted { .. }
        )
    }
}
