//! Bounded in-memory piece storage for streaming playback.
//!
//! Each open torrent gets a [`BufferPool`] of pre-allocated slots, one piece
//! long each. A [`PositionWatcher`] evicts pieces that drift out of the window
//! around the playback cursor, so memory use stays flat regardless of the
//! torrent's size. Writes that find no free slot are dropped rather than
//! spilled to disk.

mod buffer_pool;
mod completion;
mod factory;
mod piece_view;
mod watcher;

pub use buffer_pool::{BufferPool, PoolStats};
pub use completion::{CompletionKey, CompletionTracker};
pub use factory::{MemoryStorage, MemoryTorrent};
pub use piece_view::PieceView;
pub use watcher::{PositionWatcher, WatcherState};
