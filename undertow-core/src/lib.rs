//! Undertow Core - bounded in-memory piece storage for streaming playback
//!
//! This crate provides a storage backend for a BitTorrent engine that streams
//! content instead of downloading it to disk. Pieces live in a fixed pool of
//! pre-allocated slots, and a background watcher discards pieces that fall
//! outside a window around the current playback position.

pub mod config;
pub mod position;
pub mod storage;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::{MemoryStorageConfig, UndertowConfig};
pub use position::{PositionBus, PositionEvent};
pub use storage::{
    BufferPool, CompletionTracker, MemoryStorage, MemoryTorrent, PieceStorage, PieceView,
    PoolStats, PositionWatcher, StorageBackend, StorageError, TorrentStorage, WatcherState,
};
pub use torrent::{InfoHash, PieceIndex, TorrentLayout};

/// Errors that can bubble up from any Undertow subsystem.
#[derive(Debug, thiserror::Error)]
pub enum UndertowError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UndertowError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            UndertowError::Storage(e) => match e {
                StorageError::PoolExhausted { capacity, .. } => {
                    format!("Memory buffer full ({capacity} slots), increase the memory budget")
                }
                StorageError::InvalidInfoHash { reason } => format!("Invalid info hash: {reason}"),
                StorageError::InvalidLayout { reason } => format!("Invalid torrent layout: {reason}"),
                StorageError::BudgetTooLarge { budget, .. } => {
                    format!("Memory budget of {budget} bytes is too large, lower it")
                }
                StorageError::AllocationFailed { capacity, .. } => {
                    format!("Not enough memory for {capacity} piece slots, lower the memory budget")
                }
                _ => "Storage error occurred".to_string(),
            },
            UndertowError::Configuration { reason } => format!("Configuration error: {reason}"),
            UndertowError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if the failed operation can be retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UndertowError::Storage(e) if e.is_retryable())
    }
}

pub type Result<T> = std::result::Result<T, UndertowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_for_exhausted_pool() {
        let error = UndertowError::from(StorageError::PoolExhausted {
            index: PieceIndex::new(69),
            capacity: 69,
        });
        assert_eq!(
            error.user_message(),
            "Memory buffer full (69 slots), increase the memory budget"
        );
        assert!(error.is_retryable());
    }

    #[test]
    fn test_oversized_config_is_rejected() {
        let config = MemoryStorageConfig::with_memory_budget(u64::MAX);
        let error = config.validate().unwrap_err();
        assert!(matches!(error, UndertowError::Configuration { .. }));
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_configuration_error_not_retryable() {
        let error = UndertowError::Configuration {
            reason: "bad budget".to_string(),
        };
        assert!(!error.is_retryable());
        assert_eq!(error.user_message(), "Configuration error: bad budget");
    }
}
