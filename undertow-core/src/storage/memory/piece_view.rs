//! Per-piece byte access into the buffer pool

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, trace, warn};

use super::buffer_pool::BufferPool;
use crate::storage::{PieceStorage, StorageError};
use crate::torrent::PieceIndex;

/// Attempts to re-resolve a slot that changed hands mid-write.
const WRITE_ATTEMPTS: usize = 3;

/// Handle to one piece of a memory torrent.
///
/// Holds no slot itself: every read and write resolves the slot again, since
/// the watcher may evict the piece between two calls. Copies are truncated
/// at the end of the piece and report the number of bytes moved.
#[derive(Debug, Clone)]
pub struct PieceView {
    pool: Arc<BufferPool>,
    closed: Arc<AtomicBool>,
    index: PieceIndex,
    length: usize,
}

impl PieceView {
    pub(crate) fn new(
        pool: Arc<BufferPool>,
        closed: Arc<AtomicBool>,
        index: PieceIndex,
        length: usize,
    ) -> Self {
        Self {
            pool,
            closed,
            index,
            length,
        }
    }

    pub fn index(&self) -> PieceIndex {
        self.index
    }

    /// Size of the piece in bytes; shorter than the slot for the last piece.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed {
                info_hash: self.pool.info_hash(),
            });
        }
        Ok(())
    }

    fn check_offset(&self, offset: usize) -> Result<(), StorageError> {
        if offset > self.length {
            return Err(StorageError::OffsetOutOfBounds {
                index: self.index,
                offset,
                length: self.length,
            });
        }
        Ok(())
    }
}

impl PieceStorage for PieceView {
    fn read_at(&self, buf: &mut [u8], offset: usize) -> Result<usize, StorageError> {
        self.ensure_open()?;
        self.check_offset(offset)?;

        let not_ready = || StorageError::NotReady { index: self.index };
        let slot = self.pool.lookup(self.index).ok_or_else(not_ready)?;
        let bytes = self
            .pool
            .slot_bytes(slot, self.index)
            .ok_or_else(not_ready)?;

        let available = &bytes[offset..self.length];
        let copied = buf.len().min(available.len());
        buf[..copied].copy_from_slice(&available[..copied]);

        trace!(
            "Read {} bytes at offset {} of piece {} from slot {}",
            copied, offset, self.index, slot
        );
        Ok(copied)
    }

    fn write_at(&self, buf: &[u8], offset: usize) -> Result<usize, StorageError> {
        self.ensure_open()?;
        self.check_offset(offset)?;

        let mut exhausted = false;
        for _ in 0..WRITE_ATTEMPTS {
            let Some(slot) = self.pool.allocate(self.index) else {
                exhausted = true;
                break;
            };

            // The slot may have been evicted and handed to another piece
            // between allocate() and taking its lock.
            let Some(mut bytes) = self.pool.slot_bytes_mut(slot, self.index) else {
                continue;
            };

            let target = &mut bytes[offset..self.length];
            let copied = buf.len().min(target.len());
            target[..copied].copy_from_slice(&buf[..copied]);

            trace!(
                "Wrote {} bytes at offset {} of piece {} into slot {}",
                copied, offset, self.index, slot
            );
            return Ok(copied);
        }

        if !exhausted {
            debug!(
                "Dropped {} byte write to piece {} of torrent {}: evicted {} times in a row",
                buf.len(),
                self.index,
                self.pool.info_hash(),
                WRITE_ATTEMPTS
            );
            return Err(StorageError::NotReady { index: self.index });
        }

        let capacity = self.pool.capacity();
        warn!(
            "Dropped {} byte write to piece {} of torrent {}: all {} slots in use",
            buf.len(),
            self.index,
            self.pool.info_hash(),
            capacity
        );
        Err(StorageError::PoolExhausted {
            index: self.index,
            capacity,
        })
    }

    fn mark_complete(&self) -> Result<(), StorageError> {
        self.ensure_open()?;
        // An eviction since the last write leaves nothing to mark
        if !self.pool.set_complete(self.index, true) {
            return Err(StorageError::NotReady { index: self.index });
        }
        Ok(())
    }

    fn mark_not_complete(&self) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.pool.set_complete(self.index, false);
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.pool.is_complete(self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryStorageConfig;
    use crate::storage::memory::CompletionTracker;
    use crate::torrent::{InfoHash, TorrentLayout};

    const PIECE_LENGTH: u32 = 1024;

    fn create_pool(max_memory_bytes: u64, total_length: u64) -> Arc<BufferPool> {
        let layout =
            TorrentLayout::new(InfoHash::new([3u8; 20]), PIECE_LENGTH, total_length).unwrap();
        let config = MemoryStorageConfig::with_memory_budget(max_memory_bytes);
        let pool = BufferPool::new(layout, &config, Arc::new(CompletionTracker::new())).unwrap();
        Arc::new(pool)
    }

    fn view(pool: &Arc<BufferPool>, index: u32) -> PieceView {
        let index = PieceIndex::new(index);
        let length = pool.layout().piece_size(index);
        PieceView::new(pool.clone(), Arc::new(AtomicBool::new(false)), index, length)
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let pool = create_pool(8192, 64 * 1024);
        let piece = view(&pool, 2);
        let data: Vec<u8> = (0..PIECE_LENGTH).map(|i| (i % 251) as u8).collect();

        assert_eq!(piece.write_at(&data, 0).unwrap(), data.len());

        let mut out = vec![0u8; data.len()];
        assert_eq!(piece.read_at(&mut out, 0).unwrap(), data.len());
        assert_eq!(out, data);
    }

    #[test]
    fn test_read_unassigned_piece_is_not_ready() {
        let pool = create_pool(8192, 64 * 1024);
        let piece = view(&pool, 5);
        let mut out = [0u8; 16];

        let result = piece.read_at(&mut out, 0);
        assert!(matches!(result, Err(StorageError::NotReady { index }) if index.as_u32() == 5));
        assert_eq!(pool.assigned_count(), 0);
    }

    #[test]
    fn test_copies_truncate_at_piece_end() {
        let pool = create_pool(8192, 64 * 1024);
        let piece = view(&pool, 0);

        assert_eq!(piece.write_at(&[7u8; 100], 1000).unwrap(), 24);

        let mut out = [0u8; 100];
        assert_eq!(piece.read_at(&mut out, 1000).unwrap(), 24);
        assert!(out[..24].iter().all(|&b| b == 7));
        assert!(out[24..].iter().all(|&b| b == 0));

        assert_eq!(piece.read_at(&mut out, 1024).unwrap(), 0);
        assert!(matches!(
            piece.read_at(&mut out, 1025),
            Err(StorageError::OffsetOutOfBounds { offset: 1025, .. })
        ));
    }

    #[test]
    fn test_last_piece_is_shorter_than_slot() {
        let pool = create_pool(8192, 2 * 1024 + 300);
        let piece = view(&pool, 2);
        assert_eq!(piece.len(), 300);

        assert_eq!(piece.write_at(&[1u8; 1024], 0).unwrap(), 300);

        let mut out = [0u8; 1024];
        assert_eq!(piece.read_at(&mut out, 0).unwrap(), 300);
    }

    #[test]
    fn test_write_fails_when_pool_exhausted() {
        let pool = create_pool(0, 64 * 1024);
        for index in 0..pool.capacity() as u32 {
            view(&pool, index).write_at(&[1u8; 8], 0).unwrap();
        }

        let result = view(&pool, 40).write_at(&[1u8; 8], 0);
        assert!(matches!(
            result,
            Err(StorageError::PoolExhausted { capacity: 5, .. })
        ));
        assert_eq!(pool.stats().exhausted_writes, 1);
    }

    #[test]
    fn test_completion_does_not_touch_assignment() {
        let pool = create_pool(8192, 64 * 1024);
        let piece = view(&pool, 1);
        piece.write_at(&[1u8; 8], 0).unwrap();
        let slot = pool.lookup(PieceIndex::new(1));

        piece.mark_complete().unwrap();
        assert!(piece.is_complete());
        assert_eq!(pool.lookup(PieceIndex::new(1)), slot);

        piece.mark_not_complete().unwrap();
        assert!(!piece.is_complete());
        assert_eq!(pool.lookup(PieceIndex::new(1)), slot);
    }

    #[test]
    fn test_mark_complete_without_data_is_not_ready() {
        let pool = create_pool(8192, 64 * 1024);
        let piece = view(&pool, 1);

        assert!(matches!(
            piece.mark_complete(),
            Err(StorageError::NotReady { .. })
        ));
        assert!(!piece.is_complete());
        assert!(piece.mark_not_complete().is_ok());
    }

    #[test]
    fn test_mark_complete_after_eviction_is_not_ready() {
        let pool = create_pool(8192, 64 * 1024);
        let piece = view(&pool, 3);
        let data = [5u8; 64];

        piece.write_at(&data, 0).unwrap();
        let mut out = [0u8; 64];
        assert_eq!(piece.read_at(&mut out, 0).unwrap(), 64);
        assert!(pool.evict(PieceIndex::new(3)));

        let result = piece.mark_complete();
        assert!(matches!(result, Err(StorageError::NotReady { .. })));
        assert!(result.unwrap_err().is_retryable());
        assert!(!piece.is_complete());
        assert!(matches!(
            piece.read_at(&mut out, 0),
            Err(StorageError::NotReady { .. })
        ));

        // Downloading the piece again makes it completable
        piece.write_at(&data, 0).unwrap();
        piece.mark_complete().unwrap();
        assert!(piece.is_complete());
    }

    #[test]
    fn test_closed_view_rejects_operations() {
        let pool = create_pool(8192, 64 * 1024);
        let closed = Arc::new(AtomicBool::new(false));
        let piece = PieceView::new(pool.clone(), closed.clone(), PieceIndex::new(0), 1024);

        closed.store(true, Ordering::Release);

        assert!(matches!(
            piece.write_at(&[0u8; 4], 0),
            Err(StorageError::Closed { .. })
        ));
        assert!(matches!(
            piece.mark_complete(),
            Err(StorageError::Closed { .. })
        ));
    }
}
