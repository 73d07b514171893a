//! Fixed-capacity slot pool with playback-window eviction

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, Mutex, RwLock, RwLockReadGuard,
    RwLockWriteGuard,
};
use serde::Serialize;
use tracing::{debug, info};

use super::completion::{CompletionKey, CompletionTracker};
use crate::config::{MAX_MEMORY_BUDGET_BYTES, MemoryStorageConfig};
use crate::storage::StorageError;
use crate::torrent::{InfoHash, PieceIndex, TorrentLayout};

/// One pre-allocated piece buffer.
///
/// `owner` mirrors the assignment map so a handle that resolved the slot
/// before an eviction can detect the slot changed hands.
#[derive(Debug)]
struct Slot {
    owner: Option<PieceIndex>,
    bytes: Box<[u8]>,
}

/// Bidirectional piece/slot mapping plus the free list.
#[derive(Debug)]
struct Assignments {
    piece_to_slot: HashMap<PieceIndex, usize>,
    slot_to_piece: Vec<Option<PieceIndex>>,
    free: BTreeSet<usize>,
}

/// Point-in-time view of pool occupancy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub piece_length: u32,
    pub capacity: usize,
    pub assigned: usize,
    pub completed: usize,
    pub evictions: u64,
    pub exhausted_writes: u64,
}

/// Buffer pool of a single torrent.
///
/// Holds `capacity` slots of `piece_length` bytes, all allocated up front.
/// Map changes are serialized by one mutex; byte copies only take the lock
/// of the slot being touched, so pieces are read and written in parallel.
#[derive(Debug)]
pub struct BufferPool {
    layout: TorrentLayout,
    max_memory_bytes: u64,
    tail_guard_bytes: u64,
    slots: Box<[RwLock<Slot>]>,
    assignments: Mutex<Assignments>,
    completion: Arc<CompletionTracker>,
    evictions: AtomicU64,
    exhausted_writes: AtomicU64,
}

impl BufferPool {
    /// Creates a pool sized for `layout` and eagerly allocates every slot.
    ///
    /// # Errors
    ///
    /// - `StorageError::BudgetTooLarge` - If the budget cannot be counted in slots
    /// - `StorageError::AllocationFailed` - If the allocator refuses the slot memory
    pub fn new(
        layout: TorrentLayout,
        config: &MemoryStorageConfig,
        completion: Arc<CompletionTracker>,
    ) -> Result<Self, StorageError> {
        let too_large = || StorageError::BudgetTooLarge {
            budget: config.max_memory_bytes,
            piece_length: layout.piece_length,
        };
        if config.max_memory_bytes > MAX_MEMORY_BUDGET_BYTES {
            return Err(too_large());
        }
        let capacity = config
            .pool_capacity(layout.piece_length)
            .ok_or_else(too_large)?;
        let slots = allocate_slots(capacity, layout.piece_length)?;

        info!(
            "Allocated {} slots of {} bytes for torrent {}",
            capacity, layout.piece_length, layout.info_hash
        );

        Ok(Self {
            layout,
            max_memory_bytes: config.max_memory_bytes,
            tail_guard_bytes: config.tail_guard_bytes,
            slots,
            assignments: Mutex::new(Assignments {
                piece_to_slot: HashMap::with_capacity(capacity),
                slot_to_piece: vec![None; capacity],
                free: (0..capacity).collect(),
            }),
            completion,
            evictions: AtomicU64::new(0),
            exhausted_writes: AtomicU64::new(0),
        })
    }

    pub fn info_hash(&self) -> InfoHash {
        self.layout.info_hash
    }

    pub fn layout(&self) -> &TorrentLayout {
        &self.layout
    }

    pub fn piece_length(&self) -> u32 {
        self.layout.piece_length
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots currently assigned to a piece.
    pub fn assigned_count(&self) -> usize {
        self.assignments.lock().piece_to_slot.len()
    }

    /// Returns the slot of `index`, assigning the lowest free slot if needed.
    ///
    /// Returns `None` when every slot belongs to another piece. Never blocks
    /// waiting for a slot to free up.
    pub fn allocate(&self, index: PieceIndex) -> Option<usize> {
        let mut assignments = self.assignments.lock();
        if let Some(&slot) = assignments.piece_to_slot.get(&index) {
            return Some(slot);
        }

        let Some(slot) = assignments.free.pop_first() else {
            self.exhausted_writes.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        assignments.piece_to_slot.insert(index, slot);
        assignments.slot_to_piece[slot] = Some(index);
        self.slots[slot].write().owner = Some(index);

        debug!(
            "Assigned slot {} to piece {} of torrent {} ({}/{} in use)",
            slot,
            index,
            self.layout.info_hash,
            assignments.piece_to_slot.len(),
            self.slots.len()
        );

        Some(slot)
    }

    /// Returns the slot of `index` without assigning one.
    pub fn lookup(&self, index: PieceIndex) -> Option<usize> {
        self.assignments.lock().piece_to_slot.get(&index).copied()
    }

    /// Releases the slot of `index` and clears its completion record.
    ///
    /// Returns false if the piece had no slot.
    pub fn evict(&self, index: PieceIndex) -> bool {
        let mut assignments = self.assignments.lock();
        self.evict_locked(&mut assignments, index)
    }

    /// Releases every assigned slot.
    pub fn evict_all(&self) -> usize {
        let mut assignments = self.assignments.lock();
        let pieces: Vec<PieceIndex> = assignments.piece_to_slot.keys().copied().collect();

        pieces
            .into_iter()
            .filter(|&index| self.evict_locked(&mut assignments, index))
            .count()
    }

    /// Evicts pieces outside the window around `position`.
    ///
    /// A piece survives while its first byte lies within two pieces behind
    /// the cursor and the memory budget plus one piece ahead of it. Nothing
    /// is evicted when the cursor is within the tail guard of `file_end`, so
    /// the end of a file stays buffered while playback finishes. Returns the
    /// number of evicted pieces.
    pub fn apply_position_window(&self, position: u64, file_end: u64) -> usize {
        if position.saturating_add(self.tail_guard_bytes) >= file_end {
            debug!(
                "Position {} within tail guard of file end {} for torrent {}, skipping sweep",
                position, file_end, self.layout.info_hash
            );
            return 0;
        }

        let piece_length = u64::from(self.layout.piece_length);
        let lower = position.saturating_sub(2 * piece_length);
        let upper = position
            .saturating_add(self.max_memory_bytes)
            .saturating_add(piece_length);

        let mut assignments = self.assignments.lock();
        let stale: Vec<PieceIndex> = assignments
            .piece_to_slot
            .keys()
            .copied()
            .filter(|&index| {
                let offset = self.layout.piece_offset(index);
                offset < lower || offset > upper
            })
            .collect();

        let evicted = stale
            .into_iter()
            .filter(|&index| self.evict_locked(&mut assignments, index))
            .count();

        if evicted > 0 {
            debug!(
                "Evicted {} pieces outside {}..={} for torrent {} ({} remain)",
                evicted,
                lower,
                upper,
                self.layout.info_hash,
                assignments.piece_to_slot.len()
            );
        }

        evicted
    }

    pub fn is_complete(&self, index: PieceIndex) -> bool {
        self.completion.get(self.completion_key(index))
    }

    /// Records the completion state of `index`.
    ///
    /// Runs under the assignment lock so it cannot interleave with an
    /// eviction. Marking a piece without a slot complete is refused and
    /// returns false; clearing always succeeds.
    pub fn set_complete(&self, index: PieceIndex, complete: bool) -> bool {
        let assignments = self.assignments.lock();
        if complete && !assignments.piece_to_slot.contains_key(&index) {
            return false;
        }
        self.completion.set(self.completion_key(index), complete);
        true
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            piece_length: self.layout.piece_length,
            capacity: self.slots.len(),
            assigned: self.assigned_count(),
            completed: self.completion.completed_count(self.layout.info_hash),
            evictions: self.evictions.load(Ordering::Relaxed),
            exhausted_writes: self.exhausted_writes.load(Ordering::Relaxed),
        }
    }

    /// Locks `slot` for reading if it still belongs to `index`.
    pub(crate) fn slot_bytes(
        &self,
        slot: usize,
        index: PieceIndex,
    ) -> Option<MappedRwLockReadGuard<'_, [u8]>> {
        let guard = self.slots.get(slot)?.read();
        RwLockReadGuard::try_map(guard, |slot| {
            (slot.owner == Some(index)).then_some(&slot.bytes[..])
        })
        .ok()
    }

    /// Locks `slot` for writing if it still belongs to `index`.
    pub(crate) fn slot_bytes_mut(
        &self,
        slot: usize,
        index: PieceIndex,
    ) -> Option<MappedRwLockWriteGuard<'_, [u8]>> {
        let guard = self.slots.get(slot)?.write();
        RwLockWriteGuard::try_map(guard, |slot| {
            if slot.owner == Some(index) {
                Some(&mut slot.bytes[..])
            } else {
                None
            }
        })
        .ok()
    }

    fn evict_locked(&self, assignments: &mut Assignments, index: PieceIndex) -> bool {
        let Some(slot) = assignments.piece_to_slot.remove(&index) else {
            return false;
        };

        assignments.slot_to_piece[slot] = None;
        assignments.free.insert(slot);

        {
            let mut slot_guard = self.slots[slot].write();
            slot_guard.owner = None;
            slot_guard.bytes.fill(0);
        }

        self.completion.set(self.completion_key(index), false);
        self.evictions.fetch_add(1, Ordering::Relaxed);

        debug!(
            "Evicted piece {} from slot {} of torrent {}",
            index, slot, self.layout.info_hash
        );

        true
    }

    fn completion_key(&self, index: PieceIndex) -> CompletionKey {
        CompletionKey::new(self.layout.info_hash, index)
    }
}

/// Allocates zeroed slots, reporting allocator refusal instead of aborting.
fn allocate_slots(
    capacity: usize,
    piece_length: u32,
) -> Result<Box<[RwLock<Slot>]>, StorageError> {
    let failed = || StorageError::AllocationFailed {
        capacity,
        piece_length,
    };

    let mut slots = Vec::new();
    slots.try_reserve_exact(capacity).map_err(|_| failed())?;
    for _ in 0..capacity {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(piece_length as usize)
            .map_err(|_| failed())?;
        bytes.resize(piece_length as usize, 0);
        slots.push(RwLock::new(Slot {
            owner: None,
            bytes: bytes.into_boxed_slice(),
        }));
    }

    Ok(slots.into_boxed_slice())
}
