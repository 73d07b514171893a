//! Torrent identifiers and piece geometry

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::storage::StorageError;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file.
/// Used to route position events to the storage of the matching torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Parses a 40-character hex string into an InfoHash.
    ///
    /// # Errors
    ///
    /// - `StorageError::InvalidInfoHash` - If the input is not 40 hex characters
    pub fn from_hex(input: &str) -> Result<Self, StorageError> {
        let mut hash = [0u8; 20];
        hex::decode_to_slice(input.trim(), &mut hash).map_err(|e| {
            StorageError::InvalidInfoHash {
                reason: format!("'{input}': {e}"),
            }
        })?;
        Ok(Self(hash))
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Zero-based index of a piece within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Piece geometry of a single torrent.
///
/// Every piece is `piece_length` bytes except the last one, which holds
/// whatever remains of `total_length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TorrentLayout {
    pub info_hash: InfoHash,
    pub piece_length: u32,
    pub total_length: u64,
}

impl TorrentLayout {
    /// Creates a layout after validating the piece length.
    ///
    /// # Errors
    ///
    /// - `StorageError::InvalidLayout` - If `piece_length` is zero or the
    ///   torrent has more pieces than a `u32` index can address
    pub fn new(
        info_hash: InfoHash,
        piece_length: u32,
        total_length: u64,
    ) -> Result<Self, StorageError> {
        if piece_length == 0 {
            return Err(StorageError::InvalidLayout {
                reason: "piece length must be greater than zero".to_string(),
            });
        }

        let piece_count = total_length.div_ceil(u64::from(piece_length));
        if u32::try_from(piece_count).is_err() {
            return Err(StorageError::InvalidLayout {
                reason: format!("{piece_count} pieces exceed the addressable piece count"),
            });
        }

        Ok(Self {
            info_hash,
            piece_length,
            total_length,
        })
    }

    /// Number of pieces needed to cover `total_length`.
    pub fn piece_count(&self) -> u32 {
        let count = self.total_length.div_ceil(u64::from(self.piece_length.max(1)));
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Checks whether `index` addresses a piece of this torrent.
    pub fn contains(&self, index: PieceIndex) -> bool {
        index.as_u32() < self.piece_count()
    }

    /// Absolute byte offset of the first byte of `index`.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        u64::from(index.as_u32()) * u64::from(self.piece_length)
    }

    /// Size in bytes of `index`, zero for indices outside the torrent.
    pub fn piece_size(&self, index: PieceIndex) -> usize {
        let offset = self.piece_offset(index);
        if offset >= self.total_length {
            return 0;
        }
        (self.total_length - offset).min(u64::from(self.piece_length)) as usize
    }
}
