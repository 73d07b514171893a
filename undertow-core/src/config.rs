//! Centralized configuration for Undertow.
//!
//! All tunable parameters of the memory storage are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use crate::{Result, UndertowError};

/// Largest accepted per-torrent memory budget (64 GiB).
pub const MAX_MEMORY_BUDGET_BYTES: u64 = 64 * 1024 * 1024 * 1024;

/// Central configuration for all Undertow components.
///
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct UndertowConfig {
    pub storage: MemoryStorageConfig,
}

/// Memory storage sizing and eviction configuration.
///
/// Controls how much piece data is held in memory per torrent and how the
/// playback window around the read cursor is shaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryStorageConfig {
    /// Memory budget for buffered piece data per torrent
    pub max_memory_bytes: u64,
    /// Distance from the end of a file within which no eviction happens
    pub tail_guard_bytes: u64,
    /// Buffered position events per subscriber before old ones are dropped
    pub position_channel_capacity: usize,
}

impl Default for MemoryStorageConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 100 * 1024 * 1024, // 100 MiB
            tail_guard_bytes: 5 * 1024 * 1024,   // 5 MiB
            position_channel_capacity: 256,
        }
    }
}

impl MemoryStorageConfig {
    /// Creates a configuration with the given memory budget.
    pub fn with_memory_budget(max_memory_bytes: u64) -> Self {
        Self {
            max_memory_bytes,
            ..Default::default()
        }
    }

    /// Number of slots pre-allocated per torrent for `piece_length`.
    ///
    /// Covers the budget plus four pieces of slack: two behind the cursor,
    /// one ahead of the budget and one in flight. Returns `None` when the
    /// budget is too large to be counted in slots.
    pub fn pool_capacity(&self, piece_length: u32) -> Option<usize> {
        let piece_length = u64::from(piece_length.max(1));
        let slots = self
            .max_memory_bytes
            .checked_add(piece_length.checked_mul(4)?)?
            / piece_length;
        usize::try_from(slots.checked_add(1)?).ok()
    }

    /// Checks that the configuration can back a torrent.
    ///
    /// # Errors
    ///
    /// - `UndertowError::Configuration` - If the budget exceeds
    ///   [`MAX_MEMORY_BUDGET_BYTES`] or the channel capacity is zero
    pub fn validate(&self) -> Result<()> {
        if self.max_memory_bytes > MAX_MEMORY_BUDGET_BYTES {
            return Err(UndertowError::Configuration {
                reason: format!(
                    "memory budget of {} bytes exceeds the maximum of {} bytes",
                    self.max_memory_bytes, MAX_MEMORY_BUDGET_BYTES
                ),
            });
        }

        if self.position_channel_capacity == 0 {
            return Err(UndertowError::Configuration {
                reason: "position channel capacity must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}

impl UndertowConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Values that do not parse are ignored and the default is kept.
    ///
    /// # Errors
    ///
    /// - `UndertowError::Configuration` - If the resulting configuration is invalid
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(size) = std::env::var("UNDERTOW_MEMORY_SIZE") {
            if let Ok(bytes) = size.parse::<u64>() {
                config.storage.max_memory_bytes = bytes;
            }
        }

        if let Ok(guard) = std::env::var("UNDERTOW_TAIL_GUARD") {
            if let Ok(bytes) = guard.parse::<u64>() {
                config.storage.tail_guard_bytes = bytes;
            }
        }

        if let Ok(capacity) = std::env::var("UNDERTOW_POSITION_CHANNEL_CAPACITY") {
            if let Ok(count) = capacity.parse::<usize>() {
                if count > 0 {
                    config.storage.position_channel_capacity = count;
                }
            }
        }

        config.storage.validate()?;
        Ok(config)
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Small budget so tests fill the pool quickly.
    pub fn for_testing() -> Self {
        Self {
            storage: MemoryStorageConfig {
                max_memory_bytes: 1024 * 1024, // 1 MiB
                tail_guard_bytes: 5 * 1024 * 1024,
                position_channel_capacity: 16,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = UndertowConfig::default();

        assert_eq!(config.storage.max_memory_bytes, 104_857_600);
        assert_eq!(config.storage.tail_guard_bytes, 5_242_880);
        assert_eq!(config.storage.position_channel_capacity, 256);
    }

    #[test]
    fn test_pool_capacity() {
        let config = MemoryStorageConfig::with_memory_budget(1_048_576);
        assert_eq!(config.pool_capacity(16384), Some(69));

        let config = MemoryStorageConfig::with_memory_budget(1_000_000);
        // 1_065_536 / 16384 = 65.03, rounded up
        assert_eq!(config.pool_capacity(16384), Some(66));
    }

    #[test]
    fn test_pool_capacity_overflow() {
        let config = MemoryStorageConfig::with_memory_budget(u64::MAX - 10);
        assert_eq!(config.pool_capacity(16384), None);
        assert!(matches!(
            config.validate(),
            Err(UndertowError::Configuration { .. })
        ));

        let config = MemoryStorageConfig::with_memory_budget(MAX_MEMORY_BUDGET_BYTES);
        assert!(config.validate().is_ok());
        assert_eq!(config.pool_capacity(u32::MAX), Some(21));
    }

    #[test]
    fn test_pool_capacity_with_zero_budget() {
        let config = MemoryStorageConfig::with_memory_budget(0);
        assert_eq!(config.pool_capacity(262_144), Some(5));
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("UNDERTOW_MEMORY_SIZE", "2097152");
            std::env::set_var("UNDERTOW_TAIL_GUARD", "1024");
            std::env::set_var("UNDERTOW_POSITION_CHANNEL_CAPACITY", "not-a-number");
        }

        let config = UndertowConfig::from_env().unwrap();

        assert_eq!(config.storage.max_memory_bytes, 2_097_152);
        assert_eq!(config.storage.tail_guard_bytes, 1024);
        assert_eq!(config.storage.position_channel_capacity, 256);

        unsafe {
            std::env::set_var("UNDERTOW_MEMORY_SIZE", u64::MAX.to_string());
        }
        assert!(matches!(
            UndertowConfig::from_env(),
            Err(UndertowError::Configuration { .. })
        ));

        // Cleanup
        unsafe {
            std::env::remove_var("UNDERTOW_MEMORY_SIZE");
            std::env::remove_var("UNDERTOW_TAIL_GUARD");
            std::env::remove_var("UNDERTOW_POSITION_CHANNEL_CAPACITY");
        }
    }

    #[test]
    fn test_testing_preset() {
        let config = UndertowConfig::for_testing();
        assert_eq!(config.storage.max_memory_bytes, 1_048_576);
        assert_eq!(config.storage.pool_capacity(16384), Some(69));
    }
}
