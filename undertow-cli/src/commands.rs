//! CLI command implementations

use std::time::Duration;

use anyhow::Context;
use clap::{Args, Subcommand};
use rand::Rng;
use serde::Serialize;
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};
use undertow_core::config::UndertowConfig;
use undertow_core::storage::{
    MemoryStorage, MemoryTorrent, PieceStorage, PoolStats, StorageBackend, StorageError,
    TorrentStorage,
};
use undertow_core::{InfoHash, PieceIndex, PositionEvent, TorrentLayout};

const MIB: u64 = 1024 * 1024;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Simulate streaming playback against a memory torrent
    Simulate(SimulateArgs),
    /// Print the number of slots a torrent would get
    Capacity {
        /// Piece length in bytes
        #[arg(long, default_value_t = 262_144)]
        piece_length: u32,
        /// Memory budget in MiB (defaults to UNDERTOW_MEMORY_SIZE or 100)
        #[arg(long)]
        memory_mb: Option<u64>,
    },
}

#[derive(Args)]
pub struct SimulateArgs {
    /// Piece length in bytes
    #[arg(long, default_value_t = 262_144)]
    piece_length: u32,
    /// Total size of the simulated content in bytes
    #[arg(long, default_value_t = 1024 * MIB)]
    total_size: u64,
    /// Memory budget in MiB (defaults to UNDERTOW_MEMORY_SIZE or 100)
    #[arg(long)]
    memory_mb: Option<u64>,
    /// Bytes the cursor advances per playback step
    #[arg(long, default_value_t = MIB)]
    step_bytes: u64,
    /// Playback steps after the start and after each seek
    #[arg(long, default_value_t = 64)]
    steps: u32,
    /// Byte positions to seek to, in order
    #[arg(long)]
    seek: Vec<u64>,
    /// Info hash as 40 hex characters (derived from the content size if omitted)
    #[arg(long)]
    info_hash: Option<String>,
    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

/// Outcome of a playback simulation
#[derive(Debug, Default, Serialize)]
pub struct SimulationReport {
    pub info_hash: String,
    pub positions_published: u64,
    pub pieces_written: u64,
    pub pieces_verified: u64,
    pub dropped_writes: u64,
    pub verification_failures: u64,
    pub pool: Option<PoolStats>,
}

/// Handle the CLI command
///
/// # Errors
/// Returns the error of the command that failed
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Simulate(args) => simulate(args).await,
        Commands::Capacity {
            piece_length,
            memory_mb,
        } => show_capacity(piece_length, memory_mb),
    }
}

fn storage_config(memory_mb: Option<u64>) -> anyhow::Result<UndertowConfig> {
    let mut config = UndertowConfig::from_env()?;
    if let Some(memory_mb) = memory_mb {
        config.storage.max_memory_bytes = memory_mb
            .checked_mul(MIB)
            .with_context(|| format!("memory budget of {memory_mb} MiB is too large"))?;
        config.storage.validate()?;
    }
    Ok(config)
}

/// Print the slot count for a piece length and budget
///
/// # Errors
/// - `anyhow::Error` - If the piece length is zero or the budget is invalid
pub fn show_capacity(piece_length: u32, memory_mb: Option<u64>) -> anyhow::Result<()> {
    anyhow::ensure!(piece_length > 0, "piece length must be greater than zero");

    let config = storage_config(memory_mb)?;
    let capacity = config
        .storage
        .pool_capacity(piece_length)
        .context("memory budget too large to count in slots")?;

    println!("Pool capacity: {capacity} slots");
    println!(
        "  Piece length: {} bytes, budget: {:.2} MiB, resident: {:.2} MiB",
        piece_length,
        config.storage.max_memory_bytes as f64 / MIB as f64,
        (capacity as u64 * u64::from(piece_length)) as f64 / MIB as f64
    );

    Ok(())
}

/// Run a playback simulation
///
/// # Errors
/// - `anyhow::Error` - If the configuration, info hash or layout is invalid, or the torrent cannot be opened
pub async fn simulate(args: SimulateArgs) -> anyhow::Result<()> {
    let config = storage_config(args.memory_mb)?;
    let budget = config.storage.max_memory_bytes;

    let info_hash = match &args.info_hash {
        Some(hex) => InfoHash::from_hex(hex)?,
        None => derive_info_hash(args.total_size),
    };
    let layout = TorrentLayout::new(info_hash, args.piece_length, args.total_size)?;

    let storage = MemoryStorage::with_config(config.storage);
    let torrent = storage
        .open_torrent(layout)
        .context("failed to open memory torrent")?;

    let mut simulation = Simulation {
        storage: &storage,
        torrent: &torrent,
        layout,
        budget,
        report: SimulationReport {
            info_hash: info_hash.to_string(),
            ..Default::default()
        },
    };

    let starts = std::iter::once(0).chain(args.seek.iter().copied());
    for start in starts {
        info!("Playback from byte {}", start);
        for step in 0..u64::from(args.steps) {
            let position = start.saturating_add(step.saturating_mul(args.step_bytes));
            if position >= args.total_size {
                break;
            }
            simulation.play_at(position).await?;
        }
    }

    let mut report = simulation.report;
    report.pool = Some(torrent.stats());
    torrent.shutdown().await?;

    print_report(&report, args.json)
}

/// Fixed info hash for a simulated content size.
fn derive_info_hash(total_size: u64) -> InfoHash {
    let digest = Sha1::digest(format!("undertow-simulation:{total_size}").as_bytes());
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&digest);
    InfoHash::new(hash)
}

struct Simulation<'a> {
    storage: &'a MemoryStorage,
    torrent: &'a MemoryTorrent,
    layout: TorrentLayout,
    budget: u64,
    report: SimulationReport,
}

impl Simulation<'_> {
    /// Moves the cursor to `position` and downloads the window ahead of it.
    async fn play_at(&mut self, position: u64) -> anyhow::Result<()> {
        self.storage.positions().publish(PositionEvent {
            info_hash: self.layout.info_hash,
            position,
            file_offset: 0,
            file_length: self.layout.total_length,
        });
        self.report.positions_published += 1;

        // Let the watcher sweep before refilling the window
        tokio::time::sleep(Duration::from_millis(1)).await;

        let piece_length = u64::from(self.layout.piece_length);
        let first = position / piece_length;
        let last = (position.saturating_add(self.budget) / piece_length)
            .min(u64::from(self.layout.piece_count()).saturating_sub(1));

        for index in first..=last {
            self.download_piece(PieceIndex::new(index as u32))?;
        }

        Ok(())
    }

    fn download_piece(&mut self, index: PieceIndex) -> anyhow::Result<()> {
        let piece = self.torrent.piece(index)?;
        if piece.is_complete() {
            return Ok(());
        }

        let mut data = vec![0u8; piece.len()];
        rand::rng().fill(&mut data[..]);
        let expected = Sha1::digest(&data);

        match piece.write_at(&data, 0) {
            Ok(_) => self.report.pieces_written += 1,
            Err(StorageError::PoolExhausted { .. }) => {
                self.report.dropped_writes += 1;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let mut readback = vec![0u8; data.len()];
        match piece.read_at(&mut readback, 0) {
            Ok(copied) if copied == data.len() && Sha1::digest(&readback) == expected => {
                match piece.mark_complete() {
                    Ok(()) => {
                        self.report.pieces_verified += 1;
                        debug!("Verified piece {}", index);
                    }
                    Err(e) if e.is_retryable() => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(copied) => {
                warn!("Piece {} failed verification ({} bytes read)", index, copied);
                self.report.verification_failures += 1;
            }
            // Evicted by a concurrent sweep; the next step downloads it again
            Err(e) if e.is_retryable() => {}
            Err(e) => return Err(e.into()),
        }

        Ok(())
    }
}

fn print_report(report: &SimulationReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("Simulation Report");
    println!("{:-<60}", "");
    println!("Info Hash: {}", report.info_hash);
    println!("Positions published: {}", report.positions_published);
    println!("Pieces written: {}", report.pieces_written);
    println!("Pieces verified: {}", report.pieces_verified);
    println!("Dropped writes: {}", report.dropped_writes);
    println!("Verification failures: {}", report.verification_failures);

    if let Some(pool) = &report.pool {
        println!();
        println!("Buffer Pool");
        println!("{:-<60}", "");
        println!("Slots: {}/{} assigned", pool.assigned, pool.capacity);
        println!("Complete pieces: {}", pool.completed);
        println!("Evictions: {}", pool.evictions);
        println!("Exhausted allocations: {}", pool.exhausted_writes);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_info_hash_is_stable() {
        assert_eq!(derive_info_hash(1024), derive_info_hash(1024));
        assert_ne!(derive_info_hash(1024), derive_info_hash(2048));
    }

    #[test]
    fn test_capacity_rejects_zero_piece_length() {
        assert!(show_capacity(0, Some(1)).is_err());
        assert!(show_capacity(16384, Some(1)).is_ok());
    }

    #[test]
    fn test_capacity_rejects_oversized_budget() {
        assert!(show_capacity(16384, Some(u64::MAX)).is_err());
        assert!(show_capacity(16384, Some(1024 * 1024)).is_err());
        assert!(show_capacity(16384, Some(64 * 1024)).is_ok());
    }

    #[tokio::test]
    async fn test_simulation_stays_within_capacity() {
        let args = SimulateArgs {
            piece_length: 16384,
            total_size: 64 * MIB,
            memory_mb: Some(1),
            step_bytes: 256 * 1024,
            steps: 16,
            seek: vec![32 * MIB],
            info_hash: None,
            json: true,
        };

        simulate(args).await.unwrap();
    }
}
