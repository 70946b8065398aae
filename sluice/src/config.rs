//! Memory and reduction parameters, with defaults and environment overrides.

use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result};

/// Default size of a block in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 2 * 1024 * 1024;

/// RAM assumed available per host when `SLUICE_RAM` is not set.
pub const DEFAULT_RAM: usize = 4 * 1024 * 1024 * 1024;

/// How a host's RAM is divided, and how blocks are sized and swapped.
#[derive(Clone, Debug, PartialEq)]
pub struct MemoryConfig {
    /// Total RAM budget of the host in bytes.
    pub ram: usize,
    /// Capacity of blocks written by writers.
    pub block_size: usize,
    /// Directory holding the swap file of evicted blocks; the OS temp dir if `None`.
    pub swap_dir: Option<PathBuf>,
    /// How long an allocation over the hard limit waits for blocks to be unpinned.
    pub hard_limit_wait: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            ram: DEFAULT_RAM,
            block_size: DEFAULT_BLOCK_SIZE,
            swap_dir: None,
            hard_limit_wait: Duration::from_secs(1),
        }
    }
}

impl MemoryConfig {
    /// A configuration with `ram` bytes and `block_size` byte blocks.
    pub fn with_ram(ram: usize, block_size: usize) -> Self {
        MemoryConfig { ram, block_size, ..Default::default() }
    }

    /// Defaults overridden by `SLUICE_RAM`, `SLUICE_BLOCK_SIZE` and `SLUICE_SWAP_DIR`.
    pub fn from_env() -> Result<Self> {
        let mut config = MemoryConfig::default();
        if let Ok(text) = std::env::var("SLUICE_RAM") {
            config.ram = parse_bytes(&text)?;
        }
        if let Ok(text) = std::env::var("SLUICE_BLOCK_SIZE") {
            config.block_size = parse_bytes(&text)?;
        }
        if let Ok(dir) = std::env::var("SLUICE_SWAP_DIR") {
            config.swap_dir = Some(PathBuf::from(dir));
        }
        if config.block_size == 0 {
            return Err(Error::Format("SLUICE_BLOCK_SIZE must be positive".to_owned()));
        }
        Ok(config)
    }

    /// Bytes reserved for the data structures of worker threads.
    pub fn ram_workers(&self) -> usize { self.ram / 10 * 3 }

    /// Hard limit of the block pool: allocations beyond it wait or fail.
    pub fn ram_block_pool_hard(&self) -> usize { self.ram / 2 }

    /// Soft limit of the block pool: unpinned blocks beyond it are evicted.
    pub fn ram_block_pool_soft(&self) -> usize { self.ram_block_pool_hard() / 10 * 8 }

    /// Bytes left for everything else.
    pub fn ram_floating(&self) -> usize {
        self.ram - self.ram_workers() - self.ram_block_pool_hard()
    }

    /// Bytes one of `workers_per_host` workers may use for its own tables.
    pub fn ram_per_worker(&self, workers_per_host: usize) -> usize {
        self.ram_workers() / workers_per_host.max(1)
    }
}

/// Tuning of reduce hash tables.
#[derive(Clone, Debug, PartialEq)]
pub struct ReduceConfig {
    /// Fraction of a partition's buckets filled before it grows or spills.
    pub limit_partition_fill_rate: f64,
    /// Buckets a partition starts with, capped by what memory allows.
    pub initial_items_per_partition: usize,
    /// Number of partitions of post phase tables.
    pub post_partitions: usize,
    /// Drain the exchange on a separate thread while the pre phase runs.
    pub use_post_thread: bool,
    /// Bytes a single table may use; derived from the worker RAM share if `None`.
    pub limit_memory_bytes: Option<usize>,
}

impl Default for ReduceConfig {
    fn default() -> Self {
        ReduceConfig {
            limit_partition_fill_rate: 0.6,
            initial_items_per_partition: 512,
            post_partitions: 32,
            use_post_thread: false,
            limit_memory_bytes: None,
        }
    }
}

/// Parses a byte count with an optional `K`, `M`, `G` or `T` suffix (powers of 1024).
pub fn parse_bytes(text: &str) -> Result<usize> {
    let text = text.trim();
    let (digits, shift) = match text.char_indices().last() {
        Some((index, suffix)) if suffix.is_ascii_alphabetic() => {
            let shift = match suffix.to_ascii_uppercase() {
                'K' => 10,
                'M' => 20,
                'G' => 30,
                'T' => 40,
                _ => return Err(Error::Format(format!("unknown size suffix in {:?}", text))),
            };
            (&text[.. index], shift)
        },
        _ => (text, 0),
    };
    let value: usize = digits
        .trim()
        .parse()
        .map_err(|e| Error::Format(format!("invalid size {:?}: {}", text, e)))?;
    value
        .checked_mul(1usize << shift)
        .ok_or_else(|| Error::Format(format!("size {:?} overflows", text)))
}

/// Worker threads per host requested through `SLUICE_WORKERS_PER_HOST`.
pub fn workers_per_host_from_env() -> Result<Option<usize>> {
    match std::env::var("SLUICE_WORKERS_PER_HOST") {
        Ok(text) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Format(format!("SLUICE_WORKERS_PER_HOST: {}", e))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_with_suffixes() {
        assert_eq!(parse_bytes("123").unwrap(), 123);
        assert_eq!(parse_bytes("4k").unwrap(), 4096);
        assert_eq!(parse_bytes(" 2M ").unwrap(), 2 << 20);
        assert_eq!(parse_bytes("1G").unwrap(), 1 << 30);
        assert!(parse_bytes("12Q").is_err());
        assert!(parse_bytes("lots").is_err());
    }

    #[test]
    fn ram_split() {
        let config = MemoryConfig::with_ram(1000, 10);
        assert_eq!(config.ram_workers(), 300);
        assert_eq!(config.ram_block_pool_hard(), 500);
        assert_eq!(config.ram_block_pool_soft(), 400);
        assert_eq!(config.ram_floating(), 200);
        assert_eq!(config.ram_per_worker(3), 100);
    }
}
