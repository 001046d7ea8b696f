//! # Configuration Module
//!
//! This module centralizes the store configuration structs and all numeric
//! constants. Constants are grouped by their functional area and
//! interdependencies are documented and enforced through compile-time
//! assertions.
//!
//! ## Why Centralization?
//!
//! The on-disk layout couples several values tightly: the block size, the
//! extent size, the trailer width and the metablock slot layout must agree
//! or files written by one build become unreadable by another. Co-locating
//! them with compile-time checks prevents mismatch bugs.
//!
//! ## Module Organization
//!
//! - [`constants`]: all numeric configuration values with dependency notes
//! - config structs: [`StoreConfig`], [`SerStaticConfig`], [`SerDynamicConfig`]

pub mod constants;
pub use constants::*;

use std::path::PathBuf;

use eyre::{ensure, Result};

/// Geometry of a serializer file, fixed at file creation time.
///
/// These values are baked into the on-disk layout; opening an existing file
/// with a different geometry is a configuration error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerStaticConfig {
    /// Size of one data block in bytes. Must be a power of two.
    pub block_size: usize,
    /// Size of one extent in bytes. Must be a power-of-two multiple of
    /// `block_size`; the unit of allocation and reclamation.
    pub extent_size: usize,
}

impl Default for SerStaticConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            extent_size: DEFAULT_EXTENT_SIZE,
        }
    }
}

impl SerStaticConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.block_size.is_power_of_two(),
            "block_size {} must be a power of two",
            self.block_size
        );
        ensure!(
            self.block_size > BLOCK_TRAILER_SIZE,
            "block_size {} must exceed the {}-byte block trailer",
            self.block_size,
            BLOCK_TRAILER_SIZE
        );
        ensure!(
            self.extent_size.is_power_of_two(),
            "extent_size {} must be a power of two",
            self.extent_size
        );
        ensure!(
            self.extent_size >= 2 * self.block_size,
            "extent_size {} must hold at least two blocks of {} bytes",
            self.extent_size,
            self.block_size
        );
        Ok(())
    }

    /// Number of blocks packed into one extent.
    pub fn blocks_per_extent(&self) -> usize {
        self.extent_size / self.block_size
    }

    /// Caller-visible bytes per block (the trailer is engine-owned).
    pub fn block_payload_size(&self) -> usize {
        self.block_size - BLOCK_TRAILER_SIZE
    }
}

/// Tunable behavior of a serializer, adjustable between runs.
#[derive(Debug, Clone, Copy)]
pub struct SerDynamicConfig {
    /// Global garbage ratio above which collection starts.
    pub gc_high_ratio: f64,
    /// Global garbage ratio below which a running collection stops.
    pub gc_low_ratio: f64,
    /// Minimum per-extent garbage ratio for an extent to be worth copying.
    pub gc_min_ratio: f64,
    /// Age in microseconds before a filled extent stops counting as young
    /// (young extents are likely to receive deletions soon, so collecting
    /// them early wastes copies).
    pub gc_young_extent_age_us: u64,
}

impl Default for SerDynamicConfig {
    fn default() -> Self {
        Self {
            gc_high_ratio: DEFAULT_GC_HIGH_RATIO,
            gc_low_ratio: DEFAULT_GC_LOW_RATIO,
            gc_min_ratio: DEFAULT_GC_MIN_RATIO,
            gc_young_extent_age_us: DEFAULT_GC_YOUNG_EXTENT_AGE_US,
        }
    }
}

impl SerDynamicConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, v) in [
            ("gc_high_ratio", self.gc_high_ratio),
            ("gc_low_ratio", self.gc_low_ratio),
            ("gc_min_ratio", self.gc_min_ratio),
        ] {
            ensure!(
                (0.0..=1.0).contains(&v),
                "{} {} must lie in [0.0, 1.0]",
                name,
                v
            );
        }
        ensure!(
            self.gc_low_ratio <= self.gc_high_ratio,
            "gc_low_ratio {} must not exceed gc_high_ratio {}",
            self.gc_low_ratio,
            self.gc_high_ratio
        );
        Ok(())
    }
}

/// Top-level store configuration.
///
/// `n_slices` shards are distributed over `n_serializers` files: slice `i`
/// lives in file `i % n_serializers`. Both counts are fixed for the lifetime
/// of the data files; there is no rebalancing.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Base path for serializer files; file `i` is `<db_file_name>_<i>`.
    pub db_file_name: PathBuf,
    /// Number of backing files.
    pub n_serializers: usize,
    /// Number of shards.
    pub n_slices: usize,
    /// Number of worker cores. Zero selects the available parallelism.
    pub n_cores: usize,
    /// Total buffer cache budget in bytes, split evenly across slices.
    pub max_cache_size: usize,
    /// When true, a commit callback fires only after the flushed blocks and
    /// the metablock are on disk.
    pub wait_for_flush: bool,
    /// Flush dirty blocks at least this often, checked at operation
    /// boundaries.
    pub flush_timer_ms: u32,
    /// Flush early once this percentage of the cache is dirty.
    pub flush_threshold_percent: u32,
    /// File geometry.
    pub ser_static_config: SerStaticConfig,
    /// GC tuning.
    pub ser_dynamic_config: SerDynamicConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_file_name: PathBuf::from("lodestore_data"),
            n_serializers: 1,
            n_slices: 1,
            n_cores: 0,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            wait_for_flush: true,
            flush_timer_ms: DEFAULT_FLUSH_TIMER_MS,
            flush_threshold_percent: DEFAULT_FLUSH_THRESHOLD_PERCENT,
            ser_static_config: SerStaticConfig::default(),
            ser_dynamic_config: SerDynamicConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Validates the configuration. Called once at store construction;
    /// failures here refuse to start rather than limp along.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.n_serializers >= 1,
            "n_serializers must be at least 1, got {}",
            self.n_serializers
        );
        ensure!(
            self.n_slices >= 1,
            "n_slices must be at least 1, got {}",
            self.n_slices
        );
        ensure!(
            !self.db_file_name.as_os_str().is_empty(),
            "db_file_name must not be empty"
        );
        ensure!(
            self.flush_threshold_percent <= 100,
            "flush_threshold_percent {} must not exceed 100",
            self.flush_threshold_percent
        );
        self.ser_static_config.validate()?;
        self.ser_dynamic_config.validate()?;
        Ok(())
    }

    /// Path of serializer file `id`.
    pub fn serializer_path(&self, id: usize) -> PathBuf {
        PathBuf::from(format!("{}_{}", self.db_file_name.display(), id))
    }

    /// Number of worker cores to spawn.
    pub fn effective_cores(&self) -> usize {
        if self.n_cores > 0 {
            self.n_cores
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    /// Serializer owning slice `id`.
    pub fn serializer_for_slice(&self, slice_id: usize) -> usize {
        slice_id % self.n_serializers
    }

    /// Rank of slice `id` within its serializer.
    pub fn rank_on_serializer(&self, slice_id: usize) -> usize {
        slice_id / self.n_serializers
    }

    /// Number of slices sharing serializer `ser_id`.
    pub fn count_on_serializer(&self, ser_id: usize) -> usize {
        (0..self.n_slices)
            .filter(|i| i % self.n_serializers == ser_id)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        StoreConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_serializers_rejected() {
        let mut config = StoreConfig::default();
        config.n_serializers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_slices_rejected() {
        let mut config = StoreConfig::default();
        config.n_slices = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_file_name_rejected() {
        let mut config = StoreConfig::default();
        config.db_file_name = PathBuf::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn extent_must_be_multiple_of_block() {
        let config = SerStaticConfig {
            block_size: 4096,
            extent_size: 6144,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn serializer_paths_carry_index_suffix() {
        let mut config = StoreConfig::default();
        config.db_file_name = PathBuf::from("/tmp/db");
        assert_eq!(config.serializer_path(0), PathBuf::from("/tmp/db_0"));
        assert_eq!(config.serializer_path(7), PathBuf::from("/tmp/db_7"));
    }

    #[test]
    fn slice_assignment_matches_shard_map() {
        let mut config = StoreConfig::default();
        config.n_serializers = 2;
        config.n_slices = 4;
        // slice 0 -> ser 0 rank 0, slice 1 -> ser 1 rank 0,
        // slice 2 -> ser 0 rank 1, slice 3 -> ser 1 rank 1
        assert_eq!(config.serializer_for_slice(0), 0);
        assert_eq!(config.rank_on_serializer(0), 0);
        assert_eq!(config.serializer_for_slice(1), 1);
        assert_eq!(config.rank_on_serializer(1), 0);
        assert_eq!(config.serializer_for_slice(2), 0);
        assert_eq!(config.rank_on_serializer(2), 1);
        assert_eq!(config.serializer_for_slice(3), 1);
        assert_eq!(config.rank_on_serializer(3), 1);
        assert_eq!(config.count_on_serializer(0), 2);
        assert_eq!(config.count_on_serializer(1), 2);
    }

    #[test]
    fn uneven_slice_counts() {
        let mut config = StoreConfig::default();
        config.n_serializers = 2;
        config.n_slices = 5;
        assert_eq!(config.count_on_serializer(0), 3);
        assert_eq!(config.count_on_serializer(1), 2);
    }
}
