//! # Configuration Constants
//!
//! This module centralizes all numeric configuration values, grouping
//! interdependent constants together and documenting their relationships.
//!
//! ## Dependency Graph
//!
//! ```text
//! DEFAULT_BLOCK_SIZE (4096 bytes)
//!       │
//!       ├─> BLOCK_TRAILER_SIZE (8 bytes, end of every data block)
//!       │     Payload capacity = block_size - trailer.
//!       │
//!       └─> DEFAULT_EXTENT_SIZE (4 MiB)
//!             Must be a power-of-two multiple of the block size.
//!             blocks_per_extent = extent_size / block_size.
//!
//! METABLOCK_SLOT_COUNT (2)
//!       │
//!       └─> Extent 0 is split into two alternating metablock slots.
//!           Each slot = one header block + the block-address table.
//!           Table capacity = (extent_size / 2 - block_size) / entry size.
//!
//! GC thresholds
//!       DEFAULT_GC_HIGH_RATIO  starts collection
//!       DEFAULT_GC_LOW_RATIO   stops collection  (low <= high)
//!       DEFAULT_GC_MIN_RATIO   skips extents not worth copying
//! ```
//!
//! ## Critical Invariants
//!
//! Enforced by compile-time assertions below:
//!
//! 1. `DEFAULT_EXTENT_SIZE` is a multiple of `DEFAULT_BLOCK_SIZE`
//! 2. `BLOCK_TRAILER_SIZE < DEFAULT_BLOCK_SIZE`
//! 3. `DEFAULT_GC_LOW_RATIO <= DEFAULT_GC_HIGH_RATIO`
//! 4. A large-value index block fits inside one block payload

// ============================================================================
// BLOCK AND EXTENT GEOMETRY
// These define the on-disk layout; changing them orphans existing files
// ============================================================================

/// Default size of one data block in bytes (4 KiB).
/// The fundamental unit of placement and caching.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Default size of one extent in bytes (4 MiB).
/// The unit of allocation and garbage reclamation.
pub const DEFAULT_EXTENT_SIZE: usize = 4 * 1024 * 1024;

/// Size of the trailer at the end of every data block.
/// Holds the logical block id for crash recovery and move validation.
pub const BLOCK_TRAILER_SIZE: usize = 8;

const _: () = assert!(
    DEFAULT_EXTENT_SIZE % DEFAULT_BLOCK_SIZE == 0,
    "extent size must be a whole number of blocks"
);

const _: () = assert!(
    BLOCK_TRAILER_SIZE < DEFAULT_BLOCK_SIZE,
    "trailer must leave room for payload"
);

// ============================================================================
// METABLOCK LAYOUT
// Extent 0 of every serializer file holds the durable root state
// ============================================================================

/// Number of alternating metablock slots in extent 0.
/// Two slots give atomic replacement: the higher valid version wins.
pub const METABLOCK_SLOT_COUNT: usize = 2;

/// Size of one serialized block-address table entry (block id + offset).
pub const LBA_ENTRY_SIZE: usize = 16;

// ============================================================================
// GARBAGE COLLECTION DEFAULTS
// Surfaced as SerDynamicConfig knobs; these are the shipped values
// ============================================================================

/// Global garbage ratio that starts a collection pass.
pub const DEFAULT_GC_HIGH_RATIO: f64 = 0.65;

/// Global garbage ratio below which a running pass stops.
pub const DEFAULT_GC_LOW_RATIO: f64 = 0.50;

/// Minimum per-extent garbage ratio for an extent to be worth copying.
pub const DEFAULT_GC_MIN_RATIO: f64 = 0.40;

/// Microseconds before a filled extent is no longer considered young.
pub const DEFAULT_GC_YOUNG_EXTENT_AGE_US: u64 = 50_000;

const _: () = assert!(
    DEFAULT_GC_LOW_RATIO <= DEFAULT_GC_HIGH_RATIO,
    "collection must not stop above its own start threshold"
);

// ============================================================================
// CACHE AND FLUSH POLICY DEFAULTS
// ============================================================================

/// Default total buffer cache budget (64 MiB across all slices).
pub const DEFAULT_MAX_CACHE_SIZE: usize = 64 * 1024 * 1024;

/// Default flush interval in milliseconds, checked at operation boundaries.
pub const DEFAULT_FLUSH_TIMER_MS: u32 = 1000;

/// Default dirty percentage that triggers an early flush.
pub const DEFAULT_FLUSH_THRESHOLD_PERCENT: u32 = 50;

/// Minimum resident blocks per slice cache, whatever the byte budget says.
pub const MIN_CACHE_BLOCKS: usize = 8;

// ============================================================================
// LARGE VALUES
// ============================================================================

/// Maximum size of a single stored value in bytes (1 MiB).
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Upper bound on segment blocks per large value, sized for the default
/// block geometry.
pub const MAX_LARGE_VALUE_SEGMENTS: usize =
    (MAX_VALUE_SIZE - 1) / (DEFAULT_BLOCK_SIZE - BLOCK_TRAILER_SIZE) + 1;

// A large-value index block (16-byte header + one 8-byte id per segment)
// must fit inside a single block payload.
const _: () = assert!(
    16 + MAX_LARGE_VALUE_SEGMENTS * 8 <= DEFAULT_BLOCK_SIZE - BLOCK_TRAILER_SIZE,
    "large-value index must fit in one block"
);
