//! # Metablock Region
//!
//! Extent 0 of every serializer file is the durable root: it records which
//! extent is currently being filled, how far it is filled, and the complete
//! block-address table (logical block id to disk offset). Everything else in
//! the file is reachable from here.
//!
//! ## Layout
//!
//! The extent is split into two alternating slots. Each slot holds a header
//! block followed by the serialized address table:
//!
//! ```text
//! +-------------------------- extent 0 ---------------------------+
//! | slot 0                         | slot 1                       |
//! | header | address table ...     | header | address table ...   |
//! +----------------------------------------------------------------+
//! ```
//!
//! Header fields:
//!
//! ```text
//! Offset  Size  Description
//! 0       8     Magic: "LODEMETA"
//! 8       8     Version (monotonically increasing, selects the slot)
//! 16      8     Offset of the active data extent (-1 if none)
//! 24      4     Blocks filled in the active extent
//! 28      4     Address table entry count
//! 32      8     CRC64 over the address table bytes
//! 40      8     CRC64 over the first 40 header bytes
//! ```
//!
//! ## Write Protocol
//!
//! A publish writes the address table into the slot for `version % 2`, then
//! the header, then syncs the device. A crash mid-publish leaves the other
//! slot untouched, so `read_latest` always finds a consistent image: it
//! validates both headers and picks the highest valid version.

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{bail, ensure, Result};
use zerocopy::little_endian::{I64, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{LBA_ENTRY_SIZE, METABLOCK_SLOT_COUNT};
use crate::io::BlockDevice;
use crate::{BlockId, DiskOff};

pub const METABLOCK_MAGIC: &[u8; 8] = b"LODEMETA";
pub const METABLOCK_HEADER_SIZE: usize = 48;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct MetablockHeader {
    magic: [u8; 8],
    version: U64,
    last_data_extent: I64,
    blocks_in_last_data_extent: U32,
    lba_entries: U32,
    lba_crc: U64,
    header_crc: U64,
}

const _: () = assert!(std::mem::size_of::<MetablockHeader>() == METABLOCK_HEADER_SIZE);

impl MetablockHeader {
    zerocopy_accessors! {
        version: u64,
        last_data_extent: i64,
        blocks_in_last_data_extent: u32,
        lba_entries: u32,
        lba_crc: u64,
        header_crc: u64,
    }

    fn compute_header_crc(&self) -> u64 {
        CRC64.checksum(&self.as_bytes()[..METABLOCK_HEADER_SIZE - 8])
    }

    fn is_valid(&self) -> bool {
        self.magic == *METABLOCK_MAGIC && self.header_crc() == self.compute_header_crc()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
struct LbaEntryRaw {
    block_id: U64,
    offset: I64,
}

const _: () = assert!(std::mem::size_of::<LbaEntryRaw>() == LBA_ENTRY_SIZE);

/// The fields the data block manager contributes to each publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetablockSnapshot {
    /// Offset of the extent currently being filled, if any.
    pub last_data_extent: Option<DiskOff>,
    /// Blocks already placed in that extent.
    pub blocks_in_last_data_extent: usize,
}

/// Geometry of the metablock region of one file.
#[derive(Debug, Clone, Copy)]
pub struct MetablockRegion {
    extent_size: usize,
    block_size: usize,
}

impl MetablockRegion {
    pub fn new(block_size: usize, extent_size: usize) -> Self {
        Self {
            extent_size,
            block_size,
        }
    }

    fn slot_size(&self) -> usize {
        self.extent_size / METABLOCK_SLOT_COUNT
    }

    fn slot_offset(&self, version: u64) -> u64 {
        (version as usize % METABLOCK_SLOT_COUNT * self.slot_size()) as u64
    }

    /// Address table entries one slot can hold.
    pub fn capacity(&self) -> usize {
        (self.slot_size() - self.block_size) / LBA_ENTRY_SIZE
    }

    /// Publishes a new metablock image and syncs the device.
    pub fn write(
        &self,
        device: &dyn BlockDevice,
        version: u64,
        snapshot: &MetablockSnapshot,
        entries: &[(BlockId, DiskOff)],
    ) -> Result<()> {
        ensure!(
            entries.len() <= self.capacity(),
            "address table with {} entries exceeds metablock capacity {}",
            entries.len(),
            self.capacity()
        );

        let mut table = Vec::with_capacity(entries.len() * LBA_ENTRY_SIZE);
        for &(block_id, offset) in entries {
            let raw = LbaEntryRaw {
                block_id: U64::new(block_id),
                offset: I64::new(offset),
            };
            table.extend_from_slice(raw.as_bytes());
        }

        let mut header = MetablockHeader {
            magic: *METABLOCK_MAGIC,
            version: U64::new(version),
            last_data_extent: I64::new(snapshot.last_data_extent.unwrap_or(-1)),
            blocks_in_last_data_extent: U32::new(snapshot.blocks_in_last_data_extent as u32),
            lba_entries: U32::new(entries.len() as u32),
            lba_crc: U64::new(CRC64.checksum(&table)),
            header_crc: U64::new(0),
        };
        header.set_header_crc(header.compute_header_crc());

        let slot = self.slot_offset(version);
        if !table.is_empty() {
            device.write_at(slot + self.block_size as u64, &table)?;
        }
        device.write_at(slot, header.as_bytes())?;
        device.sync()?;
        Ok(())
    }

    /// Reads the highest-versioned valid metablock image.
    pub fn read_latest(
        &self,
        device: &dyn BlockDevice,
    ) -> Result<(u64, MetablockSnapshot, Vec<(BlockId, DiskOff)>)> {
        let mut best: Option<MetablockHeader> = None;
        for slot in 0..METABLOCK_SLOT_COUNT {
            let mut raw = [0u8; METABLOCK_HEADER_SIZE];
            if device
                .read_at((slot * self.slot_size()) as u64, &mut raw)
                .is_err()
            {
                continue;
            }
            let header = MetablockHeader::read_from_bytes(&raw)
                .ok()
                .expect("metablock header buffer sized exactly"); // INVARIANT: raw is METABLOCK_HEADER_SIZE bytes
            if !header.is_valid() {
                continue;
            }
            if best.map(|b| b.version() < header.version()).unwrap_or(true) {
                best = Some(header);
            }
        }

        let header = match best {
            Some(h) => h,
            None => bail!("no valid metablock found; file is corrupt or not a data file"),
        };

        let count = header.lba_entries() as usize;
        ensure!(
            count <= self.capacity(),
            "metablock names {} address entries but the region holds at most {}",
            count,
            self.capacity()
        );

        let mut table = vec![0u8; count * LBA_ENTRY_SIZE];
        if count > 0 {
            let slot = self.slot_offset(header.version());
            device.read_at(slot + self.block_size as u64, &mut table)?;
        }
        ensure!(
            CRC64.checksum(&table) == header.lba_crc(),
            "address table checksum mismatch in metablock version {}",
            header.version()
        );

        let mut entries = Vec::with_capacity(count);
        for chunk in table.chunks_exact(LBA_ENTRY_SIZE) {
            let raw = LbaEntryRaw::read_from_bytes(chunk)
                .ok()
                .expect("address entry chunk sized exactly"); // INVARIANT: chunks_exact yields LBA_ENTRY_SIZE
            entries.push((raw.block_id.get(), raw.offset.get()));
        }

        let snapshot = MetablockSnapshot {
            last_data_extent: match header.last_data_extent() {
                off if off < 0 => None,
                off => Some(off),
            },
            blocks_in_last_data_extent: header.blocks_in_last_data_extent() as usize,
        };

        Ok((header.version(), snapshot, entries))
    }
}
