//! # Serializer Block Round-Trip Tests
//!
//! Drives a single log serializer end to end on one core: sequential
//! placement, trailer round-trips, extent rotation, and recovery of the
//! metablock plus address table across a restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::bounded;
use lodestore::config::{SerDynamicConfig, SerStaticConfig};
use lodestore::exec::{Cores, Handle};
use lodestore::io::{FileDevice, SharedDevice};
use lodestore::serializer::LogSerializer;
use lodestore::BlockId;

const TIMEOUT: Duration = Duration::from_secs(30);

const BLOCK_SIZE: usize = 4096;
const EXTENT_SIZE: usize = 64 * BLOCK_SIZE;
const PAYLOAD: usize = BLOCK_SIZE - 8;

// ============================================================================
// HELPERS
// ============================================================================

fn geometry() -> SerStaticConfig {
    SerStaticConfig {
        block_size: BLOCK_SIZE,
        extent_size: EXTENT_SIZE,
    }
}

fn create_serializer(cores: &Arc<Cores>, path: &Path) -> Handle<LogSerializer> {
    let path = path.to_path_buf();
    cores
        .run_blocking(0, move |cx| {
            let device: SharedDevice = Arc::new(FileDevice::create(&path).unwrap());
            let ser = LogSerializer::create(
                cx.id(),
                &path,
                device,
                geometry(),
                SerDynamicConfig::default(),
            )
            .unwrap();
            cx.install(ser)
        })
        .unwrap()
}

fn open_serializer(cores: &Arc<Cores>, path: &Path) -> Handle<LogSerializer> {
    let path = path.to_path_buf();
    cores
        .run_blocking(0, move |cx| {
            let device: SharedDevice = Arc::new(FileDevice::open(&path).unwrap());
            let ser = LogSerializer::open(
                cx.id(),
                &path,
                device,
                geometry(),
                SerDynamicConfig::default(),
            )
            .unwrap();
            cx.install(ser)
        })
        .unwrap()
}

fn write_block(
    cores: &Arc<Cores>,
    ser: Handle<LogSerializer>,
    block_id: BlockId,
    payload: Vec<u8>,
) {
    let (tx, rx) = bounded(1);
    cores.dispatch(ser.core(), move |cx| {
        cx.with(ser, |s: &mut LogSerializer, cx| {
            s.write_block(
                cx,
                ser,
                block_id,
                payload,
                Box::new(move |_cx, res| {
                    let _ = tx.send(res);
                }),
            );
        });
    });
    rx.recv_timeout(TIMEOUT).expect("write timed out").unwrap();
}

fn read_block(
    cores: &Arc<Cores>,
    ser: Handle<LogSerializer>,
    block_id: BlockId,
) -> Option<Vec<u8>> {
    let (tx, rx) = bounded(1);
    cores.dispatch(ser.core(), move |cx| {
        cx.with(ser, |s: &mut LogSerializer, cx| {
            s.read_block(
                cx,
                ser,
                block_id,
                Box::new(move |_cx, res| {
                    let _ = tx.send(res);
                }),
            );
        });
    });
    rx.recv_timeout(TIMEOUT).expect("read timed out").unwrap()
}

fn shutdown_serializer(cores: &Arc<Cores>, ser: Handle<LogSerializer>) {
    let (tx, rx) = bounded(1);
    cores.dispatch(ser.core(), move |cx| {
        cx.with(ser, |s: &mut LogSerializer, cx| {
            s.shutdown(
                cx,
                ser,
                Box::new(move |_cx, res| {
                    let _ = tx.send(res);
                }),
            );
        });
    });
    rx.recv_timeout(TIMEOUT).expect("shutdown timed out").unwrap();
}

fn offset_of(cores: &Arc<Cores>, ser: Handle<LogSerializer>, block_id: BlockId) -> i64 {
    cores
        .run_blocking(ser.core(), move |cx| {
            cx.with(ser, |s: &mut LogSerializer, _cx| {
                s.lba().get(block_id).expect("block has no offset")
            })
        })
        .unwrap()
}

fn pattern(i: u64) -> Vec<u8> {
    vec![(i & 0xff) as u8; PAYLOAD]
}

fn db_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("db_0")
}

// ============================================================================
// ROUND-TRIP
// ============================================================================

#[test]
fn thousand_blocks_roundtrip_in_reverse() {
    let dir = tempfile::tempdir().unwrap();
    let cores = Cores::start(1).unwrap();
    let ser = create_serializer(&cores, &db_path(&dir));

    for i in 1..=1024u64 {
        write_block(&cores, ser, i, pattern(i));
    }
    for i in (1..=1024u64).rev() {
        let data = read_block(&cores, ser, i).expect("written block missing");
        assert_eq!(data, pattern(i), "block {} corrupted", i);
    }

    shutdown_serializer(&cores, ser);
    let file_len = std::fs::metadata(db_path(&dir)).unwrap().len();
    assert!(
        file_len >= (1024 * BLOCK_SIZE + EXTENT_SIZE) as u64,
        "file too small for 1024 blocks plus the metablock extent: {}",
        file_len
    );
    cores.stop();
}

#[test]
fn never_written_blocks_read_as_none() {
    let dir = tempfile::tempdir().unwrap();
    let cores = Cores::start(1).unwrap();
    let ser = create_serializer(&cores, &db_path(&dir));

    write_block(&cores, ser, 5, pattern(5));
    assert!(read_block(&cores, ser, 6).is_none());
    assert!(read_block(&cores, ser, 5).is_some());
    cores.stop();
}

#[test]
fn overwrite_returns_latest_contents() {
    let dir = tempfile::tempdir().unwrap();
    let cores = Cores::start(1).unwrap();
    let ser = create_serializer(&cores, &db_path(&dir));

    write_block(&cores, ser, 9, pattern(1));
    write_block(&cores, ser, 9, pattern(2));
    write_block(&cores, ser, 9, pattern(3));
    assert_eq!(read_block(&cores, ser, 9).unwrap(), pattern(3));
    cores.stop();
}

// ============================================================================
// PLACEMENT
// ============================================================================

#[test]
fn offsets_are_sequential_within_an_extent() {
    let dir = tempfile::tempdir().unwrap();
    let cores = Cores::start(1).unwrap();
    let ser = create_serializer(&cores, &db_path(&dir));

    let blocks_per_extent = (EXTENT_SIZE / BLOCK_SIZE) as u64;
    for i in 1..=blocks_per_extent {
        write_block(&cores, ser, i, pattern(i));
    }
    let base = offset_of(&cores, ser, 1);
    assert_eq!(base, EXTENT_SIZE as i64, "first block starts extent 1");
    for i in 1..=blocks_per_extent {
        assert_eq!(
            offset_of(&cores, ser, i),
            base + (i as i64 - 1) * BLOCK_SIZE as i64
        );
    }
    cores.stop();
}

#[test]
fn full_extent_rotates_to_the_next() {
    let dir = tempfile::tempdir().unwrap();
    let cores = Cores::start(1).unwrap();
    let ser = create_serializer(&cores, &db_path(&dir));

    let blocks_per_extent = (EXTENT_SIZE / BLOCK_SIZE) as u64;
    for i in 1..=blocks_per_extent + 1 {
        write_block(&cores, ser, i, pattern(i));
    }
    assert_eq!(
        offset_of(&cores, ser, blocks_per_extent + 1),
        2 * EXTENT_SIZE as i64,
        "first block past the boundary opens extent 2"
    );
    let filled = cores
        .run_blocking(ser.core(), move |cx| {
            cx.with(ser, |s: &mut LogSerializer, _cx| {
                s.data_blocks().blocks_in_last_data_extent()
            })
        })
        .unwrap();
    assert_eq!(filled, 1);
    cores.stop();
}

// ============================================================================
// RECOVERY
// ============================================================================

#[test]
fn clean_shutdown_then_reopen_preserves_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir);

    let cores = Cores::start(1).unwrap();
    let ser = create_serializer(&cores, &path);
    for i in 1..=200u64 {
        write_block(&cores, ser, i, pattern(i));
    }
    shutdown_serializer(&cores, ser);
    cores.stop();

    let cores = Cores::start(1).unwrap();
    let ser = open_serializer(&cores, &path);
    for i in 1..=200u64 {
        assert_eq!(read_block(&cores, ser, i).unwrap(), pattern(i));
    }
    // Placement resumes where the metablock left off.
    write_block(&cores, ser, 201, pattern(201));
    assert_eq!(read_block(&cores, ser, 201).unwrap(), pattern(201));
    cores.stop();
}

#[test]
fn metablock_flush_survives_an_unclean_stop() {
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir);

    let cores = Cores::start(1).unwrap();
    let ser = create_serializer(&cores, &path);
    for i in 1..=50u64 {
        write_block(&cores, ser, i, pattern(i));
    }
    let (tx, rx) = bounded(1);
    cores.dispatch(ser.core(), move |cx| {
        cx.with(ser, |s: &mut LogSerializer, cx| {
            s.flush_metablock(
                cx,
                Box::new(move |_cx, res| {
                    let _ = tx.send(res);
                }),
            );
        });
    });
    rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    // No shutdown: the core set just dies, as in a crash.
    cores.stop();

    let cores = Cores::start(1).unwrap();
    let ser = open_serializer(&cores, &path);
    for i in 1..=50u64 {
        assert_eq!(read_block(&cores, ser, i).unwrap(), pattern(i));
    }
    cores.stop();
}

#[test]
fn deletions_survive_reopen_and_mark_garbage() {
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir);
    let blocks_per_extent = (EXTENT_SIZE / BLOCK_SIZE) as u64;

    let cores = Cores::start(1).unwrap();
    let ser = create_serializer(&cores, &path);
    for i in 1..=2 * blocks_per_extent {
        write_block(&cores, ser, i, pattern(i));
    }
    for i in (1..=blocks_per_extent).filter(|i| i % 2 == 1) {
        cores
            .run_blocking(ser.core(), move |cx| {
                cx.with(ser, |s: &mut LogSerializer, cx| {
                    s.delete_block(cx, ser, i).unwrap();
                })
            })
            .unwrap();
    }
    shutdown_serializer(&cores, ser);
    cores.stop();

    let cores = Cores::start(1).unwrap();
    let ser = open_serializer(&cores, &path);
    for i in 1..=blocks_per_extent {
        let read = read_block(&cores, ser, i);
        if i % 2 == 1 {
            assert!(read.is_none(), "deleted block {} came back", i);
        } else {
            assert_eq!(read.unwrap(), pattern(i));
        }
    }
    // Reconstruction rebuilt the garbage map: extent 1 is half dead.
    let ratios = cores
        .run_blocking(ser.core(), move |cx| {
            cx.with(ser, |s: &mut LogSerializer, _cx| {
                s.data_blocks().extent_garbage_ratios()
            })
        })
        .unwrap();
    let extent1 = ratios
        .iter()
        .find(|(off, _)| *off == EXTENT_SIZE as i64)
        .expect("extent 1 live");
    assert!((extent1.1 - 0.5).abs() < 1e-9, "ratio {}", extent1.1);
    cores.stop();
}
