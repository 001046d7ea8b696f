//! # Garbage Collection Tests
//!
//! Exercises the copying collector end to end on one core: survivor
//! preservation and remapping, extent reclamation with file truncation, and
//! the pause/resume protocol.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use lodestore::config::{SerDynamicConfig, SerStaticConfig};
use lodestore::exec::{Cores, Handle};
use lodestore::io::{FileDevice, SharedDevice};
use lodestore::serializer::LogSerializer;
use lodestore::{BlockId, DiskOff};

const TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// HELPERS
// ============================================================================

fn eager_gc() -> SerDynamicConfig {
    SerDynamicConfig {
        gc_high_ratio: 0.3,
        gc_low_ratio: 0.01,
        gc_min_ratio: 0.3,
        gc_young_extent_age_us: 0,
    }
}

fn create_serializer(
    cores: &Arc<Cores>,
    path: &Path,
    geometry: SerStaticConfig,
    dynamic: SerDynamicConfig,
) -> Handle<LogSerializer> {
    let path = path.to_path_buf();
    cores
        .run_blocking(0, move |cx| {
            let device: SharedDevice = Arc::new(FileDevice::create(&path).unwrap());
            let ser =
                LogSerializer::create(cx.id(), &path, device, geometry, dynamic).unwrap();
            cx.install(ser)
        })
        .unwrap()
}

fn write_block(cores: &Arc<Cores>, ser: Handle<LogSerializer>, id: BlockId, payload: Vec<u8>) {
    let (tx, rx) = unbounded();
    cores.dispatch(ser.core(), move |cx| {
        cx.with(ser, |s: &mut LogSerializer, cx| {
            s.write_block(
                cx,
                ser,
                id,
                payload,
                Box::new(move |_cx, res| {
                    let _ = tx.send(res);
                }),
            );
        });
    });
    rx.recv_timeout(TIMEOUT).expect("write timed out").unwrap();
}

fn read_block(cores: &Arc<Cores>, ser: Handle<LogSerializer>, id: BlockId) -> Option<Vec<u8>> {
    let (tx, rx) = unbounded();
    cores.dispatch(ser.core(), move |cx| {
        cx.with(ser, |s: &mut LogSerializer, cx| {
            s.read_block(
                cx,
                ser,
                id,
                Box::new(move |_cx, res| {
                    let _ = tx.send(res);
                }),
            );
        });
    });
    rx.recv_timeout(TIMEOUT).expect("read timed out").unwrap()
}

fn delete_block(cores: &Arc<Cores>, ser: Handle<LogSerializer>, id: BlockId) {
    cores
        .run_blocking(ser.core(), move |cx| {
            cx.with(ser, |s: &mut LogSerializer, cx| {
                s.delete_block(cx, ser, id).unwrap();
            })
        })
        .unwrap();
}

fn wait_gc_idle(cores: &Arc<Cores>, ser: Handle<LogSerializer>) {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let idle = cores
            .run_blocking(ser.core(), move |cx| {
                cx.with(ser, |s: &mut LogSerializer, _cx| s.data_blocks().gc_is_idle())
            })
            .unwrap();
        if idle {
            std::thread::sleep(Duration::from_millis(20));
            let still_idle = cores
                .run_blocking(ser.core(), move |cx| {
                    cx.with(ser, |s: &mut LogSerializer, _cx| s.data_blocks().gc_is_idle())
                })
                .unwrap();
            if still_idle {
                return;
            }
        }
        assert!(Instant::now() < deadline, "collector never went idle");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn live_extents(cores: &Arc<Cores>, ser: Handle<LogSerializer>) -> Vec<DiskOff> {
    cores
        .run_blocking(ser.core(), move |cx| {
            cx.with(ser, |s: &mut LogSerializer, _cx| s.data_blocks().live_extents())
        })
        .unwrap()
}

fn active_extent(cores: &Arc<Cores>, ser: Handle<LogSerializer>) -> Option<DiskOff> {
    cores
        .run_blocking(ser.core(), move |cx| {
            cx.with(ser, |s: &mut LogSerializer, _cx| {
                s.data_blocks().prepare_metablock().last_data_extent
            })
        })
        .unwrap()
}

fn pattern(i: u64, payload: usize) -> Vec<u8> {
    vec![(i & 0xff) as u8; payload]
}

// ============================================================================
// SURVIVOR PRESERVATION AND RECLAMATION
// ============================================================================

#[test]
fn collection_preserves_survivors_and_reclaims_space() {
    const BLOCK_SIZE: usize = 4096;
    const EXTENT_SIZE: usize = 64 * BLOCK_SIZE;
    const PAYLOAD: usize = BLOCK_SIZE - 8;
    let geometry = SerStaticConfig {
        block_size: BLOCK_SIZE,
        extent_size: EXTENT_SIZE,
    };

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db_0");
    let cores = Cores::start(1).unwrap();
    let ser = create_serializer(&cores, &path, geometry, eager_gc());

    // Track every block the collector moves.
    let moves: Arc<parking_lot::Mutex<Vec<(BlockId, DiskOff)>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));
    {
        let sink = Arc::clone(&moves);
        cores
            .run_blocking(ser.core(), move |cx| {
                cx.with(ser, |s: &mut LogSerializer, _cx| {
                    s.lba_mut()
                        .set_observer(Box::new(move |id, off| sink.lock().push((id, off))));
                })
            })
            .unwrap();
    }

    for i in 1..=1024u64 {
        write_block(&cores, ser, i, pattern(i, PAYLOAD));
    }
    for i in (1..=1024u64).filter(|i| i % 2 == 1) {
        delete_block(&cores, ser, i);
    }
    wait_gc_idle(&cores, ser);

    // Every survivor reads back with its last-written bytes.
    for i in (1..=1024u64).filter(|i| i % 2 == 0) {
        let data = read_block(&cores, ser, i).expect("survivor lost by collection");
        assert_eq!(data, pattern(i, PAYLOAD), "survivor {} corrupted", i);
    }

    // Moves happened and the address table holds the last move of every
    // surviving block (moved-then-deleted blocks have no entry to check).
    let moves = moves.lock().clone();
    assert!(!moves.is_empty(), "collection moved nothing");
    let mut last_move: std::collections::HashMap<BlockId, DiskOff> = std::collections::HashMap::new();
    for (id, off) in moves {
        last_move.insert(id, off);
    }
    let survivors: Vec<(BlockId, DiskOff)> = last_move
        .iter()
        .filter(|(id, _)| *id % 2 == 0)
        .map(|(&id, &off)| (id, off))
        .collect();
    assert!(!survivors.is_empty(), "no surviving block was ever moved");
    let lookups = cores
        .run_blocking(ser.core(), move |cx| {
            cx.with(ser, |s: &mut LogSerializer, _cx| {
                survivors
                    .into_iter()
                    .map(|(id, off)| (id, off, s.lba().get(id)))
                    .collect::<Vec<_>>()
            })
        })
        .unwrap();
    for (id, off, current) in lookups {
        assert_eq!(current, Some(off), "remap for block {} not published", id);
    }

    // Collection packed the survivors: the live footprint is far below the
    // original sixteen data extents, and no collectible extent stayed more
    // than half garbage.
    let live = live_extents(&cores, ser);
    assert!(live.len() <= 10, "live extents after collection: {:?}", live);
    let active = active_extent(&cores, ser);
    let ratios = cores
        .run_blocking(ser.core(), move |cx| {
            cx.with(ser, |s: &mut LogSerializer, _cx| {
                s.data_blocks().extent_garbage_ratios()
            })
        })
        .unwrap();
    for (off, ratio) in ratios {
        if Some(off) == active {
            continue;
        }
        assert!(ratio <= 0.5, "extent at {} still {} garbage", off, ratio);
    }

    // Part two: discard everything else. Fully-garbage extents go back
    // without copying, and freeing the top of the file truncates it.
    let peak_len = std::fs::metadata(&path).unwrap().len();
    for i in (1..=1024u64).filter(|i| i % 2 == 0) {
        delete_block(&cores, ser, i);
    }
    wait_gc_idle(&cores, ser);

    let final_len = std::fs::metadata(&path).unwrap().len();
    assert!(
        final_len + EXTENT_SIZE as u64 <= peak_len,
        "file did not shrink: peak {} final {}",
        peak_len,
        final_len
    );
    let live = live_extents(&cores, ser);
    assert!(live.len() <= 1, "only the active extent may remain: {:?}", live);

    cores.stop();
}

// ============================================================================
// PAUSE AND RESUME
// ============================================================================

#[test]
fn disable_waits_for_inflight_copies_then_blocks_collection() {
    const BLOCK_SIZE: usize = 4096;
    const EXTENT_SIZE: usize = 8 * BLOCK_SIZE;
    const PAYLOAD: usize = BLOCK_SIZE - 8;
    let geometry = SerStaticConfig {
        block_size: BLOCK_SIZE,
        extent_size: EXTENT_SIZE,
    };

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db_0");
    let cores = Cores::start(1).unwrap();
    let ser = create_serializer(&cores, &path, geometry, eager_gc());

    // Two full extents: ids 1..8 in extent 1, ids 9..16 in extent 2 (still
    // the active extent).
    for i in 1..=16u64 {
        write_block(&cores, ser, i, pattern(i, PAYLOAD));
    }

    // Delete six of extent 1's blocks; the pass starts mid-loop. The
    // disable lands behind the collector's queued reads but ahead of its
    // copy-writes, so it must observe the machine busy.
    let (tx_disabled, rx_disabled) = unbounded();
    let (tx_was_idle, rx_was_idle) = unbounded();
    cores.dispatch(ser.core(), move |cx| {
        cx.with(ser, |s: &mut LogSerializer, cx| {
            for i in 1..=6u64 {
                s.delete_block(cx, ser, i).unwrap();
            }
        });
        cx.dispatch(cx.id(), move |cx| {
            let was_idle = cx.with(ser, |s: &mut LogSerializer, cx| {
                s.disable_gc(
                    cx,
                    Box::new(move |_cx| {
                        let _ = tx_disabled.send(());
                    }),
                )
            });
            let _ = tx_was_idle.send(was_idle);
        });
    });

    assert!(
        !rx_was_idle.recv_timeout(TIMEOUT).unwrap(),
        "disable should find the collector mid-pass"
    );
    rx_disabled
        .recv_timeout(TIMEOUT)
        .expect("disable callback never fired");
    wait_gc_idle(&cores, ser);

    // Survivors of the collected extent are intact.
    assert_eq!(read_block(&cores, ser, 7).unwrap(), pattern(7, PAYLOAD));
    assert_eq!(read_block(&cores, ser, 8).unwrap(), pattern(8, PAYLOAD));

    // Pile up garbage while paused: nothing may be collected.
    for i in 9..=14u64 {
        delete_block(&cores, ser, i);
    }
    write_block(&cores, ser, 100, pattern(100, PAYLOAD));
    let live_before = live_extents(&cores, ser);
    assert!(
        live_before.contains(&(2 * EXTENT_SIZE as i64)),
        "paused collector touched extent 2: {:?}",
        live_before
    );
    let idle = cores
        .run_blocking(ser.core(), move |cx| {
            cx.with(ser, |s: &mut LogSerializer, _cx| s.data_blocks().gc_is_idle())
        })
        .unwrap();
    assert!(idle, "collector ran while disabled");

    // Resume: the piled-up garbage is reclaimed.
    cores
        .run_blocking(ser.core(), move |cx| {
            cx.with(ser, |s: &mut LogSerializer, cx| s.enable_gc(cx, ser))
        })
        .unwrap();
    wait_gc_idle(&cores, ser);
    let live_after = live_extents(&cores, ser);
    assert!(
        !live_after.contains(&(2 * EXTENT_SIZE as i64)),
        "extent 2 not reclaimed after resume: {:?}",
        live_after
    );
    assert_eq!(read_block(&cores, ser, 15).unwrap(), pattern(15, PAYLOAD));
    assert_eq!(read_block(&cores, ser, 16).unwrap(), pattern(16, PAYLOAD));

    cores.stop();
}

#[test]
fn disable_on_idle_collector_fires_immediately() {
    const BLOCK_SIZE: usize = 4096;
    let geometry = SerStaticConfig {
        block_size: BLOCK_SIZE,
        extent_size: 8 * BLOCK_SIZE,
    };

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db_0");
    let cores = Cores::start(1).unwrap();
    let ser = create_serializer(&cores, &path, geometry, eager_gc());

    let (tx, rx) = unbounded();
    let was_idle = cores
        .run_blocking(ser.core(), move |cx| {
            cx.with(ser, |s: &mut LogSerializer, cx| {
                s.disable_gc(
                    cx,
                    Box::new(move |_cx| {
                        let _ = tx.send(());
                    }),
                )
            })
        })
        .unwrap();
    assert!(was_idle);
    rx.recv_timeout(TIMEOUT)
        .expect("idle disable must still fire its callback");
    cores.stop();
}
