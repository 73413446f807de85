//! End-to-end scenarios for the operation engine, driven entirely
//! through in-memory collaborators.

use psifs::backtree::BackTree;
use psifs::cache::CacheCmdKind;
use psifs::err::Error;
use psifs::fs::{DateStamp, FileAttr, FsInfo, ObjectType};
use psifs::mock::{MemHostFs, MockCache, MockClock, MockLink, MockTar};
use psifs::ops::{Engine, OpKind, Response, Status};
use psifs::sysvar::MemStore;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::rc::Rc;

struct World {
    engine: Engine,
    clock: MockClock,
    link: Rc<RefCell<MockLink>>,
    cache: Rc<RefCell<MockCache>>,
    tar: Rc<RefCell<MockTar>>,
    hostfs: Rc<RefCell<MemHostFs>>,
}

fn world() -> World {
    let clock = MockClock::new();
    let link = Rc::new(RefCell::new(MockLink::new()));
    let cache = Rc::new(RefCell::new(MockCache::new()));
    let tar = Rc::new(RefCell::new(MockTar::new()));
    let hostfs = Rc::new(RefCell::new(MemHostFs::new()));
    link.borrow_mut().era = true;
    link.borrow_mut().ncp = true;
    let engine = Engine::new(
        Box::new(clock.clone()),
        Box::new(link.clone()),
        Box::new(cache.clone()),
        Box::new(tar.clone()),
        Box::new(hostfs.clone()),
        Box::new(MemStore::new()),
    );
    World {
        engine,
        clock,
        link,
        cache,
        tar,
        hostfs,
    }
}

/// Pump the engine, nudging the clock so settle delays elapse, until the
/// operation reaches a terminal status or the iteration budget runs out.
fn settle(world: &mut World, handle: u32) -> Status {
    for _ in 0..200 {
        world.engine.poll().unwrap();
        let progress = match world.engine.progress(handle) {
            Ok(progress) => progress,
            // The operation was aborted and destroyed.
            Err(_) => return Status::Aborted,
        };
        if progress.status.is_done() {
            return progress.status;
        }
        world.clock.advance(50);
    }
    panic!("operation did not settle");
}

fn stamped(name: &str, date_cs: u64, size: u32) -> FsInfo {
    let stamp = DateStamp::from_cs(date_cs);
    FsInfo {
        name: name.to_string(),
        load_addr: 0xfffffd00 | stamp.high,
        exec_addr: stamp.low,
        size,
        attr: FileAttr::OWNER_READ | FileAttr::OWNER_WRITE,
        obj_type: ObjectType::File,
    }
}

#[test]
fn read_small_file() {
    let mut world = world();
    world.cache.borrow_mut().add_file(":C.$.HELLO/TXT", b"Hello");

    let handle = world
        .engine
        .start(OpKind::Read {
            src: ":C.$.HELLO/TXT".to_string(),
            dest: "/tmp/hello".to_string(),
        })
        .unwrap();
    let status = settle(&mut world, handle);
    assert_eq!(status, Status::Success);

    // Exactly one info, open, read and close, with the single read
    // spanning the whole five bytes.
    let cache = world.cache.borrow();
    assert_eq!(
        cache.log,
        vec![
            CacheCmdKind::Info,
            CacheCmdKind::Open,
            CacheCmdKind::Read,
            CacheCmdKind::Close,
        ]
    );
    assert_eq!(cache.read_lengths, vec![5]);
    drop(cache);

    let hostfs = world.hostfs.borrow();
    assert_eq!(hostfs.files.get("/tmp/hello").unwrap(), b"Hello");
    assert!(hostfs.stamps.contains_key("/tmp/hello"));
    assert!(hostfs.attrs.contains_key("/tmp/hello"));
    drop(hostfs);

    // The remaining-time estimate is zero once the operation is done.
    let progress = world.engine.progress(handle).unwrap();
    assert_eq!(progress.remain, 0);
}

#[test]
fn read_failure_mid_stream_closes_and_reports() {
    let mut world = world();
    world
        .cache
        .borrow_mut()
        .add_file(":C.$.BIG", &vec![9u8; 8192]);
    world.cache.borrow_mut().fail_read = Some((2, Error::RemoteNotReady));

    let handle = world
        .engine
        .start(OpKind::Read {
            src: ":C.$.BIG".to_string(),
            dest: "/tmp/big".to_string(),
        })
        .unwrap();
    let status = settle(&mut world, handle);
    assert_eq!(status, Status::Error);

    // The remote handle was closed after the failure, and the original
    // error (not the close) is what the client sees.
    let cache = world.cache.borrow();
    assert_eq!(cache.closed.len(), 1);
    drop(cache);
    let progress = world.engine.progress(handle).unwrap();
    assert_eq!(
        progress.error.as_deref(),
        Some("Remote device not ready")
    );

    // The partial output was wiped.
    assert!(!world.hostfs.borrow().exists("/tmp/big"));
}

#[test]
fn abort_during_read_wipes_partial_output() {
    let mut world = world();
    world
        .cache
        .borrow_mut()
        .add_file(":C.$.HUGE", &vec![1u8; 1_000_000]);
    world.cache.borrow_mut().manual = true;

    let handle = world
        .engine
        .start(OpKind::Read {
            src: ":C.$.HUGE".to_string(),
            dest: "/tmp/huge".to_string(),
        })
        .unwrap();

    // Info, open and three reads complete before the abort arrives.
    for _ in 0..5 {
        assert!(world.cache.borrow_mut().release_one());
        world.engine.poll().unwrap();
    }
    assert_eq!(world.cache.borrow().read_lengths.len(), 3);

    world.engine.end(handle).unwrap();

    // The in-flight read completes, the abort stage closes the remote
    // handle, and the operation disappears once the close lands.
    while world.cache.borrow_mut().release_one() {
        world.engine.poll().unwrap();
    }
    world.engine.poll().unwrap();

    assert_eq!(world.engine.live_operations(), 0);
    assert_eq!(world.cache.borrow().closed.len(), 1);
    assert!(!world.hostfs.borrow().exists("/tmp/huge"));
}

#[test]
fn backup_diffs_against_the_previous_archive() {
    let mut world = world();

    // Remote tree: A, B and D. Dates are the index's reference point.
    let remote_a = stamped("A", 200, 10);
    let remote_b = stamped("B", 300, 20);
    let remote_d = stamped("D", 400, 30);
    world.cache.borrow_mut().listings.insert(
        ":C.$.Src".to_string(),
        vec![remote_a.clone(), remote_b.clone(), remote_d.clone()],
    );
    for info in [&remote_a, &remote_b, &remote_d].iter() {
        world
            .cache
            .borrow_mut()
            .infos
            .insert(format!(":C.$.Src.{}", info.name), (*info).clone());
        world
            .cache
            .borrow_mut()
            .contents
            .insert(format!(":C.$.Src.{}", info.name), vec![0u8; info.size as usize]);
    }

    // Previous archive: A older than the remote, B identical, C newer
    // than anything the index holds.
    world.tar.borrow_mut().archives.insert(
        "/tmp/prev.tar".to_string(),
        vec![stamped("A", 100, 10), stamped("B", 300, 20), stamped("C", 999, 5)],
    );

    let handle = world
        .engine
        .start(OpKind::Backup {
            src: ":C.$.Src".to_string(),
            dest: "/tmp/new.tar".to_string(),
            prev: "/tmp/prev.tar".to_string(),
            scrap: "/tmp/scrap.tar".to_string(),
            temp: "/tmp/stage".to_string(),
        })
        .unwrap();

    // Exactly one newer-prompt is raised, for C.
    let mut prompts = 0;
    for _ in 0..200 {
        world.engine.poll().unwrap();
        let progress = world.engine.progress(handle).unwrap();
        if progress.status == Status::WaitNewer {
            assert!(progress.detail.unwrap().ends_with(".C"));
            prompts += 1;
            world.engine.respond(handle, Response::Skip).unwrap();
        }
        if progress.status.is_done() {
            break;
        }
        world.clock.advance(50);
    }
    assert_eq!(prompts, 1, "expected exactly one newer-file prompt");
    assert_eq!(
        world.engine.progress(handle).unwrap().status,
        Status::Success
    );

    let events = world.tar.borrow().events.clone();
    // A's stale previous copy goes to the scrap archive; B's identical
    // copy and C's newer copy (the skip answer) are kept in the new
    // archive; A and D are then read fresh from the remote.
    assert!(events.contains(&"copy /tmp/prev.tar /tmp/scrap.tar A".to_string()));
    assert!(events.contains(&"copy /tmp/prev.tar /tmp/new.tar B".to_string()));
    assert!(events.contains(&"copy /tmp/prev.tar /tmp/new.tar C".to_string()));
    assert!(events.contains(&"add /tmp/stage A /tmp/new.tar".to_string()));
    assert!(events.contains(&"add /tmp/stage D /tmp/new.tar".to_string()));
    assert!(!events.iter().any(|e| e.contains("scrap") && e.contains(" B")));
    assert!(!events.iter().any(|e| e.starts_with("add") && e.contains(" B ")));

    // The staging copy is cleaned up.
    assert!(!world.hostfs.borrow().exists("/tmp/stage"));
}

#[test]
fn restart_retries_a_failed_start() {
    let mut world = world();
    world
        .hostfs
        .borrow_mut()
        .files
        .insert("/tmp/tasks".to_string(), b"APP1 doc/odt\nAPP2 \n".to_vec());
    world
        .link
        .borrow_mut()
        .exec_failures
        .insert(b"APP1".to_vec(), 1);

    let handle = world
        .engine
        .start(OpKind::Restart {
            path: "/tmp/tasks".to_string(),
            remove: false,
        })
        .unwrap();

    let mut prompted = false;
    for _ in 0..300 {
        world.engine.poll().unwrap();
        let progress = world.engine.progress(handle).unwrap();
        if progress.status == Status::WaitRestart {
            prompted = true;
            assert!(progress.error.is_some());
            world.engine.respond(handle, Response::Retry).unwrap();
        }
        if progress.status.is_done() {
            break;
        }
        world.clock.advance(50);
    }
    assert!(prompted, "expected a restart prompt");
    assert_eq!(
        world.engine.progress(handle).unwrap().status,
        Status::Success
    );

    // Two attempts for the first task, one for the second.
    let execs = world.link.borrow().execs.clone();
    let app1 = execs.iter().filter(|(name, _)| name == b"APP1").count();
    let app2 = execs.iter().filter(|(name, _)| name == b"APP2").count();
    assert_eq!(app1, 2);
    assert_eq!(app2, 1);
}

#[test]
fn shutdown_grows_the_task_buffer_and_logs_what_it_stops() {
    let mut world = world();
    {
        let mut link = world.link.borrow_mut();
        link.era = false;
        link.sibo = true;
        // Five tasks across two drives overflow the initial buffer of
        // four entries.
        link.tasks_by_drive.insert(
            b'C',
            (0..3)
                .map(|i| psifs::wire::NcpApp {
                    name: format!("CAPP{}", i).into_bytes(),
                    args: format!("C:\\FILE{}.TXT", i).into_bytes(),
                })
                .collect(),
        );
        link.tasks_by_drive.insert(
            b'D',
            (0..2)
                .map(|i| psifs::wire::NcpApp {
                    name: format!("DAPP{}", i).into_bytes(),
                    args: format!("D:\\FILE{}.TXT", i).into_bytes(),
                })
                .collect(),
        );
        for i in 0..3 {
            link.cmd_lines.insert(
                format!("CAPP{}", i).into_bytes(),
                (
                    format!("CAPP{}", i).into_bytes(),
                    format!("C:\\FILE{}.TXT", i).into_bytes(),
                ),
            );
        }
        for i in 0..2 {
            link.cmd_lines.insert(
                format!("DAPP{}", i).into_bytes(),
                (
                    format!("DAPP{}", i).into_bytes(),
                    format!("D:\\FILE{}.TXT", i).into_bytes(),
                ),
            );
        }
    }

    let handle = world
        .engine
        .start(OpKind::Shutdown {
            path: "/tmp/tasks".to_string(),
            pattern: String::new(),
            append: false,
        })
        .unwrap();
    let status = settle(&mut world, handle);
    assert_eq!(status, Status::Success);

    // The first pass used a four-entry buffer, overflowed, and the
    // retry doubled it: every drive is queried in both passes.
    let queries = world
        .link
        .borrow()
        .log
        .iter()
        .filter(|l| l.contains("QueryDrive"))
        .count();
    assert!(queries > 26, "expected a second scan, saw {}", queries);

    // All five tasks were stopped and logged.
    assert_eq!(world.link.borrow().stops.len(), 5);
    let log = world.hostfs.borrow().files.get("/tmp/tasks").cloned().unwrap();
    let lines = log.split(|&b| b == b'\n').filter(|l| !l.is_empty()).count();
    assert_eq!(lines, 5);
}

#[test]
fn handles_are_unique_and_never_invalid() {
    let mut world = world();
    world.cache.borrow_mut().add_file(":C.$.F", b"x");
    let mut handles = Vec::new();
    for _ in 0..10 {
        let handle = world
            .engine
            .start(OpKind::Read {
                src: ":C.$.F".to_string(),
                dest: "/tmp/f".to_string(),
            })
            .unwrap();
        assert_ne!(handle, psifs::ops::ASYNC_INVALID);
        assert!(!handles.contains(&handle));
        handles.push(handle);
        settle(&mut world, handle);
    }
}

#[test]
fn backtree_laws() {
    let tree = BackTree::create();
    let info = stamped("x", 100, 1);
    tree.add(&info).unwrap();
    assert_eq!(tree.check(&info), psifs::backtree::BackTreeResult::Same);
    tree.ignore(&info).unwrap();
    assert_eq!(tree.check(&info), psifs::backtree::BackTreeResult::Missing);
}

#[test]
fn randomised_schedules_keep_the_invariants() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for round in 0..20 {
        let mut world = world();
        world.cache.borrow_mut().add_file(":C.$.F", &vec![3u8; 20_000]);
        world.cache.borrow_mut().manual = true;

        let mut handles = Vec::new();
        for _ in 0..4 {
            let handle = world
                .engine
                .start(OpKind::Read {
                    src: ":C.$.F".to_string(),
                    dest: format!("/tmp/r{}", round),
                })
                .unwrap();
            handles.push(handle);
        }

        for _ in 0..rng.gen_range(5, 60) {
            match rng.gen_range(0u32, 6) {
                0 => {
                    world.cache.borrow_mut().release_one();
                }
                1 => {
                    world.engine.poll().unwrap();
                }
                2 => {
                    let h = handles[rng.gen_range(0, handles.len())];
                    let _ = world.engine.pause(h);
                }
                3 => {
                    let h = handles[rng.gen_range(0, handles.len())];
                    let _ = world.engine.resume(h);
                }
                4 => {
                    let h = handles[rng.gen_range(0, handles.len())];
                    let _ = world.engine.end(h);
                }
                _ => world.clock.advance(rng.gen_range(1, 100)),
            }
            assert!(world.engine.tree_consistent());
        }

        // Wind everything down; the tree must drain completely.
        for &handle in &handles {
            let _ = world.engine.resume(handle);
            let _ = world.engine.end(handle);
        }
        for _ in 0..200 {
            if world.engine.live_operations() == 0 {
                break;
            }
            world.cache.borrow_mut().release_one();
            world.engine.poll().unwrap();
        }
        assert_eq!(world.engine.live_operations(), 0);
        assert!(world.engine.tree_consistent());
        assert_eq!(world.engine.idle().active_operations(), 0);
        assert!(!world.engine.cache_suspended());
    }
}

#[test]
fn completion_raises_the_notification_mask() {
    use psifs::pollword::ChangeMask;

    let mut world = world();
    world.cache.borrow_mut().add_file(":C.$.F", b"x");
    let cell = world
        .engine
        .pollword()
        .register("filer", ChangeMask::ASYNC_STATE | ChangeMask::ASYNC_END);

    let handle = world
        .engine
        .start(OpKind::Read {
            src: ":C.$.F".to_string(),
            dest: "/tmp/f".to_string(),
        })
        .unwrap();
    settle(&mut world, handle);

    assert_ne!(cell.get() & ChangeMask::ASYNC_STATE.bits(), 0);
    assert_ne!(cell.get() & ChangeMask::ASYNC_END.bits(), 0);
}

#[test]
fn finalise_requires_no_pollword_clients() {
    use psifs::pollword::ChangeMask;

    let mut world = world();
    let cell = world
        .engine
        .pollword()
        .register("filer", ChangeMask::ASYNC_END);
    assert_eq!(world.engine.finalise(), Err(Error::ClientsRegistered));
    world.engine.pollword().unregister(&cell).unwrap();
    world.engine.finalise().unwrap();
}
