//! Tests for the tree lock protocol.
//!
//! A write lock must exclude everything on the container and its
//! subtree; read locks coexist with other readers and with readers on
//! ancestors; try-lock reports Busy instead of waiting; blocked waiters
//! make progress once the holder releases.

use paddock::cgroup::{CgroupDriver, Hierarchy, CTRL_FREEZER};
use paddock::{ClientSession, Config, Daemon, ErrorKind, HostPath};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn test_daemon(tmp: &TempDir) -> Arc<Daemon> {
    let mut config = Config::default();
    config.keyvalue.root = tmp.path().join("kvs");
    config.container.tmp_dir = tmp.path().join("work");
    let driver = CgroupDriver::with_hierarchies(vec![Hierarchy {
        kind: "freezer",
        controllers: CTRL_FREEZER,
        mount: HostPath::new(tmp.path().join("freezer")),
    }]);
    let daemon = Daemon::with_driver(config, driver).unwrap();
    daemon.bootstrap().unwrap();
    daemon
}

#[test]
fn test_readers_share() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();
    let ct = daemon.create(&client, "a").unwrap();

    let first = daemon.tree.lock_read(&ct).unwrap();
    let second = daemon.tree.lock_read(&ct).unwrap();
    drop(first);
    drop(second);
}

#[test]
fn test_writer_excludes_readers_and_writers() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();
    let ct = daemon.create(&client, "a").unwrap();

    let write = daemon.tree.lock_write(&ct).unwrap();
    assert_eq!(
        daemon.tree.try_lock_read(&ct).unwrap_err().kind(),
        ErrorKind::Busy
    );
    assert_eq!(
        daemon.tree.try_lock_write(&ct).unwrap_err().kind(),
        ErrorKind::Busy
    );
    drop(write);
    daemon.tree.try_lock_read(&ct).unwrap();
}

#[test]
fn test_descendant_read_blocks_ancestor_write() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();
    let parent = daemon.create(&client, "a").unwrap();
    let child = daemon.create(&client, "a/b").unwrap();

    let child_read = daemon.tree.lock_read(&child).unwrap();

    // the ancestor can still be read but not written
    daemon.tree.try_lock_read(&parent).unwrap();
    assert_eq!(
        daemon.tree.try_lock_write(&parent).unwrap_err().kind(),
        ErrorKind::Busy
    );

    drop(child_read);
    daemon.tree.try_lock_write(&parent).unwrap();
}

#[test]
fn test_ancestor_write_blocks_descendant_locks() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();
    let parent = daemon.create(&client, "a").unwrap();
    let child = daemon.create(&client, "a/b").unwrap();

    let parent_write = daemon.tree.lock_write(&parent).unwrap();
    assert_eq!(
        daemon.tree.try_lock_read(&child).unwrap_err().kind(),
        ErrorKind::Busy
    );
    assert_eq!(
        daemon.tree.try_lock_write(&child).unwrap_err().kind(),
        ErrorKind::Busy
    );
    drop(parent_write);
    daemon.tree.try_lock_write(&child).unwrap();
}

#[test]
fn test_sibling_writes_are_independent() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();
    let a = daemon.create(&client, "a").unwrap();
    let b = daemon.create(&client, "b").unwrap();

    let _a_write = daemon.tree.lock_write(&a).unwrap();
    daemon.tree.try_lock_write(&b).unwrap();
}

#[test]
fn test_blocked_writer_makes_progress() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();
    let ct = daemon.create(&client, "a").unwrap();

    let read = daemon.tree.lock_read(&ct).unwrap();
    let acquired = Arc::new(AtomicBool::new(false));

    let waiter = {
        let daemon = daemon.clone();
        let ct = ct.clone();
        let acquired = acquired.clone();
        thread::spawn(move || {
            let _write = daemon.tree.lock_write(&ct).unwrap();
            acquired.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!acquired.load(Ordering::SeqCst), "writer jumped the read lock");

    drop(read);
    waiter.join().unwrap();
    assert!(acquired.load(Ordering::SeqCst));
}

#[test]
fn test_lock_on_destroyed_container_fails() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();
    let ct = daemon.create(&client, "a").unwrap();

    daemon.destroy(&client, "a").unwrap();
    let err = daemon.tree.lock_read(&ct).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ContainerDoesNotExist);
}

#[test]
fn test_concurrent_readers_and_writers_exclusion() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();
    let ct = daemon.create(&client, "a").unwrap();

    let writers_inside = Arc::new(AtomicBool::new(false));
    let violation = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();

    for i in 0..8 {
        let daemon = daemon.clone();
        let ct = ct.clone();
        let writers_inside = writers_inside.clone();
        let violation = violation.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..50 {
                if i % 2 == 0 {
                    let _guard = daemon.tree.lock_write(&ct).unwrap();
                    if writers_inside.swap(true, Ordering::SeqCst) {
                        violation.store(true, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_micros(50));
                    writers_inside.store(false, Ordering::SeqCst);
                } else {
                    let _guard = daemon.tree.lock_read(&ct).unwrap();
                    if writers_inside.load(Ordering::SeqCst) {
                        violation.store(true, Ordering::SeqCst);
                    }
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(!violation.load(Ordering::SeqCst), "lock protocol violated");
}
