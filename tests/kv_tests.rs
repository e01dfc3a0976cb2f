//! Tests for persistence: record storage and daemon restart
//! round-trips.

use paddock::cgroup::{CgroupDriver, Hierarchy, CTRL_FREEZER};
use paddock::{ClientSession, Config, Daemon, HostPath, KvStore, Record, State};
use std::sync::Arc;
use tempfile::TempDir;

fn test_config(tmp: &TempDir) -> Config {
    let mut config = Config::default();
    config.keyvalue.root = tmp.path().join("kvs");
    config.container.tmp_dir = tmp.path().join("work");
    config
}

fn test_driver(tmp: &TempDir) -> CgroupDriver {
    CgroupDriver::with_hierarchies(vec![Hierarchy {
        kind: "freezer",
        controllers: CTRL_FREEZER,
        mount: HostPath::new(tmp.path().join("freezer")),
    }])
}

fn test_daemon(tmp: &TempDir) -> Arc<Daemon> {
    let daemon = Daemon::with_driver(test_config(tmp), test_driver(tmp)).unwrap();
    daemon.bootstrap().unwrap();
    daemon
}

// =============================================================================
// Store
// =============================================================================

#[test]
fn test_store_save_load_remove() {
    let tmp = TempDir::new().unwrap();
    let store = KvStore::open(HostPath::new(tmp.path().join("kvs"))).unwrap();

    let mut record = Record::new(5, "a/b");
    record.set("command", "/bin/sh -c 'echo hi'");
    record.set("state", "stopped");
    store.save(&record).unwrap();

    let loaded = store.load(5).unwrap();
    assert_eq!(loaded.name, "a/b");
    assert_eq!(loaded.get("command"), Some("/bin/sh -c 'echo hi'"));
    assert_eq!(loaded.get("state"), Some("stopped"));

    store.remove(5).unwrap();
    assert!(store.load(5).is_err());
}

#[test]
fn test_store_lists_parents_first() {
    let tmp = TempDir::new().unwrap();
    let store = KvStore::open(HostPath::new(tmp.path().join("kvs"))).unwrap();

    for (id, name) in [(9, "a/b/c"), (3, "a"), (7, "a/b"), (4, "z")] {
        let mut record = Record::new(id, name);
        record.set("state", "stopped");
        store.save(&record).unwrap();
    }

    let names: Vec<String> = store.list().unwrap().into_iter().map(|r| r.name).collect();
    assert_eq!(names, vec!["a", "z", "a/b", "a/b/c"]);
}

#[test]
fn test_rewrite_is_atomic_on_disk() {
    let tmp = TempDir::new().unwrap();
    let store = KvStore::open(HostPath::new(tmp.path().join("kvs"))).unwrap();

    let mut record = Record::new(1, "a");
    record.set("state", "stopped");
    store.save(&record).unwrap();
    record.set("command", "x".repeat(1000));
    store.save(&record).unwrap();

    // no temp files left behind
    let leftovers: Vec<String> = std::fs::read_dir(tmp.path().join("kvs"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with('.'))
        .collect();
    assert!(leftovers.is_empty(), "temp files left: {:?}", leftovers);
}

// =============================================================================
// Restart round-trip
// =============================================================================

#[test]
fn test_restart_restores_stopped_containers() {
    let tmp = TempDir::new().unwrap();

    {
        let daemon = test_daemon(&tmp);
        let client = ClientSession::system();
        daemon.create(&client, "a").unwrap();
        daemon.create(&client, "a/b").unwrap();
        daemon
            .set_property(&client, "a/b", "command", "/bin/sleep 60")
            .unwrap();
        daemon
            .set_property(&client, "a/b", "memory_limit", "8M")
            .unwrap();
        daemon.set_property(&client, "a/b", "respawn", "true").unwrap();
        daemon
            .set_property(&client, "a/b", "isolate", "false")
            .unwrap();
    }

    // a fresh daemon over the same record root
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();

    assert!(daemon.tree.contains("a"));
    assert!(daemon.tree.contains("a/b"));

    let ct = daemon.tree.find("a/b").unwrap();
    assert_eq!(ct.state(), State::Stopped);
    assert_eq!(
        daemon.get_property(&client, "a/b", "command").unwrap(),
        "/bin/sleep 60"
    );
    assert_eq!(
        daemon.get_property(&client, "a/b", "memory_limit").unwrap(),
        (8u64 << 20).to_string()
    );
    assert_eq!(daemon.get_property(&client, "a/b", "respawn").unwrap(), "true");
    assert_eq!(daemon.get_property(&client, "a/b", "isolate").unwrap(), "false");
}

#[test]
fn test_restart_preserves_ids_and_respawn_count() {
    let tmp = TempDir::new().unwrap();

    let (id_a, id_b) = {
        let daemon = test_daemon(&tmp);
        let client = ClientSession::system();
        let a = daemon.create(&client, "a").unwrap();
        let b = daemon.create(&client, "a/b").unwrap();
        b.core.lock().unwrap().respawn_count = 5;
        b.save(&daemon).unwrap();
        (a.id, b.id)
    };

    let daemon = test_daemon(&tmp);
    assert_eq!(daemon.tree.find("a").unwrap().id, id_a);
    let b = daemon.tree.find("a/b").unwrap();
    assert_eq!(b.id, id_b);
    assert_eq!(b.respawn_count(), 5);
}

#[test]
fn test_restore_without_freezer_forces_stopped() {
    let tmp = TempDir::new().unwrap();

    {
        let daemon = test_daemon(&tmp);
        let client = ClientSession::system();
        let ct = daemon.create(&client, "a").unwrap();
        // pretend the workload was running when the daemon died
        {
            let mut core = ct.core.lock().unwrap();
            core.task_pid = 999_999;
            core.wait_task_pid = 999_999;
            core.state = State::Running;
        }
        ct.save(&daemon).unwrap();
    }

    // no freezer cgroup exists for it in the fake hierarchy
    let daemon = test_daemon(&tmp);
    let ct = daemon.tree.find("a").unwrap();
    assert_eq!(ct.state(), State::Stopped);
}

#[test]
fn test_unknown_record_keys_survive_a_restart() {
    let tmp = TempDir::new().unwrap();
    let store = KvStore::open(HostPath::new(tmp.path().join("kvs"))).unwrap();

    let id = {
        let daemon = test_daemon(&tmp);
        let client = ClientSession::system();
        let ct = daemon.create(&client, "a").unwrap();
        let id = ct.id;
        let mut record = store.load(id).unwrap();
        record.set("knob_from_the_future", "still here");
        store.save(&record).unwrap();
        id
    };

    let daemon = test_daemon(&tmp);
    let ct = daemon.tree.find("a").unwrap();
    assert_eq!(ct.id, id);
    // the daemon rewrote the record on restore, keeping the key
    let record = store.load(id).unwrap();
    assert_eq!(record.get("knob_from_the_future"), Some("still here"));
}
