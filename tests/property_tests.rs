//! Tests for the property catalog and per-container state machine
//! accounting.

use paddock::cgroup::{CgroupDriver, Hierarchy, CTRL_FREEZER};
use paddock::{ClientSession, Config, Daemon, ErrorKind, HostPath, State};
use std::sync::Arc;
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
fn test_set_then_get() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();
    daemon.create(&client, "a").unwrap();

    daemon
        .set_property(&client, "a", "command", "/bin/sleep 60")
        .unwrap();
    assert_eq!(
        daemon.get_property(&client, "a", "command").unwrap(),
        "/bin/sleep 60"
    );

    daemon
        .set_property(&client, "a", "memory_limit", "4M")
        .unwrap();
    assert_eq!(
        daemon.get_property(&client, "a", "memory_limit").unwrap(),
        (4u64 << 20).to_string()
    );

    daemon.set_property(&client, "a", "respawn", "true").unwrap();
    assert_eq!(daemon.get_property(&client, "a", "respawn").unwrap(), "true");
}

#[test]
fn test_rejected_value_keeps_old() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();
    daemon.create(&client, "a").unwrap();

    daemon
        .set_property(&client, "a", "cpu_policy", "batch")
        .unwrap();
    let err = daemon
        .set_property(&client, "a", "cpu_policy", "turbo")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidValue);
    assert_eq!(
        daemon.get_property(&client, "a", "cpu_policy").unwrap(),
        "batch"
    );
}

#[test]
fn test_unknown_property() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();
    daemon.create(&client, "a").unwrap();

    let err = daemon.get_property(&client, "a", "warp_drive").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidProperty);
    let err = daemon
        .set_property(&client, "a", "warp_drive", "on")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidProperty);
}

#[test]
fn test_read_only_property_rejects_writes() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();
    daemon.create(&client, "a").unwrap();

    assert_eq!(daemon.get_property(&client, "a", "state").unwrap(), "stopped");
    let err = daemon
        .set_property(&client, "a", "state", "running")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidValue);
}

#[test]
fn test_root_is_read_only() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();

    let err = daemon
        .set_property(&client, "/", "command", "/bin/true")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permission);
}

#[test]
fn test_env_indexed_access() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();
    daemon.create(&client, "a").unwrap();

    daemon
        .set_property(&client, "a", "env", "FOO=1;BAR=two")
        .unwrap();
    assert_eq!(daemon.get_property(&client, "a", "env[BAR]").unwrap(), "two");

    daemon
        .set_property(&client, "a", "env[FOO]", "updated")
        .unwrap();
    assert_eq!(
        daemon.get_property(&client, "a", "env[FOO]").unwrap(),
        "updated"
    );

    let err = daemon.get_property(&client, "a", "env[NOPE]").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidValue);
}

#[test]
fn test_bad_sizes_rejected() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();
    daemon.create(&client, "a").unwrap();

    for value in ["lots", "-1", "4X"] {
        let err = daemon
            .set_property(&client, "a", "memory_limit", value)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue, "value {}", value);
    }
}

// =============================================================================
// Running-children accounting
// =============================================================================

#[test]
fn test_running_children_counts_descendants() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();
    let m = daemon.create(&client, "m").unwrap();
    let x = daemon.create(&client, "m/x").unwrap();
    let y = daemon.create(&client, "m/y").unwrap();

    m.set_state(&daemon, State::Meta);
    x.set_state(&daemon, State::Running);
    assert_eq!(m.running_children(), 1);

    y.set_state(&daemon, State::Running);
    assert_eq!(m.running_children(), 2);
    assert_eq!(daemon.root().running_children(), 2);

    x.set_state(&daemon, State::Dead);
    assert_eq!(m.running_children(), 1);
    y.set_state(&daemon, State::Dead);
    assert_eq!(m.running_children(), 0);
    assert_eq!(daemon.root().running_children(), 0);
}

#[test]
fn test_meta_with_no_running_children_wakes_waiters() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();
    let m = daemon.create(&client, "m").unwrap();
    let x = daemon.create(&client, "m/x").unwrap();

    m.set_state(&daemon, State::Meta);
    x.set_state(&daemon, State::Running);

    let woken = Arc::new(std::sync::Mutex::new(Vec::new()));
    let record = {
        let woken = woken.clone();
        paddock::WaitRecord::new(move |name| {
            woken.lock().unwrap().push(name.map(str::to_string));
        })
    };
    m.add_waiter(&record);

    x.set_state(&daemon, State::Dead);
    let woken = woken.lock().unwrap();
    assert_eq!(woken.as_slice(), &[Some("m".to_string())]);
}
