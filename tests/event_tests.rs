//! Tests for event delivery: exit handling, idempotence, waiter
//! wakeups, respawn decisions and aging.

use paddock::cgroup::{CgroupDriver, Hierarchy, CTRL_FREEZER};
use paddock::{ClientSession, Config, Daemon, Event, HostPath, State, WaitRecord};
use std::sync::{Arc, Mutex};
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

/// Puts a container into Running with a fake workload pid, as if the
/// launcher had finished.
fn fake_start(daemon: &Arc<Daemon>, ct: &Arc<paddock::Container>, pid: i32) {
    {
        let mut core = ct.core.lock().unwrap();
        core.task_pid = pid;
        core.task_vpid = pid;
        core.wait_task_pid = pid;
    }
    ct.set_state(daemon, State::Running);
}

#[test]
fn test_exit_event_reaps_container() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();
    let ct = daemon.create(&client, "a").unwrap();
    fake_start(&daemon, &ct, 111_111);

    // standard wait-status encoding for exit code 7
    daemon.handle_event(Event::Exit {
        pid: 111_111,
        status: 7 << 8,
    });

    assert_eq!(ct.state(), State::Dead);
    assert_eq!(ct.exit_status(), Some(7 << 8));
    assert_eq!(ct.task_pid(), 0);
    assert_eq!(ct.wait_task_pid(), 0);
    assert!(ct.death_time_ms() > 0);
}

#[test]
fn test_duplicate_exit_is_noop() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();
    let ct = daemon.create(&client, "a").unwrap();
    fake_start(&daemon, &ct, 222_222);

    daemon.handle_event(Event::Exit {
        pid: 222_222,
        status: 0,
    });
    assert_eq!(ct.state(), State::Dead);
    let death = ct.death_time_ms();

    // the pid is gone from every container; a second event matches
    // nothing
    daemon.handle_event(Event::Exit {
        pid: 222_222,
        status: 9,
    });
    assert_eq!(ct.state(), State::Dead);
    assert_eq!(ct.exit_status(), Some(0));
    assert_eq!(ct.death_time_ms(), death);
}

#[test]
fn test_exit_wakes_waiter_with_name() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();
    let ct = daemon.create(&client, "a").unwrap();
    fake_start(&daemon, &ct, 333_333);

    let woken: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let record = daemon
        .wait(
            &client,
            &["a".to_string()],
            Vec::new(),
            None,
            {
                let woken = woken.clone();
                move |name| woken.lock().unwrap().push(name.map(str::to_string))
            },
        )
        .unwrap();

    assert!(woken.lock().unwrap().is_empty());
    daemon.handle_event(Event::Exit {
        pid: 333_333,
        status: 7 << 8,
    });
    assert_eq!(woken.lock().unwrap().as_slice(), &[Some("a".to_string())]);
    drop(record);
}

#[test]
fn test_wait_on_dead_container_fires_immediately() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();
    let ct = daemon.create(&client, "a").unwrap();
    fake_start(&daemon, &ct, 444_444);
    daemon.handle_event(Event::Exit {
        pid: 444_444,
        status: 0,
    });

    let woken: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let _record = daemon
        .wait(&client, &["a".to_string()], Vec::new(), None, {
            let woken = woken.clone();
            move |name| woken.lock().unwrap().push(name.map(str::to_string))
        })
        .unwrap();
    assert_eq!(woken.lock().unwrap().as_slice(), &[Some("a".to_string())]);
}

#[test]
fn test_wait_timeout_event() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);

    let woken: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let record = WaitRecord::new({
        let woken = woken.clone();
        move |name| woken.lock().unwrap().push(name.map(str::to_string))
    });

    daemon.handle_event(Event::WaitTimeout(Arc::downgrade(&record)));
    assert_eq!(woken.lock().unwrap().as_slice(), &[None]);
}

#[test]
fn test_expired_wait_record_is_dropped() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);

    let weak = {
        let record = WaitRecord::new(|_| panic!("must not fire"));
        Arc::downgrade(&record)
    };
    // the record died with its client; the event is a no-op
    daemon.handle_event(Event::WaitTimeout(weak));
}

// =============================================================================
// Respawn
// =============================================================================

#[test]
fn test_may_respawn_needs_flag_and_budget() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();
    let m = daemon.create(&client, "m").unwrap();
    let ct = daemon.create(&client, "m/a").unwrap();
    m.set_state(&daemon, State::Meta);

    fake_start(&daemon, &ct, 555_555);
    daemon.handle_event(Event::Exit {
        pid: 555_555,
        status: 1 << 8,
    });
    assert_eq!(ct.state(), State::Dead);

    // no respawn flag
    assert!(!ct.may_respawn());

    daemon.set_property(&client, "m/a", "respawn", "true").unwrap();
    daemon
        .set_property(&client, "m/a", "max_respawns", "3")
        .unwrap();
    assert!(ct.may_respawn());

    // budget exhausted
    ct.core.lock().unwrap().respawn_count = 3;
    assert!(!ct.may_respawn());

    // unlimited budget
    daemon
        .set_property(&client, "m/a", "max_respawns", "-1")
        .unwrap();
    assert!(ct.may_respawn());
}

#[test]
fn test_respawn_needs_live_parent() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();
    let m = daemon.create(&client, "m").unwrap();
    let ct = daemon.create(&client, "m/a").unwrap();
    m.set_state(&daemon, State::Meta);

    fake_start(&daemon, &ct, 666_666);
    daemon.set_property(&client, "m/a", "respawn", "true").unwrap();
    daemon.handle_event(Event::Exit {
        pid: 666_666,
        status: 0,
    });
    assert!(ct.may_respawn());

    m.set_state(&daemon, State::Stopped);
    assert!(!ct.may_respawn());
}

#[test]
fn test_exit_schedules_respawn_event() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();
    let ct = daemon.create(&client, "a").unwrap();
    daemon.set_property(&client, "a", "respawn", "true").unwrap();
    fake_start(&daemon, &ct, 777_777);

    assert!(daemon.events.is_empty());
    daemon.handle_event(Event::Exit {
        pid: 777_777,
        status: 0,
    });
    // root is running-parent enough for a top-level container
    assert_eq!(daemon.events.len(), 1);
}

// =============================================================================
// Aging
// =============================================================================

#[test]
fn test_expiry_follows_aging_time() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();
    let ct = daemon.create(&client, "a").unwrap();
    daemon.set_property(&client, "a", "aging_time", "0").unwrap();

    fake_start(&daemon, &ct, 888_888);
    assert!(!ct.expired(), "running containers never expire");

    daemon.handle_event(Event::Exit {
        pid: 888_888,
        status: 0,
    });
    assert!(ct.expired(), "dead container with zero aging time");

    daemon
        .set_property(&client, "a", "aging_time", "86400")
        .unwrap();
    assert!(!ct.expired());
}
