//! End-to-end scenarios against the live kernel.
//!
//! These run the real launcher: they need root, mounted cgroup v1
//! hierarchies and a Linux kernel, so they are ignored by default.
//! Run with `cargo test -- --ignored` on a suitable host.

use paddock::{ClientSession, Config, Daemon, Event, State};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn live_daemon(tmp: &TempDir) -> Arc<Daemon> {
    let mut config = Config::default();
    config.keyvalue.root = tmp.path().join("kvs");
    config.container.tmp_dir = tmp.path().join("work");
    config.container.start_timeout_ms = 10_000;
    let daemon = Daemon::new(config).unwrap();
    daemon.bootstrap().unwrap();
    daemon
}

/// Pumps reaped children into exit events until the condition holds.
fn wait_for(daemon: &Arc<Daemon>, deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        loop {
            let mut status = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                break;
            }
            if !daemon.reaper.report(pid, status) {
                daemon.handle_event(Event::Exit { pid, status });
            }
        }
        while let Some(event) = daemon.events.try_next() {
            daemon.handle_event(event);
        }
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    done()
}

#[test]
#[ignore = "requires root and cgroup v1 hierarchies"]
fn scenario_create_start_wait_exit() {
    let tmp = TempDir::new().unwrap();
    let daemon = live_daemon(&tmp);
    let client = ClientSession::system();

    let ct = daemon.create(&client, "a").unwrap();
    daemon
        .set_property(&client, "a", "command", "/bin/sh -c 'exit 7'")
        .unwrap();
    daemon.set_property(&client, "a", "isolate", "false").unwrap();

    let woken: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let _record = daemon
        .wait(&client, &["a".to_string()], Vec::new(), None, {
            let woken = woken.clone();
            move |name| {
                if let Some(name) = name {
                    woken.lock().unwrap().push(name.to_string());
                }
            }
        })
        .unwrap();

    daemon.start(&client, "a").unwrap();
    assert_eq!(ct.state(), State::Running);

    assert!(wait_for(&daemon, Duration::from_secs(10), || {
        ct.state() == State::Dead
    }));
    // standard wait-status encoding
    assert_eq!(ct.exit_status(), Some(7 << 8));
    assert_eq!(woken.lock().unwrap().as_slice(), &["a".to_string()]);

    daemon.destroy(&client, "a").unwrap();
}

#[test]
#[ignore = "requires root and cgroup v1 hierarchies"]
fn scenario_meta_aggregation() {
    let tmp = TempDir::new().unwrap();
    let daemon = live_daemon(&tmp);
    let client = ClientSession::system();

    let m = daemon.create(&client, "m").unwrap();
    let x = daemon.create(&client, "m/x").unwrap();
    daemon
        .set_property(&client, "m/x", "command", "/bin/sleep 60")
        .unwrap();
    daemon
        .set_property(&client, "m/x", "isolate", "false")
        .unwrap();

    daemon.start(&client, "m/x").unwrap();
    assert_eq!(m.state(), State::Meta);
    assert_eq!(m.running_children(), 1);
    assert_eq!(x.state(), State::Running);

    daemon.kill(&client, "m/x", libc::SIGKILL).unwrap();
    assert!(wait_for(&daemon, Duration::from_secs(10), || {
        x.state() == State::Dead
    }));
    assert_eq!(m.running_children(), 0);

    daemon.stop(&client, "m", None).unwrap();
    assert_eq!(m.state(), State::Stopped);
    daemon.destroy(&client, "m").unwrap();
}

#[test]
#[ignore = "requires root and cgroup v1 hierarchies"]
fn scenario_respawn_budget() {
    let tmp = TempDir::new().unwrap();
    let daemon = live_daemon(&tmp);
    let client = ClientSession::system();

    let ct = daemon.create(&client, "r").unwrap();
    daemon
        .set_property(&client, "r", "command", "/bin/false")
        .unwrap();
    daemon.set_property(&client, "r", "isolate", "false").unwrap();
    daemon.set_property(&client, "r", "respawn", "true").unwrap();
    daemon.set_property(&client, "r", "max_respawns", "3").unwrap();

    daemon.start(&client, "r").unwrap();

    // exactly three respawns after the initial start, then it stays
    // dead
    assert!(wait_for(&daemon, Duration::from_secs(30), || {
        ct.respawn_count() == 3 && ct.state() == State::Dead && !ct.may_respawn()
    }));

    daemon.destroy(&client, "r").unwrap();
}
