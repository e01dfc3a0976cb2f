//! Tests for name resolution across scopes and access levels.

use paddock::cgroup::{CgroupDriver, Hierarchy, CTRL_FREEZER};
use paddock::{AccessLevel, ClientSession, Config, Daemon, ErrorKind, HostPath};
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

/// A session that pretends to run inside the given container.
fn session_in(daemon: &Arc<Daemon>, name: &str) -> ClientSession {
    let mut session = ClientSession::system();
    session.client_ct = Some(daemon.tree.find(name).unwrap());
    session
}

#[test]
fn test_resolution_without_scope() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();
    daemon.create(&client, "a").unwrap();

    let session = session_in(&daemon, "/");
    assert_eq!(session.resolve_name("/").unwrap(), "/");
    assert_eq!(session.resolve_name("a").unwrap(), "a");
    assert_eq!(session.resolve_name("self").unwrap(), "/");
    assert_eq!(session.compose_name("a").unwrap(), "a");
}

#[test]
fn test_resolution_inside_scope() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();
    daemon.create(&client, "app").unwrap();
    daemon
        .set_property(&client, "app", "scope", "app/")
        .unwrap();
    daemon.create(&client, "app/db").unwrap();

    let session = session_in(&daemon, "app");

    // relative names live below the scope
    assert_eq!(session.resolve_name("db").unwrap(), "app/db");
    assert_eq!(session.resolve_name("self").unwrap(), "app");
    assert_eq!(session.resolve_name("self/db").unwrap(), "app/db");
    assert_eq!(session.resolve_name(".").unwrap(), "/");
    assert_eq!(session.resolve_name("/").unwrap(), "/");

    // absolute names must stay inside the scope
    assert_eq!(session.resolve_name("/paddock/app/db").unwrap(), "app/db");
    let err = session.resolve_name("/paddock/other").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permission);

    // composing goes the other way
    assert_eq!(session.compose_name("app/db").unwrap(), "db");
    assert_eq!(session.compose_name("/").unwrap(), "/");
    let err = session.compose_name("other").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permission);
}

#[test]
fn test_scope_validation() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();
    daemon.create(&client, "a").unwrap();

    let err = daemon
        .set_property(&client, "a", "scope", "no-trailing-slash")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidValue);
    daemon.set_property(&client, "a", "scope", "a/").unwrap();
}

#[test]
fn test_nested_scopes_accumulate() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();
    daemon.create(&client, "outer").unwrap();
    daemon
        .set_property(&client, "outer", "scope", "outer/")
        .unwrap();
    daemon.create(&client, "outer/inner").unwrap();
    daemon
        .set_property(&client, "outer/inner", "scope", "inner/")
        .unwrap();
    daemon.create(&client, "outer/inner/leaf").unwrap();

    let session = session_in(&daemon, "outer/inner");
    assert_eq!(session.resolve_name("leaf").unwrap(), "outer/inner/leaf");
    assert_eq!(session.compose_name("outer/inner/leaf").unwrap(), "leaf");
}

#[test]
fn test_access_level_parse() {
    assert_eq!(AccessLevel::parse("none").unwrap(), AccessLevel::None);
    assert_eq!(AccessLevel::parse("false").unwrap(), AccessLevel::None);
    assert_eq!(
        AccessLevel::parse("read-only").unwrap(),
        AccessLevel::ReadOnly
    );
    assert_eq!(
        AccessLevel::parse("child-only").unwrap(),
        AccessLevel::ChildOnly
    );
    assert_eq!(AccessLevel::parse("true").unwrap(), AccessLevel::Normal);
    assert!(AccessLevel::parse("sudo").is_err());
}

#[test]
fn test_read_only_session_cannot_write() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();
    daemon.create(&client, "a").unwrap();

    let mut session = session_in(&daemon, "/");
    session.access_level = AccessLevel::ReadOnly;

    let err = daemon
        .set_property(&session, "a", "command", "/bin/true")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permission);

    // reads still work
    daemon.get_property(&session, "a", "state").unwrap();
}

#[test]
fn test_list_composes_into_scope() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();
    daemon.create(&client, "app").unwrap();
    daemon
        .set_property(&client, "app", "scope", "app/")
        .unwrap();
    daemon.create(&client, "app/db").unwrap();
    daemon.create(&client, "other").unwrap();

    let session = session_in(&daemon, "app");
    let listed = daemon.list(&session);
    assert!(listed.contains(&"db".to_string()));
    assert!(!listed.iter().any(|n| n.contains("other")));
}
