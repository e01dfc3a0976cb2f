//! Tests for container naming, the id pool and tree membership.
//!
//! Validates the name grammar, parent resolution, id reuse after
//! destroy, and the invariant that the name map always equals the set
//! reachable from the root.

use paddock::cgroup::{CgroupDriver, Hierarchy, CTRL_FREEZER, CTRL_MEMORY};
use paddock::{parent_name, valid_name, ClientSession, Config, Daemon, HostPath, IdPool};
use std::sync::Arc;
use tempfile::TempDir;

fn test_daemon(tmp: &TempDir) -> Arc<Daemon> {
    let mut config = Config::default();
    config.keyvalue.root = tmp.path().join("kvs");
    config.container.tmp_dir = tmp.path().join("work");
    let driver = CgroupDriver::with_hierarchies(vec![
        Hierarchy {
            kind: "freezer",
            controllers: CTRL_FREEZER,
            mount: HostPath::new(tmp.path().join("freezer")),
        },
        Hierarchy {
            kind: "memory",
            controllers: CTRL_MEMORY,
            mount: HostPath::new(tmp.path().join("memory")),
        },
    ]);
    let daemon = Daemon::with_driver(config, driver).unwrap();
    daemon.bootstrap().unwrap();
    daemon
}

// =============================================================================
// Name Grammar
// =============================================================================

#[test]
fn test_valid_names() {
    for name in ["a", "a/b", "web-1", "db_0", "x.y:z@host", "A/B/C"] {
        assert!(valid_name(name).is_ok(), "{} should be valid", name);
    }
}

#[test]
fn test_invalid_names() {
    assert!(valid_name("").is_err());
    assert!(valid_name("/a").is_err());
    assert!(valid_name("a//b").is_err());
    assert!(valid_name("a/").is_err());
    assert!(valid_name("self").is_err());
    assert!(valid_name("a/self/b").is_err());
    assert!(valid_name(".").is_err());
    assert!(valid_name("a b").is_err());
    assert!(valid_name("a*b").is_err());
    assert!(valid_name(&"x".repeat(300)).is_err());
    assert!(valid_name(&format!("{}/{}", "a".repeat(100), "b".repeat(201))).is_err());
}

#[test]
fn test_root_name_is_valid() {
    assert!(valid_name("/").is_ok());
}

#[test]
fn test_parent_name() {
    assert_eq!(parent_name("a"), "/");
    assert_eq!(parent_name("a/b"), "a");
    assert_eq!(parent_name("a/b/c"), "a/b");
}

// =============================================================================
// Id Pool
// =============================================================================

#[test]
fn test_id_pool_monotone_then_reuse() {
    let mut pool = IdPool::new(16);
    let a = pool.get().unwrap();
    let b = pool.get().unwrap();
    let c = pool.get().unwrap();
    assert!(a < b && b < c);

    pool.put(b).unwrap();
    // freed ids are not reused before the pool wraps
    let d = pool.get().unwrap();
    assert!(d > c);
}

#[test]
fn test_id_pool_exhaustion() {
    let mut pool = IdPool::new(4);
    for _ in 0..4 {
        pool.get().unwrap();
    }
    assert!(pool.get().is_err());
    pool.put(2).unwrap();
    assert_eq!(pool.get().unwrap(), 2);
}

#[test]
fn test_id_pool_claims() {
    let mut pool = IdPool::new(16);
    pool.get_at(7).unwrap();
    assert!(pool.get_at(7).is_err());
    assert!(pool.get_at(0).is_err());
    assert!(pool.get_at(17).is_err());
    assert!(pool.put(9).is_err());
    pool.put(7).unwrap();
    pool.get_at(7).unwrap();
}

// =============================================================================
// Tree Membership
// =============================================================================

#[test]
fn test_create_registers_and_destroy_removes() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();

    daemon.create(&client, "a").unwrap();
    daemon.create(&client, "a/b").unwrap();
    daemon.create(&client, "a/b/c").unwrap();

    assert!(daemon.tree.contains("a/b/c"));
    assert_eq!(daemon.tree.len(), 4); // root included

    // the map matches what is reachable from the root
    let root = daemon.root();
    let mut reachable = 0;
    for ct in root.subtree() {
        assert!(daemon.tree.contains(&ct.name));
        reachable += 1;
    }
    assert_eq!(reachable, daemon.tree.len());

    // destroy removes the whole subtree
    daemon.destroy(&client, "a").unwrap();
    assert_eq!(daemon.tree.len(), 1);
    assert!(!daemon.tree.contains("a"));
    assert!(!daemon.tree.contains("a/b/c"));
}

#[test]
fn test_create_requires_parent() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();

    let err = daemon.create(&client, "missing/child").unwrap_err();
    assert_eq!(err.kind(), paddock::ErrorKind::ContainerDoesNotExist);
}

#[test]
fn test_create_duplicate_rejected() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();

    daemon.create(&client, "a").unwrap();
    let err = daemon.create(&client, "a").unwrap_err();
    assert_eq!(err.kind(), paddock::ErrorKind::ContainerAlreadyExists);
}

#[test]
fn test_level_cap() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();

    let mut name = String::new();
    for i in 0..paddock::CONTAINER_LEVEL_MAX {
        if !name.is_empty() {
            name.push('/');
        }
        name.push_str(&format!("l{}", i));
        daemon.create(&client, &name).unwrap();
    }
    let too_deep = format!("{}/bottom", name);
    let err = daemon.create(&client, &too_deep).unwrap_err();
    assert_eq!(err.kind(), paddock::ErrorKind::InvalidValue);
}

#[test]
fn test_id_released_after_destroy() {
    let tmp = TempDir::new().unwrap();
    let daemon = test_daemon(&tmp);
    let client = ClientSession::system();

    let first = daemon.create(&client, "a").unwrap();
    let first_id = first.id;
    drop(first);
    daemon.destroy(&client, "a").unwrap();

    // many later creates will eventually reuse the released id
    let mut seen = false;
    for i in 0..paddock::CONTAINER_LEVEL_MAX as usize * 4096 {
        let name = format!("c{}", i);
        let ct = daemon.create(&client, &name).unwrap();
        let id = ct.id;
        drop(ct);
        daemon.destroy(&client, &name).unwrap();
        if id == first_id {
            seen = true;
            break;
        }
    }
    assert!(seen, "released id was never reused");
}
