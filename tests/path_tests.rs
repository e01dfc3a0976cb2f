//! Tests for the filesystem primitives that run without privileges:
//! lexical ops, directory clearing, log rotation and record-friendly
//! reads.

use paddock::HostPath;
use std::io::Write;
use tempfile::TempDir;

#[test]
fn test_normalize_resolves_dots() {
    assert_eq!(HostPath::from("/a/b/./../c").normalize().as_str(), "/a/c");
    assert_eq!(HostPath::from("//a///b//").normalize().as_str(), "/a/b");
    assert_eq!(HostPath::from("/../a").normalize().as_str(), "/a");
    assert_eq!(HostPath::from("").normalize().as_str(), ".");
}

#[test]
fn test_inner_path_boundaries() {
    let prefix = HostPath::from("/place/data");
    assert_eq!(
        prefix
            .inner(&HostPath::from("/place/data/vol/root"))
            .unwrap()
            .as_str(),
        "/vol/root"
    );
    assert!(prefix.inner(&HostPath::from("/place/database")).is_none());
    assert_eq!(
        prefix.inner(&HostPath::from("/place/data")).unwrap().as_str(),
        "/"
    );
}

#[test]
fn test_join_ignores_leading_slash() {
    let base = HostPath::from("/root/fs");
    assert_eq!(base.join("/etc/hostname").as_str(), "/root/fs/etc/hostname");
    assert_eq!(base.join("etc/hostname").as_str(), "/root/fs/etc/hostname");
}

#[test]
fn test_mkdir_all_and_list() {
    let tmp = TempDir::new().unwrap();
    let deep = HostPath::new(tmp.path().join("a/b/c"));
    deep.mkdir_all(0o755).unwrap();
    assert!(deep.is_directory_follow());

    let base = HostPath::new(tmp.path().join("a"));
    let names = base.list_names().unwrap();
    assert_eq!(names, vec!["b".to_string()]);
}

#[test]
fn test_clear_directory_keeps_the_directory() {
    let tmp = TempDir::new().unwrap();
    let dir = HostPath::new(tmp.path().join("victim"));
    dir.mkdir(0o755).unwrap();
    dir.join("sub/deeper").mkdir_all(0o755).unwrap();
    std::fs::write(dir.join("file").as_path(), b"data").unwrap();
    std::fs::write(dir.join("sub/deeper/nested").as_path(), b"data").unwrap();

    dir.clear_directory().unwrap();
    assert!(dir.is_directory_follow());
    assert!(dir.list_names().unwrap().is_empty());
}

#[test]
fn test_remove_all_handles_files_and_trees() {
    let tmp = TempDir::new().unwrap();
    let file = HostPath::new(tmp.path().join("plain"));
    std::fs::write(file.as_path(), b"x").unwrap();
    file.remove_all().unwrap();
    assert!(!file.exists());

    let dir = HostPath::new(tmp.path().join("tree"));
    dir.join("a/b").mkdir_all(0o755).unwrap();
    dir.remove_all().unwrap();
    assert!(!dir.exists());
}

#[test]
fn test_read_all_enforces_limit() {
    let tmp = TempDir::new().unwrap();
    let file = HostPath::new(tmp.path().join("big"));
    std::fs::write(file.as_path(), vec![b'x'; 8192]).unwrap();

    assert!(file.read_all(1024).is_err());
    assert_eq!(file.read_all(16384).unwrap().len(), 8192);
}

#[test]
fn test_rotate_log_reports_loss() {
    let tmp = TempDir::new().unwrap();
    let log = HostPath::new(tmp.path().join("stdout"));
    {
        let mut file = std::fs::File::create(log.as_path()).unwrap();
        for i in 0..20_000 {
            writeln!(file, "line number {}", i).unwrap();
        }
    }
    let before = std::fs::metadata(log.as_path()).unwrap().len();

    // collapse-range may be refused here; either way bytes must go and
    // the loss must be reported
    let loss = log.rotate_log(4096).unwrap();
    let after = std::fs::metadata(log.as_path()).unwrap().len();
    assert!(loss > 0);
    assert!(after < before);
}

#[test]
fn test_rotate_log_small_file_untouched() {
    let tmp = TempDir::new().unwrap();
    let log = HostPath::new(tmp.path().join("stderr"));
    std::fs::write(log.as_path(), b"short\n").unwrap();

    let loss = log.rotate_log(1 << 20).unwrap();
    assert_eq!(loss, 0);
    assert_eq!(std::fs::read(log.as_path()).unwrap(), b"short\n");
}

#[test]
fn test_read_lines() {
    let tmp = TempDir::new().unwrap();
    let file = HostPath::new(tmp.path().join("lines"));
    std::fs::write(file.as_path(), "one\ntwo\nthree\n").unwrap();
    assert_eq!(
        file.read_lines(4096).unwrap(),
        vec!["one".to_string(), "two".to_string(), "three".to_string()]
    );
}

#[test]
fn test_mount_table_parses() {
    // every Linux box has a mount table with at least /proc
    let mounts = paddock::path::MountInfo::list_all().unwrap();
    assert!(mounts.iter().any(|m| m.target.as_str() == "/proc"));
    let proc_entry = mounts
        .iter()
        .find(|m| m.target.as_str() == "/proc")
        .unwrap();
    assert_eq!(proc_entry.fstype, "proc");
    assert!(proc_entry.has_option("rw") || proc_entry.has_option("ro"));
}
