//! Workload launcher.
//!
//! Start places a workload into fresh namespaces while keeping the
//! daemon the reaping parent of exactly one descendant (the wait task).
//! The fork tree, smallest first:
//!
//! ```text
//! daemon ── helper ── child ─(exec)─ workload            double fork
//! daemon ── helper ─(reparent)─ child ─ ...              triple fork:
//!                                                        helper execs the
//!                                                        supervisor binary
//! daemon ── helper ── child ─(exec supervisor)           quadro fork:
//!                         └── grandchild ─(exec)─ workload
//! ```
//!
//! The daemon and the forked side exchange exactly three messages over
//! a `SOCK_SEQPACKET` pair before the final error record: the wait pid,
//! the namespace-local pid, and a zero-byte wakeup. Pids cross pid
//! namespaces inside `SCM_CREDENTIALS`, so the kernel translates them
//! into the receiver's view.
//!
//! Code between fork and exec must stay free of locks and logging;
//! failures travel back through the socket as typed error records.

use crate::caps::{Capabilities, SUPERVISOR_CAPABILITIES};
use crate::client::ClientSession;
use crate::container::Container;
use crate::cred::Cred;
use crate::daemon::Daemon;
use crate::error::{Error, ErrorKind, Result};
use crate::path::HostPath;
use crate::property::{rlimit_resource, BindMount, VirtMode};
use nix::mount::MsFlags;
use nix::sched::CloneFlags;
use nix::sys::socket::{
    self, sockopt, ControlMessage, ControlMessageOwned, MsgFlags, UnixCredentials,
};
use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{IoSlice, IoSliceMut, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::sync::Arc;
use tracing::{info, warn};

const CHILD_STACK_SIZE: usize = 64 * 1024;

// =============================================================================
// Environment
// =============================================================================

/// Workload environment with locked entries that user values cannot
/// override.
#[derive(Debug, Clone, Default)]
pub struct Env {
    entries: Vec<(String, String, bool)>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: &str, locked: bool) {
        if let Some(entry) = self.entries.iter_mut().find(|(k, _, _)| k == key) {
            if entry.2 {
                return;
            }
            entry.1 = value.to_string();
            entry.2 = locked;
        } else {
            self.entries
                .push((key.to_string(), value.to_string(), locked));
        }
    }

    /// Merges `K=V` entries; with `overwrite` unset, existing keys win.
    pub fn merge(&mut self, entries: &[String], overwrite: bool) -> Result<()> {
        for entry in entries {
            let Some((key, value)) = entry.split_once('=') else {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("environment entry without '=': {}", entry),
                ));
            };
            if !overwrite && self.entries.iter().any(|(k, _, _)| k == key) {
                continue;
            }
            self.set(key, value, false);
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _, _)| k == key)
            .map(|(_, v, _)| v.as_str())
    }

    /// `K=V` strings for exec.
    pub fn to_strings(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(k, v, _)| format!("{}={}", k, v))
            .collect()
    }
}

// =============================================================================
// Devices
// =============================================================================

/// One permitted device node.
#[derive(Debug, Clone)]
pub struct Device {
    pub path: HostPath,
    pub read: bool,
    pub write: bool,
    pub mknod: bool,
    pub mode: u32,
    pub rdev: u64,
}

impl Device {
    /// Parses `<path> [rwm]`, defaulting to read-write.
    pub fn parse(config: &str) -> Result<Self> {
        let mut fields = config.split_whitespace();
        let path = fields.next().ok_or_else(|| {
            Error::new(ErrorKind::InvalidValue, "empty device configuration")
        })?;
        let perms = fields.next().unwrap_or("rwm");
        if fields.next().is_some() {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                "device takes a path and permissions only",
            ));
        }
        for ch in perms.chars() {
            if !matches!(ch, 'r' | 'w' | 'm' | '-') {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("bad device permission '{}'", ch),
                ));
            }
        }

        let path = HostPath::from(path);
        let meta = path
            .as_path()
            .metadata()
            .map_err(|e| Error::from(e).context(format!("device {}", path)))?;
        let file_type = meta.mode() & libc::S_IFMT;
        if file_type != libc::S_IFCHR && file_type != libc::S_IFBLK {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("not a device node: {}", path),
            ));
        }

        Ok(Self {
            path,
            read: perms.contains('r'),
            write: perms.contains('w'),
            mknod: perms.contains('m'),
            mode: meta.mode(),
            rdev: meta.rdev(),
        })
    }

    /// The owner must already have this access on the host node.
    pub fn permitted(&self, owner: &Cred) -> Result<()> {
        if owner.is_root() {
            return Ok(());
        }
        let meta = self
            .path
            .as_path()
            .metadata()
            .map_err(|e| Error::from(e).context(format!("device {}", self.path)))?;
        let mode = if meta.uid() == owner.uid {
            meta.mode() >> 6
        } else if owner.is_member_of(meta.gid()) {
            meta.mode() >> 3
        } else {
            meta.mode()
        };
        if (self.read && mode & 0o4 == 0) || (self.write && mode & 0o2 == 0) {
            return Err(Error::new(
                ErrorKind::Permission,
                format!("device access denied: {}", self.path),
            ));
        }
        Ok(())
    }

    fn major(&self) -> u64 {
        libc::major(self.rdev as libc::dev_t) as u64
    }

    fn minor(&self) -> u64 {
        libc::minor(self.rdev as libc::dev_t) as u64
    }

    /// `c 1:3 rwm` style rule for the devices cgroup.
    pub fn cgroup_rule(&self) -> String {
        let kind = if self.mode & libc::S_IFMT == libc::S_IFBLK {
            'b'
        } else {
            'c'
        };
        let mut perms = String::new();
        if self.read {
            perms.push('r');
        }
        if self.write {
            perms.push('w');
        }
        if self.mknod {
            perms.push('m');
        }
        format!("{} {}:{} {}", kind, self.major(), self.minor(), perms)
    }

    /// Replicates the node under the container root.
    pub fn makedev(&self, root: &HostPath) -> Result<()> {
        if root.is_root() {
            return Ok(()); // host /dev is already there
        }
        let target = root.join(self.path.as_str());
        if target.exists() {
            return Ok(());
        }
        target.dir_name().mkdir_all(0o755)?;
        target.mknod(self.mode, self.rdev)
    }
}

// =============================================================================
// Synchronization socket
// =============================================================================

/// One end of the launcher handshake socket.
pub struct SyncSock {
    fd: OwnedFd,
}

impl SyncSock {
    /// A `SOCK_SEQPACKET` pair with credential passing enabled.
    pub fn pair() -> Result<(SyncSock, SyncSock)> {
        let (a, b) = socket::socketpair(
            socket::AddressFamily::Unix,
            socket::SockType::SeqPacket,
            None,
            socket::SockFlag::SOCK_CLOEXEC,
        )?;
        socket::setsockopt(&a, sockopt::PassCred, &true)?;
        socket::setsockopt(&b, sockopt::PassCred, &true)?;
        Ok((SyncSock { fd: a }, SyncSock { fd: b }))
    }

    pub fn set_recv_timeout(&self, timeout_ms: u64) -> Result<()> {
        let tv = nix::sys::time::TimeVal::new(
            (timeout_ms / 1000) as nix::sys::time::time_t,
            ((timeout_ms % 1000) * 1000) as nix::sys::time::suseconds_t,
        );
        socket::setsockopt(&self.fd, sockopt::ReceiveTimeout, &tv)?;
        Ok(())
    }

    /// Sends `pid` with credentials claiming that pid, so the kernel
    /// translates it into the receiver's pid namespace.
    pub fn send_pid(&self, pid: i32) -> Result<()> {
        let payload = pid.to_ne_bytes();
        let ucred = libc::ucred {
            pid,
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        };
        let creds = UnixCredentials::from(ucred);
        let iov = [IoSlice::new(&payload)];
        let cmsg = [ControlMessage::ScmCredentials(&creds)];
        socket::sendmsg::<()>(self.fd.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
            .map_err(|e| Error::from(e).context("send pid"))?;
        Ok(())
    }

    /// Sends `payload_pid` while the credentials claim `claim_pid`;
    /// used to forward another process's pid across namespaces.
    pub fn send_pid_as(&self, claim_pid: i32, payload_pid: i32) -> Result<()> {
        let payload = payload_pid.to_ne_bytes();
        let ucred = libc::ucred {
            pid: claim_pid,
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        };
        let creds = UnixCredentials::from(ucred);
        let iov = [IoSlice::new(&payload)];
        let cmsg = [ControlMessage::ScmCredentials(&creds)];
        socket::sendmsg::<()>(self.fd.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
            .map_err(|e| Error::from(e).context("send pid"))?;
        Ok(())
    }

    /// Receives a pid: the kernel-translated value from the credentials
    /// plus the raw value as the sender saw it.
    pub fn recv_pid(&self) -> Result<(i32, i32)> {
        let mut payload = [0u8; 4];
        let (translated, bytes) = {
            let mut cmsg_buffer = nix::cmsg_space!(UnixCredentials);
            let mut iov = [IoSliceMut::new(&mut payload)];
            let msg = socket::recvmsg::<()>(
                self.fd.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buffer),
                MsgFlags::empty(),
            )
            .map_err(|e| Error::from(e).context("recv pid"))?;
            let mut translated = 0;
            for cmsg in msg.cmsgs()? {
                if let ControlMessageOwned::ScmCredentials(creds) = cmsg {
                    translated = creds.pid();
                }
            }
            (translated, msg.bytes)
        };
        if bytes != 4 {
            return Err(Error::new(ErrorKind::Unknown, "short pid message"));
        }
        Ok((translated, i32::from_ne_bytes(payload)))
    }

    /// Zero-byte wakeup.
    pub fn send_zero(&self) -> Result<()> {
        let iov = [IoSlice::new(&[0u8; 1])];
        socket::sendmsg::<()>(self.fd.as_raw_fd(), &iov, &[], MsgFlags::empty(), None)
            .map_err(|e| Error::from(e).context("send wakeup"))?;
        Ok(())
    }

    pub fn recv_zero(&self) -> Result<()> {
        let mut payload = [0u8; 1];
        let bytes = {
            let mut iov = [IoSliceMut::new(&mut payload)];
            let msg =
                socket::recvmsg::<()>(self.fd.as_raw_fd(), &mut iov, None, MsgFlags::empty())
                    .map_err(|e| Error::from(e).context("recv wakeup"))?;
            msg.bytes
        };
        if bytes != 1 {
            return Err(Error::new(ErrorKind::Unknown, "lost wakeup"));
        }
        Ok(())
    }

    /// Sends the final error record: kind, errno, message.
    pub fn send_error(&self, result: &Result<()>) -> Result<()> {
        let (kind, errno, msg) = match result {
            Ok(()) => (0u32, 0i32, String::new()),
            Err(err) => (err.kind() as u32, err.errno(), err.message().to_string()),
        };
        let mut buf = Vec::with_capacity(8 + msg.len());
        buf.extend_from_slice(&kind.to_ne_bytes());
        buf.extend_from_slice(&errno.to_ne_bytes());
        buf.extend_from_slice(msg.as_bytes());
        let iov = [IoSlice::new(&buf)];
        socket::sendmsg::<()>(self.fd.as_raw_fd(), &iov, &[], MsgFlags::empty(), None)
            .map_err(|e| Error::from(e).context("send error record"))?;
        Ok(())
    }

    /// Receives the final error record. End-of-stream without a record
    /// means every writer exec'd or exited cleanly, which is success.
    pub fn recv_error(&self) -> Result<()> {
        let mut buf = [0u8; 4096];
        let bytes = {
            let mut iov = [IoSliceMut::new(&mut buf)];
            let msg =
                socket::recvmsg::<()>(self.fd.as_raw_fd(), &mut iov, None, MsgFlags::empty())
                    .map_err(|e| Error::from(e).context("recv error record"))?;
            msg.bytes
        };
        if bytes == 0 {
            return Ok(());
        }
        if bytes < 8 {
            return Err(Error::new(ErrorKind::Unknown, "short error record"));
        }
        let kind = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
        if kind == 0 {
            return Ok(());
        }
        let errno = i32::from_ne_bytes(buf[4..8].try_into().unwrap());
        let message = String::from_utf8_lossy(&buf[8..bytes]).into_owned();
        Err(Error::with_errno(ErrorKind::from_raw(kind), errno, message))
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

// =============================================================================
// Parent namespaces
// =============================================================================

/// Namespace fds of the running parent container, entered by the helper
/// before cloning.
pub struct ParentNamespaces {
    fds: Vec<(CloneFlags, File)>,
}

impl ParentNamespaces {
    /// Grabs every namespace of `pid` worth entering, in entry order.
    /// The mount namespace goes last because it changes path
    /// resolution.
    pub fn open(pid: i32) -> Result<Self> {
        let mut fds = Vec::new();
        for (name, flag) in [
            ("ipc", CloneFlags::CLONE_NEWIPC),
            ("uts", CloneFlags::CLONE_NEWUTS),
            ("net", CloneFlags::CLONE_NEWNET),
            ("pid", CloneFlags::CLONE_NEWPID),
            ("mnt", CloneFlags::CLONE_NEWNS),
        ] {
            let path = format!("/proc/{}/ns/{}", pid, name);
            let file = File::open(&path)
                .map_err(|e| Error::from(e).context(format!("open {}", path)))?;
            fds.push((flag, file));
        }
        Ok(Self { fds })
    }

    pub fn enter(&self) -> Result<()> {
        for (flag, file) in &self.fds {
            nix::sched::setns(file, *flag)
                .map_err(|e| Error::from(e).context(format!("setns({:?})", flag)))?;
        }
        Ok(())
    }
}

/// Whether two pids share a pid namespace.
pub fn in_pid_namespace(pid: i32, other: i32) -> bool {
    let a = std::fs::read_link(format!("/proc/{}/ns/pid", pid));
    let b = std::fs::read_link(format!("/proc/{}/ns/pid", other));
    matches!((a, b), (Ok(a), Ok(b)) if a == b)
}

// =============================================================================
// Command parsing
// =============================================================================

/// Splits a command line into words, honouring single and double quotes
/// and backslash escapes. No substitution of any kind.
pub fn split_command(command: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = command.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            ' ' | '\t' if in_word => {
                words.push(std::mem::take(&mut word));
                in_word = false;
            }
            ' ' | '\t' => {}
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => word.push(ch),
                        None => {
                            return Err(Error::new(
                                ErrorKind::InvalidValue,
                                "unterminated single quote in command",
                            ))
                        }
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(esc) => word.push(esc),
                            None => {
                                return Err(Error::new(
                                    ErrorKind::InvalidValue,
                                    "trailing backslash in command",
                                ))
                            }
                        },
                        Some(ch) => word.push(ch),
                        None => {
                            return Err(Error::new(
                                ErrorKind::InvalidValue,
                                "unterminated double quote in command",
                            ))
                        }
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(esc) => word.push(esc),
                    None => {
                        return Err(Error::new(
                            ErrorKind::InvalidValue,
                            "trailing backslash in command",
                        ))
                    }
                }
            }
            ch => {
                in_word = true;
                word.push(ch);
            }
        }
    }
    if in_word {
        words.push(word);
    }
    Ok(words)
}

// =============================================================================
// Spawn environment
// =============================================================================

/// Everything the launcher needs, snapshotted from the container before
/// any fork so no locks are touched on the child side.
pub struct SpawnEnv {
    pub name: String,
    pub command: String,
    pub env: Vec<String>,
    pub cred: Cred,
    pub cwd: HostPath,
    pub parent_cwd: HostPath,
    pub root: HostPath,
    pub root_ro: bool,
    pub run_size: u64,
    pub binds: Vec<BindMount>,
    pub devices: Vec<Device>,
    pub rlimits: BTreeMap<String, (u64, u64)>,
    pub hostname: String,
    pub resolv_conf: Vec<String>,
    pub bind_dns: bool,
    pub umask: u32,
    pub isolate: bool,
    pub os_mode: bool,
    pub is_meta: bool,
    pub new_mount_ns: bool,
    pub triple_fork: bool,
    pub quadro_fork: bool,
    pub cap_ambient: Capabilities,
    pub cap_limit: Capabilities,
    pub cgroup_dirs: Vec<HostPath>,
    pub stdin_path: String,
    pub stdout_path: String,
    pub stderr_path: String,
    pub work_dir: HostPath,
    pub parent_ns: Option<ParentNamespaces>,
    pub init_fd: Option<File>,
    pub start_timeout_ms: u64,

    /// Filled in by `start`.
    pub task_pid: i32,
    pub task_vpid: i32,
    pub wait_task_pid: i32,
}

impl SpawnEnv {
    /// Snapshots the container and decides the fork tree shape.
    pub fn prepare(
        daemon: &Daemon,
        ct: &Arc<Container>,
        client: &ClientSession,
    ) -> Result<SpawnEnv> {
        let _ = client;
        let env = ct.get_env(daemon)?.to_strings();

        // everything that locks the property set goes first
        let cwd = HostPath::new(ct.cwd());
        let parent_cwd = ct
            .parent()
            .map(|p| HostPath::new(p.cwd()))
            .unwrap_or_else(HostPath::root);
        let run_size = {
            let limit = ct.total_mem_limit();
            let total = if limit != 0 {
                limit
            } else {
                crate::property::total_memory()
            };
            total / 2
        };

        let props = ct.props.lock().unwrap();

        let mut cred = props.owner.clone();
        if props.virt_mode == VirtMode::Os {
            cred = Cred::root();
        } else {
            let user = cred.user_name();
            cred.load_groups(&user)?;
        }

        let root = {
            // the root in terms of the mount namespace we launch from
            let own_root = ct.root_path.lock().unwrap().clone();
            match ct.parent() {
                Some(parent) => {
                    let parent_root = parent.root_path.lock().unwrap().clone();
                    parent_root.inner(&own_root).unwrap_or(own_root)
                }
                None => own_root,
            }
        };

        let is_meta = ct.is_root() || props.command.is_empty();
        let quadro_fork = props.virt_mode == VirtMode::App && props.isolate && !is_meta;

        let mut spawn_env = SpawnEnv {
            name: ct.name.clone(),
            command: props.command.clone(),
            env,
            cred,
            cwd,
            parent_cwd,
            root,
            root_ro: props.root_ro,
            run_size,
            binds: props.binds.clone(),
            devices: Vec::new(),
            rlimits: props.ulimit.clone(),
            hostname: props.hostname.clone(),
            resolv_conf: props.resolv_conf.clone(),
            bind_dns: props.bind_dns,
            umask: props.umask,
            isolate: props.isolate,
            os_mode: props.virt_mode == VirtMode::Os,
            is_meta,
            new_mount_ns: false,
            triple_fork: false,
            quadro_fork,
            cap_ambient: props.cap_ambient,
            cap_limit: props.cap_limit,
            cgroup_dirs: Vec::new(),
            stdin_path: "/dev/null".to_string(),
            stdout_path: props.stdout_path.clone(),
            stderr_path: props.stderr_path.clone(),
            work_dir: ct.work_dir.clone(),
            parent_ns: None,
            init_fd: None,
            start_timeout_ms: daemon.config.container.start_timeout_ms,
            task_pid: 0,
            task_vpid: 0,
            wait_task_pid: 0,
        };

        spawn_env.new_mount_ns = props.isolate
            || !props.binds.is_empty()
            || !props.hostname.is_empty()
            || !props.resolv_conf.is_empty()
            || !spawn_env.root.is_root()
            || props.root_ro;

        drop(props);

        spawn_env.devices = ct.configure_devices(daemon)?;

        let controllers = ct.controllers();
        for hy in daemon.cgroups.hierarchies() {
            if controllers & hy.controllers != 0 {
                spawn_env.cgroup_dirs.push(ct.get_cgroup(hy).path());
            }
        }

        // enter the namespaces of the nearest running ancestor
        let mut running_parent = None;
        let mut cursor = ct.parent();
        while let Some(parent) = cursor {
            if parent.task_pid() != 0 {
                running_parent = Some(parent.clone());
                break;
            }
            cursor = parent.parent();
        }
        if let Some(parent) = &running_parent {
            let parent_pid = parent.task_pid();
            spawn_env.parent_ns = Some(ParentNamespaces::open(parent_pid)?);
            // a nested pid namespace needs a reparenting fork
            if spawn_env.isolate && !in_pid_namespace(parent_pid, std::process::id() as i32) {
                spawn_env.triple_fork = true;
            }
        }

        if spawn_env.is_meta || spawn_env.triple_fork || spawn_env.quadro_fork {
            spawn_env.init_fd = Some(open_supervisor_binary()?);
        }

        Ok(spawn_env)
    }

    // =========================================================================
    // Daemon side
    // =========================================================================

    /// Runs the launch handshake. On success the task pids are filled
    /// in; on failure everything already created is killed.
    pub fn start(&mut self, daemon: &Daemon) -> Result<()> {
        self.task_pid = 0;
        self.task_vpid = 0;
        self.wait_task_pid = 0;

        let (master, slave) = SyncSock::pair()?;

        let helper_pid = raw_fork().map_err(|err| {
            warn!(error = %err, "cannot spawn helper");
            err
        })?;

        if helper_pid == 0 {
            // never returns
            helper_main(self, &master, &slave);
        }

        daemon.reaper.claim(helper_pid);
        drop(slave);

        let result = self.handshake(daemon, &master, helper_pid);
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                info!(name = %self.name, error = %err, "kill partially constructed container");
                for dir in &self.cgroup_dirs {
                    let _ = kill_cgroup(dir, libc::SIGKILL);
                }
                unsafe { libc::kill(helper_pid, libc::SIGKILL) };
                let _ = daemon.reaper.wait_child(helper_pid, 1000);
                self.task_pid = 0;
                self.task_vpid = 0;
                self.wait_task_pid = 0;
                Err(err)
            }
        }
    }

    fn handshake(&mut self, daemon: &Daemon, master: &SyncSock, helper_pid: i32) -> Result<()> {
        master.set_recv_timeout(self.start_timeout_ms)?;

        let (wait_pid, _raw) = master.recv_pid()?;
        self.wait_task_pid = wait_pid;

        let (task_pid, task_vpid) = master.recv_pid()?;
        self.task_pid = task_pid;
        self.task_vpid = task_vpid;

        let status = daemon
            .reaper
            .wait_child(helper_pid, self.start_timeout_ms)?;

        // the task exists now, even a dead one leaves a zombie to reap
        if let Err(err) = master.send_zero() {
            warn!(name = %self.name, error = %err, "task wakeup failed");
        }

        // the error record beats the helper exit status
        master.recv_error()?;

        if status != 0 {
            return Err(Error::new(
                ErrorKind::Unknown,
                format!("start failed, helper status {}", status),
            ));
        }
        Ok(())
    }
}

/// Locates the supervisor binary next to the daemon executable.
fn open_supervisor_binary() -> Result<File> {
    let exe = std::fs::read_link("/proc/self/exe")
        .map_err(|e| Error::from(e).context("readlink /proc/self/exe"))?;
    let path = exe
        .parent()
        .map(|dir| dir.join("paddock-init"))
        .ok_or_else(|| Error::new(ErrorKind::Unknown, "daemon binary has no directory"))?;
    File::open(&path)
        .map_err(|e| Error::from(e).context(format!("open {}", path.display())))
}

/// fork(2) without the libc pthread machinery; a plain fork may
/// deadlock inside libc after entering a foreign pid namespace.
fn raw_fork() -> Result<i32> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_clone,
            libc::SIGCHLD as libc::c_ulong,
            0usize,
            0usize,
            0usize,
            0usize,
        )
    };
    if ret < 0 {
        return Err(Error::sys("fork()"));
    }
    Ok(ret as i32)
}

fn gettid() -> i32 {
    (unsafe { libc::syscall(libc::SYS_gettid) }) as i32
}

/// SIGKILLs every pid listed in a cgroup directory, bypassing the
/// cgroup driver to stay lock-free on cleanup paths.
fn kill_cgroup(dir: &HostPath, sig: i32) -> Result<()> {
    let text = dir.join("cgroup.procs").read_all(16 * 1024 * 1024)?;
    for line in text.lines() {
        if let Ok(pid) = line.trim().parse::<i32>() {
            unsafe { libc::kill(pid, sig) };
        }
    }
    Ok(())
}

// =============================================================================
// Helper side (first fork)
// =============================================================================

/// The helper: enters the parent container's namespaces, clones the
/// child with the requested namespace flags and relays the handshake.
/// Runs right after fork; no locks, no logging, errors go to the
/// socket. Success sends nothing: the daemon reads end-of-stream after
/// every writer is gone.
fn helper_main(env: &SpawnEnv, master: &SyncSock, slave: &SyncSock) -> ! {
    let mut stage = 0;
    match helper_run(env, master, slave, &mut stage) {
        Ok(()) => unsafe { libc::_exit(0) },
        Err(err) => {
            // fill the protocol so the daemon never blocks
            for _ in stage..2 {
                let _ = slave.send_pid(unsafe { libc::getpid() });
            }
            let _ = slave.send_error(&Err(err));
            unsafe { libc::_exit(1) }
        }
    }
}

fn helper_run(
    env: &SpawnEnv,
    master: &SyncSock,
    slave: &SyncSock,
    stage: &mut u32,
) -> Result<()> {
    reset_signal_mask();
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
        libc::setsid();
    }
    set_process_name("paddockd-spawn-p");

    // move into the target cgroups before any child exists
    let pid = unsafe { libc::getpid() };
    for dir in &env.cgroup_dirs {
        attach_pid(dir, pid)?;
    }

    setup_stdio(env)?;

    if let Some(parent_ns) = &env.parent_ns {
        parent_ns.enter()?;
    }

    if env.triple_fork {
        // reparent through the foreign pid namespace: the middle
        // process dies at once and the daemon keeps waiting on us
        let pid = raw_fork()?;
        if pid != 0 {
            unsafe { libc::_exit(0) };
        }
    }

    let mut quadro_socks = if env.quadro_fork {
        Some(SyncSock::pair()?)
    } else {
        None
    };

    let mut clone_flags = CloneFlags::empty();
    if env.isolate {
        clone_flags |= CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWIPC;
    }
    if env.new_mount_ns {
        clone_flags |= CloneFlags::CLONE_NEWNS;
    }
    if env.isolate || !env.hostname.is_empty() {
        clone_flags |= CloneFlags::CLONE_NEWUTS;
    }

    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    let clone_pid = {
        let quadro = quadro_socks.as_ref().map(|(_, sock2)| sock2);
        let cb = Box::new(|| -> isize {
            child_main(env, slave, quadro);
        });
        unsafe { nix::sched::clone(cb, &mut stack, clone_flags, Some(libc::SIGCHLD)) }.map_err(
            |err| {
                let kind = if err == nix::Error::ENOMEM {
                    ErrorKind::ResourceNotAvailable
                } else {
                    ErrorKind::Unknown
                };
                Error::with_errno(kind, err as i32, "clone()")
            },
        )?
    };
    let clone_pid = clone_pid.as_raw();

    // wait pid in the host namespace
    if env.triple_fork {
        slave.send_pid(gettid())?;
    } else {
        slave.send_pid(clone_pid)?;
    }
    *stage += 1;

    // the namespace-local pid when the child cannot report it itself
    if env.isolate && !env.quadro_fork {
        slave.send_pid(clone_pid)?;
        *stage += 1;
    }

    // wait-pid delivered, release the child
    master.send_zero()?;

    if !env.isolate && !env.quadro_fork {
        // the child reports its own pid
        *stage += 1;
    }

    if let Some((master2, sock2)) = quadro_socks.take() {
        // close our copy of the child end so a dead child reads as EOF
        drop(sock2);
        let (app_pid, app_vpid) = master2.recv_pid()?;
        // forward: claim the translated pid, keep the in-container view
        slave.send_pid_as(app_pid, app_vpid)?;
        *stage += 1;
        master2.send_zero()?;
    }

    if env.triple_fork {
        // become the supervisor that waits for the child
        SUPERVISOR_CAPABILITIES.apply_limit()?;
        let wait_pid = clone_pid.to_string();
        let args = ["--container", env.name.as_str(), "--wait", wait_pid.as_str()];
        exec_supervisor(env, &args)?;
        unsafe {
            libc::kill(clone_pid, libc::SIGKILL);
            libc::_exit(1);
        }
    }

    Ok(())
}

/// Opens stdin/stdout/stderr in the host context and installs them as
/// fds 0..2, inherited by the workload across clone and exec.
fn setup_stdio(env: &SpawnEnv) -> Result<()> {
    let open_out = |path: &str| -> Result<File> {
        let host_path = if path.starts_with('/') {
            HostPath::from(path)
        } else {
            env.work_dir.join(path)
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o644)
            .open(host_path.as_path())
            .map_err(|e| Error::from(e).context(format!("open {}", host_path)))?;
        let meta = file.metadata();
        if let Ok(meta) = meta {
            if meta.permissions().mode() & libc::S_IFMT as u32 == libc::S_IFREG as u32 {
                let _ = nix::unistd::fchown(
                    file.as_raw_fd(),
                    Some(nix::unistd::Uid::from_raw(env.cred.uid)),
                    Some(nix::unistd::Gid::from_raw(env.cred.gid)),
                );
            }
        }
        Ok(file)
    };

    let stdin = File::open(&env.stdin_path)
        .map_err(|e| Error::from(e).context(format!("open {}", env.stdin_path)))?;
    let stdout = open_out(&env.stdout_path)?;
    let stderr = open_out(&env.stderr_path)?;

    for (fd, target) in [
        (stdin.as_raw_fd(), 0),
        (stdout.as_raw_fd(), 1),
        (stderr.as_raw_fd(), 2),
    ] {
        if unsafe { libc::dup2(fd, target) } < 0 {
            return Err(Error::sys(format!("dup2({}, {})", fd, target)));
        }
    }
    Ok(())
}

fn attach_pid(cgroup_dir: &HostPath, pid: i32) -> Result<()> {
    let procs = cgroup_dir.join("cgroup.procs");
    let mut file = OpenOptions::new()
        .write(true)
        .open(procs.as_path())
        .map_err(|e| Error::from(e).context(format!("open {}", procs)))?;
    file.write_all(pid.to_string().as_bytes())
        .map_err(|e| Error::from(e).context(format!("attach {} to {}", pid, cgroup_dir)))?;
    Ok(())
}

// =============================================================================
// Child side (clone)
// =============================================================================

/// The child inside the new namespaces. Steps are gated on the socket:
/// wakeup, report pid, configure, wakeup, exec.
fn child_main(env: &SpawnEnv, sock: &SyncSock, quadro_sock: Option<&SyncSock>) -> ! {
    set_process_name("paddockd-spawn-c");

    let mut stage = 1; // wait pid already reported by the helper
    let result = child_run(env, sock, quadro_sock, &mut stage);

    for _ in stage..2 {
        let _ = sock.send_pid(unsafe { libc::getpid() });
    }
    let _ = sock.send_error(&result.map(|_| ()));
    unsafe { libc::_exit(1) }
}

fn child_run(
    env: &SpawnEnv,
    sock: &SyncSock,
    quadro_sock: Option<&SyncSock>,
    stage: &mut u32,
) -> Result<std::convert::Infallible> {
    // wait until the daemon knows our wait pid
    sock.recv_zero()?;

    // report the pid we have in the parent's pid namespace
    if !env.isolate {
        sock.send_pid(unsafe { libc::getpid() })?;
        *stage += 1;
    } else if !env.quadro_fork {
        *stage += 1; // helper reported the clone pid
    }

    configure_child(env, quadro_sock, stage)?;

    // final barrier before exec
    sock.recv_zero()?;

    reset_signal_mask();
    reset_signal_handlers();

    child_exec(env, sock)
}

fn configure_child(
    env: &SpawnEnv,
    quadro_sock: Option<&SyncSock>,
    stage: &mut u32,
) -> Result<()> {
    // die together with the supervisor
    if env.triple_fork {
        unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) };
    }

    for (name, (cur, max)) in &env.rlimits {
        let Some(resource) = rlimit_resource(name) else {
            continue;
        };
        let limit = libc::rlimit {
            rlim_cur: *cur,
            rlim_max: *max,
        };
        if unsafe { libc::setrlimit(resource as _, &limit) } != 0 {
            return Err(Error::sys(format!("setrlimit({}, {}:{})", name, cur, max)));
        }
    }

    if unsafe { libc::setsid() } < 0 {
        return Err(Error::sys("setsid()"));
    }
    unsafe { libc::umask(0) };

    if env.new_mount_ns {
        // become a propagation receiver first
        mnt_remount_flags("/", MsFlags::MS_SLAVE | MsFlags::MS_REC)?;
    }

    if env.isolate {
        // a fresh /proc makes the new pid namespace visible
        let proc_path = HostPath::from("/proc");
        proc_path.umount_all()?;
        mnt_mount(
            "proc",
            "/proc",
            "proc",
            MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            "",
        )?;
    }

    if env.new_mount_ns && env.root.is_root() {
        let sys = HostPath::from("/sys");
        sys.umount_all()?;
        mnt_mount(
            "sysfs",
            "/sys",
            "sysfs",
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV | MsFlags::MS_RDONLY,
            "",
        )?;
    }

    mount_root_fs(env)?;

    for dev in &env.devices {
        dev.makedev(&env.root)?;
    }

    if env.new_mount_ns && env.bind_dns && env.resolv_conf.is_empty() && !env.root.is_root() {
        let target = env.root.join("etc/resolv.conf");
        if target.exists() {
            target.bind(&HostPath::from("/etc/resolv.conf"))?;
        }
    }

    for bind in &env.binds {
        let source = if bind.source.is_absolute() {
            bind.source.clone()
        } else {
            env.parent_cwd.join(bind.source.as_str())
        };
        let target = env.root.join(bind.target.as_str());
        if source.is_directory_follow() {
            if !target.exists() {
                target.mkdir_all(0o755)?;
            }
        } else if !target.exists() {
            target.dir_name().mkdir_all(0o755)?;
            target.mkfile(0o600)?;
        }
        target.bind_all(&source)?;
        if bind.read_only {
            target.remount(MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY)?;
        }
    }

    if env.root_ro {
        env.root
            .remount(MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY)?;
    }

    isolate_fs(env)?;

    if !env.resolv_conf.is_empty() {
        let mut text = String::new();
        for line in &env.resolv_conf {
            text.push_str(line);
            text.push('\n');
        }
        HostPath::from("/etc/resolv.conf").write_private(&text)?;
    }

    if !env.hostname.is_empty() {
        HostPath::from("/etc/hostname").write_private(&format!("{}\n", env.hostname))?;
        nix::unistd::sethostname(&env.hostname)
            .map_err(|e| Error::from(e).context("sethostname"))?;
    }

    std::env::set_current_dir(env.cwd.as_path())
        .map_err(|e| Error::from(e).context(format!("chdir({})", env.cwd)))?;

    if env.new_mount_ns {
        // subcontainers receive propagation from us
        mnt_remount_flags("/", MsFlags::MS_SHARED | MsFlags::MS_REC)?;
    }

    if env.quadro_fork {
        let Some(sock2) = quadro_sock else {
            return Err(Error::new(ErrorKind::Unknown, "quadro fork without second socket"));
        };
        let pid = raw_fork()?;
        if pid != 0 {
            // pid 1 of the namespace: exec the supervisor around the
            // workload
            SUPERVISOR_CAPABILITIES.apply_limit()?;
            let wait_pid = pid.to_string();
            let args = ["--container", env.name.as_str(), "--wait", wait_pid.as_str()];
            exec_supervisor(env, &args)?;
            unsafe { libc::_exit(1) };
        }
        // the workload-to-be reports through the helper
        sock2.send_pid(unsafe { libc::getpid() })?;
        sock2.recv_zero()?;
        // the helper forwards the namespace-local pid from here on
        *stage += 1;
        if unsafe { libc::setsid() } < 0 {
            return Err(Error::sys("setsid()"));
        }
    }

    // keep capabilities across the credential switch, then narrow them
    unsafe { libc::prctl(libc::PR_SET_KEEPCAPS, 1) };
    env.cred.apply()?;
    if !env.cred.is_root() {
        env.cap_ambient.apply_effective()?;
    }
    env.cap_ambient.apply_ambient()?;
    env.cap_limit.apply_limit()?;

    unsafe { libc::umask(env.umask as libc::mode_t) };

    Ok(())
}

fn child_exec(env: &SpawnEnv, sock: &SyncSock) -> Result<std::convert::Infallible> {
    if env.is_meta {
        unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, 0) };
        let args = ["--container", env.name.as_str()];
        exec_supervisor(env, &args)?;
        return Err(Error::sys("fexecve(paddock-init)"));
    }

    let words = split_command(&env.command)?;
    if words.is_empty() {
        return Err(Error::new(ErrorKind::InvalidValue, "empty command"));
    }

    unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, 0) };
    close_all_except(&[0, 1, 2, sock.as_raw_fd()]);

    let argv = to_cstrings(&words)?;
    let envp = to_cstrings(&env.env)?;
    let argv_ptrs = to_ptr_vec(&argv);
    let envp_ptrs = to_ptr_vec(&envp);
    unsafe { libc::execvpe(argv[0].as_ptr(), argv_ptrs.as_ptr(), envp_ptrs.as_ptr()) };
    Err(Error::with_errno(
        ErrorKind::InvalidValue,
        std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        format!("execvpe({}, {} args)", words[0], words.len()),
    ))
}

/// fexecve of the supervisor binary; only returns on failure.
fn exec_supervisor(env: &SpawnEnv, args: &[&str]) -> Result<()> {
    let Some(init) = &env.init_fd else {
        return Err(Error::new(ErrorKind::Unknown, "supervisor binary not open"));
    };
    let fd = init.as_raw_fd();
    close_all_except(&[0, 1, 2, fd]);

    let mut words = vec!["paddock-init".to_string()];
    words.extend(args.iter().map(|s| s.to_string()));
    let argv = to_cstrings(&words)?;
    let envp = to_cstrings(&env.env)?;
    let argv_ptrs = to_ptr_vec(&argv);
    let envp_ptrs = to_ptr_vec(&envp);
    unsafe { libc::fexecve(fd, argv_ptrs.as_ptr(), envp_ptrs.as_ptr()) };
    Err(Error::with_errno(
        ErrorKind::InvalidValue,
        std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        format!("fexecve({}, paddock-init)", fd),
    ))
}

// =============================================================================
// Mount sequence
// =============================================================================

/// Builds the container filesystem under `env.root`, then pivots into
/// it.
fn mount_root_fs(env: &SpawnEnv) -> Result<()> {
    let root = &env.root;
    if root.is_root() {
        return Ok(());
    }

    // the root must be a mount point before pivot
    root.bind_all(root)?;

    let run_opts = format!("mode=755,size={}", env.run_size);
    for (sub, fstype, flags, data) in [
        (
            "proc",
            "proc",
            MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            String::new(),
        ),
        (
            "sys",
            "sysfs",
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV | MsFlags::MS_RDONLY,
            String::new(),
        ),
        (
            "dev",
            "tmpfs",
            MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
            "mode=755,size=65536k".to_string(),
        ),
        ("run", "tmpfs", MsFlags::MS_NOSUID | MsFlags::MS_NODEV, run_opts),
    ] {
        let target = root.join(sub);
        if !target.exists() {
            target.mkdir_all(0o755)?;
        }
        mnt_mount(fstype, target.as_str(), fstype, flags, &data)?;
    }

    for sub in ["dev/pts", "dev/shm"] {
        let target = root.join(sub);
        target.mkdir_all(0o755)?;
    }
    mnt_mount(
        "devpts",
        root.join("dev/pts").as_str(),
        "devpts",
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        "newinstance,ptmxmode=0666,mode=620,gid=5",
    )?;
    mnt_mount(
        "tmpfs",
        root.join("dev/shm").as_str(),
        "tmpfs",
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        "mode=1777,size=65536k",
    )?;

    // baseline device nodes every workload expects
    for (name, mode, rdev) in [
        ("dev/null", libc::S_IFCHR | 0o666, libc::makedev(1, 3)),
        ("dev/zero", libc::S_IFCHR | 0o666, libc::makedev(1, 5)),
        ("dev/full", libc::S_IFCHR | 0o666, libc::makedev(1, 7)),
        ("dev/random", libc::S_IFCHR | 0o666, libc::makedev(1, 8)),
        ("dev/urandom", libc::S_IFCHR | 0o666, libc::makedev(1, 9)),
        ("dev/tty", libc::S_IFCHR | 0o666, libc::makedev(5, 0)),
    ] {
        let node = root.join(name);
        if !node.exists() {
            node.mknod(mode, rdev as u64)?;
        }
    }
    for (link, target) in [
        ("dev/ptmx", "pts/ptmx"),
        ("dev/fd", "/proc/self/fd"),
        ("dev/stdin", "/proc/self/fd/0"),
        ("dev/stdout", "/proc/self/fd/1"),
        ("dev/stderr", "/proc/self/fd/2"),
    ] {
        let path = root.join(link);
        if !path.exists() {
            path.symlink(&HostPath::from(target))?;
        }
    }
    Ok(())
}

/// The pivot itself; afterwards `/` is the container root.
fn isolate_fs(env: &SpawnEnv) -> Result<()> {
    let root = &env.root;
    if root.is_root() {
        return Ok(());
    }

    let old_root = File::open("/").map_err(|e| Error::from(e).context("open /"))?;
    let new_root =
        File::open(root.as_path()).map_err(|e| Error::from(e).context(format!("open {}", root)))?;

    if unsafe { libc::fchdir(new_root.as_raw_fd()) } != 0 {
        return Err(Error::sys("fchdir(new root)"));
    }
    nix::unistd::pivot_root(".", ".").map_err(|e| Error::from(e).context("pivot_root()"))?;
    if unsafe { libc::fchdir(old_root.as_raw_fd()) } != 0 {
        return Err(Error::sys("fchdir(old root)"));
    }
    HostPath::from(".").umount(nix::mount::MntFlags::MNT_DETACH)?;
    if unsafe { libc::fchdir(new_root.as_raw_fd()) } != 0 {
        return Err(Error::sys("fchdir(new root) reenter"));
    }
    std::env::set_current_dir("/").map_err(|e| Error::from(e).context("chdir(/)"))?;
    Ok(())
}

fn mnt_mount(source: &str, target: &str, fstype: &str, flags: MsFlags, data: &str) -> Result<()> {
    let data_opt = if data.is_empty() { None } else { Some(data) };
    nix::mount::mount(
        Some(source),
        target,
        Some(fstype),
        flags,
        data_opt,
    )
    .map_err(|e| Error::from(e).context(format!("mount({}, {}, {})", source, target, fstype)))
}

fn mnt_remount_flags(target: &str, flags: MsFlags) -> Result<()> {
    nix::mount::mount(None::<&str>, target, None::<&str>, flags, None::<&str>)
        .map_err(|e| Error::from(e).context(format!("remount({}, {:?})", target, flags)))
}

// =============================================================================
// Process plumbing
// =============================================================================

fn set_process_name(name: &str) {
    if let Ok(cname) = CString::new(name) {
        unsafe { libc::prctl(libc::PR_SET_NAME, cname.as_ptr()) };
    }
}

fn reset_signal_mask() {
    let set = nix::sys::signal::SigSet::empty();
    let _ = nix::sys::signal::sigprocmask(
        nix::sys::signal::SigmaskHow::SIG_SETMASK,
        Some(&set),
        None,
    );
}

fn reset_signal_handlers() {
    for sig in 1..32 {
        if sig == libc::SIGKILL || sig == libc::SIGSTOP {
            continue;
        }
        unsafe { libc::signal(sig, libc::SIG_DFL) };
    }
}

/// Closes every descriptor not in `keep`, reading the list from
/// `/proc/self/fd` first so nothing is closed while iterating.
fn close_all_except(keep: &[RawFd]) {
    let mut fds = Vec::new();
    if let Ok(entries) = std::fs::read_dir("/proc/self/fd") {
        for entry in entries.flatten() {
            if let Ok(fd) = entry.file_name().to_string_lossy().parse::<RawFd>() {
                fds.push(fd);
            }
        }
    }
    for fd in fds {
        if !keep.contains(&fd) {
            unsafe { libc::close(fd) };
        }
    }
}

fn to_cstrings(words: &[String]) -> Result<Vec<CString>> {
    words
        .iter()
        .map(|w| {
            CString::new(w.as_str())
                .map_err(|_| Error::new(ErrorKind::InvalidValue, "NUL byte in argument"))
        })
        .collect()
}

fn to_ptr_vec(cstrings: &[CString]) -> Vec<*const libc::c_char> {
    let mut ptrs: Vec<*const libc::c_char> = cstrings.iter().map(|c| c.as_ptr()).collect();
    ptrs.push(std::ptr::null());
    ptrs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_command_plain() {
        assert_eq!(
            split_command("/bin/sleep 60").unwrap(),
            vec!["/bin/sleep", "60"]
        );
    }

    #[test]
    fn test_split_command_quotes() {
        assert_eq!(
            split_command("sh -c 'exit 7'").unwrap(),
            vec!["sh", "-c", "exit 7"]
        );
        assert_eq!(
            split_command("echo \"a b\" c\\ d").unwrap(),
            vec!["echo", "a b", "c d"]
        );
        assert_eq!(split_command("echo ''").unwrap(), vec!["echo", ""]);
    }

    #[test]
    fn test_split_command_rejects_unterminated() {
        assert!(split_command("sh -c 'oops").is_err());
        assert!(split_command("echo \"oops").is_err());
        assert!(split_command("echo oops\\").is_err());
    }

    #[test]
    fn test_env_locked_entries() {
        let mut env = Env::new();
        env.set("NAME", "fixed", true);
        env.set("NAME", "override", false);
        assert_eq!(env.get("NAME"), Some("fixed"));

        env.merge(&["NAME=sneaky".to_string(), "EXTRA=1".to_string()], true)
            .unwrap();
        assert_eq!(env.get("NAME"), Some("fixed"));
        assert_eq!(env.get("EXTRA"), Some("1"));
    }

    #[test]
    fn test_env_merge_no_overwrite() {
        let mut env = Env::new();
        env.set("A", "1", false);
        env.merge(&["A=2".to_string(), "B=3".to_string()], false).unwrap();
        assert_eq!(env.get("A"), Some("1"));
        assert_eq!(env.get("B"), Some("3"));
        assert!(env.merge(&["BROKEN".to_string()], false).is_err());
    }

    #[test]
    fn test_sync_sock_pid_roundtrip() {
        let (a, b) = SyncSock::pair().unwrap();
        a.send_pid(std::process::id() as i32).unwrap();
        let (translated, raw) = b.recv_pid().unwrap();
        assert_eq!(translated, std::process::id() as i32);
        assert_eq!(raw, std::process::id() as i32);
    }

    #[test]
    fn test_sync_sock_error_roundtrip() {
        let (a, b) = SyncSock::pair().unwrap();
        a.send_error(&Ok(())).unwrap();
        assert!(b.recv_error().is_ok());

        let err = Error::with_errno(ErrorKind::InvalidValue, libc::ENOENT, "execvpe(/bin/nope)");
        a.send_error(&Err(err.clone())).unwrap();
        let got = b.recv_error().unwrap_err();
        assert_eq!(got.kind(), ErrorKind::InvalidValue);
        assert_eq!(got.errno(), libc::ENOENT);
        assert_eq!(got.message(), "execvpe(/bin/nope)");
    }

    #[test]
    fn test_sync_sock_zero_roundtrip() {
        let (a, b) = SyncSock::pair().unwrap();
        a.send_zero().unwrap();
        b.recv_zero().unwrap();
    }
}
