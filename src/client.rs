//! Client sessions and access control.
//!
//! A session is one connection on the control socket. The peer is
//! identified by `SO_PEERCRED` and by the freezer cgroup of its pid,
//! which yields the container the client lives in; relative names are
//! resolved against that container's scope. Requests on one session are
//! strictly serialized through the `processing` flag.

use crate::constants::{DOT_CONTAINER, ROOT_CONTAINER, ROOT_SCOPE, SELF_CONTAINER};
use crate::container::{Container, State};
use crate::cred::Cred;
use crate::daemon::Daemon;
use crate::error::{Error, ErrorKind, Result};
use crate::path::HostPath;
use crate::tree::ContainerLock;
use nix::sys::socket::{getsockopt, sockopt};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

/// How much a client may do, lowest first. A container's level caps
/// every client inside it, and the minimum along the ancestor chain
/// wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessLevel {
    /// Management disabled entirely.
    None,
    /// Read-only introspection.
    ReadOnly,
    /// Full control, but only below the client's own container.
    ChildOnly,
    /// Full control subject to ownership checks.
    Normal,
    /// Root on the host: ownership checks waived.
    SuperUser,
    /// The daemon itself.
    Internal,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::None => "none",
            AccessLevel::ReadOnly => "read-only",
            AccessLevel::ChildOnly => "child-only",
            AccessLevel::Normal => "normal",
            AccessLevel::SuperUser => "super-user",
            AccessLevel::Internal => "internal",
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        match text {
            "none" | "false" => Ok(AccessLevel::None),
            "read-only" => Ok(AccessLevel::ReadOnly),
            "child-only" => Ok(AccessLevel::ChildOnly),
            "normal" | "true" => Ok(AccessLevel::Normal),
            other => Err(Error::new(
                ErrorKind::InvalidValue,
                format!("unknown access level: {}", other),
            )),
        }
    }
}

// =============================================================================
// Wait records
// =============================================================================

/// One outstanding wait request. Containers keep weak references; the
/// record fires at most once, with the name of the container that
/// reached a terminal state, or with `None` on timeout.
pub struct WaitRecord {
    callback: Mutex<Option<Box<dyn FnOnce(Option<&str>) + Send>>>,
    wildcards: Vec<String>,
}

impl WaitRecord {
    pub fn new(callback: impl FnOnce(Option<&str>) + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            callback: Mutex::new(Some(Box::new(callback))),
            wildcards: Vec::new(),
        })
    }

    /// A record that additionally listens for every container matching
    /// one of the shell-style patterns.
    pub fn with_wildcards(
        wildcards: Vec<String>,
        callback: impl FnOnce(Option<&str>) + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            callback: Mutex::new(Some(Box::new(callback))),
            wildcards,
        })
    }

    pub fn has_wildcards(&self) -> bool {
        !self.wildcards.is_empty()
    }

    /// Fires the callback for `name` unless the record already fired.
    /// Wildcard records only fire on a pattern match.
    pub fn wake(&self, name: &str) {
        if !self.wildcards.is_empty() && !self.matches(name) {
            return;
        }
        if let Some(callback) = self.callback.lock().unwrap().take() {
            callback(Some(name));
        }
    }

    /// Fires with no name; used by the wait-deadline event.
    pub fn wake_timeout(&self) {
        if let Some(callback) = self.callback.lock().unwrap().take() {
            callback(None);
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.wildcards.iter().any(|w| glob_match(w, name))
    }
}

/// Minimal `*`/`?` glob matching for wait wildcards.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    fn matches(pattern: &[char], text: &[char]) -> bool {
        match (pattern.first(), text.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                matches(&pattern[1..], text)
                    || (!text.is_empty() && matches(pattern, &text[1..]))
            }
            (Some('?'), Some(_)) => matches(&pattern[1..], &text[1..]),
            (Some(p), Some(t)) if p == t => matches(&pattern[1..], &text[1..]),
            _ => false,
        }
    }
    matches(&pattern, &text)
}

// =============================================================================
// Sessions
// =============================================================================

/// One control-socket connection, or the daemon's own internal
/// identity.
pub struct ClientSession {
    pub fd: Option<OwnedFd>,
    pub pid: i32,
    /// Credentials the session acts with (the owner for containerized
    /// clients).
    pub cred: Cred,
    /// Raw peer credentials.
    pub task_cred: Cred,
    pub comm: String,
    pub access_level: AccessLevel,
    pub client_ct: Option<Arc<Container>>,
    /// Containers created weak by this session, destroyed on
    /// disconnect.
    pub weak_containers: Vec<Weak<Container>>,
    /// Serializes requests per session.
    pub processing: bool,

    read_buf: Vec<u8>,
    read_off: usize,
    frame_len: usize,
    write_buf: Vec<u8>,
    write_off: usize,
}

impl ClientSession {
    /// The daemon acting on its own behalf.
    pub fn system() -> Self {
        Self {
            fd: None,
            pid: 0,
            cred: Cred::root(),
            task_cred: Cred::root(),
            comm: "<system>".to_string(),
            access_level: AccessLevel::Internal,
            client_ct: None,
            weak_containers: Vec::new(),
            processing: false,
            read_buf: Vec::new(),
            read_off: 0,
            frame_len: 0,
            write_buf: Vec::new(),
            write_off: 0,
        }
    }

    /// Wraps an accepted connection; identification happens right
    /// after.
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self {
            fd: Some(fd),
            ..Self::system_base()
        }
    }

    fn system_base() -> Self {
        let mut base = Self::system();
        base.access_level = AccessLevel::None;
        base.cred = Cred::default();
        base.task_cred = Cred::default();
        base.comm = String::new();
        base
    }

    pub fn is_super_user(&self) -> bool {
        self.access_level >= AccessLevel::SuperUser
    }

    // =========================================================================
    // Identification
    // =========================================================================

    /// Resolves who is talking: peer credentials, the container owning
    /// the peer pid, and the resulting access level.
    pub fn identify(&mut self, daemon: &Daemon, initial: bool) -> Result<()> {
        let Some(fd) = &self.fd else {
            return Ok(()); // internal session
        };

        let peer = getsockopt(fd, sockopt::PeerCredentials)
            .map_err(|e| Error::from(e).context("cannot identify client"))?;

        // re-identification is cheap to skip while the container lives
        if !initial
            && self.pid == peer.pid()
            && self.task_cred.uid == peer.uid()
            && self.task_cred.gid == peer.gid()
        {
            if let Some(ct) = &self.client_ct {
                if matches!(ct.state(), State::Running | State::Meta) {
                    return Ok(());
                }
            }
        }

        self.task_cred = Cred::new(peer.uid(), peer.gid());
        self.pid = peer.pid();

        let ct = daemon.find_task_container(self.pid)?;

        let mut access = ct.props.lock().unwrap().access_level;
        let mut cursor = ct.parent();
        while let Some(ancestor) = cursor {
            access = access.min(ancestor.props.lock().unwrap().access_level);
            cursor = ancestor.parent();
        }
        if access == AccessLevel::None {
            return Err(Error::new(
                ErrorKind::Permission,
                format!("management disabled in container {}", ct.name),
            ));
        }
        if !ct.is_root() && !matches!(ct.state(), State::Running | State::Meta) {
            return Err(Error::new(
                ErrorKind::Permission,
                format!("client from container in state {}", ct.state().as_str()),
            ));
        }
        self.access_level = access;

        self.comm = HostPath::new(format!("/proc/{}/comm", self.pid))
            .read_all(64)
            .map(|comm| comm.trim_end().to_string())
            .unwrap_or_else(|_| "<unknown process>".to_string());

        if ct.is_root() {
            // host clients act as themselves
            self.cred = self.task_cred.clone();
            if let Err(err) = self.cred.load_groups_of_pid(self.pid) {
                warn!(pid = self.pid, error = %err, "cannot load supplementary groups");
            }
        } else {
            // containerized clients act on behalf of the owner
            self.cred = ct.props.lock().unwrap().owner.clone();
        }

        if self.cred.is_root() {
            if self.access_level == AccessLevel::Normal {
                self.access_level = AccessLevel::SuperUser;
            }
        } else if let Some(gid) = daemon.socket_gid {
            // outside the management group only reading is allowed
            if !self.cred.is_member_of(gid) && self.access_level >= AccessLevel::ReadOnly {
                self.access_level = AccessLevel::ReadOnly;
            }
        }

        self.client_ct = Some(ct);
        debug!(pid = self.pid, comm = %self.comm, level = self.access_level.as_str(),
               "client identified");
        Ok(())
    }

    fn scope(&self) -> String {
        self.client_ct
            .as_ref()
            .map(|ct| ct.scope_prefix())
            .unwrap_or_default()
    }

    // =========================================================================
    // Names
    // =========================================================================

    /// Maps an absolute container name into the client's view.
    pub fn compose_name(&self, name: &str) -> Result<String> {
        if name == ROOT_CONTAINER {
            return Ok(ROOT_CONTAINER.to_string());
        }
        let scope = self.scope();
        if scope.is_empty() {
            return Ok(name.to_string());
        }
        match name.strip_prefix(&scope) {
            Some(relative) => Ok(relative.to_string()),
            None => Err(Error::new(
                ErrorKind::Permission,
                format!("cannot access container {} from scope {}", name, scope),
            )),
        }
    }

    /// Resolves a client-relative name to an absolute one. `/` is the
    /// root, `self` the caller's container, `.` the scope parent, and
    /// an absolute `/paddock/...` name must stay inside the scope.
    pub fn resolve_name(&self, relative: &str) -> Result<String> {
        let scope = self.scope();
        let client_name = self
            .client_ct
            .as_ref()
            .map(|ct| ct.name.clone())
            .unwrap_or_else(|| ROOT_CONTAINER.to_string());

        if relative == ROOT_CONTAINER {
            return Ok(ROOT_CONTAINER.to_string());
        }
        if relative == SELF_CONTAINER {
            return Ok(client_name);
        }
        if relative == DOT_CONTAINER {
            return Ok(crate::tree::parent_name(scope.trim_end_matches('/')));
        }
        if let Some(below_self) = relative.strip_prefix("self/") {
            if client_name == ROOT_CONTAINER {
                return Ok(below_self.to_string());
            }
            return Ok(format!("{}/{}", client_name, below_self));
        }
        if let Some(absolute) = relative.strip_prefix(ROOT_SCOPE) {
            if !absolute.starts_with(&scope) && absolute != scope.trim_end_matches('/') {
                return Err(Error::new(
                    ErrorKind::Permission,
                    "absolute container name out of current scope",
                ));
            }
            return Ok(absolute.to_string());
        }
        Ok(format!("{}{}", scope, relative))
    }

    pub fn resolve_container(&self, daemon: &Daemon, relative: &str) -> Result<Arc<Container>> {
        let name = self.resolve_name(relative)?;
        daemon.tree.find(&name)
    }

    // =========================================================================
    // Permission checks
    // =========================================================================

    /// Whether this client may manipulate containers owned by `other`.
    pub fn can_control_cred(&self, other: &Cred) -> Result<()> {
        if self.access_level <= AccessLevel::ReadOnly {
            return Err(Error::new(ErrorKind::Permission, "no write access at all"));
        }
        if self.is_super_user() || self.cred.uid == other.uid {
            return Ok(());
        }
        // the per-user delegation group, looked up lazily
        let delegate = format!("{}-containers", self.cred.user_name());
        if let Ok(gid) = crate::cred::group_id(&delegate) {
            if other.is_member_of(gid) {
                return Ok(());
            }
        }
        Err(Error::new(
            ErrorKind::Permission,
            format!("user {} cannot control {}", self.cred, other),
        ))
    }

    /// Whether this client may write to `ct` (or create a child of it
    /// when `child` is set).
    pub fn can_control(&self, ct: &Arc<Container>, child: bool) -> Result<()> {
        if self.access_level < AccessLevel::ChildOnly {
            return Err(Error::new(ErrorKind::Permission, "no write access at all"));
        }
        if !child && ct.is_root() {
            return Err(Error::new(
                ErrorKind::Permission,
                "root container is read-only",
            ));
        }
        if !child || !ct.is_root() {
            let owner = ct.props.lock().unwrap().owner.clone();
            self.can_control_cred(&owner)?;
        }
        if self.access_level > AccessLevel::ChildOnly {
            return Ok(());
        }

        // child-only: the target must live below the nearest child-only
        // ancestor of the client
        let mut base = self.client_ct.clone();
        while let Some(ct) = &base {
            if ct.props.lock().unwrap().access_level == AccessLevel::ChildOnly {
                break;
            }
            base = ct.parent();
        }
        let Some(base) = base else {
            return Err(Error::new(
                ErrorKind::Permission,
                "base for child-only access not found",
            ));
        };
        if (child && Arc::ptr_eq(&base, ct)) || ct.is_child_of(&base) {
            return Ok(());
        }
        Err(Error::new(
            ErrorKind::Permission,
            format!("not a child container: {}", ct.name),
        ))
    }

    /// Resolves and read-locks a container.
    pub fn read_container(
        &self,
        daemon: &Daemon,
        relative: &str,
    ) -> Result<(Arc<Container>, ContainerLock)> {
        let ct = self.resolve_container(daemon, relative)?;
        let lock = daemon.tree.lock_read(&ct)?;
        Ok((ct, lock))
    }

    /// Resolves, checks write permission and write-locks a container.
    pub fn write_container(
        &self,
        daemon: &Daemon,
        relative: &str,
        child: bool,
    ) -> Result<(Arc<Container>, ContainerLock)> {
        if self.access_level <= AccessLevel::ReadOnly {
            return Err(Error::new(ErrorKind::Permission, "no write access at all"));
        }
        let ct = self.resolve_container(daemon, relative)?;
        self.can_control(&ct, child)?;
        let lock = daemon.tree.lock_write(&ct)?;
        Ok((ct, lock))
    }

    // =========================================================================
    // Framing
    // =========================================================================

    /// Reads more request bytes. Returns a whole frame, or the internal
    /// `Queued` error when more bytes are needed.
    pub fn read_frame(&mut self, max_msg_len: usize) -> Result<Vec<u8>> {
        if self.processing {
            warn!(pid = self.pid, "client request before response");
            return Err(Error::queued());
        }
        let Some(fd) = &self.fd else {
            return Err(Error::new(ErrorKind::Unknown, "connection closed"));
        };

        if self.read_off >= self.read_buf.len() {
            self.read_buf.resize(self.read_off + 4096, 0);
        }
        let len = unsafe {
            libc::recv(
                fd.as_raw_fd(),
                self.read_buf[self.read_off..].as_mut_ptr() as *mut libc::c_void,
                self.read_buf.len() - self.read_off,
                libc::MSG_DONTWAIT,
            )
        };
        if len > 0 {
            self.read_off += len as usize;
        } else if len == 0 {
            return Err(Error::new(ErrorKind::Unknown, "connection closed by peer"));
        } else {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno != libc::EAGAIN && errno != libc::EWOULDBLOCK {
                return Err(Error::with_errno(
                    ErrorKind::Unknown,
                    errno,
                    "recv request failed",
                ));
            }
        }

        if self.frame_len == 0 {
            let Some((length, prefix)) = decode_varint(&self.read_buf[..self.read_off]) else {
                return Err(Error::queued());
            };
            if length as usize > max_msg_len {
                return Err(Error::new(
                    ErrorKind::Unknown,
                    format!("oversized request: {}", length),
                ));
            }
            self.frame_len = length as usize + prefix;
            if self.read_buf.len() < self.frame_len {
                self.read_buf.resize(self.frame_len + 4096, 0);
            }
        }

        if self.read_off < self.frame_len {
            return Err(Error::queued());
        }
        if self.read_off > self.frame_len {
            return Err(Error::new(ErrorKind::Unknown, "garbage after request"));
        }

        let (_, prefix) = decode_varint(&self.read_buf[..self.read_off])
            .expect("frame length decoded above");
        let frame = self.read_buf[prefix..self.frame_len].to_vec();
        self.read_off = 0;
        self.frame_len = 0;
        self.processing = true;
        Ok(frame)
    }

    /// Queues a response frame and tries to flush it.
    pub fn queue_response(&mut self, payload: &[u8]) -> Result<bool> {
        self.write_buf = encode_varint(payload.len() as u32);
        self.write_buf.extend_from_slice(payload);
        self.write_off = 0;
        self.flush_response()
    }

    /// Pushes queued response bytes out. Returns `true` once done; the
    /// session is then ready for the next request.
    pub fn flush_response(&mut self) -> Result<bool> {
        let Some(fd) = &self.fd else {
            return Ok(true); // connection closed, nothing to flush
        };
        while self.write_off < self.write_buf.len() {
            let len = unsafe {
                libc::send(
                    fd.as_raw_fd(),
                    self.write_buf[self.write_off..].as_ptr() as *const libc::c_void,
                    self.write_buf.len() - self.write_off,
                    libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
                )
            };
            if len > 0 {
                self.write_off += len as usize;
                continue;
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                return Ok(false);
            }
            return Err(Error::with_errno(
                ErrorKind::Unknown,
                errno,
                "send response failed",
            ));
        }
        self.write_buf.clear();
        self.write_off = 0;
        self.processing = false;
        Ok(true)
    }

    /// Tears the session down, scheduling teardown of its weak
    /// containers.
    pub fn close(&mut self, daemon: &Daemon) {
        self.fd = None;
        for weak in self.weak_containers.drain(..) {
            if let Some(ct) = weak.upgrade() {
                ct.destroy_weak(daemon);
            }
        }
    }
}

// =============================================================================
// Varint framing
// =============================================================================

/// LEB128, as protobuf frames it.
pub fn encode_varint(mut value: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

/// Returns (value, bytes consumed), or `None` when incomplete.
pub fn decode_varint(buf: &[u8]) -> Option<(u32, usize)> {
    let mut value = 0u32;
    for (i, byte) in buf.iter().enumerate().take(5) {
        value |= ((byte & 0x7f) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_roundtrip() {
        for value in [0u32, 1, 127, 128, 300, 16384, u32::MAX] {
            let encoded = encode_varint(value);
            let (decoded, used) = decode_varint(&encoded).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(used, encoded.len());
        }
    }

    #[test]
    fn test_varint_incomplete() {
        assert!(decode_varint(&[0x80]).is_none());
        assert!(decode_varint(&[]).is_none());
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("app/*", "app/db"));
        assert!(!glob_match("app/*", "web/db"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(glob_match("*/db", "prod/db"));
    }

    #[test]
    fn test_access_level_ordering() {
        assert!(AccessLevel::None < AccessLevel::ReadOnly);
        assert!(AccessLevel::ReadOnly < AccessLevel::ChildOnly);
        assert!(AccessLevel::ChildOnly < AccessLevel::Normal);
        assert!(AccessLevel::Normal < AccessLevel::SuperUser);
        assert!(AccessLevel::SuperUser < AccessLevel::Internal);
    }

    #[test]
    fn test_wait_record_fires_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let count = Arc::new(AtomicUsize::new(0));
        let record = {
            let count = count.clone();
            WaitRecord::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        record.wake("a");
        record.wake("b");
        record.wake_timeout();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_record_wildcards() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let count = Arc::new(AtomicUsize::new(0));
        let record = {
            let count = count.clone();
            WaitRecord::with_wildcards(vec!["app/*".to_string()], move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        record.wake("web/db");
        assert_eq!(count.load(Ordering::SeqCst), 0);
        record.wake("app/db");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
