//! The daemon context and its main loop.
//!
//! All global state lives here: the container tree, the cgroup driver,
//! the event queue, the persistence store and the collaborator handles.
//! The threads:
//!
//! - the main epoll loop owning the listening socket, client fds, the
//!   signalfd and every OOM eventfd;
//! - an RPC worker pool fed through a channel, one request per thread
//!   at a time;
//! - event-queue workers running [`Daemon::handle_event`].
//!
//! The daemon marks itself a child subreaper, so launcher children
//! orphaned by design (the helper exits once the handshake is done)
//! reparent to it and stay reapable.

use crate::cgroup::CgroupDriver;
use crate::client::{ClientSession, WaitRecord};
use crate::config::Config;
use crate::constants::{
    CGROUP_PREFIX, CONTAINER_LEVEL_MAX, LOG_ROTATE_INTERVAL_MS, ROOT_CONTAINER,
};
use crate::container::{Container, State};
use crate::error::{Error, ErrorKind, Result};
use crate::event::{Event, EventQueue};
use crate::kv::KvStore;
use crate::net::{NetworkProvider, NullNetwork};
use crate::path::HostPath;
use crate::property::{self, DYNAMIC};
use crate::tree::{self, ContainerTree};
use crate::volume::{BindBackend, VolumeBackend};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, OnceLock, Weak};
use tracing::{debug, error, info, warn};

// =============================================================================
// Child reaper
// =============================================================================

/// Rendezvous between the signalfd reaper and launcher threads. Every
/// reaped status lands here; statuses of claimed pids are consumed by
/// `wait_child`, the rest become `Exit` events.
#[derive(Default)]
pub struct ChildReaper {
    inner: Mutex<ReaperInner>,
    cv: Condvar,
}

#[derive(Default)]
struct ReaperInner {
    claimed: std::collections::HashSet<i32>,
    statuses: HashMap<i32, i32>,
}

impl ChildReaper {
    /// Marks a pid as privately waited; its exit will not become an
    /// event.
    pub fn claim(&self, pid: i32) {
        self.inner.lock().unwrap().claimed.insert(pid);
    }

    /// Records a reaped status. Returns true when someone claimed the
    /// pid.
    pub fn report(&self, pid: i32, status: i32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.statuses.insert(pid, status);
        let claimed = inner.claimed.contains(&pid);
        drop(inner);
        self.cv.notify_all();
        claimed
    }

    /// Blocks until the pid's status arrives, up to `timeout_ms`.
    pub fn wait_child(&self, pid: i32, timeout_ms: u64) -> Result<i32> {
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(status) = inner.statuses.remove(&pid) {
                inner.claimed.remove(&pid);
                return Ok(status);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                inner.claimed.remove(&pid);
                return Err(Error::new(
                    ErrorKind::Unknown,
                    format!("wait for child {} timed out", pid),
                ));
            }
            let (guard, _) = self.cv.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
    }

    /// Drops a delivered status after the exit event ran its course.
    pub fn ack(&self, pid: i32) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.claimed.contains(&pid) {
            inner.statuses.remove(&pid);
        }
    }
}

// =============================================================================
// Daemon
// =============================================================================

/// Dispatches decoded request frames; the wire codec lives outside the
/// engine.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, daemon: &Arc<Daemon>, client: &mut ClientSession, frame: &[u8]) -> Vec<u8>;
}

pub struct Daemon {
    pub config: Config,
    pub cgroups: CgroupDriver,
    pub tree: Arc<ContainerTree>,
    pub events: Arc<EventQueue>,
    pub kv: KvStore,
    pub volumes: Arc<dyn VolumeBackend>,
    pub net: Arc<dyn NetworkProvider>,
    pub reaper: ChildReaper,
    pub host_name: String,
    /// Gid of the management group on the control socket.
    pub socket_gid: Option<u32>,

    epoll: Epoll,
    root: OnceLock<Arc<Container>>,
    oom_watch: Mutex<HashMap<RawFd, Weak<Container>>>,
    wildcard_waiters: Mutex<Vec<Weak<WaitRecord>>>,
    handler: Mutex<Option<Arc<dyn RequestHandler>>>,
    shutdown: AtomicBool,
}

impl Daemon {
    /// Builds the context: detects cgroup hierarchies, opens the
    /// record store and creates the epoll instance. No containers yet.
    pub fn new(config: Config) -> Result<Arc<Daemon>> {
        let cgroups = CgroupDriver::detect()?;
        Self::with_driver(config, cgroups)
    }

    /// Builds the context around an explicit cgroup driver. Embedding
    /// and test hook.
    pub fn with_driver(config: Config, cgroups: CgroupDriver) -> Result<Arc<Daemon>> {
        let kv = KvStore::open(HostPath::new(&config.keyvalue.root))?;
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| Error::from(e).context("epoll_create"))?;

        let host_name = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());

        let socket_gid = crate::cred::group_id(&config.daemon.socket_group).ok();
        if socket_gid.is_none() {
            warn!(group = %config.daemon.socket_group, "management group not found");
        }

        Ok(Arc::new(Daemon {
            tree: ContainerTree::new(config.container.max_total),
            events: Arc::new(EventQueue::new()),
            volumes: Arc::new(BindBackend),
            net: Arc::new(NullNetwork::default()),
            reaper: ChildReaper::default(),
            host_name,
            socket_gid,
            epoll,
            root: OnceLock::new(),
            oom_watch: Mutex::new(HashMap::new()),
            wildcard_waiters: Mutex::new(Vec::new()),
            handler: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            config,
            cgroups,
            kv,
        }))
    }

    pub fn set_handler(&self, handler: Arc<dyn RequestHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    pub fn root(&self) -> &Arc<Container> {
        self.root.get().expect("bootstrap creates the root")
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.events.stop();
    }

    // =========================================================================
    // Bootstrap and restore
    // =========================================================================

    /// Creates the root container, its cgroups, and restores every
    /// persisted container.
    pub fn bootstrap(self: &Arc<Self>) -> Result<()> {
        // orphaned launcher children must reparent to us
        if unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1) } != 0 {
            return Err(Error::sys("prctl(PR_SET_CHILD_SUBREAPER)"));
        }

        let daemon = self.clone();
        let root = self.tree.create_entry(ROOT_CONTAINER, None, move |id, parent| {
            Ok(Container::new(&daemon, parent, ROOT_CONTAINER, id))
        })?;

        for hy in self.cgroups.hierarchies() {
            let cg = hy.cgroup(CGROUP_PREFIX);
            if !cg.exists() {
                cg.create()?;
            }
        }

        root.core.lock().unwrap().state = State::Meta;
        self.root.set(root).ok();

        self.restore()?;
        Ok(())
    }

    fn restore(self: &Arc<Self>) -> Result<()> {
        for record in self.kv.list()? {
            if record.name == ROOT_CONTAINER {
                continue; // rebuilt every boot
            }
            info!(name = %record.name, id = record.id, "restore container");
            let daemon = self.clone();
            let name = record.name.clone();
            let result = self.tree.create_entry(&record.name, Some(record.id), {
                let record = record.clone();
                move |id, parent| {
                    let ct = Container::new(&daemon, parent, &name, id);
                    ct.load_record(&record)?;
                    Ok(ct)
                }
            });
            let ct = match result {
                Ok(ct) => ct,
                Err(err) => {
                    error!(name = %record.name, error = %err, "cannot restore container");
                    continue;
                }
            };

            ct.sync_state(self);

            // restored running state needs its counters rebuilt
            if ct.state() == State::Running {
                let mut cursor = ct.parent();
                while let Some(ancestor) = cursor {
                    ancestor.bump_running_children(1);
                    cursor = ancestor.parent();
                }
            }
            if ct.task_pid() != 0 {
                if let Err(err) = ct.prepare_oom_monitor_public(self) {
                    warn!(name = %ct.name, error = %err, "cannot rearm OOM monitor");
                }
            }

            if matches!(ct.state(), State::Running | State::Meta | State::Paused) {
                let mut props = ct.props.lock().unwrap();
                for desc in property::descriptors() {
                    if desc.flags & DYNAMIC != 0
                        && desc.prop != property::Prop::None
                        && props.has(desc.prop)
                    {
                        props.mark_dirty(desc.prop);
                    }
                }
                if let Err(err) = ct.apply_dynamic_properties(self, &mut props) {
                    warn!(name = %ct.name, error = %err, "cannot reapply properties");
                }
            }

            if ct.may_respawn() {
                ct.schedule_respawn(self);
            }

            if let Err(err) = ct.save(self) {
                warn!(name = %ct.name, error = %err, "cannot save restored container");
            }
        }
        Ok(())
    }

    // =========================================================================
    // Identity
    // =========================================================================

    /// Which container a host pid belongs to, via its freezer cgroup.
    pub fn find_task_container(&self, pid: i32) -> Result<Arc<Container>> {
        let cg = self.cgroups.freezer().task_cgroup(pid)?;
        let name = cg.name.replace('%', "/");
        let prefix = format!("{}/", CGROUP_PREFIX);
        match name.strip_prefix(&prefix) {
            Some(sub) if !sub.is_empty() => self.tree.find(sub),
            _ => self.tree.find(ROOT_CONTAINER),
        }
    }

    // =========================================================================
    // OOM plumbing
    // =========================================================================

    pub fn watch_oom(&self, fd: RawFd, ct: Weak<Container>) -> Result<()> {
        self.oom_watch.lock().unwrap().insert(fd, ct);
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll
            .add(borrowed, EpollEvent::new(EpollFlags::EPOLLIN, fd as u64))
            .map_err(|e| Error::from(e).context("epoll add OOM fd"))
    }

    pub fn unwatch_oom(&self, fd: RawFd) {
        self.oom_watch.lock().unwrap().remove(&fd);
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let _ = self.epoll.delete(borrowed);
    }

    fn oom_container(&self, fd: RawFd) -> Option<Arc<Container>> {
        self.oom_watch.lock().unwrap().get(&fd)?.upgrade()
    }

    // =========================================================================
    // Waiters
    // =========================================================================

    pub fn add_wildcard_waiter(&self, waiter: &Arc<WaitRecord>) {
        let mut waiters = self.wildcard_waiters.lock().unwrap();
        waiters.retain(|w| w.strong_count() > 0);
        waiters.push(Arc::downgrade(waiter));
    }

    pub fn wake_wildcard_waiters(&self, name: &str) {
        let waiters: Vec<_> = {
            let mut waiters = self.wildcard_waiters.lock().unwrap();
            waiters.retain(|w| w.strong_count() > 0);
            waiters.iter().filter_map(Weak::upgrade).collect()
        };
        for waiter in waiters {
            waiter.wake(name);
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Creates a stopped container under the caller's credentials.
    pub fn create(self: &Arc<Self>, client: &ClientSession, relative: &str) -> Result<Arc<Container>> {
        let name = client.resolve_name(relative)?;
        tree::valid_name(&name)?;

        let daemon = self.clone();
        let mut owner = client.cred.clone();
        let name_copy = name.clone();
        let ct = self.tree.create_entry(&name, None, move |id, parent| {
            let parent = parent.ok_or_else(|| {
                Error::new(
                    ErrorKind::ContainerDoesNotExist,
                    format!("parent container not found for {}", name_copy),
                )
            })?;
            if parent.level >= CONTAINER_LEVEL_MAX {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("maximum nesting level is {}", CONTAINER_LEVEL_MAX),
                ));
            }
            client.can_control(&parent, true)?;

            let user = owner.user_name();
            let _ = owner.load_groups(&user);

            let ct = Container::new(&daemon, Some(parent), &name_copy, id);
            {
                let mut props = ct.props.lock().unwrap();
                props.owner = owner.clone();
                props.mark_set(crate::property::Prop::User);
                props.mark_set(crate::property::Prop::Group);
                ct.sanitize_capabilities(&mut props);
            }
            Ok(ct)
        })?;

        info!(name = %name, id = ct.id, "created");
        if let Err(err) = ct.save(self) {
            let _ = self.tree.remove_entry(&ct);
            return Err(err);
        }
        Ok(ct)
    }

    pub fn start(self: &Arc<Self>, client: &ClientSession, relative: &str) -> Result<()> {
        let (ct, _lock) = client.write_container(self, relative, false)?;
        ct.start(self, client)
    }

    pub fn stop(
        self: &Arc<Self>,
        client: &ClientSession,
        relative: &str,
        timeout_ms: Option<u64>,
    ) -> Result<()> {
        let (ct, _lock) = client.write_container(self, relative, false)?;
        ct.stop(
            self,
            timeout_ms.unwrap_or(self.config.container.kill_timeout_ms),
        )
    }

    pub fn pause(self: &Arc<Self>, client: &ClientSession, relative: &str) -> Result<()> {
        let (ct, _lock) = client.write_container(self, relative, false)?;
        ct.pause(self)
    }

    pub fn resume(self: &Arc<Self>, client: &ClientSession, relative: &str) -> Result<()> {
        let (ct, _lock) = client.write_container(self, relative, false)?;
        ct.resume(self)
    }

    pub fn kill(self: &Arc<Self>, client: &ClientSession, relative: &str, sig: i32) -> Result<()> {
        let (ct, _lock) = client.write_container(self, relative, false)?;
        ct.kill(sig)
    }

    pub fn destroy(self: &Arc<Self>, client: &ClientSession, relative: &str) -> Result<()> {
        let (ct, _lock) = client.write_container(self, relative, false)?;
        ct.destroy(self)
    }

    pub fn get_property(
        self: &Arc<Self>,
        client: &ClientSession,
        relative: &str,
        name: &str,
    ) -> Result<String> {
        let (ct, _lock) = client.read_container(self, relative)?;
        ct.get_property(self, name)
    }

    pub fn set_property(
        self: &Arc<Self>,
        client: &ClientSession,
        relative: &str,
        name: &str,
        value: &str,
    ) -> Result<()> {
        let (ct, _lock) = client.write_container(self, relative, false)?;
        ct.set_property(self, name, value)
    }

    /// Container names visible to the caller, in tree order.
    pub fn list(self: &Arc<Self>, client: &ClientSession) -> Vec<String> {
        self.tree
            .list()
            .into_iter()
            .filter(|ct| !ct.is_root())
            .filter_map(|ct| client.compose_name(&ct.name).ok())
            .collect()
    }

    /// Registers a wait on the named containers and/or wildcards; the
    /// record fires on the first terminal transition, or on timeout.
    pub fn wait(
        self: &Arc<Self>,
        client: &ClientSession,
        names: &[String],
        wildcards: Vec<String>,
        timeout_ms: Option<u64>,
        callback: impl FnOnce(Option<&str>) + Send + 'static,
    ) -> Result<Arc<WaitRecord>> {
        let record = if wildcards.is_empty() {
            WaitRecord::new(callback)
        } else {
            WaitRecord::with_wildcards(wildcards, callback)
        };

        for relative in names {
            let ct = client.resolve_container(self, relative)?;
            ct.add_waiter(&record);
            // already-terminal containers fire at once
            if !matches!(ct.state(), State::Running | State::Meta) {
                record.wake(&ct.name);
            }
        }
        if record.has_wildcards() {
            self.add_wildcard_waiter(&record);
        }
        if let Some(timeout_ms) = timeout_ms {
            self.events
                .add(timeout_ms, Event::WaitTimeout(Arc::downgrade(&record)));
        }
        Ok(record)
    }

    // =========================================================================
    // Event handling
    // =========================================================================

    /// Runs one event to completion. Handlers that lose the write-lock
    /// race put the event back with a short delay.
    pub fn handle_event(self: &Arc<Self>, event: Event) {
        debug!(event = %event.describe(), "deliver event");
        match event {
            Event::Exit { pid, status } => self.handle_exit(pid, status),
            Event::Oom { fd } => self.handle_oom(fd),
            Event::Respawn(weak) => {
                let Some(ct) = weak.upgrade() else { return };
                if !ct.may_respawn() {
                    return;
                }
                match self.tree.try_lock_write(&ct) {
                    Ok(_lock) => {
                        if ct.may_respawn() {
                            if let Err(err) = ct.respawn(self) {
                                warn!(name = %ct.name, error = %err, "respawn failed");
                            }
                        }
                    }
                    Err(err) if err.is(ErrorKind::Busy) => {
                        self.events.add(100, Event::Respawn(weak));
                    }
                    Err(_) => {}
                }
            }
            Event::WaitTimeout(weak) => {
                if let Some(record) = weak.upgrade() {
                    record.wake_timeout();
                }
            }
            Event::DestroyWeak(weak) => {
                let Some(ct) = weak.upgrade() else { return };
                match self.tree.try_lock_write(&ct) {
                    Ok(_lock) => {
                        if let Err(err) = ct.destroy(self) {
                            warn!(name = %ct.name, error = %err, "cannot destroy weak container");
                        }
                    }
                    Err(err) if err.is(ErrorKind::Busy) => {
                        self.events.add(100, Event::DestroyWeak(weak));
                    }
                    Err(_) => {}
                }
            }
            Event::RotateLogs => {
                self.handle_rotate();
                self.events.add(LOG_ROTATE_INTERVAL_MS, Event::RotateLogs);
            }
        }
    }

    /// A duplicate exit for an already-reaped pid matches no container
    /// and falls through to the ack.
    fn handle_exit(self: &Arc<Self>, pid: i32, status: i32) {
        for ct in self.tree.list() {
            if ct.wait_task_pid() != pid {
                continue;
            }
            match self.tree.try_lock_write(&ct) {
                Ok(_lock) => ct.exit(self, status, false),
                Err(err) if err.is(ErrorKind::Busy) => {
                    self.events.add(100, Event::Exit { pid, status });
                    return; // keep the status until delivered
                }
                Err(_) => {}
            }
            break;
        }
        self.reaper.ack(pid);
    }

    fn handle_oom(self: &Arc<Self>, fd: RawFd) {
        let Some(ct) = self.oom_container(fd) else {
            return;
        };
        // stale notifications for dead or stopped tasks are dropped
        if ct.task_pid() == 0 || ct.state() == State::Dead {
            return;
        }
        match self.tree.try_lock_write(&ct) {
            Ok(_lock) => ct.exit(self, libc::SIGKILL, true),
            Err(err) if err.is(ErrorKind::Busy) => {
                self.events.add(100, Event::Oom { fd });
            }
            Err(_) => {}
        }
    }

    fn handle_rotate(self: &Arc<Self>) {
        for ct in self.tree.list() {
            if ct.is_root() {
                continue;
            }
            if ct.expired() {
                match self.tree.try_lock_write(&ct) {
                    Ok(_lock) => {
                        info!(name = %ct.name, "reaping aged-out container");
                        if let Err(err) = ct.destroy(self) {
                            warn!(name = %ct.name, error = %err, "aging reap failed");
                        }
                    }
                    Err(_) => {} // next tick retries
                }
                continue;
            }
            if ct.state() == State::Running {
                if let Ok(_lock) = self.tree.try_lock_read(&ct) {
                    if ct.state() == State::Running {
                        ct.rotate_stdio(self);
                    }
                }
            }
        }
    }

    // =========================================================================
    // Main loop
    // =========================================================================

    /// Binds the control socket and serves until a termination signal.
    pub fn run(self: &Arc<Self>) -> Result<()> {
        let listener = self.bind_control_socket()?;
        let mut signal_fd = self.setup_signalfd()?;

        self.epoll
            .add(
                listener.as_fd(),
                EpollEvent::new(EpollFlags::EPOLLIN, listener.as_raw_fd() as u64),
            )
            .map_err(|e| Error::from(e).context("epoll add listener"))?;
        self.epoll
            .add(
                signal_fd.as_fd(),
                EpollEvent::new(EpollFlags::EPOLLIN, signal_fd.as_raw_fd() as u64),
            )
            .map_err(|e| Error::from(e).context("epoll add signalfd"))?;

        // event workers
        for _ in 0..self.config.daemon.event_workers.max(1) {
            let daemon = self.clone();
            std::thread::spawn(move || {
                while let Some(event) = daemon.events.next() {
                    daemon.handle_event(event);
                }
            });
        }
        self.events.add(LOG_ROTATE_INTERVAL_MS, Event::RotateLogs);

        // request workers
        let (job_tx, job_rx) = mpsc::channel::<(Arc<Mutex<ClientSession>>, Vec<u8>)>();
        let job_rx = Arc::new(Mutex::new(job_rx));
        for _ in 0..self.config.daemon.workers.max(1) {
            let daemon = self.clone();
            let job_rx = job_rx.clone();
            std::thread::spawn(move || loop {
                let job = job_rx.lock().unwrap().recv();
                let Ok((session, frame)) = job else { return };
                daemon.serve_request(&session, &frame);
            });
        }

        let mut sessions: HashMap<RawFd, Arc<Mutex<ClientSession>>> = HashMap::new();
        let mut ready = vec![EpollEvent::empty(); 64];

        info!(socket = %self.config.daemon.socket_path.display(), "serving");
        while !self.shutdown.load(Ordering::SeqCst) {
            let n = match self.epoll.wait(&mut ready, EpollTimeout::from(1000u16)) {
                Ok(n) => n,
                Err(nix::Error::EINTR) => continue,
                Err(err) => return Err(Error::from(err).context("epoll_wait")),
            };

            for event in &ready[..n] {
                let fd = event.data() as RawFd;

                if fd == listener.as_raw_fd() {
                    self.accept_clients(&listener, &mut sessions);
                } else if fd == signal_fd.as_raw_fd() {
                    if self.drain_signals(&mut signal_fd) {
                        self.request_shutdown();
                    }
                } else if let Some(session) = sessions.get(&fd).cloned() {
                    self.serve_client_io(fd, &session, event.events(), &job_tx, &mut sessions);
                } else if self.oom_container(fd).is_some() {
                    // one notification per eventfd is enough
                    self.unwatch_oom_epoll_only(fd);
                    self.events.add(0, Event::Oom { fd });
                }
            }
        }

        info!("shutting down");
        let _ = std::fs::remove_file(&self.config.daemon.socket_path);
        Ok(())
    }

    fn unwatch_oom_epoll_only(&self, fd: RawFd) {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let _ = self.epoll.delete(borrowed);
    }

    fn bind_control_socket(&self) -> Result<UnixListener> {
        let path = &self.config.daemon.socket_path;
        let _ = std::fs::remove_file(path);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let listener = UnixListener::bind(path)
            .map_err(|e| Error::from(e).context(format!("bind {}", path.display())))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::from(e).context("set socket nonblocking"))?;

        if let Some(gid) = self.socket_gid {
            if let Err(err) = HostPath::new(path).chown(0, gid) {
                warn!(error = %err, "cannot set control socket group");
            }
        }
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))
            .map_err(|e| Error::from(e).context("set socket permissions"))?;
        Ok(listener)
    }

    fn setup_signalfd(&self) -> Result<SignalFd> {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);
        mask.add(Signal::SIGTERM);
        mask.add(Signal::SIGINT);
        mask.thread_block()
            .map_err(|e| Error::from(e).context("block signals"))?;
        SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .map_err(|e| Error::from(e).context("signalfd"))
    }

    /// True when a termination signal arrived.
    fn drain_signals(&self, signal_fd: &mut SignalFd) -> bool {
        let mut terminate = false;
        while let Ok(Some(info)) = signal_fd.read_signal() {
            match info.ssi_signo as i32 {
                libc::SIGCHLD => self.reap_children(),
                libc::SIGTERM | libc::SIGINT => terminate = true,
                _ => {}
            }
        }
        terminate
    }

    /// Harvests every exited child and turns unclaimed statuses into
    /// exit events.
    fn reap_children(&self) {
        loop {
            let mut status = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                return;
            }
            debug!(pid, status, "reaped child");
            if !self.reaper.report(pid, status) {
                self.events.add(0, Event::Exit { pid, status });
            }
        }
    }

    fn accept_clients(
        self: &Arc<Self>,
        listener: &UnixListener,
        sessions: &mut HashMap<RawFd, Arc<Mutex<ClientSession>>>,
    ) {
        loop {
            let (stream, _addr) = match listener.accept() {
                Ok(pair) => pair,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!(error = %err, "cannot accept client");
                    return;
                }
            };
            if sessions.len() >= self.config.daemon.max_clients {
                warn!("client limit reached, dropping connection");
                continue;
            }
            let _ = stream.set_nonblocking(true);
            let fd: std::os::fd::OwnedFd = stream.into();
            let raw = fd.as_raw_fd();

            let mut session = ClientSession::from_fd(fd);
            if let Err(err) = session.identify(self, true) {
                debug!(error = %err, "client rejected");
                continue; // drops the fd
            }

            if let Some(session_fd) = &session.fd {
                if let Err(err) = self.epoll.add(
                    session_fd.as_fd(),
                    EpollEvent::new(EpollFlags::EPOLLIN, raw as u64),
                ) {
                    warn!(error = %err, "cannot register client fd");
                    continue;
                }
            }
            sessions.insert(raw, Arc::new(Mutex::new(session)));
        }
    }

    fn serve_client_io(
        self: &Arc<Self>,
        fd: RawFd,
        session: &Arc<Mutex<ClientSession>>,
        flags: EpollFlags,
        job_tx: &mpsc::Sender<(Arc<Mutex<ClientSession>>, Vec<u8>)>,
        sessions: &mut HashMap<RawFd, Arc<Mutex<ClientSession>>>,
    ) {
        if flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR) {
            self.drop_session(fd, session, sessions);
            return;
        }

        if flags.contains(EpollFlags::EPOLLOUT) {
            let mut guard = session.lock().unwrap();
            match guard.flush_response() {
                Ok(true) => {
                    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                    let _ = self.epoll.modify(
                        borrowed,
                        &mut EpollEvent::new(EpollFlags::EPOLLIN, fd as u64),
                    );
                }
                Ok(false) => {}
                Err(err) => {
                    debug!(error = %err, "client write failed");
                    drop(guard);
                    self.drop_session(fd, session, sessions);
                    return;
                }
            }
        }

        if flags.contains(EpollFlags::EPOLLIN) {
            let frame = {
                let mut guard = session.lock().unwrap();
                match guard.read_frame(self.config.daemon.max_msg_len) {
                    Ok(frame) => Some(frame),
                    Err(err) if err.is(ErrorKind::Queued) => None,
                    Err(err) => {
                        debug!(error = %err, "client read failed");
                        drop(guard);
                        self.drop_session(fd, session, sessions);
                        return;
                    }
                }
            };
            if let Some(frame) = frame {
                // requests are serialized per session: input stays off
                // until the response is flushed
                let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                let _ = self
                    .epoll
                    .modify(borrowed, &mut EpollEvent::new(EpollFlags::empty(), fd as u64));
                let _ = job_tx.send((session.clone(), frame));
            }
        }
    }

    fn drop_session(
        &self,
        fd: RawFd,
        session: &Arc<Mutex<ClientSession>>,
        sessions: &mut HashMap<RawFd, Arc<Mutex<ClientSession>>>,
    ) {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let _ = self.epoll.delete(borrowed);
        session.lock().unwrap().close(self);
        sessions.remove(&fd);
    }

    /// Worker-thread entry: dispatch one frame and push the response.
    fn serve_request(self: &Arc<Self>, session: &Arc<Mutex<ClientSession>>, frame: &[u8]) {
        let handler = self.handler.lock().unwrap().clone();
        let mut guard = session.lock().unwrap();

        if let Err(err) = guard.identify(self, false) {
            debug!(error = %err, "re-identification failed");
        }

        let response = match handler {
            Some(handler) => handler.handle(self, &mut guard, frame),
            None => {
                warn!("no request handler installed, dropping frame");
                Vec::new()
            }
        };

        let fd = guard.fd.as_ref().map(|fd| fd.as_raw_fd());
        let flushed = guard.queue_response(&response);
        drop(guard);

        if let Some(fd) = fd {
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            let flags = match flushed {
                Ok(true) => EpollFlags::EPOLLIN,
                Ok(false) => EpollFlags::EPOLLOUT,
                Err(_) => EpollFlags::EPOLLIN, // the main loop reaps it
            };
            let _ = self
                .epoll
                .modify(borrowed, &mut EpollEvent::new(flags, fd as u64));
        }
    }
}
