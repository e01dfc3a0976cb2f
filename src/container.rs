//! Container nodes and their lifecycle.
//!
//! A [`Container`] is one node in the tree: immutable identity (name,
//! id, level, parent link), a mutable core (state machine, task pids,
//! exit accounting) and the property set. Lifecycle operations assume
//! the caller holds the per-container lock from
//! [`crate::tree::ContainerTree`]; the internal mutexes only satisfy
//! memory safety and are never held across blocking calls.

use crate::caps::{
    ALL_CAPABILITIES, APP_MODE_CAPABILITIES, MEM_CG_CAPABILITIES, OS_MODE_CAPABILITIES,
    PID_NS_CAPABILITIES, SUID_CAPABILITIES,
};
use crate::cgroup::{
    self, BlkioExt, Cgroup, CpuExt, DevicesExt, FreezerExt, Hierarchy, MemoryExt, CTRL_DEVICES,
    CTRL_FREEZER, CTRL_MEMORY, CTRL_NETCLS,
};
use crate::client::{AccessLevel, ClientSession, WaitRecord};
use crate::constants::{CGROUP_PREFIX, KV_KEY_STATE};
use crate::daemon::Daemon;
use crate::error::{Error, ErrorKind, Result};
use crate::event::{now_ms, wall_ms, Event};
use crate::kv::Record;
use crate::net::tc_handle;
use crate::path::HostPath;
use crate::property::{self, Prop, PropertySet, VirtMode, PERSIST, READ_ONLY, STOPPED_ONLY};
use crate::spawn::{Env, SpawnEnv};
use crate::volume::Volume;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, info, warn};

// =============================================================================
// State
// =============================================================================

/// Container states. `Destroyed` is terminal and equivalent to "not in
/// the tree anymore".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Stopped,
    Running,
    Paused,
    Meta,
    Dead,
    Destroyed,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Stopped => "stopped",
            State::Running => "running",
            State::Paused => "paused",
            State::Meta => "meta",
            State::Dead => "dead",
            State::Destroyed => "destroyed",
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        match text {
            "stopped" => Ok(State::Stopped),
            "running" => Ok(State::Running),
            "paused" => Ok(State::Paused),
            "meta" => Ok(State::Meta),
            "dead" => Ok(State::Dead),
            "destroyed" => Ok(State::Destroyed),
            other => Err(Error::new(
                ErrorKind::InvalidValue,
                format!("unknown state: {}", other),
            )),
        }
    }
}

/// Mutable runtime half of a container.
#[derive(Debug)]
pub struct Core {
    pub state: State,
    /// Workload pid in the daemon's pid namespace.
    pub task_pid: i32,
    /// Workload pid as seen inside the parent's pid namespace.
    pub task_vpid: i32,
    /// The descendant the daemon actually waits on.
    pub wait_task_pid: i32,
    pub exit_status: Option<i32>,
    pub oom_killed: bool,
    pub start_time_ms: u64,
    pub death_time_ms: u64,
    pub respawn_count: u64,
}

impl Default for Core {
    fn default() -> Self {
        Self {
            state: State::Stopped,
            task_pid: 0,
            task_vpid: 0,
            wait_task_pid: 0,
            exit_status: None,
            oom_killed: false,
            start_time_ms: 0,
            death_time_ms: 0,
            respawn_count: 0,
        }
    }
}

// =============================================================================
// Container
// =============================================================================

#[derive(Debug)]
pub struct Container {
    pub id: u32,
    /// Absolute name, `a/b/c`; `/` for the root.
    pub name: String,
    /// Last name component.
    pub first_name: String,
    /// Depth; 0 for the root.
    pub level: u32,
    /// Working directory in the host namespace, fixed at creation.
    pub work_dir: HostPath,

    parent: Option<Weak<Container>>,
    pub children: Mutex<Vec<Arc<Container>>>,

    /// Lock counter of the tree protocol. Only ever touched under the
    /// tree mutex.
    pub(crate) locked: AtomicI32,
    destroyed: AtomicBool,

    pub core: Mutex<Core>,
    pub props: Mutex<PropertySet>,

    /// Running containers in this subtree, self excluded.
    running_children: AtomicI64,

    waiters: Mutex<Vec<Weak<WaitRecord>>>,
    pub oom_event: Mutex<Option<OwnedFd>>,
    pub root_volume: Mutex<Option<Volume>>,
    /// Resolved chroot path in host terms, valid from start to stop.
    pub root_path: Mutex<HostPath>,
    /// Record keys an older or newer daemon wrote that this one does
    /// not understand; carried through every save.
    foreign_keys: Mutex<Vec<(String, String)>>,
}

impl Container {
    /// Builds a container with defaults derived from its parent and the
    /// daemon configuration. Registration is the tree's job.
    pub fn new(
        daemon: &Daemon,
        parent: Option<Arc<Container>>,
        name: &str,
        id: u32,
    ) -> Arc<Self> {
        let first_name = match &parent {
            None => String::new(),
            Some(p) if p.is_root() => name.to_string(),
            Some(p) => name[p.name.len() + 1..].to_string(),
        };
        let level = parent.as_ref().map(|p| p.level + 1).unwrap_or(0);
        let is_root = parent.is_none();

        let work_dir = if is_root {
            HostPath::root()
        } else {
            HostPath::new(&daemon.config.container.tmp_dir).join(name)
        };

        let mut props = PropertySet::default();
        props.stdout_limit = daemon.config.container.stdout_limit;
        props.aging_time_ms = daemon.config.container.aging_time_ms;

        props.controllers = CTRL_FREEZER;
        if parent.as_ref().map(|p| p.is_root()).unwrap_or(true) {
            props.controllers = cgroup::CTRL_ALL;
        }
        props.controllers &= daemon.cgroups.available();
        props.controllers |= CTRL_FREEZER;
        props.mark_set(Prop::Controllers);

        if is_root {
            props.scope = String::new();
        } else if daemon.config.container.default_scope {
            props.scope = format!("{}/", name);
        }

        if let Some(parent) = &parent {
            let parent_props = parent.props.lock().unwrap();
            if parent_props.access_level < AccessLevel::ChildOnly {
                props.access_level = parent_props.access_level;
            }
        }

        Arc::new(Self {
            id,
            name: name.to_string(),
            first_name,
            level,
            work_dir,
            parent: parent.map(|p| Arc::downgrade(&p)),
            children: Mutex::new(Vec::new()),
            locked: AtomicI32::new(0),
            destroyed: AtomicBool::new(false),
            core: Mutex::new(Core::default()),
            props: Mutex::new(props),
            running_children: AtomicI64::new(0),
            waiters: Mutex::new(Vec::new()),
            oom_event: Mutex::new(None),
            root_volume: Mutex::new(None),
            root_path: Mutex::new(HostPath::root()),
            foreign_keys: Mutex::new(Vec::new()),
        })
    }

    // =========================================================================
    // Identity and shape
    // =========================================================================

    pub fn is_root(&self) -> bool {
        self.level == 0
    }

    pub fn parent(&self) -> Option<Arc<Container>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.core.lock().unwrap().state = State::Destroyed;
    }

    pub fn is_child_of(&self, other: &Container) -> bool {
        let mut cursor = self.parent();
        while let Some(ct) = cursor {
            if std::ptr::eq(ct.as_ref(), other) {
                return true;
            }
            cursor = ct.parent();
        }
        false
    }

    /// The whole subtree, children before parents, self last.
    pub fn subtree(self: &Arc<Self>) -> Vec<Arc<Container>> {
        fn collect(ct: &Arc<Container>, out: &mut Vec<Arc<Container>>) {
            let children = ct.children.lock().unwrap().clone();
            for child in children {
                collect(&child, out);
            }
            out.push(ct.clone());
        }
        let mut out = Vec::new();
        collect(self, &mut out);
        out
    }

    /// Nearest ancestor (or self) with `isolate` set.
    pub fn isolation_domain(self: &Arc<Self>) -> Arc<Container> {
        let mut domain = self.clone();
        loop {
            if domain.props.lock().unwrap().isolate {
                return domain;
            }
            match domain.parent() {
                Some(parent) => domain = parent,
                None => return domain,
            }
        }
    }

    /// The dotted scope prefix this container imposes on its clients.
    pub fn scope_prefix(&self) -> String {
        let own = self.props.lock().unwrap().scope.clone();
        match self.parent() {
            Some(parent) => parent.scope_prefix() + &own,
            None => own,
        }
    }

    pub fn is_meta(&self) -> bool {
        self.is_root() || self.props.lock().unwrap().command.is_empty()
    }

    pub fn default_cwd(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else {
            self.work_dir.as_str().to_string()
        }
    }

    /// Effective working directory: an explicit one wins, a chroot
    /// resets to `/`.
    pub fn cwd(self: &Arc<Self>) -> String {
        let mut cursor = self.clone();
        loop {
            let props = cursor.props.lock().unwrap();
            if props.has(Prop::Cwd) {
                if let Some(cwd) = &props.cwd {
                    return cwd.clone();
                }
            }
            if props.root != "/" {
                return "/".to_string();
            }
            drop(props);
            match cursor.parent() {
                Some(parent) => cursor = parent,
                None => return self.default_cwd(),
            }
        }
    }

    // =========================================================================
    // Core accessors
    // =========================================================================

    pub fn state(&self) -> State {
        self.core.lock().unwrap().state
    }

    pub fn task_pid(&self) -> i32 {
        self.core.lock().unwrap().task_pid
    }

    pub fn wait_task_pid(&self) -> i32 {
        self.core.lock().unwrap().wait_task_pid
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.core.lock().unwrap().exit_status
    }

    pub fn oom_killed(&self) -> bool {
        self.core.lock().unwrap().oom_killed
    }

    pub fn start_time_ms(&self) -> u64 {
        self.core.lock().unwrap().start_time_ms
    }

    pub fn death_time_ms(&self) -> u64 {
        self.core.lock().unwrap().death_time_ms
    }

    pub fn respawn_count(&self) -> u64 {
        self.core.lock().unwrap().respawn_count
    }

    pub fn running_children(&self) -> i64 {
        self.running_children.load(Ordering::SeqCst)
    }

    /// Raw counter adjustment for restore, where state is rebuilt
    /// without transitions.
    pub fn bump_running_children(&self, diff: i64) {
        self.running_children.fetch_add(diff, Ordering::SeqCst);
    }

    /// Re-arms the OOM eventfd after a restart.
    pub fn prepare_oom_monitor_public(self: &Arc<Self>, daemon: &Daemon) -> Result<()> {
        self.prepare_oom_monitor(daemon)
    }

    // =========================================================================
    // State machine
    // =========================================================================

    /// Moves to `new_state`, maintaining ancestor running counts and
    /// waking waiters when the workload reaches a terminal state.
    pub fn set_state(self: &Arc<Self>, daemon: &Daemon, new_state: State) {
        let old_state = {
            let mut core = self.core.lock().unwrap();
            let old = core.state;
            if old == new_state {
                return;
            }
            core.state = new_state;
            old
        };

        info!(name = %self.name, from = old_state.as_str(), to = new_state.as_str(),
              "state change");

        if new_state == State::Running {
            self.update_running_children(daemon, 1);
        } else if old_state == State::Running {
            self.update_running_children(daemon, -1);
        }

        if new_state != State::Running && new_state != State::Meta {
            self.notify_waiters(daemon);
        }
    }

    fn update_running_children(self: &Arc<Self>, daemon: &Daemon, diff: i64) {
        let mut cursor = self.parent();
        while let Some(ancestor) = cursor {
            let left = ancestor.running_children.fetch_add(diff, Ordering::SeqCst) + diff;
            if left == 0 && ancestor.state() == State::Meta {
                ancestor.notify_waiters(daemon);
            }
            cursor = ancestor.parent();
        }
    }

    // =========================================================================
    // Waiters
    // =========================================================================

    pub fn add_waiter(&self, waiter: &Arc<WaitRecord>) {
        let mut waiters = self.waiters.lock().unwrap();
        waiters.retain(|w| w.strong_count() > 0);
        waiters.push(Arc::downgrade(waiter));
    }

    pub fn notify_waiters(self: &Arc<Self>, daemon: &Daemon) {
        let waiters: Vec<_> = {
            let mut waiters = self.waiters.lock().unwrap();
            waiters.retain(|w| w.strong_count() > 0);
            waiters.iter().filter_map(Weak::upgrade).collect()
        };
        for waiter in waiters {
            waiter.wake(&self.name);
        }
        if !self.is_root() {
            daemon.wake_wildcard_waiters(&self.name);
        }
    }

    // =========================================================================
    // Cgroups
    // =========================================================================

    /// The cgroup of this container in `hy`, honouring the flattening
    /// convention: a `/` before a component means the controller is
    /// enabled at that level, a `%` folds the level into its ancestor's
    /// directory name.
    pub fn get_cgroup<'a>(self: &Arc<Self>, hy: &'a Hierarchy) -> Cgroup<'a> {
        self.get_cgroup_with(hy, self.controllers())
    }

    /// `get_cgroup` for callers that already hold this container's
    /// property lock and pass its controller mask in.
    pub fn get_cgroup_with<'a>(
        self: &Arc<Self>,
        hy: &'a Hierarchy,
        self_controllers: u32,
    ) -> Cgroup<'a> {
        if self.is_root() {
            return hy.cgroup(CGROUP_PREFIX);
        }

        let mut name = String::new();
        let mut cursor = self.clone();
        let mut first = true;
        while !cursor.is_root() {
            let controllers = if first {
                self_controllers
            } else {
                cursor.props.lock().unwrap().controllers
            };
            first = false;
            let enabled = controllers & hy.controllers != 0;
            if name.is_empty() {
                if enabled {
                    name = cursor.first_name.clone();
                }
            } else {
                let sep = if enabled { '/' } else { '%' };
                name = format!("{}{}{}", cursor.first_name, sep, name);
            }
            match cursor.parent() {
                Some(parent) => cursor = parent,
                None => break,
            }
        }

        if name.is_empty() {
            hy.cgroup(CGROUP_PREFIX)
        } else {
            hy.cgroup(&format!("{}/{}", CGROUP_PREFIX, name))
        }
    }

    pub fn controllers(&self) -> u32 {
        self.props.lock().unwrap().controllers
    }

    fn prepare_cgroups(self: &Arc<Self>, daemon: &Daemon) -> Result<()> {
        let controllers = self.controllers();
        for hy in daemon.cgroups.hierarchies() {
            if controllers & hy.controllers == 0 {
                continue;
            }
            let cg = self.get_cgroup(hy);
            if cg.exists() {
                continue; // left over from restore
            }
            cg.create()?;
        }

        if self
            .parent()
            .map(|p| p.is_root())
            .unwrap_or(false)
        {
            if let Some(memory) = daemon.cgroups.get(CTRL_MEMORY) {
                if controllers & CTRL_MEMORY != 0 {
                    self.get_cgroup(memory).set_use_hierarchy(true)?;
                }
            }
        }

        if !self.is_root() && controllers & CTRL_MEMORY != 0 {
            if let Err(err) = self.prepare_oom_monitor(daemon) {
                error!(name = %self.name, error = %err, "cannot prepare OOM monitoring");
                return Err(err);
            }
        }
        Ok(())
    }

    fn prepare_oom_monitor(self: &Arc<Self>, daemon: &Daemon) -> Result<()> {
        let Some(memory) = daemon.cgroups.get(CTRL_MEMORY) else {
            return Ok(());
        };
        let event_fd = self.get_cgroup(memory).setup_oom_event()?;
        daemon.watch_oom(event_fd.as_raw_fd(), Arc::downgrade(self))?;
        *self.oom_event.lock().unwrap() = Some(event_fd);
        Ok(())
    }

    pub fn shutdown_oom(&self, daemon: &Daemon) {
        if let Some(fd) = self.oom_event.lock().unwrap().take() {
            daemon.unwatch_oom(fd.as_raw_fd());
        }
    }

    /// True when the OOM eventfd has fired. Consumes the notification.
    pub fn has_oom_event(&self) -> bool {
        let guard = self.oom_event.lock().unwrap();
        let Some(fd) = guard.as_ref() else {
            return false;
        };
        let mut value = 0u64;
        let len = unsafe {
            libc::read(
                fd.as_raw_fd(),
                &mut value as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        len == 8 && value != 0
    }

    // =========================================================================
    // Memory accounting helpers
    // =========================================================================

    /// The tightest memory limit along the ancestor chain; a meta
    /// container without its own limit is capped by the sum of its
    /// children.
    pub fn total_mem_limit(self: &Arc<Self>) -> u64 {
        fn limit_below(ct: &Arc<Container>, base_level: u32) -> u64 {
            let props = ct.props.lock().unwrap();
            let own = props.mem_limit;
            let is_meta = ct.is_root() || props.command.is_empty();
            let virt_app = props.virt_mode == VirtMode::App;
            drop(props);

            let mut limit = 0u64;
            if is_meta && virt_app {
                for child in ct.children.lock().unwrap().iter() {
                    let child_limit = limit_below(child, base_level);
                    if child_limit == 0 || child_limit > u64::MAX - limit {
                        limit = 0;
                        break;
                    }
                    limit += child_limit;
                }
            }
            if own != 0 && (limit == 0 || own < limit) {
                limit = own;
            }
            let _ = base_level;
            limit
        }

        let mut limit = limit_below(self, self.level);
        let mut cursor = self.parent();
        while let Some(ancestor) = cursor {
            let own = ancestor.props.lock().unwrap().mem_limit;
            if own != 0 && (limit == 0 || own < limit) {
                limit = own;
            }
            cursor = ancestor.parent();
        }
        limit
    }

    /// Squeezes idle meta containers: 1 MiB soft limit with no running
    /// children, the root default otherwise.
    pub fn update_soft_limit(self: &Arc<Self>, daemon: &Daemon) -> Result<()> {
        if self.is_root() {
            return Ok(());
        }
        if let Some(parent) = self.parent() {
            parent.update_soft_limit(daemon)?;
        }
        if self.state() != State::Meta {
            return Ok(());
        }
        let Some(memory) = daemon.cgroups.get(CTRL_MEMORY) else {
            return Ok(());
        };
        if self.controllers() & CTRL_MEMORY == 0 {
            return Ok(());
        }

        let default_limit = memory.root_cgroup().get_soft_limit()?;
        let limit = if self.running_children() > 0 {
            default_limit
        } else {
            1 << 20
        };
        let cg = self.get_cgroup(memory);
        if cg.get_soft_limit()? != limit {
            cg.set_soft_limit(limit)?;
        }
        Ok(())
    }

    // =========================================================================
    // Dynamic property application
    // =========================================================================

    /// Pushes every dirty property to the kernel, in a fixed order so
    /// co-dependent knobs stay consistent. Callers roll the value back
    /// when this fails during a mutating request.
    pub fn apply_dynamic_properties(
        self: &Arc<Self>,
        daemon: &Daemon,
        props: &mut PropertySet,
    ) -> Result<()> {
        if let Some(memory) = daemon.cgroups.get(CTRL_MEMORY) {
            let memcg = self.get_cgroup_with(memory, props.controllers);

            if props.test_clear_dirty(Prop::MemGuarantee) {
                memcg
                    .set_guarantee(props.mem_guarantee)
                    .map_err(|e| log_apply(self, "memory_guarantee", e))?;
            }
            if props.test_clear_dirty(Prop::MemLimit) {
                memcg
                    .set_limit(props.mem_limit)
                    .map_err(|e| log_apply(self, "memory_limit", e))?;
            }
            if props.test_clear_dirty(Prop::AnonLimit) {
                memcg
                    .set_anon_limit(props.anon_limit)
                    .map_err(|e| log_apply(self, "anon_limit", e))?;
            }
            if props.test_clear_dirty(Prop::DirtyLimit) {
                memcg
                    .set_dirty_limit(props.dirty_limit)
                    .map_err(|e| log_apply(self, "dirty_limit", e))?;
            }
            if props.test_clear_dirty(Prop::RechargeOnPgfault) {
                memcg
                    .set_recharge_on_pgfault(props.recharge_on_pgfault)
                    .map_err(|e| log_apply(self, "recharge_on_pgfault", e))?;
            }
            if props.test_clear_dirty(Prop::IoLimit) {
                memcg
                    .set_io_limit(props.io_limit)
                    .map_err(|e| log_apply(self, "io_limit", e))?;
            }
            if props.test_clear_dirty(Prop::IoOpsLimit) {
                memcg
                    .set_iops_limit(props.io_ops_limit)
                    .map_err(|e| log_apply(self, "io_ops_limit", e))?;
            }
        }

        if props.test_clear_dirty(Prop::IoPolicy) {
            if let Some(blkio) = daemon.cgroups.get(cgroup::CTRL_BLKIO) {
                self.get_cgroup_with(blkio, props.controllers)
                    .set_io_policy(&props.io_policy)
                    .map_err(|e| log_apply(self, "io_policy", e))?;
            }
        }

        // cpu knobs are one consistent group
        let cpu_dirty = props.test_clear_dirty(Prop::CpuPolicy)
            | props.test_clear_dirty(Prop::CpuLimit)
            | props.test_clear_dirty(Prop::CpuGuarantee);
        if cpu_dirty {
            if let Some(cpu) = daemon.cgroups.get(cgroup::CTRL_CPU) {
                self.get_cgroup_with(cpu, props.controllers)
                    .set_cpu_policy(&props.cpu_policy, props.cpu_guarantee, props.cpu_limit)
                    .map_err(|e| log_apply(self, "cpu policy", e))?;
            }
        }

        // network knobs go to the collaborator as one group
        let net_dirty = props.test_clear_dirty(Prop::NetPriority)
            | props.test_clear_dirty(Prop::NetLimit)
            | props.test_clear_dirty(Prop::NetGuarantee);
        if net_dirty {
            self.update_traffic_classes(daemon, props)
                .map_err(|e| log_apply(self, "traffic classes", e))?;
        }

        Ok(())
    }

    // =========================================================================
    // Network collaborator
    // =========================================================================

    /// The class handle of this container: nearest level with net_cls
    /// enabled, minor = container id.
    pub fn traffic_class(self: &Arc<Self>) -> u32 {
        self.traffic_class_with(self.controllers())
    }

    fn traffic_class_with(self: &Arc<Self>, self_controllers: u32) -> u32 {
        if self_controllers & CTRL_NETCLS != 0 {
            return tc_handle(1, self.id as u16);
        }
        let mut cursor = self.parent();
        while let Some(ct) = cursor {
            if ct.controllers() & CTRL_NETCLS != 0 {
                return tc_handle(1, ct.id as u16);
            }
            cursor = ct.parent();
        }
        tc_handle(1, 0)
    }

    fn update_traffic_classes(
        self: &Arc<Self>,
        daemon: &Daemon,
        props: &PropertySet,
    ) -> Result<()> {
        if props.controllers & CTRL_NETCLS == 0 {
            return Ok(());
        }

        let handle = self.traffic_class_with(props.controllers);
        // link the class below the closest running meta ancestor
        let mut parent_handle = tc_handle(1, 1);
        let mut cursor = self.parent();
        while let Some(ancestor) = cursor {
            match ancestor.state() {
                State::Meta => {
                    parent_handle = ancestor.traffic_class();
                    break;
                }
                State::Stopped => return Ok(()),
                _ => {}
            }
            cursor = ancestor.parent();
        }

        let leaf = !self.is_root() && !props.command.is_empty();
        daemon.net.create_class(
            handle,
            parent_handle,
            leaf,
            props.net_priority,
            props.net_guarantee,
            props.net_limit,
        )
    }

    // =========================================================================
    // Capabilities
    // =========================================================================

    /// Computes `ambient ⊆ allowed ⊆ limit` from the owner, the virt
    /// mode and the ancestor limits.
    pub fn sanitize_capabilities(self: &Arc<Self>, props: &mut PropertySet) {
        let (mut allowed, mut limit) = if props.owner.is_root() {
            (ALL_CAPABILITIES, ALL_CAPABILITIES)
        } else {
            let (allowed, mut limit) = match props.virt_mode {
                VirtMode::Os => (OS_MODE_CAPABILITIES, OS_MODE_CAPABILITIES),
                VirtMode::App => (APP_MODE_CAPABILITIES, SUID_CAPABILITIES),
            };
            let mut cursor = self.parent();
            while let Some(ancestor) = cursor {
                limit.permitted &= ancestor.props.lock().unwrap().cap_limit.permitted;
                cursor = ancestor.parent();
            }
            (allowed, limit)
        };

        if !props.has(Prop::Capabilities) {
            props.cap_limit = limit;
        } else {
            props.cap_limit.permitted &= limit.permitted;
            limit.permitted &= props.cap_limit.permitted;
        }

        allowed.permitted &= limit.permitted;
        props.cap_allowed = allowed;
        props.cap_ambient.permitted &= allowed.permitted;
    }

    // =========================================================================
    // Environment
    // =========================================================================

    pub fn get_env(self: &Arc<Self>, daemon: &Daemon) -> Result<Env> {
        let mut env = Env::new();
        let props = self.props.lock().unwrap();

        env.set("PATH", crate::constants::ENV_DEFAULT_PATH, false);
        env.set("HOME", &self.cwd_unlocked(&props), false);
        env.set("USER", &props.owner.user_name(), false);
        env.set("container", "lxc", false);
        env.set(crate::constants::ENV_CONTAINER_NAME, &self.name, true);
        env.set(crate::constants::ENV_CONTAINER_HOST, &daemon.host_name, true);

        // user env of the whole isolation domain, nearest wins
        let mut overwrite = true;
        env.merge(&props.env, overwrite)?;
        let mut isolated = props.isolate;
        drop(props);
        overwrite = false;

        let mut cursor = self.parent();
        while let (Some(ct), false) = (cursor.clone(), isolated) {
            let props = ct.props.lock().unwrap();
            // merge errors above the starting level only lose entries
            let _ = env.merge(&props.env, overwrite);
            isolated = props.isolate;
            drop(props);
            cursor = ct.parent();
        }
        Ok(env)
    }

    fn cwd_unlocked(&self, props: &PropertySet) -> String {
        if props.has(Prop::Cwd) {
            if let Some(cwd) = &props.cwd {
                return cwd.clone();
            }
        }
        if props.root != "/" {
            return "/".to_string();
        }
        self.default_cwd()
    }

    // =========================================================================
    // Start
    // =========================================================================

    pub fn start(self: &Arc<Self>, daemon: &Daemon, client: &ClientSession) -> Result<()> {
        if self.state() != State::Stopped {
            return Err(Error::new(
                ErrorKind::InvalidState,
                format!("cannot start, container is not stopped: {}", self.name),
            ));
        }

        if let Some(parent) = self.parent() {
            // start the parent chain first
            if parent.state() == State::Stopped {
                parent.start(daemon, client)?;
            }
            match parent.state() {
                State::Paused => {
                    return Err(Error::new(
                        ErrorKind::InvalidState,
                        format!("parent container is paused: {}", parent.name),
                    ))
                }
                State::Running | State::Meta => {}
                _ => {
                    return Err(Error::new(
                        ErrorKind::InvalidState,
                        format!("parent container is not running: {}", parent.name),
                    ))
                }
            }
            let freezer = parent.get_cgroup(daemon.cgroups.freezer());
            if freezer.is_frozen() {
                return Err(Error::new(
                    ErrorKind::InvalidState,
                    "parent container is frozen",
                ));
            }
        }

        self.resolve_root_path()?;
        self.apply_start_defaults(daemon)?;

        {
            let mut props = self.props.lock().unwrap();
            self.sanitize_capabilities(&mut props);

            if !props.isolate
                && props.cap_ambient.intersects(PID_NS_CAPABILITIES)
                && !client.is_super_user()
                && self.isolation_domain_is_root_locked(&props)
            {
                return Err(Error::new(
                    ErrorKind::Permission,
                    format!("capabilities require pid isolation: {}", PID_NS_CAPABILITIES),
                ));
            }

            if props.mem_limit == 0
                && props.cap_ambient.intersects(MEM_CG_CAPABILITIES)
                && !client.is_super_user()
            {
                let mut limited = false;
                let mut cursor = self.parent();
                while let Some(ancestor) = cursor {
                    limited = limited || ancestor.props.lock().unwrap().mem_limit != 0;
                    cursor = ancestor.parent();
                }
                if !limited {
                    return Err(Error::new(
                        ErrorKind::Permission,
                        format!("capabilities require memory limit: {}", MEM_CG_CAPABILITIES),
                    ));
                }
            }

            // lower parent access levels propagate into the child
            if let Some(parent) = self.parent() {
                let parent_level = parent.props.lock().unwrap().access_level;
                if parent_level < AccessLevel::ChildOnly && parent_level < props.access_level {
                    props.access_level = parent_level;
                }
            }
        }

        info!(name = %self.name, "start");
        {
            let mut core = self.core.lock().unwrap();
            core.start_time_ms = wall_ms();
        }

        self.prepare_resources(daemon)?;

        let result = self.start_prepared(daemon, client);
        if let Err(err) = result {
            // an OOM kill explains almost any launcher failure
            let err = if self.has_oom_event() {
                warn!(name = %self.name, error = %err, "start failed during OOM");
                Error::with_errno(
                    ErrorKind::InvalidValue,
                    libc::ENOMEM,
                    "OOM, memory limit too low",
                )
            } else {
                err
            };
            self.free_resources(daemon);
            return Err(err);
        }

        if self.is_meta() {
            self.set_state(daemon, State::Meta);
        } else {
            self.set_state(daemon, State::Running);
        }

        if let Err(err) = self.update_soft_limit(daemon) {
            error!(name = %self.name, error = %err, "cannot update meta soft limit");
        }
        self.save(daemon)
    }

    fn start_prepared(self: &Arc<Self>, daemon: &Daemon, client: &ClientSession) -> Result<()> {
        {
            let mut props = self.props.lock().unwrap();
            if !self.is_root() {
                self.apply_dynamic_properties(daemon, &mut props)?;
            }
        }

        if !self.is_meta() || self.props.lock().unwrap().isolate {
            let mut spawn_env = SpawnEnv::prepare(daemon, self, client)?;
            spawn_env.start(daemon)?;

            let mut core = self.core.lock().unwrap();
            core.task_pid = spawn_env.task_pid;
            core.task_vpid = spawn_env.task_vpid;
            core.wait_task_pid = spawn_env.wait_task_pid;
            info!(name = %self.name, pid = core.task_pid, "started");
        }
        Ok(())
    }

    fn resolve_root_path(self: &Arc<Self>) -> Result<()> {
        let Some(parent) = self.parent() else {
            return Ok(());
        };
        let root = HostPath::new(self.props.lock().unwrap().root.clone()).normalize();
        if root.is_dotdot() {
            return Err(Error::new(ErrorKind::Permission, "root path with .."));
        }
        let parent_root = parent.root_path.lock().unwrap().clone();
        *self.root_path.lock().unwrap() = parent_root.join(root);
        Ok(())
    }

    fn apply_start_defaults(self: &Arc<Self>, daemon: &Daemon) -> Result<()> {
        let mut props = self.props.lock().unwrap();

        if props.virt_mode == VirtMode::Os {
            if !props.owner.is_root() {
                if self.isolation_domain_is_root_locked(&props) {
                    return Err(Error::new(
                        ErrorKind::Permission,
                        "virt_mode=os must be isolated from the host",
                    ));
                }
                let root_path = self.root_path.lock().unwrap();
                if root_path.is_root() {
                    return Err(Error::new(
                        ErrorKind::Permission,
                        "virt_mode=os without chroot only for root",
                    ));
                }
            }
            if !props.has(Prop::Cwd) {
                props.cwd = Some("/".to_string());
                // the default, not a user assignment: the set bit stays off
            }
            if !props.has(Prop::Command) {
                props.command = "/sbin/init".to_string();
            }
            if !props.has(Prop::StdoutPath) {
                props.stdout_path = "/dev/null".to_string();
            }
            if !props.has(Prop::StderrPath) {
                props.stderr_path = "/dev/null".to_string();
            }
            if !props.has(Prop::BindDns) {
                props.bind_dns = false;
            }
        }

        // a non-isolated container inherits policy from its parent
        if !props.isolate {
            if let Some(parent) = self.parent() {
                let parent_props = parent.props.lock().unwrap();
                if !props.has(Prop::CpuPolicy) {
                    props.cpu_policy = parent_props.cpu_policy.clone();
                }
                if !props.has(Prop::IoPolicy) {
                    props.io_policy = parent_props.io_policy.clone();
                }
                if !props.has(Prop::RechargeOnPgfault) {
                    props.recharge_on_pgfault = parent_props.recharge_on_pgfault;
                }
                if !props.has(Prop::NetPriority) {
                    props.net_priority = parent_props.net_priority;
                }
                if !props.has(Prop::Ulimit) {
                    props.ulimit = parent_props.ulimit.clone();
                }
                if !props.has(Prop::Umask) {
                    props.umask = parent_props.umask;
                }
            }
        }

        let _ = daemon;
        Ok(())
    }

    fn isolation_domain_is_root_locked(self: &Arc<Self>, props: &PropertySet) -> bool {
        if props.isolate {
            return false;
        }
        match self.parent() {
            Some(parent) => parent.isolation_domain().is_root(),
            None => true,
        }
    }

    // =========================================================================
    // Resources
    // =========================================================================

    fn prepare_work_dir(&self) -> Result<()> {
        if self.is_root() || self.work_dir.exists() {
            return Ok(());
        }
        self.work_dir.mkdir_all(0o755)?;
        let owner = self.props.lock().unwrap().owner.clone();
        self.work_dir.chown(owner.uid, owner.gid)
    }

    fn prepare_resources(self: &Arc<Self>, daemon: &Daemon) -> Result<()> {
        if let Err(err) = self.prepare_work_dir() {
            if err.kind() == ErrorKind::NoSpace {
                info!(name = %self.name, error = %err, "cannot create working dir");
            } else {
                error!(name = %self.name, error = %err, "cannot create working dir");
            }
            self.free_resources(daemon);
            return Err(err);
        }

        if let Err(err) = self.prepare_cgroups(daemon) {
            error!(name = %self.name, error = %err, "cannot prepare cgroups");
            self.free_resources(daemon);
            return Err(err);
        }

        // a root pointing at a regular file becomes a loop-backed volume
        let needs_volume = {
            let props = self.props.lock().unwrap();
            props.has(Prop::Root) && self.root_path.lock().unwrap().is_regular_follow()
        };
        if needs_volume {
            let (storage, read_only, owner) = {
                let props = self.props.lock().unwrap();
                (
                    self.root_path.lock().unwrap().clone(),
                    props.root_ro,
                    props.owner.clone(),
                )
            };
            match daemon
                .volumes
                .create_root(&self.work_dir.join("root"), &storage, read_only, &owner)
            {
                Ok(volume) => {
                    *self.root_path.lock().unwrap() = volume.path.clone();
                    *self.root_volume.lock().unwrap() = Some(volume);
                }
                Err(err) => {
                    error!(name = %self.name, error = %err, "cannot create root volume");
                    self.free_resources(daemon);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    pub fn free_resources(self: &Arc<Self>, daemon: &Daemon) {
        self.shutdown_oom(daemon);

        if self.is_root() {
            return;
        }

        let controllers = self.controllers();
        for hy in daemon.cgroups.hierarchies() {
            if controllers & hy.controllers != 0 {
                let _ = self.get_cgroup(hy).remove();
            }
        }

        if controllers & CTRL_NETCLS != 0 {
            if let Err(err) = daemon.net.destroy_class(self.traffic_class()) {
                error!(name = %self.name, error = %err, "cannot remove traffic class");
            }
        }

        if let Some(volume) = self.root_volume.lock().unwrap().take() {
            if let Err(err) = daemon.volumes.destroy(&volume) {
                error!(name = %self.name, error = %err, "cannot destroy root volume");
            }
            *self.root_path.lock().unwrap() = HostPath::root();
        }

        if self.work_dir.exists() {
            if let Err(err) = self.work_dir.remove_all() {
                error!(name = %self.name, error = %err, "cannot remove working dir");
            }
        }
    }

    // =========================================================================
    // Stop / Terminate
    // =========================================================================

    pub fn kill(self: &Arc<Self>, sig: i32) -> Result<()> {
        if self.state() != State::Running {
            return Err(Error::new(ErrorKind::InvalidState, "container not running"));
        }
        let pid = self.task_pid();
        info!(name = %self.name, pid, sig, "kill");
        if unsafe { libc::kill(pid, sig) } != 0 {
            return Err(Error::sys(format!("kill({}, {})", pid, sig)));
        }
        Ok(())
    }

    /// Evicts every task: SIGTERM with a deadline for the main task,
    /// then SIGKILL sweeps, with freezer-assisted escalation when the
    /// cgroup refuses to drain.
    pub fn terminate(self: &Arc<Self>, daemon: &Daemon, deadline_ms: u64) -> Result<()> {
        if self.is_root() {
            return Err(Error::new(
                ErrorKind::Permission,
                "cannot terminate root container",
            ));
        }

        info!(name = %self.name, "terminate tasks");

        let cg = self.get_cgroup(daemon.cgroups.freezer());
        if self.controllers() & CTRL_FREEZER == 0 {
            if self.task_pid() != 0 {
                return Err(Error::new(
                    ErrorKind::NotSupported,
                    "cannot terminate without freezer",
                ));
            }
            return Ok(());
        }

        if cg.is_empty() {
            return Ok(());
        }
        if cg.is_frozen() {
            return Err(Error::new(
                ErrorKind::Permission,
                "cannot terminate paused container",
            ));
        }

        let task_pid = self.task_pid();
        if task_pid != 0 && deadline_ms != 0 && self.state() != State::Meta {
            if unsafe { libc::kill(task_pid, libc::SIGTERM) } == 0 {
                debug!(name = %self.name, pid = task_pid, "waiting after SIGTERM");
                while process_alive(task_pid) && now_ms() < deadline_ms {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
            }
        }

        for _pass in 0..3 {
            if cg.is_empty() {
                return Ok(());
            }
            cg.kill_all(libc::SIGKILL)?;
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        // stragglers are forking faster than we kill: freeze the world
        cg.freeze(true)?;
        let error = cg.kill_all(libc::SIGKILL);
        if cg.thaw(false).is_ok() && error.is_ok() {
            while !cg.is_empty() && deadline_ms != 0 && now_ms() < deadline_ms {
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
        }
        error
    }

    fn stop_one(self: &Arc<Self>, daemon: &Daemon, deadline_ms: u64) -> Result<()> {
        if self.state() == State::Stopped {
            return Ok(());
        }
        info!(name = %self.name, "stop");

        if !self.is_root() {
            self.terminate(daemon, deadline_ms)
                .map_err(|err| {
                    error!(name = %self.name, error = %err, "cannot terminate tasks");
                    err
                })?;
        }

        {
            let mut core = self.core.lock().unwrap();
            core.task_pid = 0;
            core.task_vpid = 0;
            core.wait_task_pid = 0;
            core.death_time_ms = 0;
            core.exit_status = None;
            core.oom_killed = false;
        }

        self.set_state(daemon, State::Stopped);
        self.free_resources(daemon);
        self.save(daemon)
    }

    /// Stops the whole subtree, children first. `timeout_ms == 0` skips
    /// the SIGTERM grace period.
    pub fn stop(self: &Arc<Self>, daemon: &Daemon, timeout_ms: u64) -> Result<()> {
        let deadline_ms = if timeout_ms != 0 {
            now_ms() + timeout_ms
        } else {
            0
        };

        let freezer = daemon.cgroups.freezer();
        let cg = self.get_cgroup(freezer);
        if self.controllers() & CTRL_FREEZER == 0 {
            if self.task_pid() != 0 {
                return Err(Error::new(
                    ErrorKind::NotSupported,
                    "cannot stop without freezer",
                ));
            }
        } else if cg.is_frozen() {
            if cg.is_parent_freezing() {
                return Err(Error::new(
                    ErrorKind::InvalidState,
                    "parent container is paused",
                ));
            }
            info!(name = %self.name, "terminate paused container");
            // SIGKILL pends on frozen tasks and fires at thaw
            for ct in self.subtree() {
                ct.get_cgroup(freezer).kill_all(libc::SIGKILL)?;
            }
            // thaw parents before children: a nested cgroup cannot thaw
            // while its ancestor is still frozen, it only shows
            // parent_freezing
            let mut subtree = self.subtree();
            subtree.reverse();
            for ct in subtree {
                let cg = ct.get_cgroup(freezer);
                if cg.is_self_freezing() {
                    cg.thaw(false)?;
                }
            }
        }

        for ct in self.subtree() {
            ct.stop_one(daemon, deadline_ms)?;
        }

        if let Err(err) = self.update_soft_limit(daemon) {
            error!(name = %self.name, error = %err, "cannot update meta soft limit");
        }
        Ok(())
    }

    // =========================================================================
    // Pause / Resume
    // =========================================================================

    pub fn pause(self: &Arc<Self>, daemon: &Daemon) -> Result<()> {
        let state = self.state();
        if state != State::Running && state != State::Meta {
            return Err(Error::new(ErrorKind::InvalidState, "container not running"));
        }
        if self.controllers() & CTRL_FREEZER == 0 {
            return Err(Error::new(
                ErrorKind::NotSupported,
                "cannot pause without freezer",
            ));
        }

        self.get_cgroup(daemon.cgroups.freezer()).freeze(true)?;

        for ct in self.subtree() {
            let state = ct.state();
            if state == State::Running || state == State::Meta {
                ct.set_state(daemon, State::Paused);
                if let Err(err) = ct.save(daemon) {
                    error!(name = %ct.name, error = %err, "cannot save state after pause");
                }
            }
        }
        Ok(())
    }

    pub fn resume(self: &Arc<Self>, daemon: &Daemon) -> Result<()> {
        if self.controllers() & CTRL_FREEZER == 0 {
            return Err(Error::new(
                ErrorKind::NotSupported,
                "cannot resume without freezer",
            ));
        }
        let freezer = daemon.cgroups.freezer();
        let cg = self.get_cgroup(freezer);
        if cg.is_parent_freezing() {
            return Err(Error::new(
                ErrorKind::InvalidState,
                "parent container is paused",
            ));
        }
        if !cg.is_self_freezing() {
            return Err(Error::new(ErrorKind::InvalidState, "container not paused"));
        }

        cg.thaw(true)?;

        for ct in self.subtree() {
            let cg = ct.get_cgroup(freezer);
            if cg.is_self_freezing() {
                let _ = cg.thaw(false);
            }
            if ct.state() == State::Paused {
                let new_state = if ct.is_meta() {
                    State::Meta
                } else {
                    State::Running
                };
                ct.set_state(daemon, new_state);
            }
            if let Err(err) = ct.save(daemon) {
                error!(name = %ct.name, error = %err, "cannot save state after resume");
            }
        }
        Ok(())
    }

    // =========================================================================
    // Exit and reaping
    // =========================================================================

    /// Handles the workload exit: records the status, folds in any OOM
    /// notification and reaps the whole subtree.
    pub fn exit(self: &Arc<Self>, daemon: &Daemon, status: i32, oom_kill: bool) {
        if self.state() == State::Stopped {
            return;
        }

        let mut oom_kill = oom_kill || self.has_oom_event();
        if !oom_kill {
            if let Some(memory) = daemon.cgroups.get(CTRL_MEMORY) {
                if let Ok(failcnt) = self.get_cgroup(memory).get_fail_cnt() {
                    oom_kill = oom_kill || failcnt != 0;
                }
            }
        }

        // the supervisor reports a fatal workload signal as 128+sig
        // because it cannot die of that signal itself
        let mut status = status;
        let (isolate, app_mode) = {
            let props = self.props.lock().unwrap();
            (props.isolate, props.virt_mode == VirtMode::App)
        };
        if isolate && app_mode && libc::WIFEXITED(status) {
            let code = libc::WEXITSTATUS(status);
            if code > 128 && code < 128 + libc::SIGRTMIN() {
                status = code - 128;
            }
        }

        info!(name = %self.name, status, oom_kill, "exit");

        self.core.lock().unwrap().exit_status = Some(status);

        for ct in self.subtree() {
            let state = ct.state();
            if state != State::Stopped && state != State::Dead {
                ct.reap(daemon, oom_kill);
            }
        }
    }

    /// Cleans one container after its workload went away.
    pub fn reap(self: &Arc<Self>, daemon: &Daemon, oom_kill: bool) {
        if let Err(err) = self.terminate(daemon, 0) {
            warn!(name = %self.name, error = %err, "cannot terminate on reap");
        }

        self.shutdown_oom(daemon);

        {
            let mut core = self.core.lock().unwrap();
            core.death_time_ms = wall_ms();
            if oom_kill {
                core.oom_killed = true;
            }
            core.task_pid = 0;
            core.task_vpid = 0;
            core.wait_task_pid = 0;
        }

        self.rotate_stdio(daemon);

        if self.state() == State::Meta {
            self.set_state(daemon, State::Stopped);
        } else {
            self.set_state(daemon, State::Dead);
        }

        if let Err(err) = self.save(daemon) {
            warn!(name = %self.name, error = %err, "cannot save state after exit");
        }

        if self.may_respawn() {
            self.schedule_respawn(daemon);
        }
    }

    /// Rotates the stdout/stderr streams against the configured cap.
    pub fn rotate_stdio(self: &Arc<Self>, daemon: &Daemon) {
        let (stdout, stderr, limit) = {
            let props = self.props.lock().unwrap();
            (
                props.stdout_path.clone(),
                props.stderr_path.clone(),
                props.stdout_limit,
            )
        };
        let _ = daemon;
        for path in [stdout, stderr] {
            if path.is_empty() || path.starts_with("/dev/") {
                continue;
            }
            let file = if path.starts_with('/') {
                HostPath::new(path)
            } else {
                self.work_dir.join(path)
            };
            if !file.is_regular_strict() {
                continue;
            }
            match file.rotate_log(limit) {
                Ok(0) => {}
                Ok(loss) => debug!(name = %self.name, file = %file, loss, "log rotated"),
                Err(err) => warn!(name = %self.name, file = %file, error = %err, "log rotation failed"),
            }
        }
    }

    // =========================================================================
    // Respawn and aging
    // =========================================================================

    pub fn may_respawn(self: &Arc<Self>) -> bool {
        if self.state() != State::Dead {
            return false;
        }
        let props = self.props.lock().unwrap();
        if !props.respawn {
            return false;
        }
        // parents must still be up; respawn does not restart the chain
        if let Some(parent) = self.parent() {
            let parent_state = parent.state();
            if parent_state != State::Running && parent_state != State::Meta {
                return false;
            }
        }
        props.max_respawns < 0 || self.respawn_count() < props.max_respawns as u64
    }

    pub fn schedule_respawn(self: &Arc<Self>, daemon: &Daemon) {
        daemon.events.add(
            daemon.config.container.respawn_delay_ms,
            Event::Respawn(Arc::downgrade(self)),
        );
    }

    pub fn respawn(self: &Arc<Self>, daemon: &Daemon) -> Result<()> {
        self.stop(daemon, daemon.config.container.kill_timeout_ms)?;

        let system = ClientSession::system();
        let result = self.start(daemon, &system);

        self.core.lock().unwrap().respawn_count += 1;
        let _ = self.save(daemon);
        result
    }

    /// A dead container past its aging time is reclaimed by the rotate
    /// tick.
    pub fn expired(self: &Arc<Self>) -> bool {
        if self.state() != State::Dead {
            return false;
        }
        let aging = self.props.lock().unwrap().aging_time_ms;
        wall_ms() >= self.death_time_ms() + aging
    }

    // =========================================================================
    // Destroy
    // =========================================================================

    /// Destroys this container and everything below it. The caller
    /// holds the write lock.
    pub fn destroy(self: &Arc<Self>, daemon: &Daemon) -> Result<()> {
        info!(name = %self.name, "destroy");

        if self.state() != State::Stopped {
            self.stop(daemon, 0)?;
        }

        loop {
            let child = self.children.lock().unwrap().first().cloned();
            match child {
                Some(child) => child.destroy(daemon)?,
                None => break,
            }
        }

        daemon.tree.remove_entry(self)?;

        if let Err(err) = daemon.kv.remove(self.id) {
            error!(name = %self.name, id = self.id, error = %err, "cannot remove record");
        }
        Ok(())
    }

    /// Queues teardown of a weak container after its client went away.
    pub fn destroy_weak(self: &Arc<Self>, daemon: &Daemon) {
        if self.props.lock().unwrap().weak {
            daemon.events.add(0, Event::DestroyWeak(Arc::downgrade(self)));
        }
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Serializes everything worth keeping into the key-value record.
    pub fn save(self: &Arc<Self>, daemon: &Daemon) -> Result<()> {
        let mut record = Record::new(self.id, &self.name);

        {
            let core = self.core.lock().unwrap();
            if core.task_pid != 0 {
                record.set("_root_pid", core.task_pid.to_string());
                record.set("_task_vpid", core.task_vpid.to_string());
                record.set("_wait_pid", core.wait_task_pid.to_string());
            }
            if let Some(status) = core.exit_status {
                record.set("_exit_status", status.to_string());
            }
            if core.oom_killed {
                record.set("_oom_killed", "true");
            }
            if core.start_time_ms != 0 {
                record.set("_start_time", core.start_time_ms.to_string());
            }
            if core.death_time_ms != 0 {
                record.set("_death_time", core.death_time_ms.to_string());
            }
            record.set("_respawn_count", core.respawn_count.to_string());
            record.set(KV_KEY_STATE, core.state.as_str());
        }

        {
            let props = self.props.lock().unwrap();
            for desc in property::descriptors() {
                if desc.flags & PERSIST == 0 || desc.flags & READ_ONLY != 0 {
                    continue;
                }
                if desc.prop == Prop::None || !props.has(desc.prop) {
                    continue;
                }
                match (desc.get)(self, &props) {
                    Ok(value) => record.set(desc.name, value),
                    Err(err) => {
                        warn!(name = %self.name, property = desc.name, error = %err,
                              "cannot serialize property");
                    }
                }
            }
        }

        for (key, value) in self.foreign_keys.lock().unwrap().iter() {
            record.set(key.clone(), value.clone());
        }

        daemon.kv.save(&record)
    }

    /// Applies a restored record. State is applied last; unknown keys
    /// are kept by the record layer and logged here.
    pub fn load_record(self: &Arc<Self>, record: &Record) -> Result<()> {
        let mut state = State::Stopped;
        let mut saw_state = false;

        {
            let mut props = self.props.lock().unwrap();
            for (key, value) in record.iter() {
                if key.starts_with('_') || key == KV_KEY_STATE {
                    continue;
                }
                let Some(desc) = property::find(key) else {
                    warn!(name = %self.name, key, "unknown property, preserved");
                    self.foreign_keys
                        .lock()
                        .unwrap()
                        .push((key.to_string(), value.to_string()));
                    continue;
                };
                let Some(set) = desc.set else {
                    continue;
                };
                if let Err(err) = set(self, &mut props, value) {
                    error!(name = %self.name, key, error = %err, "cannot load property, skipped");
                    continue;
                }
                props.mark_set(desc.prop);
            }
            // restore never leaves dirt behind: everything gets pushed
            // by the explicit apply pass after reconciliation
        }

        {
            let mut core = self.core.lock().unwrap();
            if let Some(value) = record.get("_root_pid") {
                core.task_pid = value.parse().unwrap_or(0);
            }
            if let Some(value) = record.get("_task_vpid") {
                core.task_vpid = value.parse().unwrap_or(0);
            }
            if let Some(value) = record.get("_wait_pid") {
                core.wait_task_pid = value.parse().unwrap_or(0);
            }
            if let Some(value) = record.get("_exit_status") {
                core.exit_status = value.parse().ok();
            }
            core.oom_killed = record.get("_oom_killed") == Some("true");
            if let Some(value) = record.get("_start_time") {
                core.start_time_ms = value.parse().unwrap_or(0);
            }
            if let Some(value) = record.get("_death_time") {
                core.death_time_ms = value.parse().unwrap_or(0);
            }
            if let Some(value) = record.get("_respawn_count") {
                core.respawn_count = value.parse().unwrap_or(0);
            }
            if let Some(value) = record.get(KV_KEY_STATE) {
                state = State::parse(value)?;
                saw_state = true;
            }
            core.state = state;
        }

        if !saw_state {
            return Err(Error::new(ErrorKind::Unknown, "record has no state"));
        }
        Ok(())
    }

    // =========================================================================
    // Restore reconciliation
    // =========================================================================

    /// Reconciles a restored container with the live kernel through the
    /// freezer view.
    pub fn sync_state(self: &Arc<Self>, daemon: &Daemon) {
        let state = self.state();
        info!(name = %self.name, state = state.as_str(), "sync state");

        let freezer = daemon.cgroups.freezer();
        let freezer_cg = self.get_cgroup(freezer);

        if !freezer_cg.exists() {
            if state != State::Stopped {
                warn!(name = %self.name, "freezer not found, forcing stopped");
            }
            self.core.lock().unwrap().state = State::Stopped;
            return;
        }

        let wait_pid = self.wait_task_pid();
        let isolate = self.props.lock().unwrap().isolate;

        if state == State::Stopped {
            info!(name = %self.name, "found unexpected freezer");
            self.reap(daemon, false);
        } else if state == State::Meta && wait_pid == 0 && !isolate {
            // plain meta container, nothing to check
        } else if wait_pid == 0 || !process_alive(wait_pid) {
            if state != State::Dead {
                info!(name = %self.name, "task not found");
            }
            self.reap(daemon, false);
        } else if process_parent(wait_pid) != Some(std::process::id() as i32) {
            info!(name = %self.name, pid = wait_pid, "wrong wait task parent");
            self.reap(daemon, false);
        } else if process_zombie(wait_pid) {
            info!(name = %self.name, pid = wait_pid, "task is zombie");
            self.core.lock().unwrap().task_pid = 0;
        } else {
            match freezer.task_cgroup(wait_pid) {
                Err(_) => {
                    info!(name = %self.name, "cannot check freezer");
                    self.reap(daemon, false);
                }
                Ok(task_cg) if task_cg != freezer_cg => {
                    info!(name = %self.name, "task in wrong freezer");
                    unsafe {
                        libc::kill(wait_pid, libc::SIGKILL);
                        let task_pid = self.task_pid();
                        if task_pid != 0 {
                            libc::kill(task_pid, libc::SIGKILL);
                        }
                    }
                    self.reap(daemon, false);
                }
                Ok(_) => {}
            }
        }

        if self.controllers() & CTRL_FREEZER == 0 {
            return;
        }

        // every task in the freezer must sit in every other enabled
        // controller as well; re-attach stragglers
        let tasks = match freezer_cg.get_tasks() {
            Ok(tasks) => tasks,
            Err(err) => {
                warn!(name = %self.name, error = %err, "cannot list freezer tasks");
                return;
            }
        };
        for pid in tasks {
            for hy in daemon.cgroups.hierarchies() {
                if self.controllers() & hy.controllers == 0 {
                    continue;
                }
                let correct = self.get_cgroup(hy);
                let Ok(current) = hy.task_cgroup(pid) else {
                    continue;
                };
                if current == correct {
                    continue;
                }
                // the freezer view wins: recheck before moving
                match freezer.task_cgroup(pid) {
                    Ok(fr) if fr == freezer_cg => {
                        warn!(pid, current = %current, correct = %correct,
                              "task in wrong cgroup, re-attaching");
                        let _ = correct.attach(pid);
                    }
                    _ => {}
                }
            }
        }
    }

    // =========================================================================
    // Property access
    // =========================================================================

    /// Splits `name[index]` into its parts.
    fn parse_property_name(name: &str) -> (&str, Option<&str>) {
        match name.split_once('[') {
            Some((base, idx)) => (base.trim(), Some(idx.trim_end_matches(']').trim())),
            None => (name, None),
        }
    }

    /// Reads a property, a `name[index]` element, or a raw
    /// `<controller>.<knob>` cgroup attribute.
    pub fn get_property(self: &Arc<Self>, daemon: &Daemon, name: &str) -> Result<String> {
        if let Some(dot) = name.find('.') {
            if !name.contains('[') {
                let controller = &name[..dot];
                if self.state() == State::Stopped {
                    return Err(Error::new(
                        ErrorKind::InvalidState,
                        format!("not available in stopped state: {}", name),
                    ));
                }
                for hy in daemon.cgroups.hierarchies() {
                    if hy.kind == controller {
                        let cg = self.get_cgroup(hy);
                        if !cg.has_knob(name) {
                            break;
                        }
                        return cg.get(name);
                    }
                }
                return Err(Error::new(
                    ErrorKind::InvalidProperty,
                    format!("unknown cgroup attribute: {}", name),
                ));
            }
        }

        let (base, idx) = Self::parse_property_name(name);
        let desc = property::find(base).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidProperty,
                format!("unknown container property: {}", base),
            )
        })?;

        let props = self.props.lock().unwrap();
        match idx {
            Some(idx) => {
                let get_indexed = desc.get_indexed.ok_or_else(|| {
                    Error::new(
                        ErrorKind::InvalidProperty,
                        format!("property is not indexed: {}", base),
                    )
                })?;
                get_indexed(self, &props, idx)
            }
            None => (desc.get)(self, &props),
        }
    }

    /// Assigns a property. For live containers the value goes straight
    /// to the kernel; a failed application restores the old value.
    pub fn set_property(
        self: &Arc<Self>,
        daemon: &Daemon,
        name: &str,
        value: &str,
    ) -> Result<()> {
        if self.is_root() {
            return Err(Error::new(
                ErrorKind::Permission,
                "root container is read-only",
            ));
        }

        let (base, idx) = Self::parse_property_name(name);
        let value = value.trim();
        let desc = property::find(base).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidProperty,
                format!("unknown container property: {}", base),
            )
        })?;
        if desc.flags & READ_ONLY != 0 {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("property is read-only: {}", base),
            ));
        }
        let state = self.state();
        if desc.flags & STOPPED_ONLY != 0 && state != State::Stopped {
            return Err(Error::new(
                ErrorKind::InvalidState,
                format!("cannot change {} while {}", base, state.as_str()),
            ));
        }

        let result = {
            let mut props = self.props.lock().unwrap();
            let old_value = (desc.get)(self, &props)?;

            let applied = match idx {
                Some(idx) => match desc.set_indexed {
                    Some(set_indexed) => set_indexed(self, &mut props, idx, value),
                    None => Err(Error::new(
                        ErrorKind::InvalidProperty,
                        format!("property is not indexed: {}", base),
                    )),
                },
                None => match desc.set {
                    Some(set) => set(self, &mut props, value),
                    None => Err(Error::new(
                        ErrorKind::InvalidValue,
                        format!("property is read-only: {}", base),
                    )),
                },
            };

            applied.and_then(|()| {
                if matches!(state, State::Running | State::Meta | State::Paused) {
                    if let Err(err) = self.apply_dynamic_properties(daemon, &mut props) {
                        // roll the stored value back before reporting
                        if let Some(set) = desc.set {
                            let _ = set(self, &mut props, &old_value);
                        }
                        props.test_clear_dirty(desc.prop);
                        return Err(err);
                    }
                }
                Ok(())
            })
        };

        result?;
        self.save(daemon)
    }

    // =========================================================================
    // Devices
    // =========================================================================

    /// Validates the device list and applies it to the devices cgroup.
    /// Returns the parsed nodes for the launcher.
    pub fn configure_devices(self: &Arc<Self>, daemon: &Daemon) -> Result<Vec<crate::spawn::Device>> {
        let mut devices = Vec::new();
        if self.is_root() || self.controllers() & CTRL_DEVICES == 0 {
            return Ok(devices);
        }
        let Some(devices_hy) = daemon.cgroups.get(CTRL_DEVICES) else {
            return Ok(devices);
        };
        let cg = self.get_cgroup(devices_hy);

        let (configs, owner, has_devices) = {
            let props = self.props.lock().unwrap();
            (
                props.devices.clone(),
                props.owner.clone(),
                props.has(Prop::Devices),
            )
        };

        if self.parent().map(|p| p.is_root()).unwrap_or(false) && (has_devices || !owner.is_root())
        {
            cg.apply_default_access()?;
        }

        for config in &configs {
            let device = crate::spawn::Device::parse(config)
                .map_err(|e| e.context(format!("device: {}", config)))?;
            device
                .permitted(&owner)
                .map_err(|e| e.context(format!("device: {}", config)))?;
            cg.allow_device(&device.cgroup_rule())
                .map_err(|e| e.context(format!("device: {}", config)))?;
            devices.push(device);
        }
        Ok(devices)
    }
}

fn log_apply(ct: &Container, what: &str, err: Error) -> Error {
    error!(name = %ct.name, what, error = %err, "cannot apply property");
    err
}

// =============================================================================
// Proc helpers
// =============================================================================

/// True when the pid still exists (including zombies).
pub fn process_alive(pid: i32) -> bool {
    pid > 0 && (unsafe { libc::kill(pid, 0) } == 0 || std::io::Error::last_os_error()
        .raw_os_error() == Some(libc::EPERM))
}

/// Parent pid from `/proc/<pid>/stat`, `None` when gone.
pub fn process_parent(pid: i32) -> Option<i32> {
    let text = HostPath::new(format!("/proc/{}/stat", pid))
        .read_all(4096)
        .ok()?;
    // comm may contain spaces; skip past the closing paren
    let rest = text.rsplit_once(')')?.1;
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}

/// True when the pid is a zombie.
pub fn process_zombie(pid: i32) -> bool {
    let Ok(text) = HostPath::new(format!("/proc/{}/stat", pid)).read_all(4096) else {
        return false;
    };
    text.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next().map(|s| s == "Z"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names_roundtrip() {
        for state in [
            State::Stopped,
            State::Running,
            State::Paused,
            State::Meta,
            State::Dead,
            State::Destroyed,
        ] {
            assert_eq!(State::parse(state.as_str()).unwrap(), state);
        }
        assert!(State::parse("limbo").is_err());
    }

    #[test]
    fn test_process_alive_self() {
        assert!(process_alive(std::process::id() as i32));
        assert!(!process_alive(0));
    }

    #[test]
    fn test_process_parent_of_self() {
        let ppid = process_parent(std::process::id() as i32);
        assert_eq!(ppid, Some(std::os::unix::process::parent_id() as i32));
    }
}
