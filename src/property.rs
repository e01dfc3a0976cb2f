//! Container property catalog.
//!
//! Every user-visible knob is a property: a name, a tag in [`Prop`], and
//! a pair of getter/setter functions in the static registry. Each
//! container keeps two bits per property: *set* (the user assigned a
//! non-default value) and *dirty* (the kernel still has to be told).
//! Dirty bits are consumed by the fixed-order application pass in
//! `Container::apply_dynamic_properties`.

use crate::caps::{Capabilities, NO_CAPABILITIES};
use crate::client::AccessLevel;
use crate::constants::{DEFAULT_AGING_TIME_MS, DEFAULT_STDOUT_LIMIT};
use crate::container::Container;
use crate::cred::Cred;
use crate::error::{Error, ErrorKind, Result};
use crate::path::HostPath;
use std::collections::BTreeMap;

// =============================================================================
// Tags
// =============================================================================

/// Property tags. The discriminant doubles as the bit index in the
/// per-container set/dirty bitmaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Prop {
    Command,
    Cwd,
    Env,
    Root,
    RootRo,
    User,
    Group,
    Isolate,
    VirtMode,
    BindDns,
    Hostname,
    ResolvConf,
    Bind,
    StdoutPath,
    StderrPath,
    StdoutLimit,
    MemGuarantee,
    MemLimit,
    AnonLimit,
    DirtyLimit,
    RechargeOnPgfault,
    IoLimit,
    IoOpsLimit,
    IoPolicy,
    CpuPolicy,
    CpuLimit,
    CpuGuarantee,
    NetGuarantee,
    NetLimit,
    NetPriority,
    Respawn,
    MaxRespawns,
    RespawnCount,
    AgingTime,
    Private,
    Weak,
    AccessLevel,
    Scope,
    Controllers,
    Devices,
    Capabilities,
    Ulimit,
    Umask,
    // runtime-only tags, persisted from the container core
    State,
    RootPid,
    ExitStatus,
    OomKilled,
    StartTime,
    DeathTime,
    /// No backing bit; identity getters only.
    None,
}

const fn prop_bit(prop: Prop) -> u64 {
    1u64 << (prop as u32)
}

/// Workload flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VirtMode {
    /// Ordinary application: supervisor becomes pid 1, workload pid 2.
    #[default]
    App,
    /// System container: the command itself runs as pid 1.
    Os,
}

impl VirtMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VirtMode::App => "app",
            VirtMode::Os => "os",
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        match text {
            "app" => Ok(VirtMode::App),
            "os" => Ok(VirtMode::Os),
            other => Err(Error::new(
                ErrorKind::InvalidValue,
                format!("unknown virt mode: {}", other),
            )),
        }
    }
}

/// One user-requested bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: HostPath,
    pub target: HostPath,
    pub read_only: bool,
}

// =============================================================================
// Per-container values
// =============================================================================

/// All property-backed configuration of one container plus the set and
/// dirty bitmaps. Guarded by the container's `props` mutex.
#[derive(Debug, Clone)]
pub struct PropertySet {
    pub command: String,
    pub cwd: Option<String>,
    pub env: Vec<String>,
    pub root: String,
    pub root_ro: bool,
    pub owner: Cred,
    pub isolate: bool,
    pub virt_mode: VirtMode,
    pub bind_dns: bool,
    pub hostname: String,
    pub resolv_conf: Vec<String>,
    pub binds: Vec<BindMount>,
    pub stdout_path: String,
    pub stderr_path: String,
    pub stdout_limit: u64,
    pub mem_guarantee: u64,
    pub mem_limit: u64,
    pub anon_limit: u64,
    pub dirty_limit: u64,
    pub recharge_on_pgfault: bool,
    pub io_limit: u64,
    pub io_ops_limit: u64,
    pub io_policy: String,
    pub cpu_policy: String,
    pub cpu_limit: f64,
    pub cpu_guarantee: f64,
    pub net_guarantee: u64,
    pub net_limit: u64,
    pub net_priority: u32,
    pub respawn: bool,
    pub max_respawns: i64,
    pub aging_time_ms: u64,
    pub private: String,
    pub weak: bool,
    pub access_level: AccessLevel,
    pub scope: String,
    pub controllers: u32,
    pub devices: Vec<String>,
    pub cap_ambient: Capabilities,
    pub cap_allowed: Capabilities,
    pub cap_limit: Capabilities,
    pub ulimit: BTreeMap<String, (u64, u64)>,
    pub umask: u32,

    set: u64,
    dirty: u64,
}

impl Default for PropertySet {
    fn default() -> Self {
        Self {
            command: String::new(),
            cwd: None,
            env: Vec::new(),
            root: "/".to_string(),
            root_ro: false,
            owner: Cred::root(),
            isolate: true,
            virt_mode: VirtMode::App,
            bind_dns: true,
            hostname: String::new(),
            resolv_conf: Vec::new(),
            binds: Vec::new(),
            stdout_path: "stdout".to_string(),
            stderr_path: "stderr".to_string(),
            stdout_limit: DEFAULT_STDOUT_LIMIT,
            mem_guarantee: 0,
            mem_limit: 0,
            anon_limit: 0,
            dirty_limit: 0,
            recharge_on_pgfault: false,
            io_limit: 0,
            io_ops_limit: 0,
            io_policy: "normal".to_string(),
            cpu_policy: "normal".to_string(),
            cpu_limit: num_cores() as f64,
            cpu_guarantee: 0.0,
            net_guarantee: 0,
            net_limit: 0,
            net_priority: 3,
            respawn: false,
            max_respawns: -1,
            aging_time_ms: DEFAULT_AGING_TIME_MS,
            private: String::new(),
            weak: false,
            access_level: AccessLevel::Normal,
            scope: String::new(),
            controllers: 0,
            devices: Vec::new(),
            cap_ambient: NO_CAPABILITIES,
            cap_allowed: NO_CAPABILITIES,
            cap_limit: NO_CAPABILITIES,
            ulimit: BTreeMap::new(),
            umask: 0o002,
            set: 0,
            dirty: 0,
        }
    }
}

impl PropertySet {
    pub fn has(&self, prop: Prop) -> bool {
        self.set & prop_bit(prop) != 0
    }

    pub fn mark_set(&mut self, prop: Prop) {
        self.set |= prop_bit(prop);
    }

    pub fn clear_set(&mut self, prop: Prop) {
        self.set &= !prop_bit(prop);
    }

    pub fn mark_dirty(&mut self, prop: Prop) {
        self.dirty |= prop_bit(prop);
    }

    pub fn is_dirty(&self, prop: Prop) -> bool {
        self.dirty & prop_bit(prop) != 0
    }

    /// Reads and clears the dirty bit; application order lives in
    /// `Container::apply_dynamic_properties`.
    pub fn test_clear_dirty(&mut self, prop: Prop) -> bool {
        let bit = prop_bit(prop);
        let was = self.dirty & bit != 0;
        self.dirty &= !bit;
        was
    }

    fn assign(&mut self, desc: &PropDesc) {
        self.set |= prop_bit(desc.prop);
        if desc.flags & DYNAMIC != 0 {
            self.dirty |= prop_bit(desc.prop);
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Property can be read but never assigned by clients.
pub const READ_ONLY: u32 = 1 << 0;
/// Property is left out of listings.
pub const HIDDEN: u32 = 1 << 1;
/// Property is saved in the persistent record.
pub const PERSIST: u32 = 1 << 2;
/// A change must be pushed to the kernel while the container runs.
pub const DYNAMIC: u32 = 1 << 3;
/// Property can only be assigned while the container is stopped.
pub const STOPPED_ONLY: u32 = 1 << 4;

type GetFn = fn(&Container, &PropertySet) -> Result<String>;
type SetFn = fn(&Container, &mut PropertySet, &str) -> Result<()>;
type GetIndexedFn = fn(&Container, &PropertySet, &str) -> Result<String>;
type SetIndexedFn = fn(&Container, &mut PropertySet, &str, &str) -> Result<()>;

/// One registry entry.
pub struct PropDesc {
    pub name: &'static str,
    pub prop: Prop,
    pub flags: u32,
    pub get: GetFn,
    pub set: Option<SetFn>,
    pub get_indexed: Option<GetIndexedFn>,
    pub set_indexed: Option<SetIndexedFn>,
}

macro_rules! desc {
    ($name:expr, $prop:expr, $flags:expr, $get:expr) => {
        PropDesc {
            name: $name,
            prop: $prop,
            flags: $flags,
            get: $get,
            set: None,
            get_indexed: None,
            set_indexed: None,
        }
    };
    ($name:expr, $prop:expr, $flags:expr, $get:expr, $set:expr) => {
        PropDesc {
            name: $name,
            prop: $prop,
            flags: $flags,
            get: $get,
            set: Some($set),
            get_indexed: None,
            set_indexed: None,
        }
    };
}

/// Looks a property up by name.
pub fn find(name: &str) -> Option<&'static PropDesc> {
    DESCRIPTORS.iter().find(|d| d.name == name)
}

/// The full catalog, in listing order.
pub fn descriptors() -> &'static [PropDesc] {
    DESCRIPTORS
}

static DESCRIPTORS: &[PropDesc] = &[
    desc!(
        "command",
        Prop::Command,
        PERSIST | STOPPED_ONLY,
        |_, ps| Ok(ps.command.clone()),
        |_, ps, value| {
            ps.command = value.to_string();
            ps.assign(find("command").unwrap());
            Ok(())
        }
    ),
    desc!(
        "cwd",
        Prop::Cwd,
        PERSIST | STOPPED_ONLY,
        |ct, ps| Ok(ps.cwd.clone().unwrap_or_else(|| ct.default_cwd())),
        |_, ps, value| {
            if !value.starts_with('/') {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    "working directory must be absolute",
                ));
            }
            ps.cwd = Some(value.to_string());
            ps.assign(find("cwd").unwrap());
            Ok(())
        }
    ),
    PropDesc {
        name: "env",
        prop: Prop::Env,
        flags: PERSIST | STOPPED_ONLY,
        get: |_, ps| Ok(ps.env.join(";")),
        set: Some(|_, ps, value| {
            let mut env = Vec::new();
            for entry in value.split(';') {
                let entry = entry.trim();
                if entry.is_empty() {
                    continue;
                }
                if !entry.contains('=') {
                    return Err(Error::new(
                        ErrorKind::InvalidValue,
                        format!("env entry without '=': {}", entry),
                    ));
                }
                env.push(entry.to_string());
            }
            ps.env = env;
            ps.assign(find("env").unwrap());
            Ok(())
        }),
        get_indexed: Some(|_, ps, idx| {
            for entry in &ps.env {
                if let Some((key, value)) = entry.split_once('=') {
                    if key == idx {
                        return Ok(value.to_string());
                    }
                }
            }
            Err(Error::new(
                ErrorKind::InvalidValue,
                format!("no such variable: {}", idx),
            ))
        }),
        set_indexed: Some(|_, ps, idx, value| {
            if idx.is_empty() || idx.contains('=') {
                return Err(Error::new(ErrorKind::InvalidValue, "bad variable name"));
            }
            ps.env.retain(|entry| entry.split('=').next() != Some(idx));
            ps.env.push(format!("{}={}", idx, value));
            ps.assign(find("env").unwrap());
            Ok(())
        }),
    },
    desc!(
        "root",
        Prop::Root,
        PERSIST | STOPPED_ONLY,
        |_, ps| Ok(ps.root.clone()),
        |_, ps, value| {
            if value.is_empty() {
                return Err(Error::new(ErrorKind::InvalidValue, "empty root path"));
            }
            ps.root = value.to_string();
            ps.assign(find("root").unwrap());
            Ok(())
        }
    ),
    desc!(
        "root_readonly",
        Prop::RootRo,
        PERSIST | STOPPED_ONLY,
        |_, ps| Ok(format_bool(ps.root_ro)),
        |_, ps, value| {
            ps.root_ro = parse_bool(value)?;
            ps.assign(find("root_readonly").unwrap());
            Ok(())
        }
    ),
    desc!(
        "user",
        Prop::User,
        PERSIST | STOPPED_ONLY,
        |_, ps| Ok(ps.owner.user_name()),
        |_, ps, value| {
            ps.owner.uid = crate::cred::user_id(value)?;
            ps.assign(find("user").unwrap());
            Ok(())
        }
    ),
    desc!(
        "group",
        Prop::Group,
        PERSIST | STOPPED_ONLY,
        |_, ps| Ok(crate::cred::group_name(ps.owner.gid)),
        |_, ps, value| {
            ps.owner.gid = crate::cred::group_id(value)?;
            ps.assign(find("group").unwrap());
            Ok(())
        }
    ),
    desc!(
        "isolate",
        Prop::Isolate,
        PERSIST | STOPPED_ONLY,
        |_, ps| Ok(format_bool(ps.isolate)),
        |_, ps, value| {
            ps.isolate = parse_bool(value)?;
            ps.assign(find("isolate").unwrap());
            Ok(())
        }
    ),
    desc!(
        "virt_mode",
        Prop::VirtMode,
        PERSIST | STOPPED_ONLY,
        |_, ps| Ok(ps.virt_mode.as_str().to_string()),
        |_, ps, value| {
            ps.virt_mode = VirtMode::parse(value)?;
            ps.assign(find("virt_mode").unwrap());
            Ok(())
        }
    ),
    desc!(
        "bind_dns",
        Prop::BindDns,
        PERSIST | STOPPED_ONLY,
        |_, ps| Ok(format_bool(ps.bind_dns)),
        |_, ps, value| {
            ps.bind_dns = parse_bool(value)?;
            ps.assign(find("bind_dns").unwrap());
            Ok(())
        }
    ),
    desc!(
        "hostname",
        Prop::Hostname,
        PERSIST | STOPPED_ONLY,
        |_, ps| Ok(ps.hostname.clone()),
        |_, ps, value| {
            if value.len() > 255 {
                return Err(Error::new(ErrorKind::InvalidValue, "hostname too long"));
            }
            ps.hostname = value.to_string();
            ps.assign(find("hostname").unwrap());
            Ok(())
        }
    ),
    desc!(
        "resolv_conf",
        Prop::ResolvConf,
        PERSIST | STOPPED_ONLY,
        |_, ps| Ok(ps.resolv_conf.join(";")),
        |_, ps, value| {
            ps.resolv_conf = value
                .split(';')
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
            ps.assign(find("resolv_conf").unwrap());
            Ok(())
        }
    ),
    desc!(
        "bind",
        Prop::Bind,
        PERSIST | STOPPED_ONLY,
        |_, ps| {
            Ok(ps
                .binds
                .iter()
                .map(|b| {
                    format!(
                        "{} {} {}",
                        b.source,
                        b.target,
                        if b.read_only { "ro" } else { "rw" }
                    )
                })
                .collect::<Vec<_>>()
                .join(";"))
        },
        |_, ps, value| {
            ps.binds = parse_binds(value)?;
            ps.assign(find("bind").unwrap());
            Ok(())
        }
    ),
    desc!(
        "stdout_path",
        Prop::StdoutPath,
        PERSIST | STOPPED_ONLY,
        |_, ps| Ok(ps.stdout_path.clone()),
        |_, ps, value| {
            ps.stdout_path = value.to_string();
            ps.assign(find("stdout_path").unwrap());
            Ok(())
        }
    ),
    desc!(
        "stderr_path",
        Prop::StderrPath,
        PERSIST | STOPPED_ONLY,
        |_, ps| Ok(ps.stderr_path.clone()),
        |_, ps, value| {
            ps.stderr_path = value.to_string();
            ps.assign(find("stderr_path").unwrap());
            Ok(())
        }
    ),
    desc!(
        "stdout_limit",
        Prop::StdoutLimit,
        PERSIST,
        |_, ps| Ok(ps.stdout_limit.to_string()),
        |_, ps, value| {
            ps.stdout_limit = parse_size(value)?;
            ps.assign(find("stdout_limit").unwrap());
            Ok(())
        }
    ),
    desc!(
        "memory_guarantee",
        Prop::MemGuarantee,
        PERSIST | DYNAMIC,
        |_, ps| Ok(ps.mem_guarantee.to_string()),
        |ct, ps, value| {
            let bytes = parse_size(value)?;
            if bytes > total_memory() {
                return Err(Error::new(
                    ErrorKind::ResourceNotAvailable,
                    "memory guarantee above host memory",
                ));
            }
            let _ = ct;
            ps.mem_guarantee = bytes;
            ps.assign(find("memory_guarantee").unwrap());
            Ok(())
        }
    ),
    desc!(
        "memory_limit",
        Prop::MemLimit,
        PERSIST | DYNAMIC,
        |_, ps| Ok(ps.mem_limit.to_string()),
        |_, ps, value| {
            ps.mem_limit = parse_size(value)?;
            ps.assign(find("memory_limit").unwrap());
            Ok(())
        }
    ),
    desc!(
        "anon_limit",
        Prop::AnonLimit,
        PERSIST | DYNAMIC,
        |_, ps| Ok(ps.anon_limit.to_string()),
        |_, ps, value| {
            ps.anon_limit = parse_size(value)?;
            ps.assign(find("anon_limit").unwrap());
            Ok(())
        }
    ),
    desc!(
        "dirty_limit",
        Prop::DirtyLimit,
        PERSIST | DYNAMIC,
        |_, ps| Ok(ps.dirty_limit.to_string()),
        |_, ps, value| {
            ps.dirty_limit = parse_size(value)?;
            ps.assign(find("dirty_limit").unwrap());
            Ok(())
        }
    ),
    desc!(
        "recharge_on_pgfault",
        Prop::RechargeOnPgfault,
        PERSIST | DYNAMIC,
        |_, ps| Ok(format_bool(ps.recharge_on_pgfault)),
        |_, ps, value| {
            ps.recharge_on_pgfault = parse_bool(value)?;
            ps.assign(find("recharge_on_pgfault").unwrap());
            Ok(())
        }
    ),
    desc!(
        "io_limit",
        Prop::IoLimit,
        PERSIST | DYNAMIC,
        |_, ps| Ok(ps.io_limit.to_string()),
        |_, ps, value| {
            ps.io_limit = parse_size(value)?;
            ps.assign(find("io_limit").unwrap());
            Ok(())
        }
    ),
    desc!(
        "io_ops_limit",
        Prop::IoOpsLimit,
        PERSIST | DYNAMIC,
        |_, ps| Ok(ps.io_ops_limit.to_string()),
        |_, ps, value| {
            ps.io_ops_limit = parse_size(value)?;
            ps.assign(find("io_ops_limit").unwrap());
            Ok(())
        }
    ),
    desc!(
        "io_policy",
        Prop::IoPolicy,
        PERSIST | DYNAMIC,
        |_, ps| Ok(ps.io_policy.clone()),
        |_, ps, value| {
            if value != "normal" && value != "batch" {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("unknown io policy: {}", value),
                ));
            }
            ps.io_policy = value.to_string();
            ps.assign(find("io_policy").unwrap());
            Ok(())
        }
    ),
    desc!(
        "cpu_policy",
        Prop::CpuPolicy,
        PERSIST | DYNAMIC,
        |_, ps| Ok(ps.cpu_policy.clone()),
        |_, ps, value| {
            if !matches!(value, "normal" | "rt" | "batch" | "idle") {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("unknown cpu policy: {}", value),
                ));
            }
            ps.cpu_policy = value.to_string();
            ps.assign(find("cpu_policy").unwrap());
            Ok(())
        }
    ),
    desc!(
        "cpu_limit",
        Prop::CpuLimit,
        PERSIST | DYNAMIC,
        |_, ps| Ok(format_cores(ps.cpu_limit)),
        |_, ps, value| {
            ps.cpu_limit = parse_cores(value)?;
            ps.assign(find("cpu_limit").unwrap());
            Ok(())
        }
    ),
    desc!(
        "cpu_guarantee",
        Prop::CpuGuarantee,
        PERSIST | DYNAMIC,
        |_, ps| Ok(format_cores(ps.cpu_guarantee)),
        |_, ps, value| {
            ps.cpu_guarantee = parse_cores(value)?;
            ps.assign(find("cpu_guarantee").unwrap());
            Ok(())
        }
    ),
    desc!(
        "net_guarantee",
        Prop::NetGuarantee,
        PERSIST | DYNAMIC,
        |_, ps| Ok(ps.net_guarantee.to_string()),
        |_, ps, value| {
            ps.net_guarantee = parse_size(value)?;
            ps.assign(find("net_guarantee").unwrap());
            Ok(())
        }
    ),
    desc!(
        "net_limit",
        Prop::NetLimit,
        PERSIST | DYNAMIC,
        |_, ps| Ok(ps.net_limit.to_string()),
        |_, ps, value| {
            ps.net_limit = parse_size(value)?;
            ps.assign(find("net_limit").unwrap());
            Ok(())
        }
    ),
    desc!(
        "net_priority",
        Prop::NetPriority,
        PERSIST | DYNAMIC,
        |_, ps| Ok(ps.net_priority.to_string()),
        |_, ps, value| {
            let prio: u32 = value
                .parse()
                .map_err(|_| Error::new(ErrorKind::InvalidValue, "priority must be 0..7"))?;
            if prio > 7 {
                return Err(Error::new(ErrorKind::InvalidValue, "priority must be 0..7"));
            }
            ps.net_priority = prio;
            ps.assign(find("net_priority").unwrap());
            Ok(())
        }
    ),
    desc!(
        "respawn",
        Prop::Respawn,
        PERSIST,
        |_, ps| Ok(format_bool(ps.respawn)),
        |_, ps, value| {
            ps.respawn = parse_bool(value)?;
            ps.assign(find("respawn").unwrap());
            Ok(())
        }
    ),
    desc!(
        "max_respawns",
        Prop::MaxRespawns,
        PERSIST,
        |_, ps| Ok(ps.max_respawns.to_string()),
        |_, ps, value| {
            ps.max_respawns = value
                .parse()
                .map_err(|_| Error::new(ErrorKind::InvalidValue, "bad respawn limit"))?;
            ps.assign(find("max_respawns").unwrap());
            Ok(())
        }
    ),
    desc!("respawn_count", Prop::RespawnCount, READ_ONLY | PERSIST, |ct, _| {
        Ok(ct.respawn_count().to_string())
    }),
    desc!(
        "aging_time",
        Prop::AgingTime,
        PERSIST,
        |_, ps| Ok((ps.aging_time_ms / 1000).to_string()),
        |_, ps, value| {
            let secs: u64 = value
                .parse()
                .map_err(|_| Error::new(ErrorKind::InvalidValue, "bad aging time"))?;
            ps.aging_time_ms = secs * 1000;
            ps.assign(find("aging_time").unwrap());
            Ok(())
        }
    ),
    desc!(
        "private",
        Prop::Private,
        PERSIST,
        |_, ps| Ok(ps.private.clone()),
        |_, ps, value| {
            if value.len() > 4096 {
                return Err(Error::new(ErrorKind::InvalidValue, "private value too long"));
            }
            ps.private = value.to_string();
            ps.assign(find("private").unwrap());
            Ok(())
        }
    ),
    desc!(
        "weak",
        Prop::Weak,
        PERSIST,
        |_, ps| Ok(format_bool(ps.weak)),
        |_, ps, value| {
            ps.weak = parse_bool(value)?;
            ps.assign(find("weak").unwrap());
            Ok(())
        }
    ),
    desc!(
        "enable_management",
        Prop::AccessLevel,
        PERSIST,
        |_, ps| Ok(ps.access_level.as_str().to_string()),
        |_, ps, value| {
            ps.access_level = AccessLevel::parse(value)?;
            ps.assign(find("enable_management").unwrap());
            Ok(())
        }
    ),
    desc!(
        "scope",
        Prop::Scope,
        PERSIST,
        |_, ps| Ok(ps.scope.clone()),
        |_, ps, value| {
            if !value.is_empty() && !value.ends_with('/') {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    "scope must end with '/'",
                ));
            }
            ps.scope = value.to_string();
            ps.assign(find("scope").unwrap());
            Ok(())
        }
    ),
    desc!(
        "controllers",
        Prop::Controllers,
        PERSIST | STOPPED_ONLY,
        |_, ps| Ok(crate::cgroup::controllers_to_string(ps.controllers)),
        |_, ps, value| {
            let mask = crate::cgroup::controllers_from_string(value)?;
            if mask & crate::cgroup::CTRL_FREEZER == 0 {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    "freezer controller cannot be disabled",
                ));
            }
            ps.controllers = mask;
            ps.assign(find("controllers").unwrap());
            Ok(())
        }
    ),
    desc!(
        "devices",
        Prop::Devices,
        PERSIST | STOPPED_ONLY,
        |_, ps| Ok(ps.devices.join(";")),
        |_, ps, value| {
            ps.devices = value
                .split(';')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string)
                .collect();
            ps.assign(find("devices").unwrap());
            Ok(())
        }
    ),
    desc!(
        "capabilities",
        Prop::Capabilities,
        PERSIST | STOPPED_ONLY,
        |_, ps| Ok(ps.cap_limit.to_string()),
        |_, ps, value| {
            ps.cap_limit = Capabilities::parse(value)?;
            ps.assign(find("capabilities").unwrap());
            Ok(())
        }
    ),
    desc!(
        "ulimit",
        Prop::Ulimit,
        PERSIST | STOPPED_ONLY,
        |_, ps| {
            Ok(ps
                .ulimit
                .iter()
                .map(|(res, (cur, max))| format!("{}: {} {}", res, cur, max))
                .collect::<Vec<_>>()
                .join("; "))
        },
        |_, ps, value| {
            ps.ulimit = parse_ulimit(value)?;
            ps.assign(find("ulimit").unwrap());
            Ok(())
        }
    ),
    desc!(
        "umask",
        Prop::Umask,
        PERSIST | STOPPED_ONLY,
        |_, ps| Ok(format!("{:#o}", ps.umask)),
        |_, ps, value| {
            ps.umask = u32::from_str_radix(value.trim_start_matches("0o"), 8)
                .map_err(|_| Error::new(ErrorKind::InvalidValue, "bad umask"))?;
            ps.assign(find("umask").unwrap());
            Ok(())
        }
    ),
    // ------------------------------------------------------------------
    // read-only runtime properties
    // ------------------------------------------------------------------
    desc!("state", Prop::State, READ_ONLY, |ct, _| {
        Ok(ct.state().as_str().to_string())
    }),
    desc!("exit_status", Prop::ExitStatus, READ_ONLY, |ct, _| {
        ct.exit_status()
            .map(|status| status.to_string())
            .ok_or_else(|| Error::new(ErrorKind::InvalidState, "container did not exit"))
    }),
    desc!("oom_killed", Prop::OomKilled, READ_ONLY, |ct, _| {
        Ok(format_bool(ct.oom_killed()))
    }),
    desc!("root_pid", Prop::RootPid, READ_ONLY, |ct, _| {
        Ok(ct.task_pid().to_string())
    }),
    desc!("start_time", Prop::StartTime, READ_ONLY, |ct, _| {
        Ok(ct.start_time_ms().to_string())
    }),
    desc!("death_time", Prop::DeathTime, READ_ONLY, |ct, _| {
        Ok(ct.death_time_ms().to_string())
    }),
    desc!("absolute_name", Prop::None, READ_ONLY | HIDDEN, |ct, _| {
        Ok(ct.name.clone())
    }),
    desc!("id", Prop::None, READ_ONLY | HIDDEN, |ct, _| {
        Ok(ct.id.to_string())
    }),
    desc!("level", Prop::None, READ_ONLY | HIDDEN, |ct, _| {
        Ok(ct.level.to_string())
    }),
];

// =============================================================================
// Value helpers
// =============================================================================

pub fn parse_bool(text: &str) -> Result<bool> {
    match text {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(Error::new(
            ErrorKind::InvalidValue,
            format!("expected true or false, got: {}", other),
        )),
    }
}

pub fn format_bool(value: bool) -> String {
    if value { "true" } else { "false" }.to_string()
}

/// Parses a byte count with an optional K/M/G/T suffix. `0` means
/// unlimited for every limit knob.
pub fn parse_size(text: &str) -> Result<u64> {
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::new(ErrorKind::InvalidValue, "empty size"));
    }
    let (digits, mult) = match text.as_bytes()[text.len() - 1].to_ascii_uppercase() {
        b'K' => (&text[..text.len() - 1], 1u64 << 10),
        b'M' => (&text[..text.len() - 1], 1u64 << 20),
        b'G' => (&text[..text.len() - 1], 1u64 << 30),
        b'T' => (&text[..text.len() - 1], 1u64 << 40),
        _ => (text, 1),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| Error::new(ErrorKind::InvalidValue, format!("bad size: {}", text)))?;
    value
        .checked_mul(mult)
        .ok_or_else(|| Error::new(ErrorKind::InvalidValue, format!("size overflow: {}", text)))
}

/// Parses a cpu amount: plain cores (`1.5`), cores with a `c` suffix
/// (`2c`) or percent of one core (`150%`).
pub fn parse_cores(text: &str) -> Result<f64> {
    let text = text.trim();
    let value = if let Some(percent) = text.strip_suffix('%') {
        percent
            .trim()
            .parse::<f64>()
            .map(|p| p / 100.0)
            .map_err(|_| Error::new(ErrorKind::InvalidValue, format!("bad cpu value: {}", text)))?
    } else {
        let digits = text.strip_suffix('c').unwrap_or(text);
        digits
            .trim()
            .parse::<f64>()
            .map_err(|_| Error::new(ErrorKind::InvalidValue, format!("bad cpu value: {}", text)))?
    };
    if !(0.0..=4096.0).contains(&value) {
        return Err(Error::new(
            ErrorKind::InvalidValue,
            format!("cpu value out of range: {}", text),
        ));
    }
    Ok(value)
}

pub fn format_cores(value: f64) -> String {
    format!("{}c", value)
}

fn parse_binds(text: &str) -> Result<Vec<BindMount>> {
    let mut binds = Vec::new();
    for entry in text.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let fields: Vec<&str> = entry.split_whitespace().collect();
        if fields.len() < 2 || fields.len() > 3 {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("bind must be '<source> <target> [ro|rw]': {}", entry),
            ));
        }
        let read_only = match fields.get(2) {
            Some(&"ro") => true,
            Some(&"rw") | None => false,
            Some(other) => {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("bad bind flag: {}", other),
                ))
            }
        };
        let target = HostPath::from(fields[1]);
        if !target.is_absolute() {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                "bind target must be absolute",
            ));
        }
        binds.push(BindMount {
            source: HostPath::from(fields[0]),
            target,
            read_only,
        });
    }
    Ok(binds)
}

fn parse_ulimit(text: &str) -> Result<BTreeMap<String, (u64, u64)>> {
    let mut map = BTreeMap::new();
    for entry in text.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let Some((name, values)) = entry.split_once(':') else {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("ulimit must be '<resource>: <soft> <hard>': {}", entry),
            ));
        };
        let name = name.trim();
        if rlimit_resource(name).is_none() {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("unknown rlimit: {}", name),
            ));
        }
        let parts: Vec<&str> = values.split_whitespace().collect();
        if parts.len() != 2 {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("ulimit needs soft and hard values: {}", entry),
            ));
        }
        let parse = |v: &str| -> Result<u64> {
            if v == "unlimited" {
                Ok(u64::MAX)
            } else {
                v.parse()
                    .map_err(|_| Error::new(ErrorKind::InvalidValue, format!("bad limit: {}", v)))
            }
        };
        map.insert(name.to_string(), (parse(parts[0])?, parse(parts[1])?));
    }
    Ok(map)
}

/// Maps a ulimit resource name to its setrlimit number.
pub fn rlimit_resource(name: &str) -> Option<i32> {
    let res = match name {
        "as" => libc::RLIMIT_AS,
        "core" => libc::RLIMIT_CORE,
        "cpu" => libc::RLIMIT_CPU,
        "data" => libc::RLIMIT_DATA,
        "fsize" => libc::RLIMIT_FSIZE,
        "locks" => libc::RLIMIT_LOCKS,
        "memlock" => libc::RLIMIT_MEMLOCK,
        "msgqueue" => libc::RLIMIT_MSGQUEUE,
        "nice" => libc::RLIMIT_NICE,
        "nofile" => libc::RLIMIT_NOFILE,
        "nproc" => libc::RLIMIT_NPROC,
        "rss" => libc::RLIMIT_RSS,
        "rtprio" => libc::RLIMIT_RTPRIO,
        "sigpending" => libc::RLIMIT_SIGPENDING,
        "stack" => libc::RLIMIT_STACK,
        _ => return None,
    };
    Some(res as i32)
}

/// Online cpu count.
pub fn num_cores() -> u64 {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n <= 0 {
        1
    } else {
        n as u64
    }
}

/// Total host memory in bytes.
pub fn total_memory() -> u64 {
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
    if pages <= 0 || page_size <= 0 {
        u64::MAX
    } else {
        pages as u64 * page_size as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("2M").unwrap(), 2 << 20);
        assert_eq!(parse_size("1G").unwrap(), 1 << 30);
        assert!(parse_size("4x").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn test_parse_cores() {
        assert_eq!(parse_cores("2").unwrap(), 2.0);
        assert_eq!(parse_cores("1.5c").unwrap(), 1.5);
        assert_eq!(parse_cores("50%").unwrap(), 0.5);
        assert!(parse_cores("-1").is_err());
        assert!(parse_cores("lots").is_err());
    }

    #[test]
    fn test_parse_binds() {
        let binds = parse_binds("/src /dst ro; /a /b").unwrap();
        assert_eq!(binds.len(), 2);
        assert!(binds[0].read_only);
        assert!(!binds[1].read_only);
        assert!(parse_binds("/src").is_err());
        assert!(parse_binds("/src relative/dst").is_err());
    }

    #[test]
    fn test_parse_ulimit() {
        let map = parse_ulimit("nofile: 1024 4096; core: 0 unlimited").unwrap();
        assert_eq!(map["nofile"], (1024, 4096));
        assert_eq!(map["core"], (0, u64::MAX));
        assert!(parse_ulimit("bogus: 1 2").is_err());
    }

    #[test]
    fn test_registry_lookup() {
        assert!(find("memory_limit").is_some());
        assert!(find("state").is_some());
        assert!(find("no_such_thing").is_none());
        let state = find("state").unwrap();
        assert!(state.flags & READ_ONLY != 0);
        assert!(state.set.is_none());
    }

    #[test]
    fn test_dirty_bits() {
        let mut ps = PropertySet::default();
        assert!(!ps.is_dirty(Prop::MemLimit));
        ps.mark_set(Prop::MemLimit);
        ps.mark_dirty(Prop::MemLimit);
        assert!(ps.has(Prop::MemLimit));
        assert!(ps.test_clear_dirty(Prop::MemLimit));
        assert!(!ps.test_clear_dirty(Prop::MemLimit));
        assert!(ps.has(Prop::MemLimit));
    }
}
