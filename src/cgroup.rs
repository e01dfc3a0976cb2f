//! Cgroup v1 interface.
//!
//! One [`Hierarchy`] per mounted controller, discovered from the mount
//! table at startup. A [`Cgroup`] is a hierarchy plus a path below its
//! mount point; all knob access goes through it. The freezer hierarchy
//! doubles as the source of truth for "which container does this pid
//! belong to".

use crate::error::{Error, ErrorKind, Result};
use crate::path::{HostPath, MountInfo};
use std::fmt;
use std::os::fd::{FromRawFd, OwnedFd};
use tracing::{debug, error, warn};

/// Controller bits, used for the per-container `controllers` property.
pub const CTRL_FREEZER: u32 = 1 << 0;
pub const CTRL_MEMORY: u32 = 1 << 1;
pub const CTRL_CPU: u32 = 1 << 2;
pub const CTRL_CPUACCT: u32 = 1 << 3;
pub const CTRL_BLKIO: u32 = 1 << 4;
pub const CTRL_NETCLS: u32 = 1 << 5;
pub const CTRL_DEVICES: u32 = 1 << 6;

pub const CTRL_ALL: u32 =
    CTRL_FREEZER | CTRL_MEMORY | CTRL_CPU | CTRL_CPUACCT | CTRL_BLKIO | CTRL_NETCLS | CTRL_DEVICES;

static CONTROLLER_NAMES: &[(&str, u32)] = &[
    ("freezer", CTRL_FREEZER),
    ("memory", CTRL_MEMORY),
    ("cpu", CTRL_CPU),
    ("cpuacct", CTRL_CPUACCT),
    ("blkio", CTRL_BLKIO),
    ("net_cls", CTRL_NETCLS),
    ("devices", CTRL_DEVICES),
];

/// Formats a controller mask as `freezer;memory;...`.
pub fn controllers_to_string(mask: u32) -> String {
    let mut out = Vec::new();
    for (name, bit) in CONTROLLER_NAMES {
        if mask & bit != 0 {
            out.push(*name);
        }
    }
    out.join(";")
}

/// Parses a `;`-separated controller list.
pub fn controllers_from_string(text: &str) -> Result<u32> {
    let mut mask = 0;
    for token in text.split(';') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let bit = CONTROLLER_NAMES
            .iter()
            .find(|(name, _)| *name == token)
            .map(|(_, bit)| *bit)
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidValue,
                    format!("unknown controller: {}", token),
                )
            })?;
        mask |= bit;
    }
    Ok(mask)
}

/// One mounted cgroup controller hierarchy.
#[derive(Debug, Clone)]
pub struct Hierarchy {
    /// Controller name as it appears in mount options.
    pub kind: &'static str,
    /// Controller bit(s) this hierarchy serves.
    pub controllers: u32,
    /// Mount point.
    pub mount: HostPath,
}

impl Hierarchy {
    /// A cgroup at `name` (absolute inside the hierarchy).
    pub fn cgroup(&self, name: &str) -> Cgroup<'_> {
        Cgroup {
            hierarchy: self,
            name: name.to_string(),
        }
    }

    pub fn root_cgroup(&self) -> Cgroup<'_> {
        self.cgroup("/")
    }

    /// Which cgroup of this hierarchy a pid lives in, from
    /// `/proc/<pid>/cgroup`.
    pub fn task_cgroup(&self, pid: i32) -> Result<Cgroup<'_>> {
        let text = HostPath::new(format!("/proc/{}/cgroup", pid)).read_all(64 * 1024)?;
        for line in text.lines() {
            let mut fields = line.splitn(3, ':');
            let (Some(_), Some(subsys), Some(path)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            if subsys.split(',').any(|name| name == self.kind) {
                return Ok(self.cgroup(path));
            }
        }
        Err(Error::new(
            ErrorKind::Unknown,
            format!("pid {} has no {} cgroup", pid, self.kind),
        ))
    }
}

/// A cgroup directory inside one hierarchy.
#[derive(Clone)]
pub struct Cgroup<'a> {
    pub hierarchy: &'a Hierarchy,
    pub name: String,
}

impl fmt::Display for Cgroup<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hierarchy.kind, self.name)
    }
}

impl PartialEq for Cgroup<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.hierarchy.kind == other.hierarchy.kind && self.name == other.name
    }
}

impl<'a> Cgroup<'a> {
    pub fn path(&self) -> HostPath {
        self.hierarchy.mount.join(self.name.trim_start_matches('/'))
    }

    fn knob_path(&self, knob: &str) -> HostPath {
        self.path().join(knob)
    }

    pub fn exists(&self) -> bool {
        self.path().is_directory_follow()
    }

    pub fn create(&self) -> Result<()> {
        debug!(cgroup = %self, "create cgroup");
        self.path().mkdir_all(0o755)
    }

    /// Removes the cgroup directory, retrying while the kernel still
    /// shows it busy with exiting tasks.
    pub fn remove(&self) -> Result<()> {
        debug!(cgroup = %self, "remove cgroup");
        let path = self.path();
        if !path.exists() {
            return Ok(());
        }
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            match path.rmdir() {
                Ok(()) => return Ok(()),
                Err(err) if err.errno() == libc::EBUSY && std::time::Instant::now() < deadline => {
                    std::thread::sleep(std::time::Duration::from_millis(20));
                }
                Err(err) => {
                    error!(cgroup = %self, error = %err, "cannot remove cgroup");
                    return Err(err);
                }
            }
        }
    }

    pub fn has_knob(&self, knob: &str) -> bool {
        self.knob_path(knob).exists()
    }

    pub fn get(&self, knob: &str) -> Result<String> {
        let text = self.knob_path(knob).read_all(1024 * 1024)?;
        Ok(text.trim_end_matches('\n').to_string())
    }

    pub fn set(&self, knob: &str, value: &str) -> Result<()> {
        self.knob_path(knob)
            .write_all(value)
            .map_err(|e| e.context(format!("{} {}", self, knob)))
    }

    pub fn get_u64(&self, knob: &str) -> Result<u64> {
        let text = self.get(knob)?;
        text.trim().parse().map_err(|_| {
            Error::new(
                ErrorKind::Unknown,
                format!("{} {}: not a number: {}", self, knob, text),
            )
        })
    }

    pub fn set_u64(&self, knob: &str, value: u64) -> Result<()> {
        self.set(knob, &value.to_string())
    }

    pub fn set_bool(&self, knob: &str, value: bool) -> Result<()> {
        self.set(knob, if value { "1" } else { "0" })
    }

    pub fn get_bool(&self, knob: &str) -> Result<bool> {
        Ok(self.get_u64(knob)? != 0)
    }

    /// Moves a process (all its threads) into this cgroup.
    pub fn attach(&self, pid: i32) -> Result<()> {
        self.set("cgroup.procs", &pid.to_string())
            .map_err(|e| e.context(format!("attach {}", pid)))
    }

    /// Process ids in this cgroup.
    pub fn get_pids(&self) -> Result<Vec<i32>> {
        self.read_pid_list("cgroup.procs")
    }

    /// Thread ids in this cgroup.
    pub fn get_tasks(&self) -> Result<Vec<i32>> {
        self.read_pid_list("tasks")
    }

    fn read_pid_list(&self, knob: &str) -> Result<Vec<i32>> {
        let text = self.knob_path(knob).read_all(16 * 1024 * 1024)?;
        let mut pids = Vec::new();
        for line in text.lines() {
            if let Ok(pid) = line.trim().parse() {
                pids.push(pid);
            }
        }
        Ok(pids)
    }

    pub fn is_empty(&self) -> bool {
        self.get_pids().map(|p| p.is_empty()).unwrap_or(true)
    }

    /// Sends `sig` to every process in the cgroup. New processes may
    /// appear while this runs; callers loop until the cgroup is empty.
    pub fn kill_all(&self, sig: i32) -> Result<()> {
        let pids = self.get_pids()?;
        debug!(cgroup = %self, sig, count = pids.len(), "kill all");
        for pid in pids {
            if unsafe { libc::kill(pid, sig) } != 0 {
                let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                if errno != libc::ESRCH {
                    warn!(pid, sig, errno, "kill failed");
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Freezer
// =============================================================================

const FREEZER_STATE: &str = "freezer.state";

/// Freezer operations; only valid on the freezer hierarchy.
pub trait FreezerExt {
    fn freeze(&self, wait: bool) -> Result<()>;
    fn thaw(&self, wait: bool) -> Result<()>;
    fn is_frozen(&self) -> bool;
    fn is_self_freezing(&self) -> bool;
    fn is_parent_freezing(&self) -> bool;
}

impl FreezerExt for Cgroup<'_> {
    fn freeze(&self, wait: bool) -> Result<()> {
        self.set(FREEZER_STATE, "FROZEN")?;
        if wait {
            wait_freezer(self, "FROZEN")?;
        }
        Ok(())
    }

    fn thaw(&self, wait: bool) -> Result<()> {
        if self.is_parent_freezing() {
            return Err(Error::new(ErrorKind::Busy, "parent cgroup is frozen"));
        }
        self.set(FREEZER_STATE, "THAWED")?;
        if wait {
            wait_freezer(self, "THAWED")?;
        }
        Ok(())
    }

    fn is_frozen(&self) -> bool {
        self.get(FREEZER_STATE)
            .map(|state| state.trim() != "THAWED")
            .unwrap_or(false)
    }

    fn is_self_freezing(&self) -> bool {
        self.get_bool("freezer.self_freezing").unwrap_or(false)
    }

    fn is_parent_freezing(&self) -> bool {
        self.get_bool("freezer.parent_freezing").unwrap_or(false)
    }
}

fn wait_freezer(cg: &Cgroup<'_>, want: &str) -> Result<()> {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        if cg.get(FREEZER_STATE)?.trim() == want {
            return Ok(());
        }
        if std::time::Instant::now() >= deadline {
            warn!(cgroup = %cg, want, "freezer state change timed out");
            return Ok(());
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
}

// =============================================================================
// Memory
// =============================================================================

/// Memory-controller knobs; only valid on the memory hierarchy. Knobs
/// not provided by the running kernel report `NotSupported`.
pub trait MemoryExt {
    fn set_limit(&self, limit: u64) -> Result<()>;
    fn get_soft_limit(&self) -> Result<u64>;
    fn set_soft_limit(&self, limit: u64) -> Result<()>;
    fn set_guarantee(&self, bytes: u64) -> Result<()>;
    fn set_anon_limit(&self, limit: u64) -> Result<()>;
    fn set_dirty_limit(&self, limit: u64) -> Result<()>;
    fn set_io_limit(&self, bytes_per_sec: u64) -> Result<()>;
    fn set_iops_limit(&self, ops_per_sec: u64) -> Result<()>;
    fn set_recharge_on_pgfault(&self, on: bool) -> Result<()>;
    fn set_use_hierarchy(&self, on: bool) -> Result<()>;
    fn get_fail_cnt(&self) -> Result<u64>;
    fn setup_oom_event(&self) -> Result<OwnedFd>;
}

const UNLIMITED: &str = "-1";

fn set_or_unsupported(cg: &Cgroup<'_>, knob: &str, value: String) -> Result<()> {
    if !cg.has_knob(knob) {
        return Err(Error::new(
            ErrorKind::NotSupported,
            format!("kernel has no {}", knob),
        ));
    }
    cg.set(knob, &value)
}

impl MemoryExt for Cgroup<'_> {
    fn set_limit(&self, limit: u64) -> Result<()> {
        let value = if limit == 0 {
            UNLIMITED.to_string()
        } else {
            limit.to_string()
        };
        self.set("memory.limit_in_bytes", &value).map_err(|err| {
            if err.errno() == libc::EBUSY {
                Error::new(
                    ErrorKind::InvalidValue,
                    format!("memory limit {} is below current usage", limit),
                )
            } else {
                err
            }
        })
    }

    fn get_soft_limit(&self) -> Result<u64> {
        self.get_u64("memory.soft_limit_in_bytes")
    }

    fn set_soft_limit(&self, limit: u64) -> Result<()> {
        self.set_u64("memory.soft_limit_in_bytes", limit)
    }

    fn set_guarantee(&self, bytes: u64) -> Result<()> {
        set_or_unsupported(self, "memory.low_limit_in_bytes", bytes.to_string())
    }

    fn set_anon_limit(&self, limit: u64) -> Result<()> {
        let value = if limit == 0 {
            UNLIMITED.to_string()
        } else {
            limit.to_string()
        };
        set_or_unsupported(self, "memory.anon.limit", value)
    }

    fn set_dirty_limit(&self, limit: u64) -> Result<()> {
        set_or_unsupported(self, "memory.dirty_limit_in_bytes", limit.to_string())
    }

    fn set_io_limit(&self, bytes_per_sec: u64) -> Result<()> {
        set_or_unsupported(self, "memory.fs_bps_limit", bytes_per_sec.to_string())
    }

    fn set_iops_limit(&self, ops_per_sec: u64) -> Result<()> {
        set_or_unsupported(self, "memory.fs_iops_limit", ops_per_sec.to_string())
    }

    fn set_recharge_on_pgfault(&self, on: bool) -> Result<()> {
        set_or_unsupported(
            self,
            "memory.recharge_on_pgfault",
            if on { "1" } else { "0" }.to_string(),
        )
    }

    fn set_use_hierarchy(&self, on: bool) -> Result<()> {
        self.set_bool("memory.use_hierarchy", on)
    }

    fn get_fail_cnt(&self) -> Result<u64> {
        self.get_u64("memory.failcnt")
    }

    /// Registers an eventfd that becomes readable when this cgroup hits
    /// its memory limit and the OOM killer fires.
    fn setup_oom_event(&self) -> Result<OwnedFd> {
        let raw = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if raw < 0 {
            return Err(Error::sys("eventfd()"));
        }
        let event_fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let control = std::fs::File::open(self.knob_path("memory.oom_control").as_path())
            .map_err(|e| Error::from(e).context(format!("{} memory.oom_control", self)))?;
        let line = format!(
            "{} {}",
            std::os::fd::AsRawFd::as_raw_fd(&event_fd),
            std::os::fd::AsRawFd::as_raw_fd(&control)
        );
        self.set("cgroup.event_control", &line)?;
        Ok(event_fd)
    }
}

// =============================================================================
// Cpu / Blkio / Netcls
// =============================================================================

/// Cpu-controller policy application; only valid on the cpu hierarchy.
pub trait CpuExt {
    fn set_cpu_policy(&self, policy: &str, guarantee: f64, limit: f64) -> Result<()>;
}

impl CpuExt for Cgroup<'_> {
    fn set_cpu_policy(&self, policy: &str, guarantee: f64, limit: f64) -> Result<()> {
        let shares = match policy {
            "rt" => 262144,
            "normal" | "batch" => ((guarantee * 1024.0) as u64).max(2),
            "idle" => 2,
            other => {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("unknown cpu policy: {}", other),
                ))
            }
        };
        self.set_u64("cpu.shares", shares)?;

        if self.has_knob("cpu.cfs_quota_us") {
            let period = 100_000u64;
            let quota = if limit <= 0.0 {
                -1i64
            } else {
                ((limit * period as f64) as i64).max(1000)
            };
            self.set_u64("cpu.cfs_period_us", period)?;
            self.set("cpu.cfs_quota_us", &quota.to_string())?;
        }
        Ok(())
    }
}

/// Blkio weight application; only valid on the blkio hierarchy.
pub trait BlkioExt {
    fn set_io_policy(&self, policy: &str) -> Result<()>;
}

impl BlkioExt for Cgroup<'_> {
    fn set_io_policy(&self, policy: &str) -> Result<()> {
        let weight = match policy {
            "normal" => 500,
            "batch" => 10,
            other => {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("unknown io policy: {}", other),
                ))
            }
        };
        if !self.has_knob("blkio.weight") {
            // CFQ not in use; policy is advisory then
            return Ok(());
        }
        self.set_u64("blkio.weight", weight)
    }
}

// =============================================================================
// Devices
// =============================================================================

/// Device access rules; only valid on the devices hierarchy.
pub trait DevicesExt {
    fn apply_default_access(&self) -> Result<()>;
    fn allow_device(&self, rule: &str) -> Result<()>;
}

static DEFAULT_DEVICE_RULES: &[&str] = &[
    "c 1:3 rwm",  // /dev/null
    "c 1:5 rwm",  // /dev/zero
    "c 1:7 rwm",  // /dev/full
    "c 1:8 rwm",  // /dev/random
    "c 1:9 rwm",  // /dev/urandom
    "c 5:0 rwm",  // /dev/tty
    "c 5:2 rwm",  // /dev/ptmx
    "c 136:* rw", // /dev/pts/*
];

impl DevicesExt for Cgroup<'_> {
    fn apply_default_access(&self) -> Result<()> {
        self.set("devices.deny", "a")?;
        for rule in DEFAULT_DEVICE_RULES {
            self.set("devices.allow", rule)?;
        }
        Ok(())
    }

    fn allow_device(&self, rule: &str) -> Result<()> {
        self.set("devices.allow", rule)
    }
}

// =============================================================================
// Driver
// =============================================================================

/// The set of hierarchies found on this host.
#[derive(Debug)]
pub struct CgroupDriver {
    hierarchies: Vec<Hierarchy>,
}

impl CgroupDriver {
    /// Scans the mount table for v1 controller hierarchies. The freezer
    /// is mandatory; anything else missing just narrows what containers
    /// can enable.
    pub fn detect() -> Result<Self> {
        let mut hierarchies = Vec::new();
        let mounts = MountInfo::list_all()?;
        for (name, bit) in CONTROLLER_NAMES {
            let Some(info) = mounts
                .iter()
                .find(|m| m.fstype == "cgroup" && m.has_option(name))
            else {
                warn!(controller = name, "controller not mounted");
                continue;
            };
            let mut controllers = *bit;
            // cpu and cpuacct commonly share one mount
            if info.has_option("cpu") && info.has_option("cpuacct") {
                controllers = CTRL_CPU | CTRL_CPUACCT;
            }
            if hierarchies
                .iter()
                .any(|h: &Hierarchy| h.mount == info.target)
            {
                continue;
            }
            hierarchies.push(Hierarchy {
                kind: name,
                controllers,
                mount: info.target.clone(),
            });
        }

        if !hierarchies.iter().any(|h| h.controllers & CTRL_FREEZER != 0) {
            return Err(Error::new(
                ErrorKind::NotSupported,
                "freezer cgroup hierarchy is not mounted",
            ));
        }
        Ok(Self { hierarchies })
    }

    /// Builds a driver from explicit hierarchies. Test hook.
    pub fn with_hierarchies(hierarchies: Vec<Hierarchy>) -> Self {
        Self { hierarchies }
    }

    pub fn hierarchies(&self) -> &[Hierarchy] {
        &self.hierarchies
    }

    pub fn get(&self, controller: u32) -> Option<&Hierarchy> {
        self.hierarchies
            .iter()
            .find(|h| h.controllers & controller != 0)
    }

    /// The freezer hierarchy; guaranteed present after `detect`.
    pub fn freezer(&self) -> &Hierarchy {
        self.get(CTRL_FREEZER).expect("freezer checked at detect")
    }

    /// Controllers actually available on this host.
    pub fn available(&self) -> u32 {
        self.hierarchies.iter().fold(0, |acc, h| acc | h.controllers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controllers_string_roundtrip() {
        let mask = CTRL_FREEZER | CTRL_MEMORY | CTRL_NETCLS;
        let text = controllers_to_string(mask);
        assert_eq!(controllers_from_string(&text).unwrap(), mask);
    }

    #[test]
    fn test_controllers_rejects_unknown() {
        assert!(controllers_from_string("freezer;bogus").is_err());
    }

    #[test]
    fn test_cgroup_path_join() {
        let hy = Hierarchy {
            kind: "freezer",
            controllers: CTRL_FREEZER,
            mount: HostPath::from("/sys/fs/cgroup/freezer"),
        };
        let cg = hy.cgroup("/paddock/a/b");
        assert_eq!(cg.path().as_str(), "/sys/fs/cgroup/freezer/paddock/a/b");
        assert_eq!(hy.root_cgroup().path().as_str(), "/sys/fs/cgroup/freezer");
    }

    #[test]
    fn test_driver_lookup() {
        let driver = CgroupDriver::with_hierarchies(vec![
            Hierarchy {
                kind: "freezer",
                controllers: CTRL_FREEZER,
                mount: HostPath::from("/sys/fs/cgroup/freezer"),
            },
            Hierarchy {
                kind: "cpu",
                controllers: CTRL_CPU | CTRL_CPUACCT,
                mount: HostPath::from("/sys/fs/cgroup/cpu,cpuacct"),
            },
        ]);
        assert!(driver.get(CTRL_CPUACCT).is_some());
        assert!(driver.get(CTRL_MEMORY).is_none());
        assert_eq!(driver.available(), CTRL_FREEZER | CTRL_CPU | CTRL_CPUACCT);
    }
}
