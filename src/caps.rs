//! Linux capability sets.
//!
//! A [`Capabilities`] value is a permitted-bit mask. The engine keeps
//! three per container: the ambient set raised for the workload, the
//! allowed set it may grow into, and the hard limit inherited down the
//! tree (`ambient ⊆ allowed ⊆ limit`). Application order inside the
//! launcher child: bounding-set limit first, ambient raise after
//! credentials switch, effective set last for non-root owners.

use crate::error::{Error, ErrorKind, Result};
use std::fmt;

const CAP_LAST: u32 = 40; // CAP_CHECKPOINT_RESTORE

static CAP_NAMES: &[(&str, u32)] = &[
    ("CHOWN", 0),
    ("DAC_OVERRIDE", 1),
    ("DAC_READ_SEARCH", 2),
    ("FOWNER", 3),
    ("FSETID", 4),
    ("KILL", 5),
    ("SETGID", 6),
    ("SETUID", 7),
    ("SETPCAP", 8),
    ("LINUX_IMMUTABLE", 9),
    ("NET_BIND_SERVICE", 10),
    ("NET_BROADCAST", 11),
    ("NET_ADMIN", 12),
    ("NET_RAW", 13),
    ("IPC_LOCK", 14),
    ("IPC_OWNER", 15),
    ("SYS_MODULE", 16),
    ("SYS_RAWIO", 17),
    ("SYS_CHROOT", 18),
    ("SYS_PTRACE", 19),
    ("SYS_PACCT", 20),
    ("SYS_ADMIN", 21),
    ("SYS_BOOT", 22),
    ("SYS_NICE", 23),
    ("SYS_RESOURCE", 24),
    ("SYS_TIME", 25),
    ("SYS_TTY_CONFIG", 26),
    ("MKNOD", 27),
    ("LEASE", 28),
    ("AUDIT_WRITE", 29),
    ("AUDIT_CONTROL", 30),
    ("SETFCAP", 31),
    ("MAC_OVERRIDE", 32),
    ("MAC_ADMIN", 33),
    ("SYSLOG", 34),
    ("WAKE_ALARM", 35),
    ("BLOCK_SUSPEND", 36),
    ("AUDIT_READ", 37),
    ("PERFMON", 38),
    ("BPF", 39),
    ("CHECKPOINT_RESTORE", 40),
];

const fn bit(cap: u32) -> u64 {
    1u64 << cap
}

/// A set of capabilities as a permitted mask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub permitted: u64,
}

/// Everything the running kernel can grant.
pub const ALL_CAPABILITIES: Capabilities = Capabilities {
    permitted: (bit(CAP_LAST) - 1) | bit(CAP_LAST),
};

/// No capabilities at all.
pub const NO_CAPABILITIES: Capabilities = Capabilities { permitted: 0 };

/// Default set for ordinary application workloads.
pub const APP_MODE_CAPABILITIES: Capabilities = Capabilities {
    permitted: bit(0) /* CHOWN */
        | bit(1) /* DAC_OVERRIDE */
        | bit(3) /* FOWNER */
        | bit(4) /* FSETID */
        | bit(5) /* KILL */
        | bit(6) /* SETGID */
        | bit(7) /* SETUID */
        | bit(10) /* NET_BIND_SERVICE */
        | bit(13) /* NET_RAW */
        | bit(14) /* IPC_LOCK */
        | bit(27) /* MKNOD */
        | bit(29), /* AUDIT_WRITE */
};

/// Default set for os-mode (init-style) workloads.
pub const OS_MODE_CAPABILITIES: Capabilities = Capabilities {
    permitted: APP_MODE_CAPABILITIES.permitted
        | bit(8) /* SETPCAP */
        | bit(18) /* SYS_CHROOT */
        | bit(19) /* SYS_PTRACE */
        | bit(22) /* SYS_BOOT */
        | bit(23) /* SYS_NICE */
        | bit(24) /* SYS_RESOURCE */
        | bit(31), /* SETFCAP */
};

/// Upper limit for suid-capable workloads of non-root owners.
pub const SUID_CAPABILITIES: Capabilities = Capabilities {
    permitted: OS_MODE_CAPABILITIES.permitted | bit(12) /* NET_ADMIN */ | bit(21), /* SYS_ADMIN */
};

/// Ambient capabilities that allow escaping a shared pid namespace.
pub const PID_NS_CAPABILITIES: Capabilities = Capabilities {
    permitted: bit(5) /* KILL */ | bit(19), /* SYS_PTRACE */
};

/// Ambient capabilities that allow reconfiguring a shared net namespace.
pub const NET_NS_CAPABILITIES: Capabilities = Capabilities {
    permitted: bit(12) /* NET_ADMIN */ | bit(13) /* NET_RAW */ | bit(10), /* NET_BIND_SERVICE */
};

/// Ambient capabilities that can defeat memory accounting.
pub const MEM_CG_CAPABILITIES: Capabilities = Capabilities {
    permitted: bit(14) /* IPC_LOCK */ | bit(24), /* SYS_RESOURCE */
};

/// What the in-container supervisor keeps for itself.
pub const SUPERVISOR_CAPABILITIES: Capabilities = Capabilities {
    permitted: bit(5) /* KILL */ | bit(8), /* SETPCAP */
};

impl Capabilities {
    pub fn is_empty(&self) -> bool {
        self.permitted == 0
    }

    pub fn contains(&self, other: Capabilities) -> bool {
        self.permitted & other.permitted == other.permitted
    }

    pub fn intersects(&self, other: Capabilities) -> bool {
        self.permitted & other.permitted != 0
    }

    /// Parses a `;`-separated capability list, e.g. `NET_ADMIN;SYS_NICE`.
    pub fn parse(text: &str) -> Result<Self> {
        let mut permitted = 0u64;
        for token in text.split(';') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let name = token.strip_prefix("CAP_").unwrap_or(token);
            let cap = CAP_NAMES
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, c)| *c)
                .ok_or_else(|| {
                    Error::new(
                        ErrorKind::InvalidValue,
                        format!("unknown capability: {}", token),
                    )
                })?;
            permitted |= bit(cap);
        }
        Ok(Self { permitted })
    }

    /// Drops every bounding-set capability outside this set. The caller
    /// is expected to still hold `CAP_SETPCAP`.
    pub fn apply_limit(&self) -> Result<()> {
        for cap in 0..=CAP_LAST {
            if self.permitted & bit(cap) != 0 {
                continue;
            }
            let ret =
                unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap as libc::c_ulong, 0, 0, 0) };
            if ret != 0 {
                let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                // The kernel may know fewer capabilities than we do.
                if errno == libc::EINVAL && cap > 32 {
                    continue;
                }
                return Err(Error::with_errno(
                    ErrorKind::Unknown,
                    errno,
                    format!("prctl(PR_CAPBSET_DROP, {})", cap),
                ));
            }
        }
        Ok(())
    }

    /// Raises exactly this set in the ambient set, clearing the rest.
    pub fn apply_ambient(&self) -> Result<()> {
        let ret = unsafe {
            libc::prctl(
                libc::PR_CAP_AMBIENT,
                libc::PR_CAP_AMBIENT_CLEAR_ALL as libc::c_ulong,
                0,
                0,
                0,
            )
        };
        if ret != 0 {
            return Err(Error::sys("prctl(PR_CAP_AMBIENT_CLEAR_ALL)"));
        }
        for cap in 0..=CAP_LAST {
            if self.permitted & bit(cap) == 0 {
                continue;
            }
            let ret = unsafe {
                libc::prctl(
                    libc::PR_CAP_AMBIENT,
                    libc::PR_CAP_AMBIENT_RAISE as libc::c_ulong,
                    cap as libc::c_ulong,
                    0,
                    0,
                )
            };
            if ret != 0 {
                return Err(Error::sys(format!("prctl(PR_CAP_AMBIENT_RAISE, {})", cap)));
            }
        }
        Ok(())
    }

    /// Installs this set as permitted/effective/inheritable via capset.
    /// Used for non-root owners whose exec would otherwise clear the
    /// effective set.
    pub fn apply_effective(&self) -> Result<()> {
        #[repr(C)]
        struct CapHeader {
            version: u32,
            pid: i32,
        }
        #[repr(C)]
        struct CapData {
            effective: u32,
            permitted: u32,
            inheritable: u32,
        }

        const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

        let header = CapHeader {
            version: LINUX_CAPABILITY_VERSION_3,
            pid: 0,
        };
        let low = (self.permitted & 0xffff_ffff) as u32;
        let high = (self.permitted >> 32) as u32;
        let data = [
            CapData {
                effective: low,
                permitted: low,
                inheritable: low,
            },
            CapData {
                effective: high,
                permitted: high,
                inheritable: high,
            },
        ];
        let ret = unsafe { libc::syscall(libc::SYS_capset, &header, data.as_ptr()) };
        if ret != 0 {
            return Err(Error::sys("capset()"));
        }
        Ok(())
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, cap) in CAP_NAMES {
            if self.permitted & bit(*cap) != 0 {
                if !first {
                    write!(f, ";")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_format_roundtrip() {
        let caps = Capabilities::parse("NET_ADMIN;SYS_NICE;CHOWN").unwrap();
        assert!(caps.contains(Capabilities::parse("NET_ADMIN").unwrap()));
        let text = caps.to_string();
        let back = Capabilities::parse(&text).unwrap();
        assert_eq!(caps, back);
    }

    #[test]
    fn test_parse_accepts_cap_prefix_and_case() {
        let a = Capabilities::parse("CAP_SYS_ADMIN").unwrap();
        let b = Capabilities::parse("sys_admin").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert!(Capabilities::parse("FLY").is_err());
    }

    #[test]
    fn test_set_ordering() {
        assert!(OS_MODE_CAPABILITIES.contains(APP_MODE_CAPABILITIES));
        assert!(SUID_CAPABILITIES.contains(OS_MODE_CAPABILITIES));
        assert!(ALL_CAPABILITIES.contains(SUID_CAPABILITIES));
    }

    #[test]
    fn test_empty_parse() {
        assert!(Capabilities::parse("").unwrap().is_empty());
    }
}
