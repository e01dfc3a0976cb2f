//! User credentials.
//!
//! A [`Cred`] is recorded on every container at create time (the owner)
//! and on every client session (the peer). The launcher applies one
//! inside the child right before exec.

use crate::error::{Error, ErrorKind, Result};
use crate::path::HostPath;
use std::fmt;

/// Upper bound for `/proc/<pid>/status` reads.
const PROC_STATUS_MAX: usize = 64 * 1024;

/// A uid/gid pair plus supplementary groups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cred {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

impl Cred {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            groups: Vec::new(),
        }
    }

    pub fn root() -> Self {
        Self::new(0, 0)
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }

    pub fn is_member_of(&self, gid: u32) -> bool {
        self.gid == gid || self.groups.contains(&gid)
    }

    /// Resolves the owner's user name, falling back to the numeric uid.
    pub fn user_name(&self) -> String {
        user_name(self.uid)
    }

    /// Fills supplementary groups from the user database.
    pub fn load_groups(&mut self, user: &str) -> Result<()> {
        let cuser = std::ffi::CString::new(user)
            .map_err(|_| Error::new(ErrorKind::InvalidValue, "user name with NUL"))?;
        let mut ngroups: libc::c_int = 32;
        let mut groups = vec![0 as libc::gid_t; ngroups as usize];
        let mut ret = unsafe {
            libc::getgrouplist(cuser.as_ptr(), self.gid, groups.as_mut_ptr(), &mut ngroups)
        };
        if ret < 0 {
            groups.resize(ngroups as usize, 0);
            ret = unsafe {
                libc::getgrouplist(cuser.as_ptr(), self.gid, groups.as_mut_ptr(), &mut ngroups)
            };
        }
        if ret < 0 {
            return Err(Error::new(
                ErrorKind::Unknown,
                format!("getgrouplist({})", user),
            ));
        }
        groups.truncate(ngroups as usize);
        self.groups = groups.into_iter().map(|g| g as u32).collect();
        Ok(())
    }

    /// Reads the supplementary groups of a live process.
    pub fn load_groups_of_pid(&mut self, pid: i32) -> Result<()> {
        let status = HostPath::new(format!("/proc/{}/status", pid));
        for line in status.read_lines(PROC_STATUS_MAX)? {
            let Some(rest) = line.strip_prefix("Groups:") else {
                continue;
            };
            self.groups.clear();
            for token in rest.split_whitespace() {
                let gid: u32 = token.parse().map_err(|_| {
                    Error::new(ErrorKind::Unknown, format!("bad group id: {}", token))
                })?;
                self.groups.push(gid);
            }
            break;
        }
        Ok(())
    }

    /// Switches the calling process to these credentials. Launcher-child
    /// side only.
    pub fn apply(&self) -> Result<()> {
        let gids: Vec<libc::gid_t> = self.groups.iter().map(|g| *g as libc::gid_t).collect();
        if unsafe { libc::setgroups(gids.len(), gids.as_ptr()) } != 0 {
            return Err(Error::sys("setgroups()"));
        }
        if unsafe { libc::setresgid(self.gid, self.gid, self.gid) } != 0 {
            return Err(Error::sys(format!("setresgid({})", self.gid)));
        }
        if unsafe { libc::setresuid(self.uid, self.uid, self.uid) } != 0 {
            return Err(Error::sys(format!("setresuid({})", self.uid)));
        }
        Ok(())
    }
}

impl fmt::Display for Cred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", user_name(self.uid), group_name(self.gid))
    }
}

/// Looks up a user name, falling back to the numeric uid.
pub fn user_name(uid: u32) -> String {
    match nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}

/// Looks up a group name, falling back to the numeric gid.
pub fn group_name(gid: u32) -> String {
    match nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid)) {
        Ok(Some(group)) => group.name,
        _ => gid.to_string(),
    }
}

/// Resolves a user name or numeric uid.
pub fn user_id(name: &str) -> Result<u32> {
    if let Ok(uid) = name.parse::<u32>() {
        return Ok(uid);
    }
    match nix::unistd::User::from_name(name) {
        Ok(Some(user)) => Ok(user.uid.as_raw()),
        _ => Err(Error::new(
            ErrorKind::InvalidValue,
            format!("no such user: {}", name),
        )),
    }
}

/// Resolves a group name or numeric gid.
pub fn group_id(name: &str) -> Result<u32> {
    if let Ok(gid) = name.parse::<u32>() {
        return Ok(gid);
    }
    match nix::unistd::Group::from_name(name) {
        Ok(Some(group)) => Ok(group.gid.as_raw()),
        _ => Err(Error::new(
            ErrorKind::InvalidValue,
            format!("no such group: {}", name),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership() {
        let mut cred = Cred::new(1000, 1000);
        cred.groups = vec![4, 27];
        assert!(cred.is_member_of(1000));
        assert!(cred.is_member_of(27));
        assert!(!cred.is_member_of(999));
    }

    #[test]
    fn test_root_detection() {
        assert!(Cred::root().is_root());
        assert!(!Cred::new(1, 0).is_root());
    }

    #[test]
    fn test_numeric_user_lookup() {
        assert_eq!(user_id("12345").unwrap(), 12345);
        assert_eq!(group_id("54321").unwrap(), 54321);
    }
}
