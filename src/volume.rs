//! Volume collaborator contract.
//!
//! The engine does not manage storage itself; it asks a
//! [`VolumeBackend`] for a root volume when a container's `root`
//! property points at an image file, and hands the volume back on stop.
//! The bundled [`BindBackend`] covers directory roots; loop-device and
//! overlay backends plug in behind the same trait.

use crate::cred::Cred;
use crate::error::{Error, ErrorKind, Result};
use crate::path::HostPath;
use tracing::info;

/// A materialized volume.
#[derive(Debug, Clone)]
pub struct Volume {
    /// Mount point handed to the container as its root.
    pub path: HostPath,
    /// Backing storage (directory or image file).
    pub storage: HostPath,
    pub read_only: bool,
    pub backend: &'static str,
}

/// Storage backend used for container root volumes.
pub trait VolumeBackend: Send + Sync {
    /// Creates a root volume for `storage` mounted at `target`.
    fn create_root(
        &self,
        target: &HostPath,
        storage: &HostPath,
        read_only: bool,
        owner: &Cred,
    ) -> Result<Volume>;

    /// Unmounts and removes a volume created by this backend.
    fn destroy(&self, volume: &Volume) -> Result<()>;
}

/// Bind-mount backend: the storage directory is the volume.
pub struct BindBackend;

impl VolumeBackend for BindBackend {
    fn create_root(
        &self,
        target: &HostPath,
        storage: &HostPath,
        read_only: bool,
        owner: &Cred,
    ) -> Result<Volume> {
        if !storage.is_directory_follow() {
            return Err(Error::new(
                ErrorKind::NotSupported,
                format!("bind backend needs a directory, got {}", storage),
            ));
        }
        if !target.exists() {
            target.mkdir_all(0o755)?;
            target.chown(owner.uid, owner.gid)?;
        }
        target.bind_all(storage)?;
        if read_only {
            target.remount(
                nix::mount::MsFlags::MS_REMOUNT
                    | nix::mount::MsFlags::MS_BIND
                    | nix::mount::MsFlags::MS_RDONLY,
            )?;
        }
        info!(target = %target, storage = %storage, "root volume bound");
        Ok(Volume {
            path: target.clone(),
            storage: storage.clone(),
            read_only,
            backend: "bind",
        })
    }

    fn destroy(&self, volume: &Volume) -> Result<()> {
        volume.path.umount_all()?;
        if volume.path.exists() {
            volume.path.rmdir()?;
        }
        info!(target = %volume.path, "root volume destroyed");
        Ok(())
    }
}
