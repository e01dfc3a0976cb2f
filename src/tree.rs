//! The container tree: name map, id pool and the lock protocol.
//!
//! One mutex guards the name map, the id pool and every per-container
//! lock counter; one condvar wakes waiters on any unlock. A container
//! lock counter holds 0 when free, N>0 for N readers, -1 for a writer.
//! Taking any lock also bumps each ancestor's counter by one, so a
//! writer only needs to check that its own counter is zero to know the
//! whole subtree is free.
//!
//! Rules, checked in [`ContainerTree::lock`]:
//! - read: the container itself is not write-held and no ancestor is
//!   write-held;
//! - write: the container is completely free (which implies no
//!   descendant holds anything) and no ancestor is write-held.

use crate::constants::{CONTAINER_NAME_MAX, CONTAINER_PATH_MAX, ROOT_CONTAINER, SELF_CONTAINER};
use crate::constants::{CONTAINER_ID_MAX, DOT_CONTAINER};
use crate::container::Container;
use crate::error::{Error, ErrorKind, Result};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};
use tracing::trace;

// =============================================================================
// Names
// =============================================================================

/// Validates a container path against the name grammar: components of
/// `[A-Za-z0-9._:@-]`, `/`-separated, no empty components, reserved
/// names refused.
pub fn valid_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::new(ErrorKind::InvalidValue, "container path too short"));
    }
    if name.len() > CONTAINER_PATH_MAX {
        return Err(Error::new(ErrorKind::InvalidValue, "container path too long"));
    }
    if name.starts_with('/') {
        if name == ROOT_CONTAINER {
            return Ok(());
        }
        return Err(Error::new(
            ErrorKind::InvalidValue,
            "container path starts with '/'",
        ));
    }

    for component in name.split('/') {
        if component.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                "double or trailing '/' in container path",
            ));
        }
        if component.len() > CONTAINER_NAME_MAX {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("container name too long: '{}'", component),
            ));
        }
        if component == SELF_CONTAINER {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                "container name 'self' is reserved",
            ));
        }
        if component == DOT_CONTAINER {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                "container name '.' is reserved",
            ));
        }
        for ch in component.chars() {
            if !(ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '@' | ':' | '.')) {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("forbidden character '{}' in container name", ch),
                ));
            }
        }
    }
    Ok(())
}

/// The parent path of a container name; `/` for top-level names.
pub fn parent_name(name: &str) -> String {
    match name.rfind('/') {
        Some(sep) => name[..sep].to_string(),
        None => ROOT_CONTAINER.to_string(),
    }
}

// =============================================================================
// Id Pool
// =============================================================================

/// Bitmap allocator for container ids, 1..=max. Ids are handed out
/// monotonically from a moving hint and reused only after release.
#[derive(Debug)]
pub struct IdPool {
    bitmap: Vec<u64>,
    hint: u32,
    max: u32,
}

impl IdPool {
    pub fn new(max: u32) -> Self {
        Self {
            bitmap: vec![0; (max as usize + 64) / 64],
            hint: 1,
            max,
        }
    }

    fn test(&self, id: u32) -> bool {
        self.bitmap[(id / 64) as usize] & (1 << (id % 64)) != 0
    }

    fn mark(&mut self, id: u32) {
        self.bitmap[(id / 64) as usize] |= 1 << (id % 64);
    }

    fn clear(&mut self, id: u32) {
        self.bitmap[(id / 64) as usize] &= !(1 << (id % 64));
    }

    /// Allocates the next free id.
    pub fn get(&mut self) -> Result<u32> {
        for offset in 0..self.max {
            let id = (self.hint + offset - 1) % self.max + 1;
            if !self.test(id) {
                self.mark(id);
                self.hint = id % self.max + 1;
                return Ok(id);
            }
        }
        Err(Error::new(
            ErrorKind::ResourceNotAvailable,
            "out of container ids",
        ))
    }

    /// Claims a specific id, for restore.
    pub fn get_at(&mut self, id: u32) -> Result<()> {
        if id == 0 || id > self.max {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("container id out of range: {}", id),
            ));
        }
        if self.test(id) {
            return Err(Error::new(
                ErrorKind::Busy,
                format!("container id already taken: {}", id),
            ));
        }
        self.mark(id);
        Ok(())
    }

    pub fn put(&mut self, id: u32) -> Result<()> {
        if id == 0 || id > self.max || !self.test(id) {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("releasing unallocated id: {}", id),
            ));
        }
        self.clear(id);
        Ok(())
    }
}

// =============================================================================
// Tree
// =============================================================================

#[derive(Debug)]
struct TreeState {
    map: BTreeMap<String, Arc<Container>>,
    ids: IdPool,
}

/// The shared tree of live containers.
#[derive(Debug)]
pub struct ContainerTree {
    state: Mutex<TreeState>,
    cv: Condvar,
    max_containers: usize,
}

/// Guard for a held container lock; unlocks on drop.
#[derive(Debug)]
pub struct ContainerLock {
    tree: Arc<ContainerTree>,
    ct: Arc<Container>,
    shared: bool,
}

impl ContainerLock {
    pub fn container(&self) -> &Arc<Container> {
        &self.ct
    }
}

impl Drop for ContainerLock {
    fn drop(&mut self) {
        self.tree.unlock(&self.ct, self.shared);
    }
}

impl ContainerTree {
    pub fn new(max_containers: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TreeState {
                map: BTreeMap::new(),
                ids: IdPool::new(CONTAINER_ID_MAX),
            }),
            cv: Condvar::new(),
            max_containers,
        })
    }

    pub fn find(&self, name: &str) -> Result<Arc<Container>> {
        let state = self.state.lock().unwrap();
        state.map.get(name).cloned().ok_or_else(|| {
            Error::new(
                ErrorKind::ContainerDoesNotExist,
                format!("container {} not found", name),
            )
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.lock().unwrap().map.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All containers, parents before children.
    pub fn list(&self) -> Vec<Arc<Container>> {
        let state = self.state.lock().unwrap();
        let mut all: Vec<_> = state.map.values().cloned().collect();
        all.sort_by_key(|ct| ct.level);
        all
    }

    /// Creates and registers a container under the tree mutex. `make`
    /// receives the freshly allocated id and the parent (absent only
    /// for the root) and must return the new container.
    pub fn create_entry<F>(&self, name: &str, explicit_id: Option<u32>, make: F) -> Result<Arc<Container>>
    where
        F: FnOnce(u32, Option<Arc<Container>>) -> Result<Arc<Container>>,
    {
        let mut state = self.state.lock().unwrap();

        if state.map.contains_key(name) {
            return Err(Error::new(
                ErrorKind::ContainerAlreadyExists,
                format!("container {} already exists", name),
            ));
        }
        if state.map.len() >= self.max_containers + 1 {
            return Err(Error::new(
                ErrorKind::ResourceNotAvailable,
                format!("number of containers reached limit: {}", self.max_containers),
            ));
        }

        let parent = if name == ROOT_CONTAINER {
            None
        } else {
            match state.map.get(&parent_name(name)) {
                Some(parent) => Some(parent.clone()),
                None => {
                    return Err(Error::new(
                        ErrorKind::ContainerDoesNotExist,
                        format!("parent container not found for {}", name),
                    ))
                }
            }
        };

        let id = match explicit_id {
            Some(id) => {
                state.ids.get_at(id)?;
                id
            }
            None => state.ids.get()?,
        };

        let ct = match make(id, parent.clone()) {
            Ok(ct) => ct,
            Err(err) => {
                let _ = state.ids.put(id);
                return Err(err);
            }
        };

        state.map.insert(name.to_string(), ct.clone());
        if let Some(parent) = parent {
            parent.children.lock().unwrap().push(ct.clone());
        }
        Ok(ct)
    }

    /// Removes a container from the map and releases its id. The
    /// container must hold no children; the caller already stopped it.
    pub fn remove_entry(&self, ct: &Arc<Container>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.map.remove(&ct.name);
        if let Err(err) = state.ids.put(ct.id) {
            tracing::warn!(id = ct.id, error = %err, "cannot release container id");
        }
        if let Some(parent) = ct.parent() {
            parent
                .children
                .lock()
                .unwrap()
                .retain(|child| !Arc::ptr_eq(child, ct));
        }
        ct.mark_destroyed();
        drop(state);
        // destruction may unblock lock waiters polling for liveness
        self.cv.notify_all();
        Ok(())
    }

    // =========================================================================
    // Lock protocol
    // =========================================================================

    /// Acquires a read (`shared`) or write lock on `ct`, blocking unless
    /// `try_lock` is set. Every ancestor's counter is bumped while the
    /// lock is held, which pins the path to the root.
    pub fn lock(
        self: &Arc<Self>,
        ct: &Arc<Container>,
        shared: bool,
        try_lock: bool,
    ) -> Result<ContainerLock> {
        trace!(name = %ct.name, shared, try_lock, "lock container");
        let mut state = self.state.lock().unwrap();
        loop {
            if ct.is_destroyed() {
                return Err(Error::new(
                    ErrorKind::ContainerDoesNotExist,
                    "container was destroyed",
                ));
            }
            if !Self::busy(ct, shared) {
                break;
            }
            if try_lock {
                return Err(Error::new(
                    ErrorKind::Busy,
                    format!("container is busy: {}", ct.name),
                ));
            }
            state = self.cv.wait(state).unwrap();
        }

        ct.locked
            .store(ct.locked.load(Ordering::Relaxed) + if shared { 1 } else { -1 }, Ordering::Relaxed);
        let mut cursor = ct.parent();
        while let Some(ancestor) = cursor {
            ancestor
                .locked
                .store(ancestor.locked.load(Ordering::Relaxed) + 1, Ordering::Relaxed);
            cursor = ancestor.parent();
        }
        drop(state);

        Ok(ContainerLock {
            tree: self.clone(),
            ct: ct.clone(),
            shared,
        })
    }

    pub fn lock_read(self: &Arc<Self>, ct: &Arc<Container>) -> Result<ContainerLock> {
        self.lock(ct, true, false)
    }

    pub fn lock_write(self: &Arc<Self>, ct: &Arc<Container>) -> Result<ContainerLock> {
        self.lock(ct, false, false)
    }

    pub fn try_lock_read(self: &Arc<Self>, ct: &Arc<Container>) -> Result<ContainerLock> {
        self.lock(ct, true, true)
    }

    pub fn try_lock_write(self: &Arc<Self>, ct: &Arc<Container>) -> Result<ContainerLock> {
        self.lock(ct, false, true)
    }

    /// A lock is refused while the container is write-held, a writer
    /// wants it non-free, or any ancestor is write-held. Counters are
    /// only touched under the tree mutex.
    fn busy(ct: &Arc<Container>, shared: bool) -> bool {
        let locked = ct.locked.load(Ordering::Relaxed);
        if locked != 0 && (locked < 0 || !shared) {
            return true;
        }
        let mut cursor = ct.parent();
        while let Some(ancestor) = cursor {
            if ancestor.locked.load(Ordering::Relaxed) < 0 {
                return true;
            }
            cursor = ancestor.parent();
        }
        false
    }

    fn unlock(&self, ct: &Arc<Container>, shared: bool) {
        trace!(name = %ct.name, shared, "unlock container");
        let state = self.state.lock().unwrap();
        let locked = ct.locked.load(Ordering::Relaxed);
        debug_assert!(if shared { locked > 0 } else { locked == -1 });
        ct.locked
            .store(locked + if shared { -1 } else { 1 }, Ordering::Relaxed);
        let mut cursor = ct.parent();
        while let Some(ancestor) = cursor {
            let held = ancestor.locked.load(Ordering::Relaxed);
            debug_assert!(held > 0);
            ancestor.locked.store(held - 1, Ordering::Relaxed);
            cursor = ancestor.parent();
        }
        drop(state);
        // simple but fair enough: every waiter re-evaluates
        self.cv.notify_all();
    }
}
