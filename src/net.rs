//! Network collaborator contract.
//!
//! Traffic shaping lives outside the engine. The engine computes a
//! class handle per container (major 1, minor = container id) and asks
//! the [`NetworkProvider`] to create or destroy classes when the
//! net-prio/limit/guarantee property group changes. The default
//! provider only records what it was asked to do.

use crate::error::Result;
use std::sync::Mutex;
use tracing::debug;

/// Packs a `major:minor` tc handle.
pub fn tc_handle(major: u16, minor: u16) -> u32 {
    ((major as u32) << 16) | minor as u32
}

/// Traffic-class programming interface.
pub trait NetworkProvider: Send + Sync {
    /// Creates or updates a class under `parent`. Leaf classes carry
    /// the actual rate limits; inner classes only aggregate.
    fn create_class(
        &self,
        handle: u32,
        parent: u32,
        leaf: bool,
        prio: u32,
        rate: u64,
        ceil: u64,
    ) -> Result<()>;

    /// Removes a class and its children.
    fn destroy_class(&self, handle: u32) -> Result<()>;
}

/// Provider that accepts everything and programs nothing; used when no
/// traffic shaping is configured and by tests.
#[derive(Default)]
pub struct NullNetwork {
    classes: Mutex<Vec<u32>>,
}

impl NullNetwork {
    pub fn class_count(&self) -> usize {
        self.classes.lock().unwrap().len()
    }
}

impl NetworkProvider for NullNetwork {
    fn create_class(
        &self,
        handle: u32,
        parent: u32,
        leaf: bool,
        prio: u32,
        rate: u64,
        ceil: u64,
    ) -> Result<()> {
        debug!(handle, parent, leaf, prio, rate, ceil, "create traffic class");
        let mut classes = self.classes.lock().unwrap();
        if !classes.contains(&handle) {
            classes.push(handle);
        }
        Ok(())
    }

    fn destroy_class(&self, handle: u32) -> Result<()> {
        debug!(handle, "destroy traffic class");
        self.classes.lock().unwrap().retain(|h| *h != handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tc_handle_packing() {
        assert_eq!(tc_handle(1, 0), 0x1_0000);
        assert_eq!(tc_handle(1, 42), 0x1_002a);
    }

    #[test]
    fn test_null_network_tracks_classes() {
        let net = NullNetwork::default();
        net.create_class(tc_handle(1, 5), tc_handle(1, 1), true, 3, 0, 0)
            .unwrap();
        net.create_class(tc_handle(1, 5), tc_handle(1, 1), true, 3, 0, 0)
            .unwrap();
        assert_eq!(net.class_count(), 1);
        net.destroy_class(tc_handle(1, 5)).unwrap();
        assert_eq!(net.class_count(), 0);
    }
}
