//! Mount registry: every node with a remote attached, plus the reference
//! that keeps it alive while mounted.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use riofs_proto::{Channel, VfsError, VfsResult};
use tracing::{debug, warn};

use crate::handoff::unmount_handshake;
use crate::node::NodeRef;

/// Registry of mounted-on nodes.
///
/// Installing a remote takes an extra node reference so a mount point cannot
/// be released while mounted; uninstalling drops it. The channel itself is
/// owned by the node ([`crate::node::Node::attach_remote`]); the registry
/// tracks identity only.
#[derive(Debug, Default)]
pub struct MountRegistry {
    entries: Mutex<Vec<NodeRef>>,
}

impl MountRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn entries_lock(&self) -> MutexGuard<'_, Vec<NodeRef>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach `channel` to `node` and record the mount.
    ///
    /// Fails `AlreadyBound` when the node already has a remote; the existing
    /// mount is left untouched.
    pub fn install(&self, node: &NodeRef, channel: Channel) -> VfsResult<()> {
        // attach_remote is the single point deciding AlreadyBound, so the
        // double check (walker saw a remote, then install re-checks) stays
        // race-free without holding the registry lock across it.
        node.attach_remote(channel)?;
        self.entries_lock().push(Arc::clone(node));
        debug!(node = ?**node, "remote installed");
        Ok(())
    }

    /// Detach `node`'s remote and drop the registry's reference.
    ///
    /// Returns the detached channel; the caller owns its teardown. Fails
    /// `NotFound` when the node is not mounted, with no reference change.
    pub fn uninstall(&self, node: &NodeRef) -> VfsResult<Channel> {
        let entry = {
            let mut entries = self.entries_lock();
            let pos = entries
                .iter()
                .position(|e| Arc::ptr_eq(e, node))
                .ok_or(VfsError::NotFound)?;
            entries.remove(pos)
        };
        debug!(node = ?*entry, "remote uninstalled");
        entry.detach_remote()
    }

    /// Detach every mount, running the unmount handshake for each with the
    /// given per-entry timeout. Handshake failures are logged and do not
    /// stop the sweep; the registry always ends empty.
    pub async fn uninstall_all(&self, timeout: Option<Duration>) {
        loop {
            let Some(entry) = self.entries_lock().pop() else {
                return;
            };
            match entry.detach_remote() {
                Ok(channel) => {
                    if let Err(err) = unmount_handshake(channel, timeout).await {
                        warn!(%err, "unmount handshake failed");
                    }
                }
                Err(_) => warn!("registry entry had no remote attached"),
            }
        }
    }

    /// Number of live mounts.
    pub fn len(&self) -> usize {
        self.entries_lock().len()
    }

    /// Whether no mounts exist.
    pub fn is_empty(&self) -> bool {
        self.entries_lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memfs;

    #[tokio::test]
    async fn install_holds_a_reference() {
        let registry = MountRegistry::new();
        let node = memfs::root();
        let before = Arc::strong_count(&node);
        let (local, _peer) = Channel::pair();
        registry.install(&node, local).unwrap();
        assert_eq!(Arc::strong_count(&node), before + 1);
        assert!(node.is_remote());

        let channel = registry.uninstall(&node).unwrap();
        drop(channel);
        assert_eq!(Arc::strong_count(&node), before);
        assert!(!node.is_remote());
    }

    #[tokio::test]
    async fn second_install_fails_already_bound() {
        let registry = MountRegistry::new();
        let node = memfs::root();
        let (c1, _p1) = Channel::pair();
        let (c2, _p2) = Channel::pair();
        registry.install(&node, c1).unwrap();
        assert_eq!(registry.install(&node, c2), Err(VfsError::AlreadyBound));
        // One entry, original channel untouched.
        assert_eq!(registry.len(), 1);
        assert!(node.is_remote());
    }

    #[tokio::test]
    async fn uninstall_is_not_idempotent_but_safe() {
        let registry = MountRegistry::new();
        let node = memfs::root();
        let (local, _peer) = Channel::pair();
        registry.install(&node, local).unwrap();
        registry.uninstall(&node).unwrap();

        let count = Arc::strong_count(&node);
        assert_eq!(registry.uninstall(&node), Err(VfsError::NotFound));
        assert_eq!(Arc::strong_count(&node), count);
    }

    #[tokio::test]
    async fn uninstall_all_sweeps_every_entry() {
        let registry = MountRegistry::new();
        let mut nodes = Vec::new();
        for _ in 0..3 {
            let node = memfs::root();
            let (local, peer) = Channel::pair();
            // Far ends dropped: each handshake send fails, which counts as
            // success.
            drop(peer);
            registry.install(&node, local).unwrap();
            nodes.push(node);
        }
        registry.uninstall_all(Some(Duration::ZERO)).await;
        assert!(registry.is_empty());
        for node in &nodes {
            assert!(!node.is_remote());
            assert_eq!(Arc::strong_count(node), 1);
        }
    }
}
