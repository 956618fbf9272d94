//! Node reference container and the backend contract.
//!
//! A [`Node`] wraps one backend object ([`Vnode`]) together with the state
//! the VFS layer owns: the device flag and the optional remote channel a
//! mount attaches. Nodes are shared through [`NodeRef`] (an `Arc`); the
//! backend's [`Vnode::release`] hook runs when the last reference drops.

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use riofs_proto::{Channel, Handle, MmapRequest, NodeAttr, OpenFlags, VfsError, VfsResult};
use tracing::error;

/// Shared ownership handle for a [`Node`].
pub type NodeRef = Arc<Node>;

/// Opaque directory-iteration state, owned by one connection.
///
/// The backend interprets and advances it; the dispatcher only resets it
/// when the reset sentinel offset arrives.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirCookie(pub u64);

impl DirCookie {
    /// Restart iteration from the beginning.
    pub fn reset(&mut self) {
        self.0 = 0;
    }
}

/// The operations a backend node implements.
///
/// Every method the backend does not support keeps its default body; the
/// dispatcher surfaces the resulting `NotSupported` verbatim. `lookup` and
/// `create` return nodes with their reference already acquired (the
/// returned `NodeRef` is the acquisition).
#[allow(unused_variables)]
#[async_trait]
pub trait Vnode: Send + Sync + 'static {
    /// Downcast support for backends that need to recognize their own nodes
    /// (rename/link across parents).
    fn as_any(&self) -> &dyn Any;

    /// Resolve a child by name.
    async fn lookup(&self, name: &str) -> VfsResult<NodeRef> {
        Err(VfsError::NotSupported)
    }

    /// Create a child by name.
    async fn create(&self, name: &str, mode: u32) -> VfsResult<NodeRef> {
        Err(VfsError::NotSupported)
    }

    /// Validate an open of this node.
    async fn open(&self, flags: OpenFlags) -> VfsResult<()> {
        Ok(())
    }

    /// One connection to this node is closing.
    async fn close(&self) -> VfsResult<()> {
        Ok(())
    }

    /// Read up to `len` bytes at `offset`.
    async fn read_at(&self, offset: u64, len: usize) -> VfsResult<Vec<u8>> {
        Err(VfsError::NotSupported)
    }

    /// Write `data` at `offset`, returning the bytes written.
    async fn write_at(&self, offset: u64, data: &[u8]) -> VfsResult<usize> {
        Err(VfsError::NotSupported)
    }

    /// Set the content length.
    async fn truncate(&self, len: u64) -> VfsResult<()> {
        Err(VfsError::NotSupported)
    }

    /// Fetch the attribute record.
    async fn getattr(&self) -> VfsResult<NodeAttr> {
        Err(VfsError::NotSupported)
    }

    /// Store the attribute record.
    async fn setattr(&self, attr: NodeAttr) -> VfsResult<()> {
        Err(VfsError::NotSupported)
    }

    /// Fill a dirent buffer of at most `max_bytes`, advancing `cookie`.
    async fn readdir(&self, cookie: &mut DirCookie, max_bytes: usize) -> VfsResult<Vec<u8>> {
        Err(VfsError::NotSupported)
    }

    /// Backend-defined control operation.
    async fn ioctl(&self, op: u32, input: &[u8], max_reply: usize) -> VfsResult<Vec<u8>> {
        Err(VfsError::NotSupported)
    }

    /// Flush backend state.
    async fn sync(&self) -> VfsResult<()> {
        Err(VfsError::NotSupported)
    }

    /// Remove the directory entry `name`.
    async fn unlink(&self, name: &str, must_be_dir: bool) -> VfsResult<()> {
        Err(VfsError::NotSupported)
    }

    /// Move `old_name` from this directory to `new_name` under `new_parent`.
    async fn rename(
        &self,
        old_name: &str,
        new_parent: &NodeRef,
        new_name: &str,
        src_must_be_dir: bool,
        dst_must_be_dir: bool,
    ) -> VfsResult<()> {
        Err(VfsError::NotSupported)
    }

    /// Add `new_name` under `new_parent` referring to this directory's
    /// `old_name` entry.
    async fn link(&self, old_name: &str, new_parent: &NodeRef, new_name: &str) -> VfsResult<()> {
        Err(VfsError::NotSupported)
    }

    /// Map the node's contents, returning a buffer handle.
    async fn mmap(&self, req: MmapRequest) -> VfsResult<Handle> {
        Err(VfsError::NotSupported)
    }

    /// Produce a notification channel for directory watches.
    fn watch_dir(&self) -> VfsResult<Channel> {
        Err(VfsError::NotSupported)
    }

    /// Directory-watch hook: a new entry `name` appeared. Fire-and-forget.
    fn notify_add(&self, name: &str) {}

    /// Invoked exactly once, when the last reference drops. Must never be
    /// called while a remote is attached.
    fn release(&self) {}
}

#[derive(Debug)]
struct RemoteMount {
    channel: Channel,
    /// Set once the mounted server's readiness signal was observed.
    ready: bool,
}

/// One filesystem node: backend object plus VFS-owned remote state.
pub struct Node {
    ops: Arc<dyn Vnode>,
    device: bool,
    remote: Mutex<Option<RemoteMount>>,
}

impl Node {
    /// Wrap a backend object in a fresh node.
    pub fn new(ops: Arc<dyn Vnode>) -> NodeRef {
        Arc::new(Self {
            ops,
            device: false,
            remote: Mutex::new(None),
        })
    }

    /// Wrap a device front-end. Devices always present a remote channel for
    /// proxying and are never treated as mount points by the walker.
    pub fn new_device(ops: Arc<dyn Vnode>, channel: Channel) -> NodeRef {
        Arc::new(Self {
            ops,
            device: true,
            remote: Mutex::new(Some(RemoteMount {
                channel,
                ready: true,
            })),
        })
    }

    /// The backend object.
    pub fn backend(&self) -> &dyn Vnode {
        &*self.ops
    }

    /// Whether this node is a device front-end.
    pub fn is_device(&self) -> bool {
        self.device
    }

    fn remote_lock(&self) -> MutexGuard<'_, Option<RemoteMount>> {
        self.remote.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a remote channel is currently attached.
    pub fn is_remote(&self) -> bool {
        self.remote_lock().is_some()
    }

    /// Attach a remote channel, clearing the mount-ready bit.
    ///
    /// Fails `AlreadyBound` when a remote is already attached; the existing
    /// remote is left untouched.
    pub fn attach_remote(&self, channel: Channel) -> VfsResult<()> {
        let mut guard = self.remote_lock();
        if guard.is_some() {
            return Err(VfsError::AlreadyBound);
        }
        *guard = Some(RemoteMount {
            channel,
            ready: false,
        });
        Ok(())
    }

    /// Detach and return the remote channel; the caller owns its lifecycle.
    pub fn detach_remote(&self) -> VfsResult<Channel> {
        self.remote_lock()
            .take()
            .map(|r| r.channel)
            .ok_or(VfsError::NotFound)
    }

    /// A clone of the attached remote channel, if any.
    pub fn remote_channel(&self) -> Option<Channel> {
        self.remote_lock().as_ref().map(|r| r.channel.clone())
    }

    /// Wait until the mounted server signals readiness, then return the
    /// channel for forwarding.
    ///
    /// Fails `Unavailable` when no remote is attached, the peer closed, or
    /// `timeout` expired. Must be called without the VFS tree lock held.
    pub async fn wait_for_remote(&self, timeout: Option<Duration>) -> VfsResult<Channel> {
        let channel = {
            let guard = self.remote_lock();
            match guard.as_ref() {
                None => return Err(VfsError::Unavailable),
                Some(r) if r.ready => return Ok(r.channel.clone()),
                Some(r) => r.channel.clone(),
            }
        };
        channel
            .wait_ready(timeout)
            .await
            .map_err(|_| VfsError::Unavailable)?;
        // The mount may have been swapped while waiting; only the remote
        // whose signal was actually observed gets its ready bit set.
        if let Some(r) = self.remote_lock().as_mut() {
            if r.channel.same_channel(&channel) {
                r.ready = true;
            }
        }
        Ok(channel)
    }
}

/// Node identity: two nodes are equal only when they are the same node,
/// matching the `Arc::ptr_eq` identity used throughout the VFS.
impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Eq for Node {}

impl Drop for Node {
    fn drop(&mut self) {
        // Releasing a node with an attached remote is a programming error:
        // the mount registry holds a reference for every mounted node, so
        // this can only fire if a remote was attached behind its back.
        if !self.device && self.remote_lock().take().is_some() {
            error!("node released with a remote still attached; unmount first");
        }
        self.ops.release();
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("device", &self.device)
            .field("remote", &self.is_remote())
            .finish_non_exhaustive()
    }
}
