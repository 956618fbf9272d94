//! The VFS core: tree lock, mount registry, token table, and the
//! open/create orchestrator.

use std::sync::Arc;
use std::time::Duration;

use riofs_proto::{Channel, OpenFlags, VfsError, VfsResult};
use tracing::trace;

use crate::mount::MountRegistry;
use crate::name::trim_name;
use crate::node::NodeRef;
use crate::token::TokenTable;
use crate::walk::{WalkStep, walk};

/// How long an open blocks waiting for a freshly mounted server to signal
/// readiness.
pub const REMOTE_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// How an open resolves.
#[derive(Debug)]
pub enum OpenOutcome {
    /// The node is served locally; the caller wires up a connection.
    Local {
        /// The opened node, reference acquired.
        node: NodeRef,
    },
    /// The path crossed into a mounted server; forward the open there.
    Remote {
        /// The mounted server's channel, ready for traffic.
        channel: Channel,
        /// The remaining path to forward, `"."` when nothing remains.
        path: String,
    },
    /// The node is a device front-end; hand its channel to the caller.
    Device {
        /// A clone of the device's channel.
        channel: Channel,
    },
}

/// One VFS instance: shared mutable state for every connection serving its
/// tree.
#[derive(Debug, Default)]
pub struct Vfs {
    /// Serializes tree mutation and traversal. Held only across short
    /// non-blocking segments, never across a remote readiness wait or an
    /// unmount handshake.
    tree_lock: tokio::sync::Mutex<()>,
    /// Mounted-on nodes.
    pub mounts: MountRegistry,
    /// Cross-request authorization tokens.
    pub tokens: TokenTable,
}

impl Vfs {
    /// A fresh VFS with no mounts and no tokens.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquire the tree lock.
    pub(crate) async fn lock_tree(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.tree_lock.lock().await
    }

    /// Resolve `path` relative to `dir` and open (or create) the target.
    ///
    /// Remote hand-off takes priority at every stage: a mount point crossed
    /// mid-walk, or resolved as the final node, yields `Remote` (unless
    /// `NO_REMOTE` suppresses the final-node hand-off). Readiness waiting
    /// happens after the tree lock is released.
    pub async fn open(
        &self,
        dir: NodeRef,
        path: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> VfsResult<OpenOutcome> {
        if flags.contains(OpenFlags::EXCLUSIVE) && !flags.contains(OpenFlags::CREATE) {
            return Err(VfsError::InvalidArgument);
        }
        if flags.contains(OpenFlags::DIRECTORY) && flags.contains(OpenFlags::TRUNCATE) {
            return Err(VfsError::InvalidArgument);
        }
        trace!(path, ?flags, "open");

        let guard = self.lock_tree().await;
        let (node, last) = match walk(dir, path).await? {
            WalkStep::Remote { node, remaining } => {
                drop(guard);
                let channel = node.wait_for_remote(Some(REMOTE_READY_TIMEOUT)).await?;
                return Ok(OpenOutcome::Remote {
                    channel,
                    path: remaining,
                });
            }
            WalkStep::Local { node, last } => (node, last),
        };

        let trimmed = trim_name(&last)?;
        let name = trimmed.name;
        // A stripped trailing separator is directory intent.
        let flags = if trimmed.must_be_dir {
            flags | OpenFlags::DIRECTORY
        } else {
            flags
        };

        let target = if name == "." {
            // Re-opening the walked-to node itself; backends have no
            // self-entry to look up.
            node
        } else if flags.contains(OpenFlags::CREATE) {
            match node.backend().create(name, mode).await {
                Ok(created) => {
                    node.backend().notify_add(name);
                    created
                }
                Err(VfsError::AlreadyExists) if !flags.contains(OpenFlags::EXCLUSIVE) => {
                    node.backend().lookup(name).await?
                }
                // Backends without create still serve plain opens.
                Err(VfsError::NotSupported) => node.backend().lookup(name).await?,
                Err(err) => return Err(err),
            }
        } else {
            node.backend().lookup(name).await?
        };

        if target.is_remote() && !target.is_device() && !flags.contains(OpenFlags::NO_REMOTE) {
            drop(guard);
            let channel = target.wait_for_remote(Some(REMOTE_READY_TIMEOUT)).await?;
            return Ok(OpenOutcome::Remote {
                channel,
                path: ".".to_string(),
            });
        }
        drop(guard);

        target.backend().open(flags).await?;
        if target.is_device() && !flags.contains(OpenFlags::DIRECTORY) {
            if let Some(channel) = target.remote_channel() {
                return Ok(OpenOutcome::Device { channel });
            }
        }
        if flags.contains(OpenFlags::TRUNCATE) {
            target.backend().truncate(0).await?;
        }
        Ok(OpenOutcome::Local { node: target })
    }
}
