//! Per-connection RPC dispatch.
//!
//! One task serves one channel: requests are taken strictly in order, and
//! each is fully processed before the next is read. Operations that
//! complete on a different channel (open, clone) send nothing on the
//! request channel; everything else gets exactly one reply.

use std::str::from_utf8;
use std::sync::Arc;
use std::time::Duration;

use riofs_proto::{
    Channel, Handle, IOCTL_GET_TOKEN, IOCTL_MOUNT_FS, IOCTL_MOUNT_MKDIR_FS, IOCTL_UNMOUNT_FS,
    IOCTL_UNMOUNT_NODE, IOCTL_WATCH_DIR, MAX_CHUNK, MODE_DIR, MOUNT_MKDIR_FLAG_REPLACE, Message,
    MmapRequest, NodeAttr, OpCode, OpenFlags, READDIR_RESET, Reply, Request, RequestArg,
    SeekOrigin, Token, VfsError, VfsResult,
};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::handoff::{forward_open, unmount_handshake};
use crate::name::trim_name;
use crate::node::{DirCookie, NodeRef};
use crate::vfs::{OpenOutcome, Vfs};

/// Per-entry handshake bound used when a connection tears down every mount.
pub const UNMOUNT_ALL_TIMEOUT: Duration = Duration::from_millis(500);

/// How one request resolved.
enum Dispatch {
    /// Send this reply on the request channel.
    Reply(Reply),
    /// Completion happens on a channel the request carried; send nothing.
    Indirect,
    /// Send this reply, then stop serving.
    Shutdown(Reply),
}

/// Serve `channel` in a new task.
pub fn spawn_serve(
    vfs: Arc<Vfs>,
    node: NodeRef,
    flags: OpenFlags,
    channel: Channel,
) -> JoinHandle<()> {
    tokio::spawn(serve(vfs, node, flags, channel))
}

/// Serve requests for `node` arriving on `channel` until the peer goes away
/// or a shutdown-worthy request lands.
///
/// Signals readiness on the channel first, so a mounting client's
/// [`crate::node::Node::wait_for_remote`] unblocks once the loop is up.
pub async fn serve(vfs: Arc<Vfs>, node: NodeRef, flags: OpenFlags, channel: Channel) {
    channel.signal_ready();
    let mut conn = Connection {
        vfs,
        node,
        flags,
        offset: 0,
        dir_cookie: DirCookie::default(),
        token: None,
        closed: false,
    };
    while let Some(message) = channel.recv().await {
        let Message::Request(request) = message else {
            warn!("reply envelope on a request channel; closing connection");
            break;
        };
        match conn.dispatch(request).await {
            Dispatch::Reply(reply) => {
                if channel.send(Message::Reply(reply)).is_err() {
                    break;
                }
            }
            Dispatch::Indirect => {}
            Dispatch::Shutdown(reply) => {
                let _ = channel.send(Message::Reply(reply));
                break;
            }
        }
    }
    if let Err(err) = conn.teardown().await {
        debug!(%err, "backend close failed during teardown");
    }
}

struct Connection {
    vfs: Arc<Vfs>,
    node: NodeRef,
    flags: OpenFlags,
    offset: u64,
    dir_cookie: DirCookie,
    /// Token issued for this connection, if any. Repeated requests get the
    /// same one back.
    token: Option<Token>,
    closed: bool,
}

impl Connection {
    async fn dispatch(&mut self, request: Request) -> Dispatch {
        trace!(op = ?request.op, "request");
        if let OpCode::Unknown(op) = request.op {
            // No schema exists for an unhandled opcode; fail it uniformly,
            // dropping whatever handles it carried.
            debug!(op, "unknown opcode");
            return Dispatch::Reply(Reply::error(VfsError::NotSupported));
        }
        if let Err(err) = request.validate() {
            // Carried handles drop with the rejected request.
            return Dispatch::Reply(Reply::error(err));
        }
        let outcome = match request.op {
            OpCode::Open => return self.op_open(request).await,
            OpCode::Clone => return self.op_clone(request),
            OpCode::Close => {
                let reply = match self.teardown().await {
                    Ok(()) => Reply::ok(),
                    Err(err) => Reply::error(err),
                };
                return Dispatch::Shutdown(reply);
            }
            OpCode::Ioctl => return self.op_ioctl(request).await,
            OpCode::Read => self.op_read(&request).await,
            OpCode::ReadAt => self.op_read_at(&request).await,
            OpCode::Write => self.op_write(&request).await,
            OpCode::WriteAt => self.op_write_at(&request).await,
            OpCode::Seek => self.op_seek(&request).await,
            OpCode::Stat => self.op_stat().await,
            OpCode::Setattr => self.op_setattr(&request).await,
            OpCode::Readdir => self.op_readdir(&request).await,
            OpCode::Truncate => self.op_truncate(&request).await,
            OpCode::Rename | OpCode::Link => self.op_rename_link(request).await,
            OpCode::Mmap => self.op_mmap(&request).await,
            OpCode::Sync => self.node.backend().sync().await.map(|()| Reply::ok()),
            OpCode::Unlink => self.op_unlink(&request).await,
            // Rejected before validation.
            OpCode::Unknown(_) => Err(VfsError::NotSupported),
        };
        Dispatch::Reply(outcome.unwrap_or_else(Reply::error))
    }

    /// Open always completes on the carried reply channel: a description
    /// reply there unless the caller pipelined, then either a serving loop
    /// on that channel or a hand-off.
    async fn op_open(&mut self, mut request: Request) -> Dispatch {
        let Some(reply_channel) = request.handles.pop().and_then(Handle::into_channel) else {
            return Dispatch::Indirect;
        };
        let Some(flags) = OpenFlags::from_wire(request.arg) else {
            // Unknown flag bits; pipeline intent is unknowable, so report
            // unconditionally and let a pipelined caller ignore it.
            let reply = Reply::error(VfsError::InvalidArgument);
            let _ = reply_channel.send(Message::Reply(reply));
            return Dispatch::Indirect;
        };
        let pipelined = flags.contains(OpenFlags::PIPELINE);
        let RequestArg::Mode(mode) = request.arg2 else {
            return Dispatch::Indirect;
        };
        let path = match from_utf8(&request.data) {
            Ok(path) => path,
            Err(_) => {
                if !pipelined {
                    let reply = Reply::error(VfsError::InvalidArgument);
                    let _ = reply_channel.send(Message::Reply(reply));
                }
                return Dispatch::Indirect;
            }
        };

        match self
            .vfs
            .open(Arc::clone(&self.node), path, flags, mode)
            .await
        {
            Err(err) => {
                if !pipelined {
                    let _ = reply_channel.send(Message::Reply(Reply::error(err)));
                }
            }
            Ok(OpenOutcome::Remote { channel, path }) => {
                forward_open(&channel, reply_channel, &path, flags, mode);
            }
            Ok(OpenOutcome::Device { channel }) => {
                if pipelined {
                    // A pipelined caller never reads a description, so the
                    // device channel could not be delivered.
                    debug!("dropping device open with pipelined flags");
                } else {
                    let reply = Reply::ok().with_handle(Handle::Channel(channel));
                    let _ = reply_channel.send(Message::Reply(reply));
                }
            }
            Ok(OpenOutcome::Local { node }) => {
                if !pipelined
                    && reply_channel.send(Message::Reply(Reply::ok())).is_err()
                {
                    // Caller vanished between open and description; undo the
                    // backend open.
                    let _ = node.backend().close().await;
                    return Dispatch::Indirect;
                }
                spawn_serve(Arc::clone(&self.vfs), node, flags, reply_channel);
            }
        }
        Dispatch::Indirect
    }

    /// Clone shares the node and open flags; the backend's open hook is not
    /// re-run.
    fn op_clone(&self, mut request: Request) -> Dispatch {
        let Some(new_channel) = request.handles.pop().and_then(Handle::into_channel) else {
            return Dispatch::Indirect;
        };
        let pipelined = OpenFlags::from_wire(request.arg)
            .is_some_and(|f| f.contains(OpenFlags::PIPELINE));
        if !pipelined && new_channel.send(Message::Reply(Reply::ok())).is_err() {
            return Dispatch::Indirect;
        }
        spawn_serve(
            Arc::clone(&self.vfs),
            Arc::clone(&self.node),
            self.flags,
            new_channel,
        );
        Dispatch::Indirect
    }

    async fn op_read(&mut self, request: &Request) -> VfsResult<Reply> {
        let want = read_len(request.arg)?;
        let data = self.node.backend().read_at(self.offset, want).await?;
        self.offset += data.len() as u64;
        // Sequential reads report the advanced offset.
        let new_offset = as_arg(self.offset)?;
        Ok(Reply::ok().with_arg(new_offset).with_data(data))
    }

    async fn op_read_at(&self, request: &Request) -> VfsResult<Reply> {
        let RequestArg::Offset(offset) = request.arg2 else {
            return Err(VfsError::Io);
        };
        let want = read_len(request.arg)?;
        let data = self.node.backend().read_at(offset, want).await?;
        let count = as_arg(data.len() as u64)?;
        Ok(Reply::ok().with_arg(count).with_data(data))
    }

    async fn op_write(&mut self, request: &Request) -> VfsResult<Reply> {
        if self.flags.contains(OpenFlags::APPEND) {
            // Append re-queries the size for every write, so interleaved
            // writers do not clobber each other.
            self.offset = self.node.backend().getattr().await?.size;
        }
        let written = self
            .node
            .backend()
            .write_at(self.offset, &request.data)
            .await?;
        self.offset += written as u64;
        Ok(Reply::ok().with_arg(as_arg(self.offset)?))
    }

    async fn op_write_at(&self, request: &Request) -> VfsResult<Reply> {
        let RequestArg::Offset(offset) = request.arg2 else {
            return Err(VfsError::Io);
        };
        let written = self.node.backend().write_at(offset, &request.data).await?;
        Ok(Reply::ok().with_arg(as_arg(written as u64)?))
    }

    async fn op_seek(&mut self, request: &Request) -> VfsResult<Reply> {
        let RequestArg::Seek { offset, origin } = request.arg2 else {
            return Err(VfsError::Io);
        };
        let size = if matches!(origin, SeekOrigin::End) || self.node.is_device() {
            self.node.backend().getattr().await?.size
        } else {
            0
        };
        let base = match origin {
            SeekOrigin::Start => 0,
            SeekOrigin::Current => self.offset,
            SeekOrigin::End => size,
        };
        let target = base
            .checked_add_signed(offset)
            .ok_or(VfsError::InvalidArgument)?;
        if self.node.is_device() && target > size {
            return Err(VfsError::InvalidArgument);
        }
        let reported = as_arg(target)?;
        self.offset = target;
        Ok(Reply::ok().with_arg(reported))
    }

    async fn op_stat(&self) -> VfsResult<Reply> {
        let attr = self.node.backend().getattr().await?;
        Ok(Reply::ok().with_data(attr.to_bytes().to_vec()))
    }

    async fn op_setattr(&self, request: &Request) -> VfsResult<Reply> {
        let attr = NodeAttr::from_bytes(&request.data)?;
        self.node.backend().setattr(attr).await?;
        Ok(Reply::ok())
    }

    async fn op_readdir(&mut self, request: &Request) -> VfsResult<Reply> {
        let RequestArg::Offset(offset) = request.arg2 else {
            return Err(VfsError::Io);
        };
        if offset == READDIR_RESET {
            self.dir_cookie.reset();
        }
        let max_bytes = read_len(request.arg)?;
        let buf = self
            .node
            .backend()
            .readdir(&mut self.dir_cookie, max_bytes)
            .await?;
        let count = as_arg(buf.len() as u64)?;
        Ok(Reply::ok().with_arg(count).with_data(buf))
    }

    async fn op_truncate(&self, request: &Request) -> VfsResult<Reply> {
        let RequestArg::Length(len) = request.arg2 else {
            return Err(VfsError::Io);
        };
        let len = u64::try_from(len).map_err(|_| VfsError::InvalidArgument)?;
        self.node.backend().truncate(len).await?;
        Ok(Reply::ok())
    }

    async fn op_unlink(&self, request: &Request) -> VfsResult<Reply> {
        let name = from_utf8(&request.data).map_err(|_| VfsError::InvalidArgument)?;
        let trimmed = trim_name(name)?;
        let _guard = self.vfs.lock_tree().await;
        self.node
            .backend()
            .unlink(trimmed.name, trimmed.must_be_dir)
            .await?;
        Ok(Reply::ok())
    }

    async fn op_rename_link(&self, mut request: Request) -> VfsResult<Reply> {
        let token = request
            .handles
            .pop()
            .and_then(Handle::into_token)
            .ok_or(VfsError::Io)?;
        // The token is consumed before anything else: one use, success or
        // failure, and the association is gone.
        let new_parent = self.vfs.tokens.consume(token)?;

        let text = from_utf8(&request.data).map_err(|_| VfsError::InvalidArgument)?;
        let (old_raw, new_raw) = text.split_once('\0').ok_or(VfsError::InvalidArgument)?;
        let old = trim_name(old_raw)?;
        let new = trim_name(new_raw)?;
        if request.op == OpCode::Link && (old.must_be_dir || new.must_be_dir) {
            // Hard links never target directories.
            return Err(VfsError::NotADirectory);
        }

        let _guard = self.vfs.lock_tree().await;
        match request.op {
            OpCode::Rename => {
                self.node
                    .backend()
                    .rename(
                        old.name,
                        &new_parent,
                        new.name,
                        old.must_be_dir,
                        new.must_be_dir,
                    )
                    .await?;
            }
            _ => {
                self.node
                    .backend()
                    .link(old.name, &new_parent, new.name)
                    .await?;
            }
        }
        new_parent.backend().notify_add(new.name);
        Ok(Reply::ok())
    }

    async fn op_mmap(&self, request: &Request) -> VfsResult<Reply> {
        let req = MmapRequest::from_bytes(&request.data)?;
        let handle = self.node.backend().mmap(req).await?;
        Ok(Reply::ok().with_handle(handle))
    }

    async fn op_ioctl(&mut self, mut request: Request) -> Dispatch {
        let RequestArg::Ioctl { op, max_reply } = request.arg2 else {
            return Dispatch::Reply(Reply::error(VfsError::Io));
        };
        let max_reply = usize::try_from(max_reply).unwrap_or(MAX_CHUNK).min(MAX_CHUNK);
        let reply = match op {
            IOCTL_GET_TOKEN => {
                let token = self.get_token();
                Ok(Reply::ok().with_handle(Handle::Token(token)))
            }
            IOCTL_WATCH_DIR => self
                .node
                .backend()
                .watch_dir()
                .map(|channel| Reply::ok().with_handle(Handle::Channel(channel))),
            IOCTL_MOUNT_FS => self.install_mount(),
            IOCTL_MOUNT_MKDIR_FS => {
                let Some(remote) = request.handles.pop().and_then(Handle::into_channel) else {
                    return Dispatch::Reply(Reply::error(VfsError::Io));
                };
                return Dispatch::Reply(self.mount_mkdir(remote, &request.data).await);
            }
            IOCTL_UNMOUNT_NODE => self
                .vfs
                .mounts
                .uninstall(&self.node)
                .map(|channel| Reply::ok().with_handle(Handle::Channel(channel))),
            IOCTL_UNMOUNT_FS => {
                self.vfs.mounts.uninstall_all(Some(UNMOUNT_ALL_TIMEOUT)).await;
                return Dispatch::Shutdown(Reply::ok());
            }
            _ => {
                self.node
                    .backend()
                    .ioctl(op, &request.data, max_reply)
                    .await
                    .and_then(|out| {
                        if out.len() > max_reply {
                            return Err(VfsError::Io);
                        }
                        let count = as_arg(out.len() as u64)?;
                        Ok(Reply::ok().with_arg(count).with_data(out))
                    })
            }
        };
        Dispatch::Reply(reply.unwrap_or_else(Reply::error))
    }

    /// Mount a fresh server on this node: the registry attaches one end of
    /// a new channel pair and the other end goes back to the caller.
    fn install_mount(&self) -> VfsResult<Reply> {
        let (ours, theirs) = Channel::pair();
        self.vfs.mounts.install(&self.node, ours)?;
        Ok(Reply::ok().with_handle(Handle::Channel(theirs)))
    }

    /// Mount a caller-supplied server channel on a child directory, creating
    /// it if needed. On any failure the rejected server is told to unmount.
    async fn mount_mkdir(&self, remote: Channel, data: &[u8]) -> Reply {
        match self.mount_mkdir_inner(&remote, data).await {
            Ok(()) => Reply::ok(),
            Err(err) => {
                let _ = unmount_handshake(remote, Some(Duration::ZERO)).await;
                Reply::error(err)
            }
        }
    }

    async fn mount_mkdir_inner(&self, remote: &Channel, data: &[u8]) -> VfsResult<()> {
        let (&flags_byte, name) = data.split_first().ok_or(VfsError::InvalidArgument)?;
        let name = from_utf8(name).map_err(|_| VfsError::InvalidArgument)?;
        let trimmed = trim_name(name)?;

        let target = {
            let _guard = self.vfs.lock_tree().await;
            match self
                .node
                .backend()
                .create(trimmed.name, MODE_DIR | 0o755)
                .await
            {
                Ok(node) => {
                    self.node.backend().notify_add(trimmed.name);
                    node
                }
                Err(VfsError::AlreadyExists | VfsError::NotSupported) => self
                    .node
                    .backend()
                    .lookup(trimmed.name)
                    .await
                    .map_err(|_| VfsError::AccessDenied)?,
                Err(err) => return Err(err),
            }
        };

        if flags_byte & MOUNT_MKDIR_FLAG_REPLACE != 0 {
            if let Ok(old) = self.vfs.mounts.uninstall(&target) {
                let _ = unmount_handshake(old, Some(Duration::ZERO)).await;
            }
        }
        self.vfs.mounts.install(&target, remote.clone())
    }

    fn get_token(&mut self) -> Token {
        if let Some(token) = self.token {
            return token;
        }
        let token = self.vfs.tokens.issue(&self.node);
        self.token = Some(token);
        token
    }

    /// Idempotent close: invalidate the connection's token, then run the
    /// backend close hook. The token association is erased before anything
    /// else so a duplicated token cannot race the teardown.
    async fn teardown(&mut self) -> VfsResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(token) = self.token.take() {
            self.vfs.tokens.invalidate(token);
        }
        self.node.backend().close().await
    }
}

fn read_len(arg: i32) -> VfsResult<usize> {
    usize::try_from(arg)
        .map(|len| len.min(MAX_CHUNK))
        .map_err(|_| VfsError::InvalidArgument)
}

fn as_arg(value: u64) -> VfsResult<i64> {
    i64::try_from(value).map_err(|_| VfsError::InvalidArgument)
}
