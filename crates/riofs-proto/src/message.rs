//! Request/Reply envelopes and per-opcode schemas.
//!
//! The wire format is one envelope per message: an opcode, a 32-bit signed
//! argument, an opcode-specific second argument, a bounded data payload, and
//! zero or more handles. Requests and replies are distinct variants sharing
//! the envelope conventions rather than one struct reused for both phases.
//!
//! Every opcode has a schema (expected handle kinds, expected second-argument
//! shape, data bound) checked centrally before dispatch. A mismatch drops
//! all carried handles and rejects the request with `Io` without invoking
//! any node operation.

use crate::channel::{Channel, Handle, HandleKind, Token};
use crate::error::VfsError;
use crate::flags::SeekOrigin;

/// Maximum data payload per message.
pub const MAX_CHUNK: usize = 8192;

/// Maximum ioctl input buffer.
pub const MAX_IOCTL_INPUT: usize = 1024;

/// Maximum length of a single path segment.
pub const MAX_NAME_LEN: usize = 255;

/// Readdir request offset that resets the connection's directory cookie
/// before resuming iteration.
pub const READDIR_RESET: u64 = u64::MAX;

/// Operation codes multiplexed over one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// Open or create a node; the reply channel handle becomes either the
    /// new connection or the hand-off target.
    Open,
    /// Tear down the connection.
    Close,
    /// Duplicate the connection onto a new channel.
    Clone,
    /// Read at the connection offset, advancing it.
    Read,
    /// Read at an explicit offset.
    ReadAt,
    /// Write at the connection offset (end-of-file in append mode),
    /// advancing it.
    Write,
    /// Write at an explicit offset.
    WriteAt,
    /// Move the connection offset.
    Seek,
    /// Fetch the attribute record.
    Stat,
    /// Store the attribute record.
    Setattr,
    /// Read directory entries into a bounded buffer.
    Readdir,
    /// Backend or VFS-level control operation.
    Ioctl,
    /// Set the node's length.
    Truncate,
    /// Rename under a token-named destination parent.
    Rename,
    /// Link under a token-named destination parent.
    Link,
    /// Map the node's contents; replies with a buffer handle.
    Mmap,
    /// Flush backend state.
    Sync,
    /// Remove a directory entry.
    Unlink,
    /// An opcode this revision does not understand.
    Unknown(u32),
}

/// Opcode-specific second argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestArg {
    /// No second argument.
    None,
    /// Creation mode bits (Open).
    Mode(u32),
    /// Explicit byte offset (ReadAt/WriteAt/Readdir).
    Offset(u64),
    /// Signed length (Truncate; negative is rejected at dispatch).
    Length(i64),
    /// Seek displacement and origin.
    Seek {
        /// Signed displacement from the origin.
        offset: i64,
        /// Where the displacement is measured from.
        origin: SeekOrigin,
    },
    /// Ioctl operation number and reply bound.
    Ioctl {
        /// Ioctl operation number (kind tag in the upper bits).
        op: u32,
        /// Maximum reply payload the caller will accept.
        max_reply: u32,
    },
}

/// A request envelope.
#[derive(Debug)]
pub struct Request {
    /// Operation code.
    pub op: OpCode,
    /// 32-bit signed argument (open flags, read/readdir bound, ...).
    pub arg: i32,
    /// Opcode-specific second argument.
    pub arg2: RequestArg,
    /// Data payload, bounded by [`MAX_CHUNK`].
    pub data: Vec<u8>,
    /// Handles accompanying the request.
    pub handles: Vec<Handle>,
}

impl Request {
    /// A bare request with no payload or handles.
    pub fn new(op: OpCode) -> Self {
        Self {
            op,
            arg: 0,
            arg2: RequestArg::None,
            data: Vec::new(),
            handles: Vec::new(),
        }
    }

    /// An Open request carrying the reply channel.
    pub fn open(path: &str, flags: i32, mode: u32, reply: Channel) -> Self {
        Self {
            op: OpCode::Open,
            arg: flags,
            arg2: RequestArg::Mode(mode),
            data: path.as_bytes().to_vec(),
            handles: vec![Handle::Channel(reply)],
        }
    }

    /// A Clone request carrying the new connection channel.
    pub fn clone_conn(new_channel: Channel) -> Self {
        Self {
            op: OpCode::Clone,
            arg: 0,
            arg2: RequestArg::None,
            data: Vec::new(),
            handles: vec![Handle::Channel(new_channel)],
        }
    }

    /// An Ioctl request.
    pub fn ioctl(op: u32, max_reply: u32, input: Vec<u8>, handles: Vec<Handle>) -> Self {
        Self {
            op: OpCode::Ioctl,
            arg: 0,
            arg2: RequestArg::Ioctl { op, max_reply },
            data: input,
            handles,
        }
    }

    /// A Rename or Link request; `data` carries both names NUL-separated.
    pub fn rename_or_link(op: OpCode, old_name: &str, new_name: &str, token: Token) -> Self {
        let mut data = Vec::with_capacity(old_name.len() + new_name.len() + 1);
        data.extend_from_slice(old_name.as_bytes());
        data.push(0);
        data.extend_from_slice(new_name.as_bytes());
        Self {
            op,
            arg: 0,
            arg2: RequestArg::None,
            data,
            handles: vec![Handle::Token(token)],
        }
    }

    /// Validate this request against its opcode's schema.
    ///
    /// On failure the caller must drop all carried handles and reply `Io`.
    pub fn validate(&self) -> Result<(), VfsError> {
        if self.data.len() > MAX_CHUNK {
            return Err(VfsError::Io);
        }
        let expected: &[HandleKind] = match self.op {
            OpCode::Open | OpCode::Clone => &[HandleKind::Channel],
            OpCode::Rename | OpCode::Link => &[HandleKind::Token],
            OpCode::Ioctl => match self.arg2 {
                RequestArg::Ioctl { op, .. } => {
                    if self.data.len() > MAX_IOCTL_INPUT {
                        return Err(VfsError::InvalidArgument);
                    }
                    ioctl_in_handles(op)
                }
                _ => return Err(VfsError::Io),
            },
            _ => &[],
        };
        if self.handles.len() != expected.len() {
            return Err(VfsError::Io);
        }
        for (handle, kind) in self.handles.iter().zip(expected) {
            if handle.kind() != *kind {
                return Err(VfsError::Io);
            }
        }
        self.validate_arg2()
    }

    fn validate_arg2(&self) -> Result<(), VfsError> {
        let ok = match self.op {
            OpCode::Open => matches!(self.arg2, RequestArg::Mode(_)),
            OpCode::ReadAt | OpCode::WriteAt | OpCode::Readdir => {
                matches!(self.arg2, RequestArg::Offset(_))
            }
            OpCode::Truncate => matches!(self.arg2, RequestArg::Length(_)),
            OpCode::Seek => matches!(self.arg2, RequestArg::Seek { .. }),
            OpCode::Ioctl => matches!(self.arg2, RequestArg::Ioctl { .. }),
            _ => matches!(self.arg2, RequestArg::None),
        };
        if ok { Ok(()) } else { Err(VfsError::Io) }
    }
}

/// A reply envelope.
#[derive(Debug)]
pub struct Reply {
    /// Operation status; errors carry the taxonomy kind.
    pub status: Result<(), VfsError>,
    /// Result argument (byte count, new offset, ...).
    pub arg: i64,
    /// Data payload.
    pub data: Vec<u8>,
    /// Handles accompanying the reply.
    pub handles: Vec<Handle>,
}

impl Reply {
    /// A success reply with no payload.
    pub fn ok() -> Self {
        Self {
            status: Ok(()),
            arg: 0,
            data: Vec::new(),
            handles: Vec::new(),
        }
    }

    /// An error reply.
    pub fn error(err: VfsError) -> Self {
        Self {
            status: Err(err),
            arg: 0,
            data: Vec::new(),
            handles: Vec::new(),
        }
    }

    /// Attach a result argument.
    pub fn with_arg(mut self, arg: i64) -> Self {
        self.arg = arg;
        self
    }

    /// Attach a data payload.
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    /// Attach a handle.
    pub fn with_handle(mut self, handle: Handle) -> Self {
        self.handles.push(handle);
        self
    }
}

/// A message traveling over a channel.
#[derive(Debug)]
pub enum Message {
    /// A request envelope.
    Request(Request),
    /// A reply envelope.
    Reply(Reply),
}

// VFS-level pseudo-ioctls. The kind tag in bits 16..18 states how many
// handles the reply carries, so a generic client can unpack it.

const IOCTL_KIND_DEFAULT: u32 = 0;
const IOCTL_KIND_ONE_HANDLE: u32 = 1;

const fn ioctl_num(kind: u32, number: u32) -> u32 {
    (kind << 16) | number
}

/// Mount: no input, one output handle (the new remote-server-facing end).
pub const IOCTL_MOUNT_FS: u32 = ioctl_num(IOCTL_KIND_ONE_HANDLE, 1);
/// Mount with mkdir: name payload plus a provided remote handle and a
/// replace flag.
pub const IOCTL_MOUNT_MKDIR_FS: u32 = ioctl_num(IOCTL_KIND_DEFAULT, 2);
/// Unmount this node: one output handle (the detached remote).
pub const IOCTL_UNMOUNT_NODE: u32 = ioctl_num(IOCTL_KIND_ONE_HANDLE, 3);
/// Unmount everything; the serving loop exits afterwards.
pub const IOCTL_UNMOUNT_FS: u32 = ioctl_num(IOCTL_KIND_DEFAULT, 4);
/// Issue an authorization token: one output handle.
pub const IOCTL_GET_TOKEN: u32 = ioctl_num(IOCTL_KIND_ONE_HANDLE, 5);
/// Watch this directory: one output handle (a notification channel).
pub const IOCTL_WATCH_DIR: u32 = ioctl_num(IOCTL_KIND_ONE_HANDLE, 6);

/// Replace flag byte in the mount-with-mkdir payload (first data byte).
pub const MOUNT_MKDIR_FLAG_REPLACE: u8 = 1;

/// How many handles a reply to this ioctl carries.
pub fn ioctl_out_handles(op: u32) -> usize {
    ((op >> 16) & 0x3) as usize
}

/// Expected input handle kinds for an ioctl request.
pub fn ioctl_in_handles(op: u32) -> &'static [HandleKind] {
    if op == IOCTL_MOUNT_MKDIR_FS {
        &[HandleKind::Channel]
    } else {
        &[]
    }
}
