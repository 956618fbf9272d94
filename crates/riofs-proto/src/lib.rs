//! Wire protocol and transport primitives for riofs.
//!
//! riofs serves POSIX-like file operations over asynchronous message
//! channels. This crate defines everything both sides of a channel must
//! agree on:
//!
//! - [`VfsError`], the error taxonomy and its wire status codes
//! - [`Channel`] and [`Handle`], the in-process transport and the
//!   capability union messages can carry
//! - [`Request`] and [`Reply`], the message envelopes and their per-opcode
//!   schemas
//! - [`NodeAttr`], dirent records, and [`MmapRequest`], the fixed-size
//!   payload layouts
//! - [`OpenFlags`] and [`SeekOrigin`], the flag types carried in envelopes
//!
//! The serving side (node tree, path walking, mounts, dispatch) lives in
//! `riofs-vfs`.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod attr;
mod channel;
mod error;
mod flags;
mod message;

pub use attr::{
    ATTR_SIZE, Dirent, MMAP_REQ_SIZE, MODE_DIR, MmapRequest, NodeAttr, NodeKind, parse_dirents,
    write_dirent,
};
pub use channel::{Channel, ChannelError, Handle, HandleKind, Token};
pub use error::{VfsError, VfsResult};
pub use flags::{OpenFlags, SeekOrigin};
pub use message::{
    IOCTL_GET_TOKEN, IOCTL_MOUNT_FS, IOCTL_MOUNT_MKDIR_FS, IOCTL_UNMOUNT_FS, IOCTL_UNMOUNT_NODE,
    IOCTL_WATCH_DIR, MAX_CHUNK, MAX_IOCTL_INPUT, MAX_NAME_LEN, MOUNT_MKDIR_FLAG_REPLACE, Message,
    OpCode, READDIR_RESET, Reply, Request, RequestArg, ioctl_in_handles, ioctl_out_handles,
};
