//! Remote-mount VFS server over riofs channels.
//!
//! This crate turns a tree of backend nodes into an RPC filesystem server:
//!
//! - [`Vnode`] is the backend contract; [`memfs`] is the in-memory
//!   implementation of it.
//! - [`Vfs`] owns the shared state: the tree lock, the [`MountRegistry`]
//!   and the [`TokenTable`].
//! - [`serve`] / [`spawn_serve`] run the per-connection dispatch loop over
//!   a [`riofs_proto::Channel`].
//!
//! Mounting composes servers: a node with a remote channel attached hands
//! every open that crosses it off to the mounted server, so one namespace
//! can span many serving tasks.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod connection;
mod handoff;
pub mod memfs;
mod mount;
mod name;
mod node;
mod token;
mod vfs;
mod walk;

pub use connection::{UNMOUNT_ALL_TIMEOUT, serve, spawn_serve};
pub use handoff::{forward_open, unmount_handshake};
pub use mount::MountRegistry;
pub use name::{TrimmedName, trim_name};
pub use node::{DirCookie, Node, NodeRef, Vnode};
pub use token::TokenTable;
pub use vfs::{OpenOutcome, REMOTE_READY_TIMEOUT, Vfs};
