//! Shared harness for the dispatcher integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use riofs_proto::{Channel, Message, OpenFlags, Reply, Request, VfsError};
use riofs_vfs::{NodeRef, Vfs, memfs, spawn_serve};

static INIT: Once = Once::new();

/// Install a test tracing subscriber once; `RUST_LOG` controls verbosity.
pub fn init_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Stand up a VFS serving `root` and return the client end of its channel.
pub fn serve_root(root: &NodeRef) -> (Arc<Vfs>, Channel) {
    init_logging();
    let vfs = Vfs::new();
    let (client, server) = Channel::pair();
    spawn_serve(
        Arc::clone(&vfs),
        Arc::clone(root),
        OpenFlags::empty(),
        server,
    );
    (vfs, client)
}

/// A fresh memfs tree with one file, served.
pub fn serve_tree_with_file(name: &str, content: &[u8]) -> (Arc<Vfs>, NodeRef, Channel) {
    let root = memfs::root();
    memfs::put_file(&root, name, content).unwrap();
    let (vfs, client) = serve_root(&root);
    (vfs, root, client)
}

/// One request/reply round trip. Panics if the server drops the channel
/// instead of replying.
pub async fn rpc(conn: &Channel, request: Request) -> Reply {
    conn.send(Message::Request(request)).expect("server alive");
    match conn.recv().await.expect("server replied") {
        Message::Reply(reply) => reply,
        Message::Request(_) => panic!("server sent a request"),
    }
}

/// Non-pipelined open: returns the new connection channel after a
/// successful description reply.
pub async fn open(
    conn: &Channel,
    path: &str,
    flags: OpenFlags,
    mode: u32,
) -> Result<Channel, VfsError> {
    let (reply, channel) = open_described(conn, path, flags, mode).await;
    let reply = reply.expect("description reply");
    reply.status.map(|()| channel)
}

/// Non-pipelined open returning the raw description reply (for inspecting
/// carried handles) plus our end of the reply channel. The reply is `None`
/// when the server dropped the channel without describing.
pub async fn open_described(
    conn: &Channel,
    path: &str,
    flags: OpenFlags,
    mode: u32,
) -> (Option<Reply>, Channel) {
    let (ours, theirs) = Channel::pair();
    conn.send(Message::Request(Request::open(
        path,
        flags.to_wire(),
        mode,
        theirs,
    )))
    .expect("server alive");
    match ours.recv().await {
        Some(Message::Reply(reply)) => (Some(reply), ours),
        Some(Message::Request(_)) => panic!("server sent a request on the reply channel"),
        None => (None, ours),
    }
}
