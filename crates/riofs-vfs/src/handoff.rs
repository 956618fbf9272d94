//! Hand-off onto mounted servers: open forwarding and the unmount handshake.

use std::time::Duration;

use riofs_proto::{
    Channel, ChannelError, IOCTL_UNMOUNT_FS, Message, OpenFlags, Reply, Request, VfsError,
    VfsResult,
};
use tracing::debug;

/// Forward an open to a mounted server, transferring the reply channel.
///
/// Fire-and-forget: all further traffic for this open happens between the
/// original caller and the mounted server. When the server side is already
/// gone the reply channel is dropped with the failed send, which the caller
/// observes as its channel closing.
pub fn forward_open(remote: &Channel, reply: Channel, path: &str, flags: OpenFlags, mode: u32) {
    let request = Request::open(path, flags.to_wire(), mode, reply);
    if remote.send(Message::Request(request)).is_err() {
        debug!(path, "open hand-off target closed; dropping reply channel");
    }
}

/// Tell a detached remote server to unmount, waiting briefly for an answer.
///
/// Transport failures mean the far side is already gone and count as
/// success: a send failure, or the peer closing while we wait. An explicit
/// error status in the reply propagates, and an expired `timeout` fails
/// `TimedOut`. The channel is consumed either way.
pub async fn unmount_handshake(channel: Channel, timeout: Option<Duration>) -> VfsResult<()> {
    let request = Request::ioctl(IOCTL_UNMOUNT_FS, 0, Vec::new(), Vec::new());
    if channel.send(Message::Request(request)).is_err() {
        debug!("unmount handshake peer already closed");
        return Ok(());
    }
    match channel.recv_timeout(timeout).await {
        Ok(Some(Message::Reply(Reply { status, .. }))) => status,
        // A request coming back instead of a reply is a protocol violation,
        // but the remote is being torn down regardless.
        Ok(Some(Message::Request(_))) => Err(VfsError::Io),
        Ok(None) => Ok(()),
        Err(ChannelError::TimedOut) => Err(VfsError::TimedOut),
        Err(ChannelError::PeerClosed) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use riofs_proto::OpCode;

    #[tokio::test]
    async fn forward_open_transfers_reply_channel() {
        let (local, server) = Channel::pair();
        let (reply_ours, reply_theirs) = Channel::pair();
        forward_open(&local, reply_theirs, "b/c", OpenFlags::empty(), 0o644);

        let Some(Message::Request(req)) = server.recv().await else {
            panic!("expected forwarded request");
        };
        assert_eq!(req.op, OpCode::Open);
        assert_eq!(req.data, b"b/c");
        assert_eq!(req.handles.len(), 1);
        drop(req);
        // The forwarded handle was the peer of our reply endpoint.
        assert!(reply_ours.is_peer_closed());
    }

    #[tokio::test]
    async fn forward_open_drops_reply_on_dead_target() {
        let (local, server) = Channel::pair();
        drop(server);
        let (reply_ours, reply_theirs) = Channel::pair();
        forward_open(&local, reply_theirs, ".", OpenFlags::empty(), 0);
        assert!(reply_ours.is_peer_closed());
    }

    #[tokio::test]
    async fn handshake_send_failure_is_success() {
        let (local, server) = Channel::pair();
        drop(server);
        assert_eq!(unmount_handshake(local, Some(Duration::ZERO)).await, Ok(()));
    }

    #[tokio::test]
    async fn handshake_peer_close_while_waiting_is_success() {
        let (local, server) = Channel::pair();
        let task = tokio::spawn(unmount_handshake(local, None));
        let Some(Message::Request(req)) = server.recv().await else {
            panic!("expected unmount request");
        };
        assert!(matches!(
            req.arg2,
            riofs_proto::RequestArg::Ioctl { op, .. } if op == IOCTL_UNMOUNT_FS
        ));
        drop(server);
        assert_eq!(task.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn handshake_error_status_propagates() {
        let (local, server) = Channel::pair();
        let task = tokio::spawn(unmount_handshake(local, None));
        assert!(server.recv().await.is_some());
        server
            .send(Message::Reply(Reply::error(VfsError::Io)))
            .unwrap();
        assert_eq!(task.await.unwrap(), Err(VfsError::Io));
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_times_out() {
        let (local, _server) = Channel::pair();
        assert_eq!(
            unmount_handshake(local, Some(Duration::from_millis(10))).await,
            Err(VfsError::TimedOut)
        );
    }
}
