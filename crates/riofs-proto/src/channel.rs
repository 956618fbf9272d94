//! In-process message channels with readiness signaling.
//!
//! A [`Channel`] is one endpoint of a bidirectional message pipe. Endpoints
//! are cheaply cloneable (clones share the receive side), which models
//! handle duplication: a channel stored in a mount table can be cloned for
//! forwarding while the original stays attached.
//!
//! Besides carrying [`Message`]s, an endpoint can raise a readiness signal
//! observed by its peer. A freshly mounted filesystem server raises it once
//! its serving loop is up; the mounting side blocks in
//! [`Channel::wait_ready`] before forwarding any request.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, Notify, mpsc};

use crate::message::Message;

/// Transport-level failures distinct from the VFS error taxonomy.
///
/// Callers map these to taxonomy kinds at the policy layer: a readiness wait
/// maps both variants to `Unavailable`, while the unmount handshake treats
/// `PeerClosed` as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// Every clone of the peer endpoint has been dropped.
    #[error("channel peer closed")]
    PeerClosed,
    /// The bounded wait expired before the peer signaled.
    #[error("channel wait timed out")]
    TimedOut,
}

#[derive(Debug, Default)]
struct Signals {
    ready: AtomicBool,
    notify: Notify,
}

/// One endpoint of an in-process message pipe.
#[derive(Debug, Clone)]
pub struct Channel {
    tx: mpsc::UnboundedSender<Message>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Message>>>,
    /// Signals this endpoint raises, observed by the peer.
    ours: Arc<Signals>,
    /// Signals raised by the peer, observed here.
    theirs: Arc<Signals>,
}

impl Channel {
    /// Create a connected endpoint pair.
    pub fn pair() -> (Channel, Channel) {
        let (tx_ab, rx_ab) = mpsc::unbounded_channel();
        let (tx_ba, rx_ba) = mpsc::unbounded_channel();
        let sig_a = Arc::new(Signals::default());
        let sig_b = Arc::new(Signals::default());
        let a = Channel {
            tx: tx_ab,
            rx: Arc::new(Mutex::new(rx_ba)),
            ours: Arc::clone(&sig_a),
            theirs: Arc::clone(&sig_b),
        };
        let b = Channel {
            tx: tx_ba,
            rx: Arc::new(Mutex::new(rx_ab)),
            ours: sig_b,
            theirs: sig_a,
        };
        (a, b)
    }

    /// Send a message to the peer.
    pub fn send(&self, msg: Message) -> Result<(), ChannelError> {
        self.tx.send(msg).map_err(|_| ChannelError::PeerClosed)
    }

    /// Receive the next message. Returns `None` once the peer has closed and
    /// all queued messages were drained.
    pub async fn recv(&self) -> Option<Message> {
        self.rx.lock().await.recv().await
    }

    /// Receive with a bound. `None` timeout waits indefinitely.
    pub async fn recv_timeout(&self, timeout: Option<Duration>) -> Result<Option<Message>, ChannelError> {
        match timeout {
            None => Ok(self.recv().await),
            Some(t) => tokio::time::timeout(t, self.recv())
                .await
                .map_err(|_| ChannelError::TimedOut),
        }
    }

    /// Raise the readiness signal observed by the peer.
    pub fn signal_ready(&self) {
        self.ours.ready.store(true, Ordering::Release);
        self.ours.notify.notify_waiters();
    }

    /// Whether the peer has already signaled readiness.
    pub fn peer_ready(&self) -> bool {
        self.theirs.ready.load(Ordering::Acquire)
    }

    /// Whether every clone of the peer endpoint has been dropped.
    pub fn is_peer_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Whether `other` is a clone of this endpoint (same underlying pipe).
    pub fn same_channel(&self, other: &Channel) -> bool {
        self.tx.same_channel(&other.tx)
    }

    /// Wait until the peer signals readiness, it closes, or the bound
    /// expires. `None` timeout waits indefinitely.
    pub async fn wait_ready(&self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            if self.peer_ready() {
                return Ok(());
            }
            if self.is_peer_closed() {
                return Err(ChannelError::PeerClosed);
            }
            let notified = self.theirs.notify.notified();
            // The signal may have been raised between the check above and
            // registering the waiter.
            if self.peer_ready() {
                return Ok(());
            }
            match deadline {
                None => {
                    tokio::select! {
                        () = notified => {}
                        () = self.tx.closed() => return Err(ChannelError::PeerClosed),
                    }
                }
                Some(d) => {
                    tokio::select! {
                        () = notified => {}
                        () = self.tx.closed() => return Err(ChannelError::PeerClosed),
                        () = tokio::time::sleep_until(d) => return Err(ChannelError::TimedOut),
                    }
                }
            }
        }
    }
}

/// Endpoint identity: two channels are equal when they are clones of the
/// same endpoint.
impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.same_channel(other)
    }
}

impl Eq for Channel {}

/// An authorization token handle.
///
/// The token itself carries only an opaque identity; its association with a
/// node lives in the server's token table. Cloning a token models handle
/// duplication and does not extend the association's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u64);

impl Token {
    /// Wrap a raw token identity.
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// The opaque token identity.
    pub fn id(self) -> u64 {
        self.0
    }
}

/// The kinds of handle a message can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// A channel endpoint.
    Channel,
    /// An authorization token.
    Token,
    /// A shared read-only byte region (mmap result).
    Buffer,
}

/// A transferable capability accompanying a message.
#[derive(Debug, Clone)]
pub enum Handle {
    /// A channel endpoint.
    Channel(Channel),
    /// An authorization token.
    Token(Token),
    /// A shared read-only byte region (mmap result).
    Buffer(Arc<[u8]>),
}

impl Handle {
    /// The kind tag of this handle.
    pub fn kind(&self) -> HandleKind {
        match self {
            Handle::Channel(_) => HandleKind::Channel,
            Handle::Token(_) => HandleKind::Token,
            Handle::Buffer(_) => HandleKind::Buffer,
        }
    }

    /// Unwrap a channel handle.
    pub fn into_channel(self) -> Option<Channel> {
        match self {
            Handle::Channel(c) => Some(c),
            _ => None,
        }
    }

    /// Unwrap a token handle.
    pub fn into_token(self) -> Option<Token> {
        match self {
            Handle::Token(t) => Some(t),
            _ => None,
        }
    }
}
