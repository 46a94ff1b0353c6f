use std::net::SocketAddr;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PeerEvent {
    /// The peer no longer has a message, so it was skipped. Messages after it are delivered
    ///  normally.
    MessageLost { peer: SocketAddr, sequence_id: u64 },
    /// A missing message was requested repeatedly without success
    PeerUnreachable { peer: SocketAddr, missing_sequence_id: u64 },
    ReachabilityChanged { peer: SocketAddr, is_reachable: bool },
}

impl PeerEvent {
    pub fn peer(&self) -> SocketAddr {
        match self {
            PeerEvent::MessageLost { peer, .. } => *peer,
            PeerEvent::PeerUnreachable { peer, .. } => *peer,
            PeerEvent::ReachabilityChanged { peer, .. } => *peer,
        }
    }
}

/// The upward interface to application code. Messages from a given peer are passed to
///  `on_message` in the order of their sequence ids, each exactly once.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageListener: Send + Sync + 'static {
    async fn on_message(&self, sender: SocketAddr, payload: &[u8]);

    async fn on_peer_event(&self, event: PeerEvent);
}
