use std::io::ErrorKind;
use std::net::SocketAddr;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use bytes::Bytes;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{info, trace};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport is closed")]
    Closed,
}

impl TransportError {
    /// Some platforms report ICMP 'port unreachable' for an earlier send as an error on the next
    ///  receive. That says something about a peer, not about the local socket.
    pub fn is_peer_feedback(&self) -> bool {
        match self {
            TransportError::Io(e) => matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused),
            TransportError::Closed => false,
        }
    }
}

/// This is an abstraction over the datagram socket, introduced to facilitate testing without
///  real I/O. Datagrams are fire-and-forget: a send is never retried at this level.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, to: SocketAddr, datagram: &[u8]) -> Result<(), TransportError>;

    /// Waits for the next datagram. Dropping the returned future before it completes must not
    ///  lose a datagram.
    async fn recv(&self) -> Result<(Bytes, SocketAddr), TransportError>;

    fn local_addr(&self) -> SocketAddr;
}

pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    max_datagram_size: usize,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr, max_datagram_size: usize) -> anyhow::Result<UdpTransport> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        info!("bound UDP socket to {:?}", local_addr);

        Ok(UdpTransport {
            socket,
            local_addr,
            max_datagram_size,
        })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, to: SocketAddr, datagram: &[u8]) -> Result<(), TransportError> {
        trace!("UDP socket: sending {} bytes to {:?}", datagram.len(), to);
        self.socket.send_to(datagram, to).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<(Bytes, SocketAddr), TransportError> {
        // longer datagrams are truncated by the socket and subsequently fail to decode
        let mut buf = vec![0u8; self.max_datagram_size];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(len);
        trace!("UDP socket: received {} bytes from {:?}", len, from);
        Ok((Bytes::from(buf), from))
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
