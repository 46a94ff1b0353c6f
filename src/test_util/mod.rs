//! This module contains utilities for testing code based on the messaging core: an in-memory
//!  datagram network with configurable loss, a transport that only records what is sent, and a
//!  listener that collects what is delivered. They are used for testing the crate itself, but
//!  they are also exported for application testing.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

use crate::messaging::message_listener::{MessageListener, PeerEvent};
use crate::messaging::transport::{Transport, TransportError};

/// convenience method for unit test code: create a localhost [SocketAddr] based on a number, the
///  same number generating the same address and different numbers different addresses
pub fn test_peer_addr(number: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, number))
}

/// A [Transport] that records sent datagrams and never receives anything
pub struct RecordingTransport {
    local_addr: SocketAddr,
    sent: RwLock<Vec<(SocketAddr, Bytes)>>,
}
impl RecordingTransport {
    pub fn new(local_addr: SocketAddr) -> Self {
        RecordingTransport {
            local_addr,
            sent: Default::default(),
        }
    }

    /// returns sent datagrams, clearing the internal buffer
    pub async fn sent_datagrams(&self) -> Vec<(SocketAddr, Bytes)> {
        let mut lock = self.sent.write().await;
        std::mem::take(&mut *lock)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, to: SocketAddr, datagram: &[u8]) -> Result<(), TransportError> {
        self.sent.write().await.push((to, Bytes::copy_from_slice(datagram)));
        Ok(())
    }

    async fn recv(&self) -> Result<(Bytes, SocketAddr), TransportError> {
        std::future::pending().await
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// A [MessageListener] that collects everything it is passed
#[derive(Default)]
pub struct CollectingListener {
    messages: RwLock<Vec<(SocketAddr, Vec<u8>)>>,
    events: RwLock<Vec<PeerEvent>>,
}
impl CollectingListener {
    pub fn new() -> Self {
        Default::default()
    }

    pub async fn messages(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.messages.read().await.clone()
    }

    pub async fn events(&self) -> Vec<PeerEvent> {
        self.events.read().await.clone()
    }

    /// waits until at least `n` messages were received, returning `false` on timeout
    pub async fn wait_for_messages(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.messages.read().await.len() >= n {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        self.messages.read().await.len() >= n
    }
}

#[async_trait]
impl MessageListener for CollectingListener {
    async fn on_message(&self, sender: SocketAddr, payload: &[u8]) {
        self.messages.write().await.push((sender, payload.to_vec()));
    }

    async fn on_peer_event(&self, event: PeerEvent) {
        self.events.write().await.push(event);
    }
}

type DatagramFilter = Box<dyn FnMut(SocketAddr, SocketAddr, &[u8]) -> bool + Send>;

/// An in-memory datagram network connecting [MemoryTransport]s. Like UDP, datagrams to unknown
///  addresses vanish silently. A filter decides for every datagram whether it is delivered, which
///  allows simulating loss.
pub struct MemoryNetwork {
    inboxes: RwLock<FxHashMap<SocketAddr, mpsc::UnboundedSender<(Bytes, SocketAddr)>>>,
    filter: Mutex<DatagramFilter>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<MemoryNetwork> {
        Arc::new(MemoryNetwork {
            inboxes: Default::default(),
            filter: Mutex::new(Box::new(|_: SocketAddr, _: SocketAddr, _: &[u8]| true)),
        })
    }

    pub async fn transport(self: &Arc<Self>, addr: SocketAddr) -> MemoryTransport {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inboxes.write().await.insert(addr, sender);
        MemoryTransport {
            network: self.clone(),
            addr,
            inbox: Mutex::new(receiver),
        }
    }

    /// `filter` is called with sender, recipient and datagram, and it returns `true` if the
    ///  datagram should be delivered
    pub async fn set_filter(&self, filter: impl FnMut(SocketAddr, SocketAddr, &[u8]) -> bool + Send + 'static) {
        *self.filter.lock().await = Box::new(filter);
    }

    /// drops the first datagram for which `matching` returns `true`, delivering everything else
    pub async fn drop_once(&self, matching: impl Fn(SocketAddr, SocketAddr, &[u8]) -> bool + Send + 'static) {
        let mut dropped = false;
        self.set_filter(move |from, to, datagram| {
            if !dropped && matching(from, to, datagram) {
                dropped = true;
                return false;
            }
            true
        }).await;
    }

    /// Disconnects the transport at `addr`: its pending `recv` fails with [TransportError::Closed]
    pub async fn close(&self, addr: SocketAddr) {
        self.inboxes.write().await.remove(&addr);
    }

    async fn deliver(&self, from: SocketAddr, to: SocketAddr, datagram: &[u8]) {
        let mut filter = self.filter.lock().await;
        if !(*filter)(from, to, datagram) {
            debug!("memory network: dropping datagram {:?} -> {:?}: {:?}", from, to, String::from_utf8_lossy(datagram));
            return;
        }

        match self.inboxes.read().await.get(&to) {
            Some(inbox) => {
                trace!("memory network: {:?} -> {:?}: {:?}", from, to, String::from_utf8_lossy(datagram));
                let _ = inbox.send((Bytes::copy_from_slice(datagram), from));
            }
            None => {
                trace!("memory network: no transport at {:?}", to);
            }
        }
    }
}

pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    addr: SocketAddr,
    inbox: Mutex<mpsc::UnboundedReceiver<(Bytes, SocketAddr)>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, to: SocketAddr, datagram: &[u8]) -> Result<(), TransportError> {
        self.network.deliver(self.addr, to, datagram).await;
        Ok(())
    }

    async fn recv(&self) -> Result<(Bytes, SocketAddr), TransportError> {
        self.inbox.lock().await
            .recv().await
            .ok_or(TransportError::Closed)
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}
