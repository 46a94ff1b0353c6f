use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;

use crate::util::exponential_backoff::BackoffConfig;

#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// The address the node's UDP socket is bound to. Peers send their datagrams here.
    pub self_addr: SocketAddr,

    /// This is the receive buffer size, i.e. the biggest datagram that is accepted without
    ///  truncation. Outgoing frames are checked against this limit as well since there is no
    ///  fragmentation: a message that does not fit into a single datagram cannot be sent.
    pub max_datagram_size: usize,

    pub keep_alive_interval: Duration,
    /// A peer that was not heard from for this long is reported as unreachable. This should be
    ///  a small multiple of the peers' keep-alive interval.
    pub liveness_timeout: Duration,

    /// This is the maximum number of sent messages *per peer* that are retained for re-sending.
    ///  Requests for older messages are answered with an `unavailable` frame.
    pub retransmit_buffer_capacity: usize,

    /// Rate limiting for repeated requests for the same missing message: after the first
    ///  request, the number of gap-revealing frames (out-of-order messages and keep-alives) between
    ///  requests grows exponentially.
    pub gap_backoff: BackoffConfig,
    /// After this many requests for the same missing message, the peer is reported as
    ///  unreachable and requests are suspended until a keep-alive arrives from the peer.
    pub max_gap_requests: u32,

    /// Reply to a request for a message that is no longer buffered with an explicit
    ///  `unavailable` frame rather than ignoring it
    pub send_unavailable_on_miss: bool,

    /// Received messages and peer events are queued for the listener so that a slow listener
    ///  does not hold up the receive loop. When the queue is full, the receive loop waits.
    pub delivery_queue_capacity: usize,
}

impl ChatConfig {
    pub fn new(self_addr: SocketAddr) -> ChatConfig {
        ChatConfig {
            self_addr,
            max_datagram_size: 1024,
            keep_alive_interval: Duration::from_secs(10),
            liveness_timeout: Duration::from_secs(30),
            retransmit_buffer_capacity: 1024,
            gap_backoff: BackoffConfig::default(),
            max_gap_requests: 5,
            send_unavailable_on_miss: true,
            delivery_queue_capacity: 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_size < 64 {
            bail!("max datagram size is too small: {}", self.max_datagram_size);
        }
        if self.max_datagram_size > 65507 {
            bail!("max datagram size exceeds what fits into a UDP packet: {}", self.max_datagram_size);
        }
        if self.keep_alive_interval.is_zero() {
            bail!("keep-alive interval must not be zero");
        }
        if self.liveness_timeout < self.keep_alive_interval {
            bail!("liveness timeout {:?} is shorter than the keep-alive interval {:?}", self.liveness_timeout, self.keep_alive_interval);
        }
        if self.retransmit_buffer_capacity == 0 {
            bail!("retransmit buffer capacity must be at least 1");
        }
        if self.delivery_queue_capacity == 0 {
            bail!("delivery queue capacity must be at least 1");
        }
        if self.max_gap_requests == 0 {
            bail!("max gap requests must be at least 1");
        }
        self.gap_backoff.validate()?;

        Ok(())
    }
}
