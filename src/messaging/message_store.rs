use std::collections::VecDeque;
use std::net::SocketAddr;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::trace;

use crate::messaging::frame::FrameKind;

/// A sent frame, retained so it can be re-sent on request
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StoredMessage {
    pub peer: SocketAddr,
    pub sequence_id: u64,
    pub header_kind: FrameKind,
    pub payload: Bytes,
    pub sent_at: Instant,
    /// the datagram exactly as it was sent
    pub encoded: Bytes,
}

/// Bounded per-peer retention of sent `text` frames. Sequence ids are issued in ascending order
///  per peer, so each peer's buffer is ordered by id, and eviction drops the lowest id.
#[derive(Debug)]
pub struct MessageStore {
    capacity_per_peer: usize,
    buffers: FxHashMap<SocketAddr, VecDeque<StoredMessage>>,
}

impl MessageStore {
    pub fn new(capacity_per_peer: usize) -> MessageStore {
        MessageStore {
            capacity_per_peer,
            buffers: Default::default(),
        }
    }

    pub fn put(&mut self, peer: SocketAddr, message: StoredMessage) {
        if !message.header_kind.is_sequenced() {
            trace!("not storing {} frame for {:?}", message.header_kind, peer);
            return;
        }

        let buffer = self.buffers.entry(peer).or_default();
        buffer.push_back(message);
        while buffer.len() > self.capacity_per_peer {
            if let Some(evicted) = buffer.pop_front() {
                trace!("evicting message #{} for {:?} from retransmit buffer", evicted.sequence_id, peer);
            }
        }
    }

    pub fn get(&self, peer: SocketAddr, sequence_id: u64) -> Option<&StoredMessage> {
        let buffer = self.buffers.get(&peer)?;
        let first_id = buffer.front()?.sequence_id;
        if sequence_id < first_id {
            return None;
        }

        // ids are contiguous in the common case, so try direct indexing first
        let idx = usize::try_from(sequence_id - first_id).ok()?;
        match buffer.get(idx) {
            Some(msg) if msg.sequence_id == sequence_id => Some(msg),
            _ => buffer.iter().find(|m| m.sequence_id == sequence_id),
        }
    }

    pub fn len(&self, peer: SocketAddr) -> usize {
        self.buffers.get(&peer)
            .map(|b| b.len())
            .unwrap_or(0)
    }

    pub fn forget(&mut self, peer: SocketAddr) {
        self.buffers.remove(&peer);
    }
}
