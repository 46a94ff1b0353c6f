use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::bail;
use bytes::Bytes;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::ChatConfig;
use crate::messaging::frame::{Frame, FrameKind};
use crate::messaging::gap_recovery::{GapDecision, GapRecovery};
use crate::messaging::message_listener::PeerEvent;
use crate::messaging::message_store::{MessageStore, StoredMessage};
use crate::messaging::peer_registry::PeerRegistry;
use crate::messaging::sequence_tracker::{InboundCheck, SequenceTracker};

/// Everything that needs to be done as a consequence of a received frame. It is returned rather
///  than acted on so that I/O and calls to application code happen outside the protocol lock.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct DispatchOutcome {
    /// sequence id and (still encoded) payload of an accepted `text` frame
    pub delivered: Option<(u64, Bytes)>,
    /// datagrams to send back to the frame's sender
    pub replies: Vec<Bytes>,
    pub events: Vec<PeerEvent>,
}

#[derive(Debug, Default, Eq, PartialEq)]
pub struct KeepAliveRound {
    pub targets: Vec<SocketAddr>,
    pub events: Vec<PeerEvent>,
}

/// The protocol state machine. All state is per peer, and it is all in one place so that a single
///  lock keeps it consistent.
pub struct ProtocolState {
    config: Arc<ChatConfig>,
    registry: PeerRegistry,
    tracker: SequenceTracker,
    store: MessageStore,
    gaps: GapRecovery,
}

impl ProtocolState {
    pub fn new(config: Arc<ChatConfig>) -> ProtocolState {
        ProtocolState {
            registry: PeerRegistry::new(),
            tracker: SequenceTracker::new(),
            store: MessageStore::new(config.retransmit_buffer_capacity),
            gaps: GapRecovery::new(config.gap_backoff, config.max_gap_requests),
            config,
        }
    }

    pub fn add_peer(&mut self, peer: SocketAddr, now: Instant) -> bool {
        self.registry.add(peer, now)
    }

    /// This drops all sequence information for the peer as well
    pub fn remove_peer(&mut self, peer: SocketAddr) -> bool {
        self.tracker.forget(peer);
        self.store.forget(peer);
        self.gaps.forget(peer);
        self.registry.remove(peer)
    }

    pub fn on_frame(&mut self, from: SocketAddr, frame: Frame, now: Instant) -> DispatchOutcome {
        trace!("received {} frame #{} from {:?}", frame.kind, frame.sequence_id, from);

        let mut outcome = DispatchOutcome::default();
        if self.registry.touch(from, now) {
            debug!("peer {:?} is reachable again", from);
            outcome.events.push(PeerEvent::ReachabilityChanged { peer: from, is_reachable: true });
        }

        match frame.kind {
            FrameKind::Data => self.on_data(from, frame, &mut outcome),
            FrameKind::Request => self.on_request(from, &frame, &mut outcome),
            FrameKind::Unavailable => self.on_unavailable(from, &frame, &mut outcome),
            FrameKind::KeepAlive => self.on_keep_alive(from, &mut outcome),
        }
        outcome
    }

    fn on_data(&mut self, from: SocketAddr, frame: Frame, outcome: &mut DispatchOutcome) {
        if !self.registry.contains(from) {
            debug!("discarding message #{} from unregistered peer {:?}", frame.sequence_id, from);
            return;
        }

        match self.tracker.check_inbound(from, frame.sequence_id) {
            InboundCheck::Accept => {
                self.gaps.resolve(from, frame.sequence_id);
                outcome.delivered = Some((frame.sequence_id, frame.payload));
                self.request_pending_hole(from, outcome);
            }
            InboundCheck::Duplicate => {
                debug!("discarding duplicate message #{} from {:?}", frame.sequence_id, from);
            }
            InboundCheck::Gap { missing } => {
                debug!("message #{} from {:?} arrived before #{} - discarding it", frame.sequence_id, from, missing);
                self.on_gap(from, missing, outcome);
            }
        }
    }

    fn on_gap(&mut self, from: SocketAddr, missing: u64, outcome: &mut DispatchOutcome) {
        match self.gaps.on_gap(from, missing) {
            GapDecision::Request => {
                debug!("requesting message #{} from {:?}", missing, from);
                outcome.replies.push(Frame::request(missing).encode());
            }
            GapDecision::Suppress => {
                trace!("request for message #{} from {:?} was sent recently", missing, from);
            }
            GapDecision::Abandon => {
                outcome.events.push(PeerEvent::PeerUnreachable { peer: from, missing_sequence_id: missing });
            }
        }
    }

    /// Messages after a hole are discarded rather than buffered, so they need to be requested
    ///  once the hole is filled
    fn request_pending_hole(&mut self, from: SocketAddr, outcome: &mut DispatchOutcome) {
        if let Some(missing) = self.tracker.pending_hole(from) {
            self.on_gap(from, missing, outcome);
        }
    }

    fn on_request(&mut self, from: SocketAddr, frame: &Frame, outcome: &mut DispatchOutcome) {
        let requested = match frame.referenced_sequence_id() {
            Ok(id) => id,
            Err(e) => {
                warn!("request from {:?} has an invalid payload: {}", from, e);
                return;
            }
        };

        match self.store.get(from, requested) {
            Some(msg) => {
                debug!("re-sending message #{} to {:?}", requested, from);
                outcome.replies.push(msg.encoded.clone());
            }
            None => {
                debug!("retransmission miss: message #{} for {:?} is not buffered", requested, from);
                if self.config.send_unavailable_on_miss {
                    outcome.replies.push(Frame::unavailable(requested).encode());
                }
            }
        }
    }

    fn on_unavailable(&mut self, from: SocketAddr, frame: &Frame, outcome: &mut DispatchOutcome) {
        let lost = match frame.referenced_sequence_id() {
            Ok(id) => id,
            Err(e) => {
                warn!("unavailable reply from {:?} has an invalid payload: {}", from, e);
                return;
            }
        };

        if self.tracker.skip_past(from, lost) {
            warn!("message #{} from {:?} is lost - skipping it", lost, from);
            self.gaps.resolve(from, lost);
            outcome.events.push(PeerEvent::MessageLost { peer: from, sequence_id: lost });
            self.request_pending_hole(from, outcome);
        }
        else {
            debug!("ignoring stale unavailable reply for message #{} from {:?}", lost, from);
        }
    }

    /// A keep-alive gives an abandoned hole a fresh set of requests. For a hole that is still
    ///  being requested, it counts as one more gap-revealing event, so a lost request or resend
    ///  is retried on the keep-alive cadence even if the peer sends no further messages.
    fn on_keep_alive(&mut self, from: SocketAddr, outcome: &mut DispatchOutcome) {
        self.gaps.rearm(from);
        self.request_pending_hole(from, outcome);
    }

    /// Allocates the next sequence id for the peer and retains the encoded frame for re-sending.
    ///  A frame that does not fit into a datagram is rejected without using up a sequence id.
    pub fn prepare_data_frame(&mut self, peer: SocketAddr, payload: Bytes, now: Instant) -> anyhow::Result<(u64, Bytes)> {
        let sequence_id = self.tracker.state(peer).next_outbound_id;
        let frame = Frame::data(sequence_id, payload);
        let encoded = frame.encode();
        if encoded.len() > self.config.max_datagram_size {
            bail!("message for {:?} is {} bytes as a frame, exceeding the maximum datagram size of {}", peer, encoded.len(), self.config.max_datagram_size);
        }

        let allocated = self.tracker.next_outbound(peer);
        debug_assert_eq!(allocated, sequence_id);

        self.store.put(peer, StoredMessage {
            peer,
            sequence_id,
            header_kind: frame.kind,
            payload: frame.payload,
            sent_at: now,
            encoded: encoded.clone(),
        });
        Ok((sequence_id, encoded))
    }

    pub fn keep_alive_round(&mut self, now: Instant) -> KeepAliveRound {
        let events = self.registry.newly_silent(now, self.config.liveness_timeout)
            .into_iter()
            .map(|peer| {
                debug!("peer {:?} was silent for more than {:?}", peer, self.config.liveness_timeout);
                PeerEvent::ReachabilityChanged { peer, is_reachable: false }
            })
            .collect();

        KeepAliveRound {
            targets: self.registry.list(),
            events,
        }
    }
}

/// Shared access point to the protocol state, used by the receive loop, the keep-alive loop and
///  the send path concurrently
pub struct Dispatcher {
    state: RwLock<ProtocolState>,
}

impl Dispatcher {
    pub fn new(config: Arc<ChatConfig>) -> Dispatcher {
        Dispatcher {
            state: RwLock::new(ProtocolState::new(config)),
        }
    }

    pub async fn add_peer(&self, peer: SocketAddr) -> bool {
        self.state.write().await
            .add_peer(peer, Instant::now())
    }

    pub async fn remove_peer(&self, peer: SocketAddr) -> bool {
        self.state.write().await
            .remove_peer(peer)
    }

    pub async fn peers(&self) -> Vec<SocketAddr> {
        self.state.read().await
            .registry.list()
    }

    pub async fn is_reachable(&self, peer: SocketAddr) -> Option<bool> {
        self.state.read().await
            .registry.is_reachable(peer)
    }

    pub async fn prepare_data_frame(&self, peer: SocketAddr, payload: Bytes) -> anyhow::Result<(u64, Bytes)> {
        self.state.write().await
            .prepare_data_frame(peer, payload, Instant::now())
    }

    /// Undecodable datagrams are logged and dropped, resulting in an empty outcome
    pub async fn on_datagram(&self, from: SocketAddr, datagram: &[u8]) -> DispatchOutcome {
        let frame = match Frame::decode(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping datagram from {:?}: {}", from, e);
                return DispatchOutcome::default();
            }
        };

        self.state.write().await
            .on_frame(from, frame, Instant::now())
    }

    pub async fn keep_alive_round(&self) -> KeepAliveRound {
        self.state.write().await
            .keep_alive_round(Instant::now())
    }
}
