use std::cmp::max;
use std::net::SocketAddr;
use rustc_hash::FxHashMap;
use tracing::trace;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum InboundCheck {
    /// the expected message - it was registered as received
    Accept,
    /// a message that was received before
    Duplicate,
    /// there is at least one missing message before this one, and `missing` is the first of them
    Gap { missing: u64 },
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SequenceState {
    pub next_outbound_id: u64,
    pub next_expected_inbound_id: u64,
    /// the highest inbound id that was observed, whether it was accepted or not. If this is
    ///  not below `next_expected_inbound_id`, there is a hole that needs to be filled.
    pub highest_seen_inbound_id: u64,
}

impl Default for SequenceState {
    fn default() -> Self {
        SequenceState {
            next_outbound_id: 1,
            next_expected_inbound_id: 1,
            highest_seen_inbound_id: 0,
        }
    }
}

/// Per-peer sequence numbers, in both directions. Numbering starts at 1 for each peer, and
///  state for a peer is created on first use.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    states: FxHashMap<SocketAddr, SequenceState>,
}

impl SequenceTracker {
    pub fn new() -> SequenceTracker {
        Default::default()
    }

    pub fn state(&self, peer: SocketAddr) -> SequenceState {
        self.states.get(&peer)
            .cloned()
            .unwrap_or_default()
    }

    pub fn next_outbound(&mut self, peer: SocketAddr) -> u64 {
        let state = self.states.entry(peer).or_default();
        let result = state.next_outbound_id;
        state.next_outbound_id += 1;
        result
    }

    pub fn check_inbound(&mut self, peer: SocketAddr, id: u64) -> InboundCheck {
        let state = self.states.entry(peer).or_default();
        state.highest_seen_inbound_id = max(state.highest_seen_inbound_id, id);

        if id == state.next_expected_inbound_id {
            state.next_expected_inbound_id += 1;
            InboundCheck::Accept
        }
        else if id < state.next_expected_inbound_id {
            InboundCheck::Duplicate
        }
        else {
            trace!("gap from {:?}: expected #{}, received #{}", peer, state.next_expected_inbound_id, id);
            InboundCheck::Gap { missing: state.next_expected_inbound_id }
        }
    }

    /// Gives up on the expected message, moving on to the next one. This is done only if `id`
    ///  is actually the next expected id, returning `false` otherwise.
    pub fn skip_past(&mut self, peer: SocketAddr, id: u64) -> bool {
        match self.states.get_mut(&peer) {
            Some(state) if state.next_expected_inbound_id == id => {
                state.next_expected_inbound_id += 1;
                true
            }
            _ => false,
        }
    }

    /// the first missing id if a message after it was observed
    pub fn pending_hole(&self, peer: SocketAddr) -> Option<u64> {
        self.states.get(&peer)
            .filter(|s| s.highest_seen_inbound_id >= s.next_expected_inbound_id)
            .map(|s| s.next_expected_inbound_id)
    }

    pub fn forget(&mut self, peer: SocketAddr) {
        self.states.remove(&peer);
    }

    /// `true` if there is no state for any peer
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
