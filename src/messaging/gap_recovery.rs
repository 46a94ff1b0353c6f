use std::net::SocketAddr;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::util::exponential_backoff::{BackoffConfig, ExponentialBackoff};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum GapDecision {
    /// send a request for the missing message
    Request,
    /// a request was sent recently, so nothing is done
    Suppress,
    /// the maximum number of requests was sent without the hole being filled: give up on the
    ///  peer until there is a sign of life from it
    Abandon,
}

#[derive(Debug)]
struct GapState {
    missing_id: u64,
    backoff: ExponentialBackoff,
    requests_sent: u32,
    abandoned: bool,
}

/// Rate limiting for requests of missing messages. Every out-of-order message and every
///  keep-alive from the peer reveals the same hole, and requesting it on each of them would flood
///  a peer that is unable to fill it.
#[derive(Debug)]
pub struct GapRecovery {
    backoff_config: BackoffConfig,
    max_requests: u32,
    gaps: FxHashMap<SocketAddr, GapState>,
}

impl GapRecovery {
    pub fn new(backoff_config: BackoffConfig, max_requests: u32) -> GapRecovery {
        GapRecovery {
            backoff_config,
            max_requests,
            gaps: Default::default(),
        }
    }

    pub fn on_gap(&mut self, peer: SocketAddr, missing_id: u64) -> GapDecision {
        if let Some(state) = self.gaps.get_mut(&peer) {
            if state.missing_id == missing_id {
                if state.abandoned {
                    return GapDecision::Suppress;
                }
                if !state.backoff.should_fire(false) {
                    return GapDecision::Suppress;
                }
                if state.requests_sent >= self.max_requests {
                    warn!("message #{} from {:?} is still missing after {} requests - giving up", missing_id, peer, state.requests_sent);
                    state.abandoned = true;
                    return GapDecision::Abandon;
                }
                state.requests_sent += 1;
                debug!("requesting message #{} from {:?} again (request #{})", missing_id, peer, state.requests_sent);
                return GapDecision::Request;
            }
        }

        let mut backoff = ExponentialBackoff::new(self.backoff_config);
        let _ = backoff.should_fire(true);
        self.gaps.insert(peer, GapState {
            missing_id,
            backoff,
            requests_sent: 1,
            abandoned: false,
        });
        GapDecision::Request
    }

    /// A message was accepted (or skipped), so holes up to its id are filled
    pub fn resolve(&mut self, peer: SocketAddr, filled_id: u64) {
        if self.gaps.get(&peer).map(|s| s.missing_id <= filled_id).unwrap_or(false) {
            self.gaps.remove(&peer);
        }
    }

    /// The peer is alive, so an abandoned hole gets a fresh set of requests. Returns `true` if
    ///  there was an abandoned hole.
    pub fn rearm(&mut self, peer: SocketAddr) -> bool {
        if self.is_abandoned(peer) {
            debug!("re-arming gap recovery for {:?}", peer);
            self.gaps.remove(&peer);
            true
        }
        else {
            false
        }
    }

    pub fn is_abandoned(&self, peer: SocketAddr) -> bool {
        self.gaps.get(&peer)
            .map(|s| s.abandoned)
            .unwrap_or(false)
    }

    pub fn forget(&mut self, peer: SocketAddr) {
        self.gaps.remove(&peer);
    }

    pub fn is_empty(&self) -> bool {
        self.gaps.is_empty()
    }
}
