use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::messaging::dispatcher::Dispatcher;
use crate::messaging::frame::Frame;
use crate::messaging::message_listener::MessageListener;
use crate::messaging::transport::Transport;
use crate::util::shutdown::shutdown_signalled;

/// Periodically sends a `keep_alive` frame to every registered peer, and reports peers that were
///  silent for too long as unreachable
pub struct KeepAliveScheduler {
    interval: Duration,
    dispatcher: Arc<Dispatcher>,
    transport: Arc<dyn Transport>,
    listener: Arc<dyn MessageListener>,
}

impl KeepAliveScheduler {
    pub fn new(interval: Duration, dispatcher: Arc<Dispatcher>, transport: Arc<dyn Transport>, listener: Arc<dyn MessageListener>) -> KeepAliveScheduler {
        KeepAliveScheduler {
            interval,
            dispatcher,
            transport,
            listener,
        }
    }

    /// The first round is immediate, subsequent rounds follow at the configured interval
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("starting keep-alive loop with interval {:?}", self.interval);

        let mut ticks = interval(self.interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = ticks.tick() => self.do_round().await,
                _ = shutdown_signalled(&mut shutdown) => break,
            }
        }
        info!("keep-alive loop terminated");
    }

    pub async fn do_round(&self) {
        let round = self.dispatcher.keep_alive_round().await;
        debug!("sending keep-alive to {} peers", round.targets.len());

        let datagram = Frame::keep_alive().encode();
        for peer in round.targets {
            if let Err(e) = self.transport.send(peer, &datagram).await {
                warn!("error sending keep-alive to {:?}: {}", peer, e);
            }
        }

        for event in round.events {
            self.listener.on_peer_event(event).await;
        }
    }
}
