use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::anyhow;
use bytes::Bytes;
use tokio::select;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::ChatConfig;
use crate::messaging::dispatcher::Dispatcher;
use crate::messaging::keep_alive::KeepAliveScheduler;
use crate::messaging::message_listener::{MessageListener, PeerEvent};
use crate::messaging::payload_codec::PayloadCodec;
use crate::messaging::transport::{Transport, UdpTransport};
use crate::util::shutdown::shutdown_signalled;

/// ChatNode is the place where all parts of the protocol come together: It has an API for
///  application code to manage peers and send messages, and it runs the loops that receive
///  datagrams and send keep-alives.
pub struct ChatNode {
    config: Arc<ChatConfig>,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn PayloadCodec>,
    listener: Arc<dyn MessageListener>,
    dispatcher: Arc<Dispatcher>,
    /// held while allocating a sequence id and sending the frame, so frames for a peer are sent
    ///  in the order of their ids
    send_lock: Mutex<()>,
}

impl ChatNode {
    pub fn new(
        config: ChatConfig,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn PayloadCodec>,
        listener: Arc<dyn MessageListener>,
    ) -> anyhow::Result<Arc<ChatNode>> {
        config.validate()?;
        let config = Arc::new(config);

        Ok(Arc::new(ChatNode {
            dispatcher: Arc::new(Dispatcher::new(config.clone())),
            config,
            transport,
            codec,
            listener,
            send_lock: Mutex::new(()),
        }))
    }

    /// Creates a node with a UDP socket bound to the configured address
    pub async fn bind(
        config: ChatConfig,
        codec: Arc<dyn PayloadCodec>,
        listener: Arc<dyn MessageListener>,
    ) -> anyhow::Result<Arc<ChatNode>> {
        config.validate()?;
        let transport = UdpTransport::bind(config.self_addr, config.max_datagram_size).await?;
        Self::new(config, Arc::new(transport), codec, listener)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub async fn add_peer(&self, peer: SocketAddr) -> bool {
        self.dispatcher.add_peer(peer).await
    }

    pub async fn remove_peer(&self, peer: SocketAddr) -> bool {
        self.dispatcher.remove_peer(peer).await
    }

    pub async fn peers(&self) -> Vec<SocketAddr> {
        self.dispatcher.peers().await
    }

    pub async fn is_reachable(&self, peer: SocketAddr) -> Option<bool> {
        self.dispatcher.is_reachable(peer).await
    }

    /// Sends a message, returning the sequence id it was sent with. A transport error is returned
    ///  to the caller, but the message is retained nonetheless: the peer notices the gap with
    ///  the next message and requests it.
    pub async fn send_message(&self, peer: SocketAddr, plaintext: &[u8]) -> anyhow::Result<u64> {
        let payload = self.codec.encrypt(peer, plaintext)?;

        let _send_guard = self.send_lock.lock().await;
        let (sequence_id, datagram) = self.dispatcher.prepare_data_frame(peer, Bytes::from(payload)).await?;
        trace!("sending message #{} to {:?}", sequence_id, peer);
        self.transport.send(peer, &datagram).await?;
        Ok(sequence_id)
    }

    /// Sends a message to every registered peer, each with its own sequence id. A failure for one
    ///  peer does not affect the others.
    pub async fn broadcast(&self, plaintext: &[u8]) -> Vec<(SocketAddr, anyhow::Result<u64>)> {
        let mut result = Vec::new();
        for peer in self.peers().await {
            let outcome = self.send_message(peer, plaintext).await;
            if let Err(e) = &outcome {
                warn!("error sending message to {:?}: {}", peer, e);
            }
            result.push((peer, outcome));
        }
        result
    }

    /// Spawns the receive loop, the keep-alive loop and the delivery loop that passes received
    ///  messages and events on to the listener
    pub fn start(self: &Arc<Self>) -> RunningNode {
        let (shutdown_sender, shutdown_receiver) = watch::channel(false);
        let shutdown_sender = Arc::new(shutdown_sender);

        let keep_alive = KeepAliveScheduler::new(
            self.config.keep_alive_interval,
            self.dispatcher.clone(),
            self.transport.clone(),
            self.listener.clone(),
        );
        let keep_alive_shutdown = shutdown_receiver.clone();
        let keep_alive_loop = tokio::spawn(async move {
            keep_alive.run(keep_alive_shutdown).await
        });

        // the receive loop owns the only sender, so the delivery loop drains the queue and
        //  terminates after the receive loop is done
        let (deliveries, delivery_queue) = mpsc::channel(self.config.delivery_queue_capacity);
        let delivery_loop = tokio::spawn(Self::delivery_loop(self.listener.clone(), delivery_queue));

        let node = self.clone();
        let recv_shutdown_sender = shutdown_sender.clone();
        let recv_loop = tokio::spawn(async move {
            let result = node.recv_loop(shutdown_receiver, deliveries).await;
            // the keep-alive loop ends with the receive loop, whatever the reason
            recv_shutdown_sender.send_replace(true);
            result
        });

        RunningNode {
            node: self.clone(),
            shutdown_sender,
            recv_loop,
            keep_alive_loop,
            delivery_loop,
        }
    }

    async fn recv_loop(&self, mut shutdown: watch::Receiver<bool>, deliveries: mpsc::Sender<Delivery>) -> anyhow::Result<()> {
        info!("starting receive loop on {:?}", self.local_addr());

        loop {
            let received = select! {
                r = self.transport.recv() => r,
                _ = shutdown_signalled(&mut shutdown) => {
                    info!("receive loop shutting down");
                    return Ok(());
                }
            };

            match received {
                Ok((datagram, from)) => self.on_datagram(from, &datagram, &deliveries).await,
                Err(e) if e.is_peer_feedback() => {
                    debug!("ignoring receive error caused by a peer: {}", e);
                }
                Err(e) => {
                    error!("error receiving datagram - terminating receive loop: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    /// Replies are sent right away, while everything for the listener is queued
    async fn on_datagram(&self, from: SocketAddr, datagram: &[u8], deliveries: &mpsc::Sender<Delivery>) {
        let outcome = self.dispatcher.on_datagram(from, datagram).await;

        for reply in &outcome.replies {
            if let Err(e) = self.transport.send(from, reply).await {
                warn!("error sending reply to {:?}: {}", from, e);
            }
        }

        if let Some((sequence_id, payload)) = outcome.delivered {
            match self.codec.decrypt(from, &payload) {
                Ok(plaintext) => Self::enqueue(deliveries, Delivery::Message(from, plaintext)).await,
                Err(e) => warn!("dropping message #{} from {:?}: {}", sequence_id, from, e),
            }
        }

        for event in outcome.events {
            Self::enqueue(deliveries, Delivery::Event(event)).await;
        }
    }

    async fn enqueue(deliveries: &mpsc::Sender<Delivery>, delivery: Delivery) {
        if let Err(e) = deliveries.send(delivery).await {
            error!("delivery loop is gone - dropping {:?}", e.0);
        }
    }

    async fn delivery_loop(listener: Arc<dyn MessageListener>, mut delivery_queue: mpsc::Receiver<Delivery>) {
        while let Some(delivery) = delivery_queue.recv().await {
            match delivery {
                Delivery::Message(from, plaintext) => listener.on_message(from, &plaintext).await,
                Delivery::Event(event) => listener.on_peer_event(event).await,
            }
        }
        debug!("delivery loop terminated");
    }
}

#[derive(Debug)]
enum Delivery {
    Message(SocketAddr, Vec<u8>),
    Event(PeerEvent),
}

/// Handle to a started [ChatNode]
pub struct RunningNode {
    node: Arc<ChatNode>,
    shutdown_sender: Arc<watch::Sender<bool>>,
    recv_loop: JoinHandle<anyhow::Result<()>>,
    keep_alive_loop: JoinHandle<()>,
    delivery_loop: JoinHandle<()>,
}

impl RunningNode {
    pub fn node(&self) -> &Arc<ChatNode> {
        &self.node
    }

    /// Signals the loops to stop and waits for them to terminate. An error that terminated the
    ///  receive loop before is returned here.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        info!("shutting down node at {:?}", self.node.local_addr());
        self.shutdown_sender.send_replace(true);
        self.wait().await
    }

    /// Waits for the loops to terminate, which happens on shutdown or on a receive error. This
    ///  includes passing all queued messages and events to the listener.
    pub async fn wait(self) -> anyhow::Result<()> {
        let recv_result = self.recv_loop.await;
        if let Err(e) = self.keep_alive_loop.await {
            error!("keep-alive loop failed: {}", e);
        }
        if let Err(e) = self.delivery_loop.await {
            error!("delivery loop failed: {}", e);
        }
        recv_result.map_err(|e| anyhow!("receive loop failed: {}", e))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;
    use std::time::Duration;
    use async_trait::async_trait;
    use mockall::predicate::eq;
    use rstest::rstest;
    use tokio::runtime::Builder;
    use tokio::time::{sleep, timeout};
    use crate::messaging::frame::Frame;
    use crate::messaging::message_listener::{MockMessageListener, PeerEvent};
    use crate::messaging::payload_codec::{Aes256GcmCodec, NoEncryption};
    use crate::messaging::transport::{MockTransport, TransportError};
    use crate::test_util::{test_peer_addr, CollectingListener, MemoryNetwork, RecordingTransport};

    fn node_with(transport: Arc<dyn Transport>, listener: Arc<dyn MessageListener>) -> Arc<ChatNode> {
        ChatNode::new(ChatConfig::new(transport.local_addr()), transport, Arc::new(NoEncryption), listener).unwrap()
    }

    /// handles a datagram the way the receive loop does, and then passes everything queued for
    ///  the listener on to it
    async fn receive(node: &ChatNode, from: SocketAddr, datagram: &[u8]) {
        let (deliveries, delivery_queue) = mpsc::channel(16);
        node.on_datagram(from, datagram, &deliveries).await;
        drop(deliveries);
        ChatNode::delivery_loop(node.listener.clone(), delivery_queue).await;
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = ChatConfig::new(test_peer_addr(1));
        config.retransmit_buffer_capacity = 0;

        let result = ChatNode::new(config, Arc::new(RecordingTransport::new(test_peer_addr(1))), Arc::new(NoEncryption), Arc::new(CollectingListener::new()));
        assert!(result.is_err());
    }

    #[test]
    fn test_send_message() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let transport = Arc::new(RecordingTransport::new(test_peer_addr(1)));
            let node = node_with(transport.clone(), Arc::new(CollectingListener::new()));

            assert_eq!(node.send_message(test_peer_addr(2), b"hello").await.unwrap(), 1);
            assert_eq!(node.send_message(test_peer_addr(2), b"a|b").await.unwrap(), 2);
            assert_eq!(node.send_message(test_peer_addr(3), b"other").await.unwrap(), 1);

            assert_eq!(transport.sent_datagrams().await, vec![
                (test_peer_addr(2), Bytes::from_static(b"1|text|hello")),
                (test_peer_addr(2), Bytes::from_static(b"2|text|a|b")),
                (test_peer_addr(3), Bytes::from_static(b"1|text|other")),
            ]);
        });
    }

    #[test]
    fn test_send_oversized_message() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let transport = Arc::new(RecordingTransport::new(test_peer_addr(1)));
            let node = node_with(transport.clone(), Arc::new(CollectingListener::new()));

            assert!(node.send_message(test_peer_addr(2), &[b'x'; 1020]).await.is_err());
            assert!(transport.sent_datagrams().await.is_empty());
            assert_eq!(node.send_message(test_peer_addr(2), b"small").await.unwrap(), 1);
        });
    }

    #[test]
    fn test_send_error_is_returned() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let mut transport = MockTransport::new();
            transport.expect_local_addr()
                .return_const(test_peer_addr(1));
            transport.expect_send()
                .with(eq(test_peer_addr(2)), eq(b"1|text|hello".to_vec()))
                .times(1)
                .returning(|_, _| Err(TransportError::Io(ErrorKind::PermissionDenied.into())));
            transport.expect_send()
                .with(eq(test_peer_addr(2)), eq(b"2|text|again".to_vec()))
                .times(1)
                .returning(|_, _| Ok(()));

            let node = node_with(Arc::new(transport), Arc::new(MockMessageListener::new()));
            assert!(node.send_message(test_peer_addr(2), b"hello").await.is_err());
            assert_eq!(node.send_message(test_peer_addr(2), b"again").await.unwrap(), 2);
        });
    }

    #[test]
    fn test_send_without_session_key() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let transport = Arc::new(RecordingTransport::new(test_peer_addr(1)));
            let node = ChatNode::new(ChatConfig::new(test_peer_addr(1)), transport.clone(), Arc::new(Aes256GcmCodec::new()), Arc::new(CollectingListener::new())).unwrap();

            assert!(node.send_message(test_peer_addr(2), b"secret").await.is_err());
            assert!(transport.sent_datagrams().await.is_empty());
        });
    }

    #[rstest]
    #[case::no_peers(vec![], vec![])]
    #[case::two_peers(vec![2, 3], vec![(2, b"1|text|hi".to_vec()), (3, b"1|text|hi".to_vec())])]
    fn test_broadcast(#[case] peers: Vec<u16>, #[case] expected: Vec<(u16, Vec<u8>)>) {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async move {
            let transport = Arc::new(RecordingTransport::new(test_peer_addr(1)));
            let node = node_with(transport.clone(), Arc::new(CollectingListener::new()));
            for peer in peers {
                node.add_peer(test_peer_addr(peer)).await;
            }

            let result = node.broadcast(b"hi").await;
            assert!(result.iter().all(|(_, r)| r.is_ok()));

            let expected = expected.into_iter()
                .map(|(peer, datagram)| (test_peer_addr(peer), Bytes::from(datagram)))
                .collect::<Vec<_>>();
            assert_eq!(transport.sent_datagrams().await, expected);
        });
    }

    #[test]
    fn test_encrypted_exchange() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let network = MemoryNetwork::new();
            let key = Aes256GcmCodec::generate_session_key();

            let codec_a = Arc::new(Aes256GcmCodec::new());
            codec_a.install_session_key(test_peer_addr(2), &key).unwrap();
            let codec_b = Arc::new(Aes256GcmCodec::new());
            codec_b.install_session_key(test_peer_addr(1), &key).unwrap();

            let listener_b = Arc::new(CollectingListener::new());
            let a = ChatNode::new(ChatConfig::new(test_peer_addr(1)), Arc::new(network.transport(test_peer_addr(1)).await), codec_a, Arc::new(CollectingListener::new())).unwrap();
            let b = ChatNode::new(ChatConfig::new(test_peer_addr(2)), Arc::new(network.transport(test_peer_addr(2)).await), codec_b, listener_b.clone()).unwrap();
            b.add_peer(test_peer_addr(1)).await;
            let running_b = b.start();

            a.send_message(test_peer_addr(2), b"top secret | with delimiter").await.unwrap();
            assert!(listener_b.wait_for_messages(1, Duration::from_secs(5)).await);
            assert_eq!(listener_b.messages().await, vec![(test_peer_addr(1), b"top secret | with delimiter".to_vec())]);

            running_b.shutdown().await.unwrap();
        });
    }

    #[test]
    fn test_undecryptable_message_is_dropped() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let codec = Arc::new(Aes256GcmCodec::new());
            codec.install_session_key(test_peer_addr(2), &Aes256GcmCodec::generate_session_key()).unwrap();

            let mut listener = MockMessageListener::new();
            listener.expect_on_message().never();
            listener.expect_on_peer_event().never();

            let node = ChatNode::new(ChatConfig::new(test_peer_addr(1)), Arc::new(RecordingTransport::new(test_peer_addr(1))), codec, Arc::new(listener)).unwrap();
            node.add_peer(test_peer_addr(2)).await;
            receive(&node, test_peer_addr(2), &Frame::data(1, Bytes::from_static(b"not really encrypted at all")).encode()).await;
        });
    }

    #[test]
    fn test_replies_and_delivery() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let transport = Arc::new(RecordingTransport::new(test_peer_addr(1)));

            let mut listener = MockMessageListener::new();
            listener.expect_on_message()
                .with(eq(test_peer_addr(2)), eq(b"first".to_vec()))
                .times(1)
                .return_const(());
            listener.expect_on_peer_event()
                .with(eq(PeerEvent::MessageLost { peer: test_peer_addr(2), sequence_id: 2 }))
                .times(1)
                .return_const(());

            let node = node_with(transport.clone(), Arc::new(listener));
            node.add_peer(test_peer_addr(2)).await;

            receive(&node, test_peer_addr(2), b"1|text|first").await;
            receive(&node, test_peer_addr(2), b"1|text|first").await;
            receive(&node, test_peer_addr(2), b"3|text|third").await;
            assert_eq!(transport.sent_datagrams().await, vec![(test_peer_addr(2), Frame::request(2).encode())]);

            receive(&node, test_peer_addr(2), b"0|unavailable|2").await;
            assert_eq!(transport.sent_datagrams().await, vec![(test_peer_addr(2), Frame::request(3).encode())]);

            receive(&node, test_peer_addr(2), b"0|request|1").await;
            assert_eq!(transport.sent_datagrams().await, vec![(test_peer_addr(2), Frame::unavailable(1).encode())]);
        });
    }

    #[test]
    fn test_receive_error_terminates_both_loops() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let mut transport = MockTransport::new();
            transport.expect_local_addr()
                .return_const(test_peer_addr(1));
            transport.expect_send()
                .returning(|_, _| Ok(()));
            transport.expect_recv()
                .times(1)
                .returning(|| Err(TransportError::Io(ErrorKind::PermissionDenied.into())));

            let node = node_with(Arc::new(transport), Arc::new(CollectingListener::new()));
            node.add_peer(test_peer_addr(2)).await;
            let running = node.start();

            sleep(Duration::from_secs(1)).await;
            assert!(running.recv_loop.is_finished());
            assert!(running.keep_alive_loop.is_finished());
            assert!(running.delivery_loop.is_finished());

            let result = running.wait().await;
            assert!(result.is_err());
        });
    }

    #[test]
    fn test_peer_feedback_does_not_terminate_receive_loop() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let mut seq = mockall::Sequence::new();
            let mut transport = MockTransport::new();
            transport.expect_local_addr()
                .return_const(test_peer_addr(1));
            transport.expect_recv()
                .times(1)
                .in_sequence(&mut seq)
                .returning(|| Err(TransportError::Io(ErrorKind::ConnectionRefused.into())));
            transport.expect_recv()
                .times(1)
                .in_sequence(&mut seq)
                .returning(|| Err(TransportError::Closed));

            let node = node_with(Arc::new(transport), Arc::new(CollectingListener::new()));
            let running = node.start();

            let result = running.wait().await;
            assert!(result.unwrap_err().to_string().contains("closed"));
        });
    }

    /// takes an hour to process each message
    struct SlowListener {
        delivered: CollectingListener,
    }

    #[async_trait]
    impl MessageListener for SlowListener {
        async fn on_message(&self, sender: SocketAddr, payload: &[u8]) {
            sleep(Duration::from_secs(3600)).await;
            self.delivered.on_message(sender, payload).await;
        }

        async fn on_peer_event(&self, event: PeerEvent) {
            self.delivered.on_peer_event(event).await;
        }
    }

    #[test]
    fn test_slow_listener_does_not_delay_replies() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let network = MemoryNetwork::new();
            let listener = Arc::new(SlowListener { delivered: CollectingListener::new() });
            let node = node_with(Arc::new(network.transport(test_peer_addr(1)).await), listener.clone());
            let peer_2 = network.transport(test_peer_addr(2)).await;
            let peer_3 = network.transport(test_peer_addr(3)).await;
            node.add_peer(test_peer_addr(2)).await;

            node.send_message(test_peer_addr(3), b"for three").await.unwrap();
            assert_eq!(peer_3.recv().await.unwrap(), (Bytes::from_static(b"1|text|for three"), test_peer_addr(1)));

            let running = node.start();
            peer_2.send(test_peer_addr(1), b"1|text|hello").await.unwrap();
            sleep(Duration::from_millis(100)).await;

            // the listener is still busy with the message from peer 2
            peer_3.send(test_peer_addr(1), b"0|request|1").await.unwrap();
            let reply = timeout(Duration::from_secs(1), peer_3.recv()).await;
            assert_eq!(reply.unwrap().unwrap(), (Bytes::from_static(b"1|text|for three"), test_peer_addr(1)));
            assert!(listener.delivered.messages().await.is_empty());

            running.shutdown().await.unwrap();
            assert_eq!(listener.delivered.messages().await, vec![(test_peer_addr(2), b"hello".to_vec())]);
        });
    }

    #[test]
    fn test_shutdown() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let transport = Arc::new(RecordingTransport::new(test_peer_addr(1)));
            let node = node_with(transport.clone(), Arc::new(CollectingListener::new()));
            node.add_peer(test_peer_addr(2)).await;
            let running = node.start();

            sleep(Duration::from_secs(15)).await;
            running.shutdown().await.unwrap();
            assert_eq!(transport.sent_datagrams().await.len(), 2);

            sleep(Duration::from_secs(60)).await;
            assert!(transport.sent_datagrams().await.is_empty());
        });
    }
}
