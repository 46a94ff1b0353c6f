pub mod chat_node;
pub mod dispatcher;
pub mod frame;
pub mod gap_recovery;
pub mod keep_alive;
pub mod message_listener;
pub mod message_store;
pub mod payload_codec;
pub mod peer_registry;
pub mod sequence_tracker;
pub mod transport;
