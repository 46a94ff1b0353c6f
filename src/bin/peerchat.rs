use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use clap::Parser;
use clap_derive::Parser;
use peerchat::config::ChatConfig;
use peerchat::messaging::chat_node::ChatNode;
use peerchat::messaging::message_listener::{MessageListener, PeerEvent};
use peerchat::messaging::payload_codec::NoEncryption;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tracing::{info, warn, Level};

#[derive(Parser)]
struct Args {
    bind_address: String,

    #[clap(long)]
    peer: Vec<String>,

    /// file with one peer address (`ip:port`) per line
    #[clap(long)]
    peers_file: Option<String>,

    #[clap(long)]
    keep_alive_secs: Option<u64>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

struct ConsoleListener;

#[async_trait]
impl MessageListener for ConsoleListener {
    async fn on_message(&self, sender: SocketAddr, payload: &[u8]) {
        println!("[{}] {}", sender, String::from_utf8_lossy(payload));
    }

    async fn on_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::MessageLost { peer, sequence_id } => println!("*** message #{} from {} was lost", sequence_id, peer),
            PeerEvent::PeerUnreachable { peer, missing_sequence_id } => println!("*** {} does not respond to requests for message #{}", peer, missing_sequence_id),
            PeerEvent::ReachabilityChanged { peer, is_reachable: true } => println!("*** {} is reachable", peer),
            PeerEvent::ReachabilityChanged { peer, is_reachable: false } => println!("*** {} is unreachable", peer),
        }
    }
}

fn parse_peers(lines: &str) -> anyhow::Result<Vec<SocketAddr>> {
    lines.lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| l.parse::<SocketAddr>().with_context(|| format!("invalid peer address {:?}", l)))
        .collect()
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();

    let mut peers = Vec::new();
    for p in &args.peer {
        let peer: SocketAddr = p.parse()?;
        peers.push(peer);
    }
    if let Some(peers_file) = &args.peers_file {
        let content = tokio::fs::read_to_string(peers_file).await
            .with_context(|| format!("reading peers file {}", peers_file))?;
        peers.extend(parse_peers(&content)?);
    }
    if peers.is_empty() {
        warn!("starting without peers - nothing will be sent");
    }

    let mut config = ChatConfig::new(args.bind_address.parse()?);
    if let Some(secs) = args.keep_alive_secs {
        config.keep_alive_interval = Duration::from_secs(secs);
        config.liveness_timeout = config.keep_alive_interval * 3;
    }

    let node = ChatNode::bind(config, Arc::new(NoEncryption), Arc::new(ConsoleListener)).await?;
    for peer in peers {
        node.add_peer(peer).await;
    }
    let running = node.start();
    info!("chatting on {:?} - type a line to send it to all peers", node.local_addr());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => {
                        for (peer, result) in node.broadcast(line.as_bytes()).await {
                            if let Err(e) = result {
                                println!("*** sending to {} failed: {}", peer, e);
                            }
                        }
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    running.shutdown().await
        .map_err(|e| anyhow!("node terminated with an error: {}", e))
}
