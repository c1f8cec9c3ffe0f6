//! room-daemon: one player's node in a peer-to-peer word-game mesh.
//!
//! Listens for links from other nodes, dials the configured peers with a
//! higher id, and offers an interactive console on stdin.

use anyhow::{Context, Result};
use clap::Parser;
use room_core::{InMemoryScores, Node, PeerId, WordListPuzzle};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use room_daemon::config::{DaemonConfig, PeerAddress};
use room_daemon::console::run_console;
use room_daemon::outgoing::Dialer;
use room_daemon::server::GameServer;

#[derive(Parser, Debug)]
#[command(name = "room-daemon")]
#[command(about = "Peer-to-peer game room node")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Node id in hex (generated if not provided)
    #[arg(long)]
    id: Option<PeerId>,

    /// Player display name
    #[arg(short, long)]
    name: Option<String>,

    /// Address to listen on for incoming links
    #[arg(short, long)]
    listen: Option<String>,

    /// Peer to link with, as <id>=ws://host:port (repeatable)
    #[arg(long = "peer")]
    peers: Vec<PeerAddress>,

    /// Word list for hosted puzzles, one word per line
    #[arg(long)]
    words: Option<PathBuf>,

    /// Run without the interactive console
    #[arg(long)]
    headless: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    /// File configuration with command-line overrides applied.
    fn resolve(self) -> Result<(DaemonConfig, bool)> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::load(path)?,
            None => DaemonConfig::default(),
        };
        if let Some(id) = self.id {
            config.id = Some(id);
        }
        if let Some(name) = self.name {
            config.name = Some(name);
        }
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(words) = self.words {
            config.words = Some(words);
        }
        for peer in self.peers {
            config.peers.retain(|p| p.id != peer.id);
            config.peers.push(peer);
        }
        Ok((config, self.headless))
    }
}

fn load_puzzle(config: &DaemonConfig) -> Result<WordListPuzzle> {
    match &config.words {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read word list: {:?}", path))?;
            let puzzle = WordListPuzzle::from_text(&text);
            anyhow::ensure!(puzzle.word_count() > 0, "Word list {:?} is empty", path);
            info!("Loaded {} words from {:?}", puzzle.word_count(), path);
            Ok(puzzle)
        }
        None => Ok(WordListPuzzle::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,room_daemon=debug,room_core=debug"
    } else {
        "info,room_daemon=info,room_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (config, headless) = args.resolve()?;
    let name = config
        .name
        .clone()
        .context("A player name is required (--name or \"name\" in the config file)")?;
    let id = config.id.unwrap_or_else(|| {
        let id = PeerId::generate();
        info!("Generated node id: {}", id);
        id
    });

    info!("Starting room-daemon as {} ({})", name, id);
    let node = Node::spawn(
        config.node_config(id, &name),
        Arc::new(load_puzzle(&config)?),
        Arc::new(InMemoryScores::new()),
    )?;

    let call_timeout = config.timing.call_timeout();
    let server = GameServer::bind(Arc::clone(&node), &config.listen, call_timeout).await?;
    let server_task = tokio::spawn(server.run());

    let dialers: Vec<_> = config
        .dial_targets(id)
        .map(|peer| {
            info!("Linking to {} at {}", peer.id, peer.address);
            Dialer::new(
                Arc::clone(&node),
                peer.id,
                peer.address.clone(),
                config.timing.reconnect(),
                call_timeout,
            )
            .spawn()
        })
        .collect();

    if headless {
        info!("Running headless. Press Ctrl+C to stop.");
        tokio::signal::ctrl_c().await?;
        info!("Shutdown signal received");
    } else {
        tokio::select! {
            _ = run_console(Arc::clone(&node)) => {}
            _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
        }
    }

    info!("Shutting down");
    server_task.abort();
    for dialer in dialers {
        dialer.abort();
    }
    node.shutdown();
    Ok(())
}
