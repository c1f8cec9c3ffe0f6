//! WebSocket listener for incoming links.
//!
//! Every accepted connection is upgraded, handshaken and pumped on its own
//! task; the accept loop never waits on a peer.

use crate::connection::Link;
use anyhow::{Context, Result};
use room_core::Node;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};

pub struct GameServer {
    node: Arc<Node>,
    listener: TcpListener,
    call_timeout: Duration,
}

impl GameServer {
    /// Bind to an address.
    pub async fn bind(node: Arc<Node>, listen_addr: &str, call_timeout: Duration) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("Failed to listen on {}", listen_addr))?;
        info!("WebSocket server listening on {}", listener.local_addr()?);
        Ok(Self {
            node,
            listener,
            call_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever.
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let node = Arc::clone(&self.node);
                    tokio::spawn(accept_connection(node, stream, addr, self.call_timeout));
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            }
        }
    }
}

async fn accept_connection(node: Arc<Node>, stream: TcpStream, addr: SocketAddr, call_timeout: Duration) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            // Health checks (like `nc -z`) connect and immediately close without
            // completing the WebSocket handshake. Log these as debug, not error.
            let err_str = e.to_string();
            if err_str.contains("Handshake not finished")
                || err_str.contains("Connection reset")
                || err_str.contains("unexpected EOF")
            {
                debug!("Connection closed before handshake from {}", addr);
            } else {
                error!("WebSocket upgrade failed for {}: {}", addr, e);
            }
            return;
        }
    };

    debug!("New connection from {}", addr);
    match Link::establish(node, ws_stream, addr.to_string(), None, call_timeout).await {
        Ok(link) => link.run().await,
        Err(e) => warn!("Dropping connection from {}: {:#}", addr, e),
    }
}
