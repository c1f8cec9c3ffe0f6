//! Outgoing peer links.
//!
//! A dialer owns the link to one configured peer: it connects, hands the
//! socket to [`Link`], and reconnects with exponential backoff whenever the
//! link drops.

use crate::connection::Link;
use anyhow::Result;
use room_core::{Node, PeerId};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, MaybeTlsStream};
use tracing::{debug, info, warn};

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before first reconnect attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum number of attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_attempts: None, // Unlimited
        }
    }
}

/// Calculates the next reconnection delay using exponential backoff.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// Consecutive failed attempts to reach one peer.
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    pub attempts: u32,
}

impl ReconnectState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a failed attempt and return how long to wait before the next.
    pub fn schedule_reconnect(&mut self, config: &ReconnectConfig) -> Duration {
        self.attempts += 1;
        calculate_backoff(self.attempts, config)
    }

    /// Reset state after successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Check if max attempts exceeded.
    pub fn exceeded_max_attempts(&self, config: &ReconnectConfig) -> bool {
        config
            .max_attempts
            .map(|max| self.attempts >= max)
            .unwrap_or(false)
    }
}

/// Keeps one outgoing link to a configured peer alive.
pub struct Dialer {
    node: Arc<Node>,
    peer: PeerId,
    address: String,
    reconnect: ReconnectConfig,
    call_timeout: Duration,
}

impl Dialer {
    pub fn new(
        node: Arc<Node>,
        peer: PeerId,
        address: String,
        reconnect: ReconnectConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            node,
            peer,
            address,
            reconnect,
            call_timeout,
        }
    }

    /// Run the dial loop on its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Connect and complete the handshake once.
    pub async fn connect(&self) -> Result<Link<MaybeTlsStream<TcpStream>>> {
        let (ws, _) = connect_async(&self.address).await?;
        Link::establish(
            Arc::clone(&self.node),
            ws,
            self.address.clone(),
            Some(self.peer),
            self.call_timeout,
        )
        .await
    }

    async fn run(self) {
        let mut state = ReconnectState::new();
        loop {
            match self.connect().await {
                Ok(link) => {
                    state.reset();
                    link.run().await;
                    info!("Lost link to {} at {}", self.peer, self.address);
                }
                Err(e) => debug!("Failed to connect to {} at {}: {}", self.peer, self.address, e),
            }

            if state.exceeded_max_attempts(&self.reconnect) {
                warn!(
                    "Giving up on {} at {} after {} attempts",
                    self.peer, self.address, state.attempts
                );
                break;
            }
            let delay = state.schedule_reconnect(&self.reconnect);
            info!(
                "Reconnecting to {} in {:?} (attempt {})",
                self.address, delay, state.attempts
            );
            tokio::time::sleep(delay).await;
        }
    }
}
