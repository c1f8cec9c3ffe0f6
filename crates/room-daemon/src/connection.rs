//! A single WebSocket link to another node or to a front-end client.
//!
//! Both ends send a [`Handshake`] first. A peer-role link is then registered
//! with the node as a [`WsPeerHandle`], so the node's outboxes can call
//! through it; a client-role link is only served.
//!
//! Inbound calls run on their own task. A link dropping mid-call must not
//! cancel a call halfway through the node's duplicate suppression, and a
//! slow player operation must not hold up the acknowledgments queued behind it.

use crate::message::{Frame, MAX_MESSAGE_SIZE};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use room_core::protocol::{Handshake, Role};
use room_core::transport::{self, PeerHandle, TransportError};
use room_core::{Node, PeerId, RemoteCall, Reply};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, error, info, warn};

/// How long the remote side has to send its handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// [`PeerHandle`] over an established link.
///
/// Replies are matched to calls by sequence number. Sequence numbers are
/// unique per caller, and only this side's calls are pending here.
pub struct WsPeerHandle {
    address: String,
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Pending,
    call_timeout: Duration,
}

impl WsPeerHandle {
    fn forget(&self, seq: u64) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&seq);
    }
}

#[async_trait]
impl PeerHandle for WsPeerHandle {
    async fn call(&self, call: RemoteCall) -> transport::Result<Reply> {
        let seq = call.seq;
        let (tx, rx) = oneshot::channel();
        // A retry reuses the seq and replaces the earlier waiter
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(seq, tx);

        let frame = Frame::Call(call).to_binary();
        if self.outgoing.send(Message::Binary(frame.into())).is_err() {
            self.forget(seq);
            return Err(TransportError::Closed);
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.forget(seq);
                Err(TransportError::Timeout(self.call_timeout))
            }
        }
    }

    fn describe(&self) -> String {
        format!("ws:{}", self.address)
    }
}

/// An established link, handshake done.
pub struct Link<S> {
    node: Arc<Node>,
    remote: Handshake,
    address: String,
    read: SplitStream<WebSocketStream<S>>,
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Pending,
    writer: JoinHandle<()>,
}

impl<S> Link<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Exchange handshakes and, for a peer, register the link with the node.
    ///
    /// With `expected` set, the remote side must identify as that peer.
    pub async fn establish(
        node: Arc<Node>,
        ws: WebSocketStream<S>,
        address: String,
        expected: Option<PeerId>,
        call_timeout: Duration,
    ) -> Result<Self> {
        let (mut write, mut read) = ws.split();

        let ours = Handshake::new(node.id(), node.name(), node.config().incarnation);
        write
            .send(Message::Binary(ours.to_json().into()))
            .await
            .with_context(|| format!("Failed to send handshake to {}", address))?;

        let remote = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_handshake(&mut read))
            .await
            .map_err(|_| anyhow!("No handshake from {} within {:?}", address, HANDSHAKE_TIMEOUT))??;
        if let Some(expected) = expected {
            if remote.peer_id != expected {
                let _ = write.close().await;
                bail!(
                    "Expected peer {} at {}, found {}",
                    expected,
                    address,
                    remote.peer_id
                );
            }
        }
        if remote.should_warn_version() {
            warn!(
                "Peer {} speaks protocol version {}, we speak {}",
                remote.peer_id,
                remote.version,
                room_core::protocol::PROTOCOL_VERSION
            );
        }

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(address.clone(), write, outgoing_rx));
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        if remote.role == Role::Peer {
            let handle = WsPeerHandle {
                address: address.clone(),
                outgoing: outgoing.clone(),
                pending: Arc::clone(&pending),
                call_timeout,
            };
            if let Err(e) = node.register_peer(remote.peer_id, &remote.name, Arc::new(handle)) {
                writer.abort();
                bail!("Refusing {} from {}: {}", remote.peer_id, address, e);
            }
        }
        info!(
            "Link to {} ({}, {:?}) established via {}",
            remote.peer_id, remote.name, remote.role, address
        );

        Ok(Self {
            node,
            remote,
            address,
            read,
            outgoing,
            pending,
            writer,
        })
    }

    /// The remote side's handshake.
    pub fn remote(&self) -> &Handshake {
        &self.remote
    }

    /// Pump frames until the link closes.
    pub async fn run(mut self) {
        loop {
            let data = match self.read.next().await {
                Some(Ok(Message::Binary(data))) => data.to_vec(),
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame from {}", self.address);
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection {} closed", self.address);
                        }
                        _ => error!("WebSocket error on {}: {}", self.address, e),
                    }
                    break;
                }
                None => {
                    debug!("Connection {} stream ended", self.address);
                    break;
                }
            };

            if data.len() > MAX_MESSAGE_SIZE {
                warn!(
                    "Frame from {} exceeds max size ({} > {}), dropping",
                    self.address,
                    data.len(),
                    MAX_MESSAGE_SIZE
                );
                continue;
            }

            match Frame::from_binary(&data) {
                Some(Frame::Call(call)) => self.serve(call),
                Some(Frame::Reply { seq, reply }) => {
                    let waiter = self
                        .pending
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&seq);
                    match waiter {
                        Some(waiter) => {
                            let _ = waiter.send(reply);
                        }
                        None => debug!("Late reply #{} from {}", seq, self.address),
                    }
                }
                None => warn!(
                    "Unrecognized frame from {} ({} bytes), dropping",
                    self.address,
                    data.len()
                ),
            }
        }

        // Callers still waiting see the link as closed
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.writer.abort();
        info!("Link to {} ({}) closed", self.remote.peer_id, self.address);
    }

    fn serve(&self, call: RemoteCall) {
        let seq = call.seq;
        if call.caller.peer != self.remote.peer_id {
            let reply = Reply::rejected(format!(
                "Caller {} does not match link peer {}",
                call.caller, self.remote.peer_id
            ));
            self.reply(seq, reply);
            return;
        }

        let node = Arc::clone(&self.node);
        let outgoing = self.outgoing.clone();
        tokio::spawn(async move {
            let reply = node.handle(call).await;
            let frame = Frame::Reply { seq, reply }.to_binary();
            let _ = outgoing.send(Message::Binary(frame.into()));
        });
    }

    fn reply(&self, seq: u64, reply: Reply) {
        let frame = Frame::Reply { seq, reply }.to_binary();
        let _ = self.outgoing.send(Message::Binary(frame.into()));
    }
}

/// Wait for the first data message and parse it as a handshake.
async fn read_handshake<S>(read: &mut SplitStream<WebSocketStream<S>>) -> Result<Handshake>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let data = match read.next().await {
            Some(Ok(Message::Binary(data))) => data.to_vec(),
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Close(_))) | None => bail!("Connection closed before handshake"),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e).context("WebSocket error during handshake"),
        };
        return Handshake::from_json(&data).ok_or_else(|| anyhow!("Expected a handshake"));
    }
}

async fn write_loop<S>(
    address: String,
    mut write: SplitSink<WebSocketStream<S>, Message>,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = outgoing.recv().await {
        if let Err(e) = write.send(message).await {
            warn!("Failed to write to {}: {}", address, e);
            break;
        }
    }
    let _ = write.close().await;
}
