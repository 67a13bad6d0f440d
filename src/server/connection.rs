//! Terminal gateway connection
//!
//! One client socket bound to one session handle. The connection claims the
//! session, streams output and input until something ends it, and reports why.

use std::sync::Arc;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ClientMessage, OutputEncoder, ServerMessage};
use crate::monitor::ActivityMonitor;
use crate::pty::PtyEvent;
use crate::session::{Claim, ConnectionId, EvictionNotice, OwnershipRegistry, SessionHandle};

/// Lifecycle of a gateway connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Attaching,
    Ready,
    Disconnected,
    Replaced,
}

/// Why a connection ended without being replaced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client closed the socket
    ClientClosed,
    /// The attach process exited with this code
    ProcessExited(i32),
    /// Server shutdown
    Shutdown,
    /// Claiming the session failed
    AttachFailed(String),
    /// Sending to or reading from the socket failed
    TransportError(String),
}

/// Final result of a gateway connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutcome {
    Disconnected(DisconnectReason),
    Replaced,
}

/// A client attached to one session
pub struct TerminalConnection {
    id: ConnectionId,
    session: String,
    state: ConnectionState,
    registry: Arc<OwnershipRegistry>,
    monitor: Arc<ActivityMonitor>,
}

impl TerminalConnection {
    /// Create a connection for `session`, not yet attached
    pub fn new(
        session: impl Into<String>,
        registry: Arc<OwnershipRegistry>,
        monitor: Arc<ActivityMonitor>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session: session.into(),
            state: ConnectionState::Connecting,
            registry,
            monitor,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Drive the connection to completion
    ///
    /// A replaced connection neither kills the handle nor releases ownership:
    /// the registry already did both on behalf of the new owner.
    pub async fn run<S>(
        mut self,
        ws: WebSocketStream<S>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> ConnectionOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut sender, mut receiver) = ws.split();

        self.state = ConnectionState::Attaching;
        let claim = match self.registry.claim(&self.session, self.id).await {
            Ok(claim) => claim,
            Err(e) => {
                warn!("Attach to session {} failed: {}", self.session, e);
                let _ = send_message(&mut sender, &ServerMessage::error(e.to_string())).await;
                let _ = sender.send(Message::Close(None)).await;
                self.state = ConnectionState::Disconnected;
                return ConnectionOutcome::Disconnected(DisconnectReason::AttachFailed(
                    e.to_string(),
                ));
            }
        };

        let Claim {
            handle,
            mut events,
            evicted,
        } = claim;
        self.state = ConnectionState::Ready;
        info!("Connection {} attached to session {}", self.id, self.session);

        let outcome = self
            .stream(
                &mut sender,
                &mut receiver,
                &handle,
                &mut events,
                evicted,
                &mut shutdown_rx,
            )
            .await;

        match &outcome {
            ConnectionOutcome::Replaced => {
                self.state = ConnectionState::Replaced;
                info!("Connection {} replaced on session {}", self.id, self.session);
            }
            ConnectionOutcome::Disconnected(reason) => {
                self.state = ConnectionState::Disconnected;
                handle.kill();
                self.registry.release(&self.session, self.id).await;
                info!(
                    "Connection {} left session {}: {:?}",
                    self.id, self.session, reason
                );
            }
        }

        debug!("Connection {} finished in state {:?}", self.id, self.state);
        outcome
    }

    async fn stream<Si, St>(
        &self,
        sender: &mut Si,
        receiver: &mut St,
        handle: &SessionHandle,
        events: &mut mpsc::Receiver<PtyEvent>,
        evicted: oneshot::Receiver<EvictionNotice>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> ConnectionOutcome
    where
        Si: Sink<Message, Error = tungstenite::Error> + Unpin,
        St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        use ConnectionOutcome::Disconnected;

        for message in [ServerMessage::ready(&self.session), ServerMessage::RequestResize] {
            if let Err(e) = send_message(sender, &message).await {
                return Disconnected(DisconnectReason::TransportError(e.to_string()));
            }
        }

        let mut evicted = Some(evicted);
        let mut encoder = OutputEncoder::new();

        loop {
            tokio::select! {
                // Eviction wins over anything the dying handle still emits
                biased;

                notice = eviction(&mut evicted) => {
                    let _ = send_message(sender, &ServerMessage::replaced(notice.message)).await;
                    let _ = sender.send(Message::Close(None)).await;
                    return ConnectionOutcome::Replaced;
                }

                event = events.recv() => {
                    match event {
                        Some(PtyEvent::Output(data)) => {
                            self.monitor.record_activity(&self.session).await;
                            if let Some(message) = encoder.encode(&data) {
                                if let Err(e) = send_message(sender, &message).await {
                                    return Disconnected(DisconnectReason::TransportError(e.to_string()));
                                }
                            }
                        }
                        Some(PtyEvent::Exit(exit)) => {
                            if let Some(message) = encoder.flush() {
                                let _ = send_message(sender, &message).await;
                            }
                            let _ = send_message(sender, &ServerMessage::exit(exit.code)).await;
                            let _ = sender.send(Message::Close(None)).await;
                            return Disconnected(DisconnectReason::ProcessExited(exit.code));
                        }
                        None => {
                            let _ = sender.send(Message::Close(None)).await;
                            return Disconnected(DisconnectReason::ProcessExited(-1));
                        }
                    }
                }

                msg = receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_client_message(&text, handle).await;
                        }
                        Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                            Ok(text) => self.handle_client_message(text, handle).await,
                            Err(_) => warn!(
                                "Ignoring non-UTF-8 binary frame on connection {} ({} bytes)",
                                self.id,
                                data.len()
                            ),
                        },
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = sender.send(Message::Pong(data)).await {
                                return Disconnected(DisconnectReason::TransportError(e.to_string()));
                            }
                        }
                        Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("Client closed connection {}", self.id);
                            return Disconnected(DisconnectReason::ClientClosed);
                        }
                        Some(Err(e)) => {
                            return Disconnected(DisconnectReason::TransportError(e.to_string()));
                        }
                    }
                }

                _ = shutdown_rx.recv() => {
                    let _ = sender.send(Message::Close(None)).await;
                    return Disconnected(DisconnectReason::Shutdown);
                }
            }
        }
    }

    /// Apply one client message; malformed ones are logged and dropped
    async fn handle_client_message(&self, text: &str, handle: &SessionHandle) {
        match ClientMessage::from_json(text) {
            Ok(ClientMessage::Input { data }) => handle.write(data.as_bytes()),
            Ok(ClientMessage::Resize { cols, rows }) => match handle.resize(cols, rows).await {
                Ok(true) => debug!("Session {} resized to {}x{}", self.session, cols, rows),
                Ok(false) => {}
                Err(e) => warn!("Resize of session {} failed: {}", self.session, e),
            },
            Err(e) => warn!("Ignoring malformed message on connection {}: {}", self.id, e),
        }
    }
}

/// Resolve with the eviction notice; never resolves once the sender is gone
async fn eviction(slot: &mut Option<oneshot::Receiver<EvictionNotice>>) -> EvictionNotice {
    if let Some(rx) = slot.as_mut() {
        match rx.await {
            Ok(notice) => return notice,
            Err(_) => *slot = None,
        }
    }
    std::future::pending().await
}

async fn send_message<Si>(sender: &mut Si, message: &ServerMessage) -> anyhow::Result<()>
where
    Si: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    sender.send(Message::Text(message.to_json()?)).await?;
    Ok(())
}
