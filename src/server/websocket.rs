//! WebSocket server implementation
//!
//! Listens on the configured address, routes each upgrade request to the
//! terminal gateway or the notification channel, and owns the background
//! monitor tasks.

use std::sync::Arc;

use futures_util::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::{run_notifications, ServerMessage, TerminalConnection};
use crate::config::GatewayConfig;
use crate::monitor::{ActivityMonitor, NotificationHub};
use crate::session::OwnershipRegistry;
use crate::tmux::{Multiplexer, TmuxClient};

/// Path of the terminal gateway
pub const TERMINAL_PATH: &str = "/ws/terminal";
/// Path of the notification channel
pub const NOTIFICATIONS_PATH: &str = "/ws/notifications";

/// Error sent to terminal clients that did not name a session
pub const SESSION_REQUIRED_MESSAGE: &str = "Session name required";

/// Where an upgrade request is headed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Terminal { session: String },
    /// Terminal path without a `session` parameter
    MissingSession,
    Notifications,
}

impl Route {
    /// Resolve a route from the request path and query
    ///
    /// Unknown paths are rejected with 404. A terminal request without a
    /// `session` parameter is still upgraded so the client gets an `error`
    /// message it understands.
    pub fn from_request(request: &Request) -> Result<Self, ErrorResponse> {
        let uri = request.uri();
        match uri.path() {
            TERMINAL_PATH => {
                let session = uri.query().and_then(|query| {
                    url::form_urlencoded::parse(query.as_bytes())
                        .find(|(key, _)| key == "session")
                        .map(|(_, value)| value.into_owned())
                });
                match session {
                    Some(session) if !session.is_empty() => Ok(Route::Terminal { session }),
                    _ => Ok(Route::MissingSession),
                }
            }
            NOTIFICATIONS_PATH => Ok(Route::Notifications),
            _ => Err(reject(StatusCode::NOT_FOUND, "Not found")),
        }
    }
}

fn reject(status: StatusCode, message: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(message.to_string()));
    *response.status_mut() = status;
    response
}

/// Shared services every connection works with
#[derive(Clone)]
pub struct GatewayContext {
    pub registry: Arc<OwnershipRegistry>,
    pub monitor: Arc<ActivityMonitor>,
}

impl GatewayContext {
    /// Wire up a monitor, hub and registry around a multiplexer
    pub fn new(mux: Arc<dyn Multiplexer>, config: &GatewayConfig) -> Self {
        let hub = Arc::new(NotificationHub::new());
        let monitor = Arc::new(ActivityMonitor::new(
            Arc::clone(&mux),
            hub,
            config.monitor.clone(),
        ));
        let registry = Arc::new(OwnershipRegistry::new(
            mux,
            Arc::clone(&monitor),
            config.terminal.attach_config(),
        ));
        Self { registry, monitor }
    }

    /// Start the monitor sweeps and the reaper closing handles of stopped sessions
    ///
    /// Every task exits after the shutdown broadcast.
    pub fn start_background(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let (stopped_tx, stopped_rx) = mpsc::unbounded_channel();
        let mut tasks = self.monitor.start(shutdown, stopped_tx);
        tasks.push(spawn_reaper(Arc::clone(&self.registry), stopped_rx));
        tasks
    }
}

/// Tear down handles of sessions that vanished from the multiplexer
///
/// Ends once every sweep holding the sender has stopped.
fn spawn_reaper(
    registry: Arc<OwnershipRegistry>,
    mut stopped_rx: mpsc::UnboundedReceiver<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(name) = stopped_rx.recv().await {
            if registry.terminate(&name).await {
                info!("Closed handle of stopped session {}", name);
            }
        }
    })
}

/// WebSocket server for terminal and notification clients
pub struct GatewayServer {
    config: GatewayConfig,
    tmux: TmuxClient,
    context: GatewayContext,
    shutdown_tx: broadcast::Sender<()>,
}

impl GatewayServer {
    /// Create a new server backed by tmux
    pub fn new(config: GatewayConfig) -> Self {
        let tmux = TmuxClient::new(&config.terminal.multiplexer)
            .with_capture_lines(config.monitor.capture_lines);
        let context = GatewayContext::new(Arc::new(tmux.clone()), &config);
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            tmux,
            context,
            shutdown_tx,
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Create autostart sessions and register configured ones
    async fn prepare_sessions(&self) {
        for session in &self.config.sessions {
            if session.autostart {
                let dir = session
                    .working_dir
                    .clone()
                    .unwrap_or_else(|| self.config.terminal.resolved_working_dir());
                match self
                    .tmux
                    .create_session(&session.name, Some(dir.as_path()), session.command.as_deref())
                    .await
                {
                    Ok(true) => info!("Created session {}", session.name),
                    Ok(false) => debug!("Session {} already running", session.name),
                    Err(e) => warn!("Could not create session {}: {}", session.name, e),
                }
            }
            self.context.monitor.register(&session.name).await;
        }
    }

    /// Run the WebSocket server
    ///
    /// Listens for incoming connections and handles them concurrently until a
    /// shutdown signal is received.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.prepare_sessions().await;

        let background = self.context.start_background(&self.shutdown_tx);

        let addr = self.config.server.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("Gateway listening on ws://{}{}", addr, TERMINAL_PATH);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let context = self.context.clone();
                            let shutdown_rx = self.shutdown_tx.subscribe();
                            let peer = peer_addr.to_string();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer, context, shutdown_rx).await {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        for task in background {
            let _ = task.await;
        }

        let session_count = self.context.registry.session_count().await;
        if session_count > 0 {
            info!("Closing {} attached sessions", session_count);
            self.context.registry.shutdown_all().await;
        }

        Ok(())
    }
}

/// Handle a single connection from handshake to close
pub async fn handle_connection<S>(
    stream: S,
    peer: String,
    context: GatewayContext,
    shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut route = None;
    let handshake = accept_hdr_async(
        stream,
        |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            route = Some(Route::from_request(request)?);
            Ok(response)
        },
    )
    .await;

    let mut ws = match handshake {
        Ok(ws) => ws,
        Err(e) => {
            warn!("Rejected upgrade from {}: {}", peer, e);
            return Ok(());
        }
    };
    let Some(route) = route else {
        return Ok(());
    };

    match route {
        Route::Terminal { session } => {
            let connection = TerminalConnection::new(
                session.as_str(),
                Arc::clone(&context.registry),
                Arc::clone(&context.monitor),
            );
            info!(
                "Terminal connection {} from {} for session {}",
                connection.id(),
                peer,
                session
            );
            let outcome = connection.run(ws, shutdown_rx).await;
            debug!("Connection from {} finished: {:?}", peer, outcome);
        }
        Route::MissingSession => {
            warn!("Terminal connection from {} without a session name", peer);
            let error = ServerMessage::error(SESSION_REQUIRED_MESSAGE).to_json()?;
            ws.send(Message::Text(error)).await?;
            let _ = ws.close(None).await;
        }
        Route::Notifications => {
            info!("Notification connection from {}", peer);
            run_notifications(ws, context.monitor, shutdown_rx).await?;
        }
    }

    Ok(())
}
