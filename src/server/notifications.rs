//! Notification channel
//!
//! Streams the monitor's snapshot followed by every state transition.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::monitor::ActivityMonitor;

/// Forward notifications to one subscriber until either side goes away
pub async fn run_notifications<S>(
    ws: WebSocketStream<S>,
    monitor: Arc<ActivityMonitor>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sender, mut receiver) = ws.split();
    let mut subscription = monitor.subscribe().await;
    info!("Notification subscriber {} connected", subscription.id());

    let result = loop {
        tokio::select! {
            notification = subscription.recv() => {
                let Some(notification) = notification else {
                    warn!("Notification subscriber {} was dropped by the hub", subscription.id());
                    let _ = sender.send(Message::Close(None)).await;
                    break Ok(());
                };
                let json = match notification.to_json() {
                    Ok(json) => json,
                    Err(e) => break Err(e.into()),
                };
                if let Err(e) = sender.send(Message::Text(json)).await {
                    break Err(e.into());
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            break Err(e.into());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => debug!("Ignoring message on notification channel"),
                    Some(Err(e)) => break Err(e.into()),
                }
            }
            _ = shutdown_rx.recv() => {
                let _ = sender.send(Message::Close(None)).await;
                break Ok(());
            }
        }
    };

    monitor.hub().unsubscribe(subscription.id()).await;
    info!("Notification subscriber {} disconnected", subscription.id());
    result
}
