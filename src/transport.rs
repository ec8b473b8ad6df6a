use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::router::{self, Envelope};
use crate::traits::PeerSender;
use crate::types::{Manager, PeerId};

/// Open WebSocket sessions, keyed by peer id. Each session owns an outbound
/// channel; dropping the channel ends the session's socket loop. Session ids
/// keep a reconnecting peer's fresh session safe from its stale one's
/// cleanup.
pub struct PeerConnections {
    inner: std::sync::Mutex<HashMap<PeerId, (u64, mpsc::UnboundedSender<Envelope>)>>,
    next_session: AtomicU64,
}

impl PeerConnections {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(0),
        }
    }

    /// Registers a session and returns its id. An existing session for the
    /// same peer is replaced; its socket loop ends when its sender drops.
    pub fn register(&self, peer_id: &PeerId, tx: mpsc::UnboundedSender<Envelope>) -> u64 {
        let session = self.next_session.fetch_add(1, Ordering::SeqCst);
        self.inner
            .lock()
            .expect("peer map is not poisoned")
            .insert(peer_id.clone(), (session, tx));
        session
    }

    /// Removes the session only if it is still the current one for the peer.
    pub fn unregister(&self, peer_id: &PeerId, session: u64) {
        let mut map = self.inner.lock().expect("peer map is not poisoned");
        if map.get(peer_id).map(|(s, _)| *s) == Some(session) {
            map.remove(peer_id);
        }
    }

    /// Drops the peer's outbound channel, which closes its socket loop.
    pub fn close(&self, peer_id: &PeerId) {
        self.inner
            .lock()
            .expect("peer map is not poisoned")
            .remove(peer_id);
    }

    pub fn connected(&self) -> Vec<PeerId> {
        self.inner
            .lock()
            .expect("peer map is not poisoned")
            .keys()
            .cloned()
            .collect()
    }

    #[cfg(test)]
    pub fn register_for_test(&self, peer_id: &str) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.register(&peer_id.to_string(), tx);
        rx
    }
}

impl Default for PeerConnections {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerSender for PeerConnections {
    async fn send(&self, peer_id: &PeerId, envelope: Envelope) -> Result<()> {
        let tx = self
            .inner
            .lock()
            .expect("peer map is not poisoned")
            .get(peer_id)
            .map(|(_, tx)| tx.clone())
            .ok_or_else(|| Error::Transport(format!("peer {peer_id} is not connected")))?;
        tx.send(envelope)
            .map_err(|_| Error::Transport(format!("session for {peer_id} is closed")))
    }
}

/// Serves the p2p WebSocket transport on the configured port.
pub async fn serve_p2p(manager: Arc<Manager>) {
    let port = manager.config.port;
    let app = Router::new()
        .route("/", get(ws_handler))
        .with_state(manager);

    let listener = match TcpListener::bind(format!("0.0.0.0:{port}")).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind p2p transport to port {}: {}", port, e);
            return;
        }
    };
    info!("p2p WebSocket transport listening on port {}", port);

    if let Err(e) = axum::serve(listener, app.into_make_service()).await {
        error!("p2p transport failed: {}", e);
    }
}

#[axum_macros::debug_handler]
async fn ws_handler(
    State(manager): State<Arc<Manager>>,
    ws: WebSocketUpgrade,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = handle_socket(socket, manager).await {
            warn!("WebSocket session error: {:?}", e);
        }
    })
}

/// One peer session: the first frame must be a hello binding the socket to a
/// peer id, then inbound messages are routed and replies plus manager-pushed
/// messages (offers) flow back out.
async fn handle_socket(socket: WebSocket, manager: Arc<Manager>) -> Result<()> {
    let (sender, mut receiver) = socket.split();
    let sender = Arc::new(Mutex::new(sender));

    let peer_id = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<Envelope>(&text) {
                Ok(Envelope::Hello { peer_id }) => break peer_id,
                _ => {
                    let refusal = Envelope::from_error(&Error::Transport(
                        "session must open with a hello".to_string(),
                    ));
                    let _ = sender
                        .lock()
                        .await
                        .send(Message::Text(serde_json::to_string(&refusal)?.into()))
                        .await;
                    return Ok(());
                }
            },
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(Error::Transport(e.to_string())),
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = manager.peers.register(&peer_id, tx);
    manager.registry.lock().await.connect(&peer_id)?;
    manager.control.nudge();
    info!("Peer connected: {}", peer_id);

    loop {
        tokio::select! {
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let reply = match serde_json::from_str::<Envelope>(&text) {
                        Ok(envelope) => {
                            match router::handle_message(&manager, &peer_id, envelope).await {
                                Ok(reply) => reply,
                                Err(e) => Some(Envelope::from_error(&e)),
                            }
                        }
                        Err(e) => Some(Envelope::from_error(&Error::InvalidArgument(format!(
                            "undecodable message: {e}"
                        )))),
                    };
                    if let Some(reply) = reply {
                        let text = serde_json::to_string(&reply)?;
                        if sender.lock().await.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Receive error from {}: {}", peer_id, e);
                    break;
                }
            },
            outbound = rx.recv() => match outbound {
                Some(envelope) => {
                    let text = serde_json::to_string(&envelope)?;
                    if sender.lock().await.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                // The manager closed the session.
                None => {
                    let _ = sender.lock().await.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    manager.peers.unregister(&peer_id, session);
    manager.registry.lock().await.disconnect(&peer_id)?;
    info!("Peer disconnected: {}", peer_id);
    Ok(())
}
