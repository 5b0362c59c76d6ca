//! WebSocket sync client.
//!
//! Provides:
//! - Connection lifecycle with a writer task and a reader task
//! - `open` / `patch` requests matched to replies by request id
//! - Throttled selection updates, saves, heartbeats
//! - Presence and save events for the host

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tandem_core::DocumentPatch;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::client_engine::SyncTransport;
use crate::presence::SelectionThrottle;
use crate::protocol::{
    MessageType, OpenRequest, PatchReply, ProtocolError, SavedDocument, SelectionUpdate, SyncMessage, UserInfo,
};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    /// Sent right after connecting when set
    pub username: Option<String>,
    /// Period of the document sync tick
    pub update_interval: Duration,
    /// Trailing-edge window for selection updates
    pub selection_throttle: Duration,
    /// How long an `open` or `patch` waits for its reply
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8844".to_string(),
            username: None,
            update_interval: Duration::from_millis(650),
            selection_throttle: Duration::from_millis(250),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost; every shadow and remote user is gone
    Disconnected,
    /// Presence record of a remote user
    User(UserInfo),
    /// A remote user disconnected
    RemoveUser(Uuid),
    /// A remote user saved a document
    Saved(SavedDocument),
}

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<PatchReply>>>>;

/// The sync client.
///
/// Owns the WebSocket connection. Document sync runs on top of it through
/// [`SyncTransport`].
pub struct SyncClient {
    /// Our identity on outgoing envelopes
    peer_id: Uuid,

    config: ClientConfig,

    state: Arc<RwLock<ConnectionState>>,

    next_request: AtomicU64,

    /// Replies awaited by request id
    pending: PendingReplies,

    /// Channel to send messages to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Channel to the selection throttle task
    selection_tx: Option<mpsc::Sender<SelectionUpdate>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            peer_id: Uuid::new_v4(),
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            next_request: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            outgoing_tx: None,
            selection_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages and
    /// for throttled selection updates.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.config.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::error!("Failed to connect to {}: {e}", self.config.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Selection task: trailing-edge throttle in front of the writer
        let (selection_tx, selection_rx) = mpsc::channel::<SelectionUpdate>(64);
        tokio::spawn(run_selection_throttle(
            self.peer_id,
            self.config.selection_throttle,
            selection_rx,
            out_tx.clone(),
        ));

        self.outgoing_tx = Some(out_tx);
        self.selection_tx = Some(selection_tx);

        if let Some(username) = self.config.username.clone() {
            self.send(SyncMessage::username(self.peer_id, &username)).await?;
        }

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;
        log::info!("Connected to {}", self.config.server_url);

        // Reader task: process incoming WebSocket messages
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let pending = self.pending.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match SyncMessage::decode(&bytes) {
                            Ok(sync_msg) => dispatch(sync_msg, &pending, &event_tx).await,
                            Err(e) => log::warn!("Failed to decode server message: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost: outstanding requests fail with ConnectionClosed.
            pending.lock().await.clear();
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
            log::info!("Disconnected from server");
        });

        Ok(())
    }

    /// Drop the connection. The reader task reports `Disconnected` once the
    /// socket is closed.
    pub fn disconnect(&mut self) {
        self.outgoing_tx = None;
        self.selection_tx = None;
    }

    async fn send(&self, msg: SyncMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(encoded).await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    async fn request(&self, build: impl FnOnce(u64) -> SyncMessage) -> Result<PatchReply, ProtocolError> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);

        if let Err(e) = self.send(build(request_id)).await {
            self.pending.lock().await.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                log::warn!("Request {request_id} timed out");
                Err(ProtocolError::Timeout)
            }
        }
    }

    /// Queue a selection update. Only the latest one per throttle window
    /// is sent.
    pub async fn send_selection(&self, update: SelectionUpdate) -> Result<(), ProtocolError> {
        let tx = self.selection_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(update).await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Tell other clients a document was saved.
    pub async fn send_save(&self, document: &SavedDocument) -> Result<(), ProtocolError> {
        self.send(SyncMessage::save(self.peer_id, document)).await
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(SyncMessage::ping(self.peer_id)).await
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Requests still waiting for a reply.
    pub async fn pending_requests(&self) -> usize {
        self.pending.lock().await.len()
    }
}

impl SyncTransport for SyncClient {
    async fn open(&self, request: OpenRequest) -> Result<PatchReply, ProtocolError> {
        let peer_id = self.peer_id;
        self.request(|id| SyncMessage::open(peer_id, id, &request)).await
    }

    async fn patch(&self, patch: DocumentPatch) -> Result<PatchReply, ProtocolError> {
        let peer_id = self.peer_id;
        self.request(|id| SyncMessage::patch(peer_id, id, &patch)).await
    }

    async fn close(&self, doc_id: String) -> Result<(), ProtocolError> {
        self.send(SyncMessage::close(self.peer_id, &doc_id)).await
    }
}

/// Route one server message to its waiting request or to the event channel.
async fn dispatch(msg: SyncMessage, pending: &PendingReplies, event_tx: &mpsc::Sender<SyncEvent>) {
    let event = match msg.msg_type {
        MessageType::Reply => {
            let Some(waiter) = pending.lock().await.remove(&msg.request_id) else {
                log::debug!("Reply {} has no waiting request", msg.request_id);
                return;
            };
            match msg.patch_reply() {
                Ok(reply) => {
                    let _ = waiter.send(reply);
                }
                Err(e) => log::warn!("Undecodable reply {}: {e}", msg.request_id),
            }
            return;
        }
        MessageType::User => msg.user_info().ok().map(SyncEvent::User),
        MessageType::RemoveUser => msg.removed_user().ok().map(SyncEvent::RemoveUser),
        MessageType::Save => msg.saved_document().ok().map(SyncEvent::Saved),
        MessageType::Pong => {
            log::trace!("Pong");
            None
        }
        other => {
            log::debug!("Ignoring {other:?} from server");
            None
        }
    };

    if let Some(evt) = event {
        let _ = event_tx.send(evt).await;
    }
}

async fn run_selection_throttle(
    peer_id: Uuid,
    interval: Duration,
    mut updates: mpsc::Receiver<SelectionUpdate>,
    outgoing: mpsc::Sender<Vec<u8>>,
) {
    let mut throttle = SelectionThrottle::new(interval);
    loop {
        let deadline = throttle.next_deadline();
        tokio::select! {
            update = updates.recv() => match update {
                Some(update) => throttle.offer(update, std::time::Instant::now()),
                None => break,
            },
            _ = sleep_until(deadline), if deadline.is_some() => {
                let Some(update) = throttle.flush(std::time::Instant::now()) else {
                    continue;
                };
                match SyncMessage::selection(peer_id, &update).encode() {
                    Ok(encoded) => {
                        if outgoing.send(encoded).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Failed to encode selection: {e}"),
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<std::time::Instant>) {
    if let Some(deadline) = deadline {
        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
    }
}
