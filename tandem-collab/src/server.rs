//! WebSocket sync server.
//!
//! ```text
//! Client A ──┐                       ┌── canonical documents
//!            ├── ServerSyncEngine ───┤
//! Client B ──┘        │              └── users (shadows, selections)
//!                     │
//!              BroadcastGroup ── user / remove-user / save ──▶ other clients
//! ```
//!
//! Requests (`open`, `patch`) are answered on the requesting connection.
//! Presence and saves fan out through the broadcast group.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::BroadcastGroup;
use crate::engine::ServerSyncEngine;
use crate::protocol::{MessageType, PatchReply, ProtocolError, SyncMessage};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Presence messages buffered per connection
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8844".to_string(),
            broadcast_capacity: 256,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_documents: usize,
    pub active_users: usize,
}

pub struct SyncServer {
    config: ServerConfig,
    engine: Arc<ServerSyncEngine>,
    broadcast: Arc<BroadcastGroup>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let broadcast = Arc::new(BroadcastGroup::new(config.broadcast_capacity));
        Self {
            config,
            engine: Arc::new(ServerSyncEngine::new()),
            broadcast,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let engine = self.engine.clone();
            let broadcast = self.broadcast.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, engine, broadcast, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        engine: Arc<ServerSyncEngine>,
        broadcast: Arc<BroadcastGroup>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let user_id = engine.connect().await;
        let mut broadcast_rx = broadcast.add_peer(user_id).await;
        log::info!("WebSocket connection from {addr} is user {user_id}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
            s.active_users = engine.user_count().await;
        }

        let result = async {
            // Introduce everyone already here.
            for info in engine.other_users(user_id).await {
                let encoded = SyncMessage::user(&info).encode()?;
                ws_sender.send(Message::Binary(encoded.into())).await?;
            }

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += bytes.len() as u64;
                                }
                                match SyncMessage::decode(&bytes) {
                                    Ok(sync_msg) => match route(&engine, &broadcast, user_id, sync_msg).await {
                                        Ok(Some(response)) => {
                                            ws_sender.send(Message::Binary(response.encode()?.into())).await?;
                                        }
                                        Ok(None) => {}
                                        Err(e) => log::warn!("Bad message from {addr}: {e}"),
                                    },
                                    Err(e) => log::warn!("Failed to decode message from {addr}: {e}"),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }

                    msg = broadcast_rx.recv() => {
                        match msg {
                            Ok(data) => {
                                // Don't echo back to the user it came from.
                                if let Ok(sync_msg) = SyncMessage::decode(&data) {
                                    if sync_msg.peer_id == user_id {
                                        continue;
                                    }
                                }
                                ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("User {user_id} lagged by {n} broadcast messages");
                                broadcast.record_dropped(n);
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
            Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;

        // Cleanup runs whether the loop ended cleanly or on a send error.
        broadcast.remove_peer(&user_id).await;
        engine.disconnect(user_id).await;
        if let Err(e) = broadcast.broadcast(&SyncMessage::remove_user(user_id)) {
            log::warn!("Failed to announce departure of {user_id}: {e}");
        }

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_users = engine.user_count().await;
            s.active_documents = engine.document_count().await;
        }

        result
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_users = self.engine.user_count().await;
        stats.active_documents = self.engine.document_count().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn engine(&self) -> &Arc<ServerSyncEngine> {
        &self.engine
    }

    pub fn broadcast_group(&self) -> &Arc<BroadcastGroup> {
        &self.broadcast
    }
}

/// Handle one decoded message from `user_id`. Returns the message to send
/// back on the same connection, if any.
pub(crate) async fn route(
    engine: &ServerSyncEngine,
    broadcast: &BroadcastGroup,
    user_id: Uuid,
    msg: SyncMessage,
) -> Result<Option<SyncMessage>, ProtocolError> {
    match msg.msg_type {
        MessageType::Username => {
            let name = msg.username_value()?;
            if let Some(info) = engine.set_username(user_id, &name).await {
                broadcast.broadcast(&SyncMessage::user(&info))?;
            }
            Ok(None)
        }

        MessageType::Open => {
            let request = msg.open_request()?;
            log::debug!("Open {} from {user_id}", request.id);
            let reply = engine.open(user_id, request).await;
            Ok(Some(SyncMessage::reply(msg.request_id, &reply)))
        }

        MessageType::Patch => {
            let reply = match msg.document_patch() {
                Ok(patch) => engine.patch(user_id, patch).await,
                Err(e) => {
                    log::warn!("Undecodable patch from {user_id}: {e}");
                    PatchReply::error(crate::engine::PATCH_FAILED)
                }
            };
            Ok(Some(SyncMessage::reply(msg.request_id, &reply)))
        }

        MessageType::Close => {
            let doc_id = msg.closed_document()?;
            engine.close(user_id, &doc_id).await;
            Ok(None)
        }

        MessageType::Selection => {
            let update = msg.selection_update()?;
            if let Some(info) = engine.set_selections(user_id, update).await {
                broadcast.broadcast(&SyncMessage::user(&info))?;
            }
            Ok(None)
        }

        MessageType::Save => {
            let document = msg.saved_document()?;
            log::info!("User {user_id} saved {}", document.id);
            broadcast.broadcast(&SyncMessage::save(user_id, &document))?;
            Ok(None)
        }

        MessageType::Ping => Ok(Some(SyncMessage::pong(user_id))),

        _ => {
            log::debug!("Unhandled message type from {user_id}: {:?}", msg.msg_type);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{OpenRequest, SavedDocument, SelectionUpdate};
    use tandem_core::Document;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8844");
        assert_eq!(config.broadcast_capacity, 256);
    }

    #[test]
    fn test_server_custom_config() {
        let server = SyncServer::new(ServerConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            broadcast_capacity: 512,
        });
        assert_eq!(server.bind_addr(), "0.0.0.0:8080");
        assert_eq!(server.broadcast_group().capacity(), 512);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.active_documents, 0);
        assert_eq!(stats.active_users, 0);
    }

    #[tokio::test]
    async fn test_route_open_and_patch_reply_with_request_id() {
        let engine = ServerSyncEngine::new();
        let group = BroadcastGroup::new(8);
        let user = engine.connect().await;

        let open = SyncMessage::open(
            user,
            5,
            &OpenRequest {
                id: "a.txt".into(),
                text: "abc".into(),
            },
        );
        let reply = route(&engine, &group, user, open).await.unwrap().unwrap();
        assert_eq!(reply.msg_type, MessageType::Reply);
        assert_eq!(reply.request_id, 5);

        let patch = Document::new("a.txt", "abc").create_patch("abxc");
        let reply = route(&engine, &group, user, SyncMessage::patch(user, 6, &patch))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.request_id, 6);
        assert!(matches!(reply.patch_reply().unwrap(), PatchReply::Patch(p) if p.is_empty()));
    }

    #[tokio::test]
    async fn test_route_presence_broadcasts_user_record() {
        let engine = ServerSyncEngine::new();
        let group = BroadcastGroup::new(8);
        let user = engine.connect().await;
        let mut rx = group.subscribe();

        let response = route(&engine, &group, user, SyncMessage::username(user, "alice"))
            .await
            .unwrap();
        assert!(response.is_none());
        let msg = SyncMessage::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg.peer_id, user);
        assert_eq!(msg.user_info().unwrap().username, "alice");

        let update = SelectionUpdate {
            id: "a.txt".into(),
            selections: vec![[1, 1, 1, 2]],
        };
        route(&engine, &group, user, SyncMessage::selection(user, &update))
            .await
            .unwrap();
        let msg = SyncMessage::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg.user_info().unwrap().selections["a.txt"], vec![[1, 1, 1, 2]]);
    }

    #[tokio::test]
    async fn test_route_save_is_relayed() {
        let engine = ServerSyncEngine::new();
        let group = BroadcastGroup::new(8);
        let user = engine.connect().await;
        let mut rx = group.subscribe();

        let saved = SavedDocument {
            id: "a.txt".into(),
            text: "final".into(),
        };
        // The sender's own peer id is ignored; the server stamps the user id.
        route(&engine, &group, user, SyncMessage::save(Uuid::nil(), &saved))
            .await
            .unwrap();
        let msg = SyncMessage::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg.peer_id, user);
        assert_eq!(msg.saved_document().unwrap(), saved);
    }

    #[tokio::test]
    async fn test_route_close_and_ping() {
        let engine = ServerSyncEngine::new();
        let group = BroadcastGroup::new(8);
        let user = engine.connect().await;
        engine
            .open(
                user,
                OpenRequest {
                    id: "a.txt".into(),
                    text: String::new(),
                },
            )
            .await;

        assert!(route(&engine, &group, user, SyncMessage::close(user, "a.txt"))
            .await
            .unwrap()
            .is_none());
        assert_eq!(engine.document_count().await, 0);

        let pong = route(&engine, &group, user, SyncMessage::ping(user)).await.unwrap().unwrap();
        assert_eq!(pong.msg_type, MessageType::Pong);
    }

    #[tokio::test]
    async fn test_route_rejects_mismatched_payload() {
        let engine = ServerSyncEngine::new();
        let group = BroadcastGroup::new(8);
        let user = engine.connect().await;

        let mut msg = SyncMessage::ping(user);
        msg.msg_type = MessageType::Open;
        assert!(route(&engine, &group, user, msg).await.is_err());
    }
}
