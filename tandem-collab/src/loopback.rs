//! In-process transport: requests go through the wire codec and the same
//! message routing as a WebSocket connection, without a socket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tandem_core::DocumentPatch;
use uuid::Uuid;

use crate::broadcast::BroadcastGroup;
use crate::client_engine::SyncTransport;
use crate::engine::ServerSyncEngine;
use crate::protocol::{OpenRequest, PatchReply, ProtocolError, SyncMessage};
use crate::server::route;

/// A server engine with its broadcast group, minus the listener.
#[derive(Clone)]
pub struct LoopbackServer {
    engine: Arc<ServerSyncEngine>,
    broadcast: Arc<BroadcastGroup>,
}

impl LoopbackServer {
    pub fn new() -> Self {
        Self {
            engine: Arc::new(ServerSyncEngine::new()),
            broadcast: Arc::new(BroadcastGroup::new(256)),
        }
    }

    /// Register a new user and return a transport speaking as that user.
    pub async fn connect(&self) -> LoopbackTransport {
        let user_id = self.engine.connect().await;
        LoopbackTransport {
            server: self.clone(),
            user_id,
            next_request: AtomicU64::new(1),
        }
    }

    pub fn engine(&self) -> &Arc<ServerSyncEngine> {
        &self.engine
    }

    pub fn broadcast_group(&self) -> &Arc<BroadcastGroup> {
        &self.broadcast
    }
}

impl Default for LoopbackServer {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LoopbackTransport {
    server: LoopbackServer,
    user_id: Uuid,
    next_request: AtomicU64,
}

impl LoopbackTransport {
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// Drop this user from the server, as a closed socket would.
    pub async fn disconnect(&self) {
        self.server.engine.disconnect(self.user_id).await;
    }

    async fn deliver(&self, msg: SyncMessage) -> Result<Option<SyncMessage>, ProtocolError> {
        let msg = SyncMessage::decode(&msg.encode()?)?;
        let response = route(&self.server.engine, &self.server.broadcast, self.user_id, msg).await?;
        response.map(|r| SyncMessage::decode(&r.encode()?)).transpose()
    }

    async fn request(&self, build: impl FnOnce(u64) -> SyncMessage) -> Result<PatchReply, ProtocolError> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let response = self
            .deliver(build(request_id))
            .await?
            .ok_or(ProtocolError::ConnectionClosed)?;
        if response.request_id != request_id {
            return Err(ProtocolError::InvalidMessageType);
        }
        response.patch_reply()
    }
}

impl SyncTransport for LoopbackTransport {
    async fn open(&self, request: OpenRequest) -> Result<PatchReply, ProtocolError> {
        let user_id = self.user_id;
        self.request(|id| SyncMessage::open(user_id, id, &request)).await
    }

    async fn patch(&self, patch: DocumentPatch) -> Result<PatchReply, ProtocolError> {
        let user_id = self.user_id;
        self.request(|id| SyncMessage::patch(user_id, id, &patch)).await
    }

    async fn close(&self, doc_id: String) -> Result<(), ProtocolError> {
        self.deliver(SyncMessage::close(self.user_id, &doc_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_open_and_close() {
        let server = LoopbackServer::new();
        let transport = server.connect().await;

        let reply = transport
            .open(OpenRequest {
                id: "a.txt".into(),
                text: "abc".into(),
            })
            .await
            .unwrap();
        assert!(matches!(reply, PatchReply::Patch(p) if p.is_empty()));
        assert_eq!(server.engine().document_count().await, 1);

        transport.close("a.txt".into()).await.unwrap();
        assert_eq!(server.engine().document_count().await, 0);
    }

    #[tokio::test]
    async fn test_loopback_users_are_distinct() {
        let server = LoopbackServer::new();
        let a = server.connect().await;
        let b = server.connect().await;
        assert_ne!(a.user_id(), b.user_id());
        assert_eq!(server.engine().user_count().await, 2);

        a.disconnect().await;
        assert_eq!(server.engine().user_count().await, 1);
    }

    #[tokio::test]
    async fn test_loopback_patch_unknown_document() {
        let server = LoopbackServer::new();
        let transport = server.connect().await;
        let reply = transport.patch(DocumentPatch::empty("a.txt", "0")).await.unwrap();
        assert_eq!(reply, PatchReply::error(crate::engine::INVALID_DOCUMENT_ID));
    }
}
