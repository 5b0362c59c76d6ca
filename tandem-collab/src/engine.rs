//! Server sync engine: per-user shadows converging on shared canonical
//! documents.
//!
//! Locks are always taken in the order documents map → users map → one
//! user → one canonical document, and never held across I/O.

use tandem_core::{Document, DocumentPatch};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::protocol::{OpenRequest, PatchReply, SelectionUpdate, UserInfo};
use crate::registry::{DocumentRegistry, ServerUser, UserRegistry};

pub const INVALID_DOCUMENT_ID: &str = "invalid document id";
pub const PATCH_FAILED: &str = "patch failed";

#[derive(Default)]
pub struct ServerSyncEngine {
    documents: RwLock<DocumentRegistry>,
    users: RwLock<UserRegistry>,
}

impl ServerSyncEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection and return its user id.
    pub async fn connect(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.users.write().await.insert(ServerUser::new(id));
        log::info!("User {id} connected");
        id
    }

    /// Drop a user with all its shadows, then sweep unused documents.
    pub async fn disconnect(&self, user_id: Uuid) -> Option<UserInfo> {
        let removed = self.users.write().await.remove(&user_id)?;
        let info = removed.lock().await.info();
        log::info!("User {} ({user_id}) disconnected", info.username);
        self.sweep().await;
        Some(info)
    }

    /// Presence records of everyone except `user_id`.
    pub async fn other_users(&self, user_id: Uuid) -> Vec<UserInfo> {
        let users = self.users.read().await;
        let mut infos = Vec::with_capacity(users.len());
        for (id, user) in users.iter() {
            if *id != user_id {
                infos.push(user.lock().await.info());
            }
        }
        infos
    }

    pub async fn set_username(&self, user_id: Uuid, username: &str) -> Option<UserInfo> {
        let user = self.users.read().await.get(&user_id)?;
        let mut user = user.lock().await;
        user.set_username(username);
        log::info!("User {user_id} is now {username}");
        Some(user.info())
    }

    pub async fn set_selections(&self, user_id: Uuid, update: SelectionUpdate) -> Option<UserInfo> {
        let user = self.users.read().await.get(&user_id)?;
        let mut user = user.lock().await;
        log::trace!("User {user_id} selected {} ranges in {}", update.selections.len(), update.id);
        user.set_selections(update.id, update.selections);
        Some(user.info())
    }

    /// Start tracking `request.id` for a user. The first opener's text
    /// becomes canonical; later openers get a patch towards it.
    pub async fn open(&self, user_id: Uuid, request: OpenRequest) -> PatchReply {
        // The documents map stays locked until the shadow is in place, so a
        // concurrent sweep cannot drop a canonical document nobody holds yet.
        let mut documents = self.documents.write().await;
        let Some(user) = self.users.read().await.get(&user_id) else {
            return PatchReply::error(INVALID_DOCUMENT_ID);
        };

        let (canonical, created) = documents.get_or_create(&request.id, &request.text);
        let mut shadow = Document::new(request.id.as_str(), request.text);

        let patch = if created {
            log::info!("Document {} created by {user_id}", shadow.id());
            DocumentPatch::empty(shadow.id(), shadow.fingerprint())
        } else {
            let canonical_text = canonical.lock().await.text().to_string();
            let patch = shadow.create_patch(&canonical_text);
            shadow.set_text(canonical_text);
            log::debug!(
                "User {user_id} opened {} with {} hunks to converge",
                shadow.id(),
                patch.hunks.len()
            );
            patch
        };

        user.lock().await.insert_shadow(shadow);
        PatchReply::Patch(patch)
    }

    /// Apply a client patch to its shadow and the canonical document, and
    /// answer with whatever brings the client level with canonical.
    pub async fn patch(&self, user_id: Uuid, patch: DocumentPatch) -> PatchReply {
        let canonical = self.documents.read().await.get(&patch.id);
        let user = self.users.read().await.get(&user_id);
        let (Some(canonical), Some(user)) = (canonical, user) else {
            return PatchReply::error(INVALID_DOCUMENT_ID);
        };

        let mut user = user.lock().await;
        let Some(shadow) = user.shadow_mut(&patch.id) else {
            return PatchReply::error(INVALID_DOCUMENT_ID);
        };

        if !shadow.apply_patch(&patch) {
            log::warn!("Patch from {user_id} failed on shadow {}", patch.id);
            return PatchReply::error(PATCH_FAILED);
        }

        let mut canonical = canonical.lock().await;
        if !canonical.apply_patch_unverified(&patch) {
            log::debug!("Patch from {user_id} applied partially to canonical {}", patch.id);
        }

        if shadow.fingerprint() == canonical.fingerprint() {
            log::trace!("Shadow {} of {user_id} in sync", patch.id);
            return PatchReply::Patch(DocumentPatch::empty(shadow.id(), shadow.fingerprint()));
        }

        let reply = shadow.create_patch(canonical.text());
        shadow.set_text(canonical.text());
        log::debug!("Sending {} hunks to {user_id} for {}", reply.hunks.len(), patch.id);
        PatchReply::Patch(reply)
    }

    /// Forget a user's shadow, then sweep unused documents.
    pub async fn close(&self, user_id: Uuid, doc_id: &str) {
        let user = self.users.read().await.get(&user_id);
        if let Some(user) = user {
            if user.lock().await.remove_shadow(doc_id).is_some() {
                log::debug!("User {user_id} closed {doc_id}");
            }
        }
        self.sweep().await;
    }

    /// Drop canonical documents no user holds a shadow for.
    pub async fn sweep(&self) -> Vec<String> {
        let mut documents = self.documents.write().await;
        let open = self.users.read().await.open_document_ids().await;
        let dropped = documents.retain_open(&open);
        for id in &dropped {
            log::info!("Document {id} dropped (no open shadows)");
        }
        dropped
    }

    pub async fn document_count(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn user_count(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn canonical_text(&self, doc_id: &str) -> Option<String> {
        let doc = self.documents.read().await.get(doc_id)?;
        let text = doc.lock().await.text().to_string();
        Some(text)
    }

    pub async fn shadow_text(&self, user_id: Uuid, doc_id: &str) -> Option<String> {
        let user = self.users.read().await.get(&user_id)?;
        let user = user.lock().await;
        user.shadow(doc_id).map(|s| s.text().to_string())
    }
}
