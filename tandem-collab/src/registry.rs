//! Server-side state: connected users with their shadows, and the canonical
//! documents those shadows converge on.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tandem_core::Document;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::protocol::{Selection, UserInfo};

/// One connection's view of the world.
#[derive(Debug)]
pub struct ServerUser {
    id: Uuid,
    username: String,
    shadows: HashMap<String, Document>,
    selections: HashMap<String, Vec<Selection>>,
}

impl ServerUser {
    /// New user, named after its id until it says otherwise.
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            username: id.to_string(),
            shadows: HashMap::new(),
            selections: HashMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn set_username(&mut self, username: impl Into<String>) {
        self.username = username.into();
    }

    pub fn shadow(&self, doc_id: &str) -> Option<&Document> {
        self.shadows.get(doc_id)
    }

    pub fn shadow_mut(&mut self, doc_id: &str) -> Option<&mut Document> {
        self.shadows.get_mut(doc_id)
    }

    /// Replaces any shadow already held for the same id.
    pub fn insert_shadow(&mut self, shadow: Document) {
        self.shadows.insert(shadow.id().to_string(), shadow);
    }

    pub fn remove_shadow(&mut self, doc_id: &str) -> Option<Document> {
        self.shadows.remove(doc_id)
    }

    pub fn shadow_ids(&self) -> impl Iterator<Item = &str> {
        self.shadows.keys().map(String::as_str)
    }

    pub fn set_selections(&mut self, doc_id: impl Into<String>, selections: Vec<Selection>) {
        self.selections.insert(doc_id.into(), selections);
    }

    pub fn info(&self) -> UserInfo {
        UserInfo {
            id: self.id,
            username: self.username.clone(),
            selections: self.selections.clone(),
        }
    }
}

/// Connected users by id.
#[derive(Debug, Default)]
pub struct UserRegistry {
    users: HashMap<Uuid, Arc<Mutex<ServerUser>>>,
}

impl UserRegistry {
    pub fn insert(&mut self, user: ServerUser) -> Arc<Mutex<ServerUser>> {
        let id = user.id();
        let user = Arc::new(Mutex::new(user));
        self.users.insert(id, user.clone());
        user
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Mutex<ServerUser>>> {
        self.users.get(id).cloned()
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<Arc<Mutex<ServerUser>>> {
        self.users.remove(id)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Uuid, &Arc<Mutex<ServerUser>>)> {
        self.users.iter()
    }

    /// Every document id some user still holds a shadow for.
    pub async fn open_document_ids(&self) -> HashSet<String> {
        let mut open = HashSet::new();
        for user in self.users.values() {
            let user = user.lock().await;
            open.extend(user.shadow_ids().map(str::to_string));
        }
        open
    }
}

/// Canonical documents by id.
#[derive(Debug, Default)]
pub struct DocumentRegistry {
    documents: HashMap<String, Arc<Mutex<Document>>>,
}

impl DocumentRegistry {
    pub fn get(&self, id: &str) -> Option<Arc<Mutex<Document>>> {
        self.documents.get(id).cloned()
    }

    /// Existing canonical document for `id`, or a new one seeded with
    /// `text`. The flag is `true` when the document was created.
    pub fn get_or_create(&mut self, id: &str, text: &str) -> (Arc<Mutex<Document>>, bool) {
        if let Some(doc) = self.documents.get(id) {
            return (doc.clone(), false);
        }
        let doc = Arc::new(Mutex::new(Document::new(id, text)));
        self.documents.insert(id.to_string(), doc.clone());
        (doc, true)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.documents.contains_key(id)
    }

    /// Drop every document not in `open`. Returns the dropped ids.
    pub fn retain_open(&mut self, open: &HashSet<String>) -> Vec<String> {
        let unused: Vec<String> = self
            .documents
            .keys()
            .filter(|id| !open.contains(*id))
            .cloned()
            .collect();
        for id in &unused {
            self.documents.remove(id);
        }
        unused
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}
