//! Client sync engine: one shadow per visible document, kept level with the
//! server through periodic patch round trips.
//!
//! ```text
//!            tick (every update_interval)
//!                 │
//!   buffer ──diff──▶ shadow ──patch──▶ server
//!     ▲                                  │
//!     └──── edit script ◀── reply patch ─┘
//! ```
//!
//! Each document has at most one round trip outstanding. Every shadow
//! carries a generation token; a reply is applied only if the shadow it was
//! requested for is still the current one, so a close/reopen while a reply
//! is in flight drops the stale reply instead of corrupting the new shadow.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tandem_core::{replay, BufferError, Document, DocumentPatch, SharedBuffer, TextPatchCodec};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::client::SyncEvent;
use crate::protocol::{OpenRequest, PatchReply, ProtocolError};

/// How many times an open is retried after a rejected reply before giving up.
pub const MAX_OPEN_ATTEMPTS: usize = 3;

/// Request/reply channel to a sync server.
pub trait SyncTransport: Send + Sync + 'static {
    fn open(&self, request: OpenRequest) -> impl Future<Output = Result<PatchReply, ProtocolError>> + Send;

    fn patch(&self, patch: DocumentPatch) -> impl Future<Output = Result<PatchReply, ProtocolError>> + Send;

    fn close(&self, doc_id: String) -> impl Future<Output = Result<(), ProtocolError>> + Send;
}

/// Why syncing one document failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    Transport(ProtocolError),
    Rejected(String),
    UnknownDocument(String),
    ResyncLimit(String),
    Buffer(String),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Transport error: {e}"),
            Self::Rejected(reason) => write!(f, "Rejected by server: {reason}"),
            Self::UnknownDocument(id) => write!(f, "Document {id} is not open"),
            Self::ResyncLimit(id) => {
                write!(f, "Document {id} failed to open after {MAX_OPEN_ATTEMPTS} attempts")
            }
            Self::Buffer(e) => write!(f, "Buffer error: {e}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        Self::Transport(e)
    }
}

impl From<BufferError> for SyncError {
    fn from(e: BufferError) -> Self {
        Self::Buffer(e.to_string())
    }
}

/// What one tick did for one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Not initialized yet, or a round trip is already outstanding.
    Skipped,
    /// The shadow changed while the request was out; reply dropped.
    Stale,
    /// Reply applied to the shadow and replayed into the buffer.
    Applied,
    /// Server or fingerprint rejected the round trip; document re-opened.
    Reopened,
}

struct ClientShadow {
    document: Document,
    buffer: SharedBuffer,
    generation: u64,
    is_initialized: bool,
    is_round_trip_in_flight: bool,
    is_dirty: bool,
}

impl ClientShadow {
    fn new(document: Document, buffer: SharedBuffer, generation: u64) -> Self {
        Self {
            document,
            buffer,
            generation,
            is_initialized: false,
            is_round_trip_in_flight: false,
            is_dirty: false,
        }
    }

    /// Replay a reply into the live buffer, then flag the shadow dirty if
    /// the buffer still differs (keystrokes made during the round trip).
    fn replay_reply(&mut self, codec: &TextPatchCodec, patch: &DocumentPatch) -> Result<(), BufferError> {
        let mut buffer = self.buffer.lock().map_err(|_| BufferError::Poisoned)?;
        if !replay(codec, &mut *buffer, &patch.hunks)? {
            log::debug!("Reply for {} replayed partially into the buffer", patch.id);
        }
        if buffer.text() != self.document.text() {
            self.is_dirty = true;
        }
        Ok(())
    }
}

fn read_text(buffer: &SharedBuffer) -> Result<String, BufferError> {
    let buffer = buffer.lock().map_err(|_| BufferError::Poisoned)?;
    Ok(buffer.text())
}

enum OpenOutcome {
    Opened,
    Superseded,
    Rejected(String),
}

pub struct ClientSyncEngine<T: SyncTransport> {
    transport: Arc<T>,
    codec: TextPatchCodec,
    shadows: Mutex<HashMap<String, ClientShadow>>,
    next_generation: AtomicU64,
}

impl<T: SyncTransport> ClientSyncEngine<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self::with_codec(transport, TextPatchCodec::default())
    }

    pub fn with_codec(transport: Arc<T>, codec: TextPatchCodec) -> Self {
        Self {
            transport,
            codec,
            shadows: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Start syncing `id` from the current contents of `buffer`. An existing
    /// shadow for the same id is closed first.
    pub async fn open_document(&self, id: &str, buffer: SharedBuffer) -> Result<(), SyncError> {
        self.close(id).await?;

        for attempt in 1..=MAX_OPEN_ATTEMPTS {
            match self.open_once(id, &buffer).await? {
                OpenOutcome::Opened => return Ok(()),
                OpenOutcome::Superseded => {
                    log::debug!("Open of {id} superseded before its reply arrived");
                    return Ok(());
                }
                OpenOutcome::Rejected(reason) => {
                    log::warn!("Open of {id} rejected ({reason}), attempt {attempt}/{MAX_OPEN_ATTEMPTS}");
                }
            }
        }
        Err(SyncError::ResyncLimit(id.to_string()))
    }

    async fn open_once(&self, id: &str, buffer: &SharedBuffer) -> Result<OpenOutcome, SyncError> {
        let text = read_text(buffer)?;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut shadow = ClientShadow::new(Document::new(id, text.as_str()), buffer.clone(), generation);
            shadow.is_round_trip_in_flight = true;
            self.shadows.lock().await.insert(id.to_string(), shadow);
        }

        let request = OpenRequest {
            id: id.to_string(),
            text,
        };
        let reply = match self.transport.open(request).await {
            Ok(reply) => reply,
            Err(e) => {
                self.discard(id, generation).await;
                return Err(e.into());
            }
        };

        let mut shadows = self.shadows.lock().await;
        let Some(shadow) = shadows.get_mut(id).filter(|s| s.generation == generation) else {
            log::warn!("Dropping stale open reply for {id}");
            return Ok(OpenOutcome::Superseded);
        };

        let patch = match reply {
            PatchReply::Patch(patch) => patch,
            PatchReply::Error { error } => {
                shadows.remove(id);
                return Ok(OpenOutcome::Rejected(error));
            }
        };

        if !shadow.document.apply_patch(&patch) {
            shadows.remove(id);
            return Ok(OpenOutcome::Rejected("fingerprint mismatch".to_string()));
        }

        if let Err(e) = shadow.replay_reply(&self.codec, &patch) {
            shadows.remove(id);
            drop(shadows);
            self.notify_close(id).await;
            return Err(e.into());
        }

        shadow.is_initialized = true;
        shadow.is_round_trip_in_flight = false;
        log::info!("Opened {id} ({} hunks to converge)", patch.hunks.len());
        Ok(OpenOutcome::Opened)
    }

    /// One round trip for `id`: push local edits (or probe when clean) and
    /// replay whatever the server sends back.
    pub async fn sync_document(&self, id: &str) -> Result<TickOutcome, SyncError> {
        let (patch, generation) = {
            let mut shadows = self.shadows.lock().await;
            let Some(shadow) = shadows.get_mut(id) else {
                return Err(SyncError::UnknownDocument(id.to_string()));
            };
            if !shadow.is_initialized || shadow.is_round_trip_in_flight {
                return Ok(TickOutcome::Skipped);
            }

            let patch = if shadow.is_dirty {
                let text = read_text(&shadow.buffer)?;
                let patch = shadow.document.create_patch(&text);
                shadow.document.set_text(text);
                shadow.is_dirty = false;
                patch
            } else {
                DocumentPatch::empty(id, shadow.document.fingerprint())
            };
            shadow.is_round_trip_in_flight = true;
            (patch, shadow.generation)
        };

        if patch.is_empty() {
            log::trace!("Probing {id}");
        } else {
            log::debug!("Sending {} hunks for {id}", patch.hunks.len());
        }

        let reply = match self.transport.patch(patch).await {
            Ok(reply) => reply,
            Err(e) => {
                self.discard(id, generation).await;
                return Err(e.into());
            }
        };

        let buffer = {
            let mut shadows = self.shadows.lock().await;
            let Some(shadow) = shadows.get_mut(id).filter(|s| s.generation == generation) else {
                log::warn!("Dropping stale patch reply for {id}");
                return Ok(TickOutcome::Stale);
            };

            match reply {
                PatchReply::Patch(patch) => {
                    if shadow.document.apply_patch(&patch) {
                        if let Err(e) = shadow.replay_reply(&self.codec, &patch) {
                            shadows.remove(id);
                            drop(shadows);
                            self.notify_close(id).await;
                            return Err(e.into());
                        }
                        shadow.is_round_trip_in_flight = false;
                        return Ok(TickOutcome::Applied);
                    }
                    log::warn!("Reply for {id} does not match the shadow, re-opening");
                }
                PatchReply::Error { error } => log::warn!("Server rejected patch for {id}: {error}, re-opening"),
            }

            let buffer = shadow.buffer.clone();
            shadows.remove(id);
            buffer
        };

        self.open_document(id, buffer).await?;
        Ok(TickOutcome::Reopened)
    }

    /// Spawn one round trip per open document. Documents are independent;
    /// failures are logged.
    pub async fn tick(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.document_ids()
            .await
            .into_iter()
            .map(|id| {
                let engine = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = engine.sync_document(&id).await {
                        log::warn!("Sync of {id} failed: {e}");
                    }
                })
            })
            .collect()
    }

    /// Tick forever at `period`.
    pub async fn run(self: Arc<Self>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    /// Note that the buffer behind `id` changed. The diff happens on the
    /// next tick.
    pub async fn mark_dirty(&self, id: &str) -> bool {
        match self.shadows.lock().await.get_mut(id) {
            Some(shadow) => {
                shadow.is_dirty = true;
                true
            }
            None => false,
        }
    }

    /// Stop syncing `id`. Closing an unknown id is a no-op.
    pub async fn close(&self, id: &str) -> Result<(), SyncError> {
        let removed = self.shadows.lock().await.remove(id);
        if removed.is_some() {
            log::debug!("Closing {id}");
            self.transport.close(id.to_string()).await?;
        }
        Ok(())
    }

    /// Reconcile with the set of documents the host currently shows: close
    /// the ones that went away, open the new ones. A known id backed by a
    /// different buffer is re-opened.
    pub async fn set_visible_documents(&self, visible: Vec<(String, SharedBuffer)>) -> Vec<(String, SyncError)> {
        let mut errors = Vec::new();
        let wanted: HashSet<&str> = visible.iter().map(|(id, _)| id.as_str()).collect();

        for id in self.document_ids().await {
            if !wanted.contains(id.as_str()) {
                if let Err(e) = self.close(&id).await {
                    errors.push((id, e));
                }
            }
        }

        for (id, buffer) in &visible {
            let current = {
                let shadows = self.shadows.lock().await;
                shadows.get(id).map(|s| Arc::ptr_eq(&s.buffer, buffer))
            };
            if current == Some(true) {
                continue;
            }
            if let Err(e) = self.open_document(id, buffer.clone()).await {
                errors.push((id.clone(), e));
            }
        }
        errors
    }

    /// Forget every shadow without telling the server. Used when the
    /// connection is gone.
    pub async fn reset(&self) {
        let mut shadows = self.shadows.lock().await;
        if !shadows.is_empty() {
            log::info!("Dropping {} shadows", shadows.len());
        }
        shadows.clear();
    }

    pub async fn handle_event(&self, event: &SyncEvent) {
        if matches!(event, SyncEvent::Disconnected) {
            self.reset().await;
        }
    }

    pub async fn is_open(&self, id: &str) -> bool {
        self.shadows.lock().await.contains_key(id)
    }

    pub async fn is_initialized(&self, id: &str) -> bool {
        self.shadows.lock().await.get(id).is_some_and(|s| s.is_initialized)
    }

    pub async fn is_dirty(&self, id: &str) -> bool {
        self.shadows.lock().await.get(id).is_some_and(|s| s.is_dirty)
    }

    pub async fn shadow_text(&self, id: &str) -> Option<String> {
        self.shadows.lock().await.get(id).map(|s| s.document.text().to_string())
    }

    pub async fn shadow_fingerprint(&self, id: &str) -> Option<String> {
        self.shadows.lock().await.get(id).map(|s| s.document.fingerprint().to_string())
    }

    pub async fn document_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shadows.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drop the shadow only if it is still the one `generation` belongs to.
    async fn discard(&self, id: &str, generation: u64) {
        let mut shadows = self.shadows.lock().await;
        if shadows.get(id).is_some_and(|s| s.generation == generation) {
            shadows.remove(id);
        }
    }

    async fn notify_close(&self, id: &str) {
        if let Err(e) = self.transport.close(id.to_string()).await {
            log::warn!("Failed to close {id} on the server: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackServer;
    use std::sync::atomic::AtomicUsize;
    use tandem_core::{shared, StringBuffer, TextBuffer};

    fn buffer_text(buffer: &SharedBuffer) -> String {
        buffer.lock().unwrap().text()
    }

    fn set_buffer(buffer: &SharedBuffer, text: &str) {
        let mut guard = buffer.lock().unwrap();
        let edits = tandem_core::TextPatchCodec::default()
            .edit_script(&guard.text(), text)
            .to_buffer_edits();
        guard.apply_edits(&edits).unwrap();
    }

    /// Answers every request with the same canned reply.
    struct ScriptedTransport {
        reply: PatchReply,
        opens: AtomicUsize,
        closes: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(reply: PatchReply) -> Self {
            Self {
                reply,
                opens: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
            }
        }
    }

    impl SyncTransport for ScriptedTransport {
        async fn open(&self, _request: OpenRequest) -> Result<PatchReply, ProtocolError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }

        async fn patch(&self, _patch: DocumentPatch) -> Result<PatchReply, ProtocolError> {
            Ok(self.reply.clone())
        }

        async fn close(&self, _doc_id: String) -> Result<(), ProtocolError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct DeadTransport;

    impl SyncTransport for DeadTransport {
        async fn open(&self, _request: OpenRequest) -> Result<PatchReply, ProtocolError> {
            Err(ProtocolError::ConnectionClosed)
        }

        async fn patch(&self, _patch: DocumentPatch) -> Result<PatchReply, ProtocolError> {
            Err(ProtocolError::ConnectionClosed)
        }

        async fn close(&self, _doc_id: String) -> Result<(), ProtocolError> {
            Err(ProtocolError::ConnectionClosed)
        }
    }

    #[tokio::test]
    async fn test_open_initializes_shadow() {
        let server = LoopbackServer::new();
        let engine = ClientSyncEngine::new(Arc::new(server.connect().await));
        let buffer = shared(StringBuffer::new("hello"));

        engine.open_document("a.txt", buffer).await.unwrap();
        assert!(engine.is_open("a.txt").await);
        assert!(engine.is_initialized("a.txt").await);
        assert!(!engine.is_dirty("a.txt").await);
        assert_eq!(engine.shadow_text("a.txt").await.as_deref(), Some("hello"));
        assert_eq!(server.engine().canonical_text("a.txt").await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_open_replays_canonical_into_buffer() {
        let server = LoopbackServer::new();
        let alice = ClientSyncEngine::new(Arc::new(server.connect().await));
        let bob = ClientSyncEngine::new(Arc::new(server.connect().await));

        alice.open_document("a.txt", shared(StringBuffer::new("foo"))).await.unwrap();
        let bob_buffer = shared(StringBuffer::new("bar"));
        bob.open_document("a.txt", bob_buffer.clone()).await.unwrap();

        assert_eq!(buffer_text(&bob_buffer), "foo");
        assert_eq!(bob.shadow_text("a.txt").await.as_deref(), Some("foo"));
    }

    #[tokio::test]
    async fn test_clean_tick_pushes_edit() {
        let server = LoopbackServer::new();
        let engine = ClientSyncEngine::new(Arc::new(server.connect().await));
        let buffer = shared(StringBuffer::new("abc"));
        engine.open_document("a.txt", buffer.clone()).await.unwrap();

        set_buffer(&buffer, "abxc");
        assert!(engine.mark_dirty("a.txt").await);
        assert_eq!(engine.sync_document("a.txt").await.unwrap(), TickOutcome::Applied);

        assert_eq!(server.engine().canonical_text("a.txt").await.as_deref(), Some("abxc"));
        assert_eq!(
            engine.shadow_fingerprint("a.txt").await,
            Some(tandem_core::fingerprint("abxc"))
        );
        assert!(!engine.is_dirty("a.txt").await);
    }

    #[tokio::test]
    async fn test_probe_pulls_remote_edit() {
        let server = LoopbackServer::new();
        let alice = ClientSyncEngine::new(Arc::new(server.connect().await));
        let bob = ClientSyncEngine::new(Arc::new(server.connect().await));
        let alice_buffer = shared(StringBuffer::new("one two"));
        let bob_buffer = shared(StringBuffer::new("one two"));
        alice.open_document("a.txt", alice_buffer.clone()).await.unwrap();
        bob.open_document("a.txt", bob_buffer.clone()).await.unwrap();

        set_buffer(&alice_buffer, "one two three");
        alice.mark_dirty("a.txt").await;
        alice.sync_document("a.txt").await.unwrap();

        // Bob has no local edits, so his tick is a probe.
        assert_eq!(bob.sync_document("a.txt").await.unwrap(), TickOutcome::Applied);
        assert_eq!(buffer_text(&bob_buffer), "one two three");
    }

    #[tokio::test]
    async fn test_sync_unknown_document() {
        let server = LoopbackServer::new();
        let engine = ClientSyncEngine::new(Arc::new(server.connect().await));
        assert_eq!(
            engine.sync_document("nope").await,
            Err(SyncError::UnknownDocument("nope".into()))
        );
        assert!(!engine.mark_dirty("nope").await);
    }

    #[tokio::test]
    async fn test_error_reply_reopens() {
        let transport = Arc::new(ScriptedTransport::new(PatchReply::error("patch failed")));
        let engine = ClientSyncEngine::new(transport.clone());

        let result = engine.open_document("a.txt", shared(StringBuffer::new("x"))).await;
        assert_eq!(result, Err(SyncError::ResyncLimit("a.txt".into())));
        assert_eq!(transport.opens.load(Ordering::SeqCst), MAX_OPEN_ATTEMPTS);
        assert!(!engine.is_open("a.txt").await);
    }

    #[tokio::test]
    async fn test_open_fingerprint_mismatch_is_rejected() {
        let reply = PatchReply::Patch(DocumentPatch::empty("a.txt", "deadbeef"));
        let transport = Arc::new(ScriptedTransport::new(reply));
        let engine = ClientSyncEngine::new(transport.clone());

        assert!(engine.open_document("a.txt", shared(StringBuffer::new("x"))).await.is_err());
        assert_eq!(transport.opens.load(Ordering::SeqCst), MAX_OPEN_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_transport_failure_drops_shadow() {
        let engine = ClientSyncEngine::new(Arc::new(DeadTransport));
        let result = engine.open_document("a.txt", shared(StringBuffer::new("x"))).await;
        assert_eq!(result, Err(SyncError::Transport(ProtocolError::ConnectionClosed)));
        assert!(!engine.is_open("a.txt").await);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let reply = PatchReply::Patch(DocumentPatch::empty("a.txt", tandem_core::fingerprint("x")));
        let transport = Arc::new(ScriptedTransport::new(reply));
        let engine = ClientSyncEngine::new(transport.clone());
        engine.open_document("a.txt", shared(StringBuffer::new("x"))).await.unwrap();

        engine.close("a.txt").await.unwrap();
        engine.close("a.txt").await.unwrap();
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
        assert!(!engine.is_open("a.txt").await);
    }

    #[tokio::test]
    async fn test_reopen_closes_previous_shadow() {
        let server = LoopbackServer::new();
        let engine = ClientSyncEngine::new(Arc::new(server.connect().await));
        engine.open_document("a.txt", shared(StringBuffer::new("one"))).await.unwrap();
        engine.open_document("a.txt", shared(StringBuffer::new("two"))).await.unwrap();

        assert_eq!(engine.document_ids().await, vec!["a.txt".to_string()]);
        // The close swept the canonical document, so the second text won.
        assert_eq!(server.engine().canonical_text("a.txt").await.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn test_reset_on_disconnect() {
        let server = LoopbackServer::new();
        let engine = ClientSyncEngine::new(Arc::new(server.connect().await));
        engine.open_document("a.txt", shared(StringBuffer::new("one"))).await.unwrap();
        engine.open_document("b.txt", shared(StringBuffer::new("two"))).await.unwrap();

        engine.handle_event(&SyncEvent::Connected).await;
        assert_eq!(engine.document_ids().await.len(), 2);

        engine.handle_event(&SyncEvent::Disconnected).await;
        assert!(engine.document_ids().await.is_empty());
    }

    #[test]
    fn test_sync_error_display() {
        assert_eq!(
            SyncError::Rejected("patch failed".into()).to_string(),
            "Rejected by server: patch failed"
        );
        assert_eq!(
            SyncError::ResyncLimit("a.txt".into()).to_string(),
            "Document a.txt failed to open after 3 attempts"
        );
        assert_eq!(
            SyncError::from(ProtocolError::Timeout).to_string(),
            "Transport error: Request timeout"
        );
    }
}
