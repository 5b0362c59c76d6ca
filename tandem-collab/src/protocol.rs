//! Binary protocol for shadow-document synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬────────────┬──────────┐
//! │ msg_type │ peer_id   │ request_id │ payload  │
//! │ 1 byte   │ 16 bytes  │ varint     │ variable │
//! └──────────┴───────────┴────────────┴──────────┘
//! ```
//!
//! `open` and `patch` are requests: the server answers each with a `reply`
//! carrying the same `request_id`. Everything else is fire-and-forget.
//! Server-originated presence messages carry the id of the user they
//! describe in `peer_id`, which is also how connections skip their own
//! broadcasts.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tandem_core::DocumentPatch;
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client display name
    Username = 1,
    /// Full presence record of one user
    User = 2,
    /// A user disconnected
    RemoveUser = 3,
    /// Start syncing a document (request)
    Open = 4,
    /// Stop syncing a document
    Close = 5,
    /// Shadow patch (request)
    Patch = 6,
    /// Answer to an open or patch request
    Reply = 7,
    /// Selection ranges in one document
    Selection = 8,
    /// Document saved by a peer
    Save = 9,
    /// Heartbeat ping
    Ping = 10,
    /// Heartbeat pong
    Pong = 11,
}

/// `[start_line, start_col, end_line, end_col]`
pub type Selection = [u32; 4];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRequest {
    pub id: String,
    pub text: String,
}

/// Server answer to `open` and `patch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchReply {
    Patch(DocumentPatch),
    Error { error: String },
}

impl PatchReply {
    pub fn error(error: impl Into<String>) -> Self {
        Self::Error { error: error.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionUpdate {
    pub id: String,
    pub selections: Vec<Selection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedDocument {
    pub id: String,
    pub text: String,
}

/// Presence record broadcast for each connected user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: Uuid,
    pub username: String,
    pub selections: HashMap<String, Vec<Selection>>,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    /// Correlates replies with requests; 0 for one-way messages.
    pub request_id: u64,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

fn encode_payload<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).unwrap_or_default()
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, request_id: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            request_id,
            payload,
        }
    }

    pub fn username(peer_id: Uuid, name: &str) -> Self {
        Self::new(MessageType::Username, peer_id, 0, encode_payload(&name))
    }

    pub fn user(info: &UserInfo) -> Self {
        Self::new(MessageType::User, info.id, 0, encode_payload(info))
    }

    pub fn remove_user(user_id: Uuid) -> Self {
        Self::new(MessageType::RemoveUser, user_id, 0, Vec::new())
    }

    pub fn open(peer_id: Uuid, request_id: u64, request: &OpenRequest) -> Self {
        Self::new(MessageType::Open, peer_id, request_id, encode_payload(request))
    }

    pub fn close(peer_id: Uuid, doc_id: &str) -> Self {
        Self::new(MessageType::Close, peer_id, 0, encode_payload(&doc_id))
    }

    pub fn patch(peer_id: Uuid, request_id: u64, patch: &DocumentPatch) -> Self {
        Self::new(MessageType::Patch, peer_id, request_id, encode_payload(patch))
    }

    pub fn reply(request_id: u64, reply: &PatchReply) -> Self {
        Self::new(MessageType::Reply, Uuid::nil(), request_id, encode_payload(reply))
    }

    pub fn selection(peer_id: Uuid, update: &SelectionUpdate) -> Self {
        Self::new(MessageType::Selection, peer_id, 0, encode_payload(update))
    }

    pub fn save(peer_id: Uuid, document: &SavedDocument) -> Self {
        Self::new(MessageType::Save, peer_id, 0, encode_payload(document))
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, 0, Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    fn payload_as<T: DeserializeOwned>(&self, expected: MessageType) -> Result<T, ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (value, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(value)
    }

    pub fn username_value(&self) -> Result<String, ProtocolError> {
        self.payload_as(MessageType::Username)
    }

    pub fn user_info(&self) -> Result<UserInfo, ProtocolError> {
        self.payload_as(MessageType::User)
    }

    /// The user a `remove-user` message is about.
    pub fn removed_user(&self) -> Result<Uuid, ProtocolError> {
        if self.msg_type != MessageType::RemoveUser {
            return Err(ProtocolError::InvalidMessageType);
        }
        Ok(self.peer_id)
    }

    pub fn open_request(&self) -> Result<OpenRequest, ProtocolError> {
        self.payload_as(MessageType::Open)
    }

    pub fn closed_document(&self) -> Result<String, ProtocolError> {
        self.payload_as(MessageType::Close)
    }

    pub fn document_patch(&self) -> Result<DocumentPatch, ProtocolError> {
        self.payload_as(MessageType::Patch)
    }

    pub fn patch_reply(&self) -> Result<PatchReply, ProtocolError> {
        self.payload_as(MessageType::Reply)
    }

    pub fn selection_update(&self) -> Result<SelectionUpdate, ProtocolError> {
        self.payload_as(MessageType::Selection)
    }

    pub fn saved_document(&self) -> Result<SavedDocument, ProtocolError> {
        self.payload_as(MessageType::Save)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Request timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
