//! # tandem-collab: Differential sync over WebSocket
//!
//! Keeps client shadows and server canonical documents convergent by
//! exchanging context patches.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   open / patch    ┌──────────────────┐
//! │ ClientSyncEngine │ ────────────────► │ ServerSyncEngine │
//! │ (shadow per doc) │ ◄──────────────── │ (shadow per user │
//! └────────┬─────────┘   reply patch     │  per doc)        │
//!          │                             └────────┬─────────┘
//!          ▼                                      ▼
//! ┌──────────────────┐                   ┌──────────────────┐
//! │ SyncClient       │   Binary Proto    │ SyncServer       │
//! │ (SyncTransport)  │ ◄───────────────► │ + BroadcastGroup │
//! └──────────────────┘                   └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`]: Server-wide fan-out of presence and saves
//! - [`registry`]: Server users and canonical documents
//! - [`engine`]: Server side of the patch round trip
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client
//! - [`client_engine`]: Client shadows and the sync tick
//! - [`presence`]: Remote user roster, selection throttling
//! - [`loopback`]: In-process transport

pub mod protocol;
pub mod broadcast;
pub mod registry;
pub mod engine;
pub mod server;
pub mod client;
pub mod client_engine;
pub mod presence;
pub mod loopback;

// Re-exports for convenience
pub use protocol::{
    MessageType, OpenRequest, PatchReply, ProtocolError, SavedDocument, Selection, SelectionUpdate,
    SyncMessage, UserInfo,
};
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use registry::{DocumentRegistry, ServerUser, UserRegistry};
pub use engine::ServerSyncEngine;
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{ClientConfig, ConnectionState, SyncClient, SyncEvent};
pub use client_engine::{ClientSyncEngine, SyncError, SyncTransport, TickOutcome, MAX_OPEN_ATTEMPTS};
pub use presence::{PresenceRoster, RemoteUser, SelectionThrottle};
pub use loopback::{LoopbackServer, LoopbackTransport};
