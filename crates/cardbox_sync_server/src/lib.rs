//! # Cardbox Sync Server
//!
//! The synchronization engine behind a self-hosted flashcard sync
//! server: many users, each with one collection and one media
//! directory, reconcile against the central copy over an optimistic,
//! incremental, last-writer-wins protocol.
//!
//! This crate provides:
//! - The collection sync state machine (`meta` → ... → `finish`)
//! - The media sync protocol (checksum-addressed zip reconciliation)
//! - The per-collection worker registry serializing all access to a
//!   given collection, with an idle monitor that closes dormant ones
//! - The session registry (host key → user → worker), optionally
//!   persisted to SQLite
//! - The full-sync fallback (integrity-checked whole-file transfer)
//!
//! # Architecture
//!
//! The transport layer (HTTP routing, multipart parsing, the process
//! entry point) lives outside this crate. It resolves the path to an
//! [`Operation`](cardbox_sync_protocol::Operation), collects the form
//! fields, and calls [`SyncServer::handle`]; everything from session
//! resolution to response bytes happens here. Each collection is
//! confined to one worker thread, so protocol handlers never contend
//! over a database handle.
//!
//! ```no_run
//! use cardbox_sync_server::{ServerConfig, SyncRequest, SyncServer};
//! use cardbox_sync_protocol::Operation;
//!
//! let server = SyncServer::new(
//!     ServerConfig::new("/srv/cardbox").with_auth_db("/srv/cardbox/auth.db"),
//! )?;
//!
//! let request = SyncRequest::new(Operation::HostKey)
//!     .with_data(br#"{"u": "alice", "p": "secret"}"#.as_slice());
//! let response = server.handle(request)?;
//! # Ok::<(), cardbox_sync_server::ServerError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod collection_sync;
mod config;
mod error;
mod executor;
pub mod full_sync;
mod media_sync;
mod server;
mod session;
mod users;

pub use collection_sync::CollectionSyncHandler;
pub use config::{ServerConfig, DEFAULT_MONITOR_FREQUENCY, DEFAULT_MONITOR_INACTIVITY};
pub use error::{ServerError, ServerResult};
pub use executor::{CollectionManager, CollectionWorker};
pub use media_sync::MediaSyncHandler;
pub use server::{SyncRequest, SyncServer};
pub use session::{ChunkTable, SessionStore, SyncCycleState, SyncSession, COLLECTION_FILENAME};
pub use users::{valid_username, UserStore};
