//! # Cardbox Core
//!
//! SQLite-backed collection storage for the cardbox sync server.
//!
//! This crate provides:
//! - [`Collection`]: one user's card database (cards, notes, review
//!   log, tombstones, and the JSON-bundled metadata maps), with the
//!   usn bookkeeping and merge rules the sync protocol relies on
//! - [`MediaIndex`]: the checksum-addressed media directory index,
//!   kept in a separate database with its own usn stream
//! - Full-sync primitives: integrity-checked file replacement and raw
//!   snapshot reads
//!
//! A `Collection` is not thread-safe by design — the sync server
//! confines each one to a single worker.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod collection;
mod error;
mod media;
pub mod schema;
pub mod time;

pub use collection::{
    field_checksum, media_dir_for, pending_objects, Collection, GraveKind, FIELD_SEPARATOR,
};
pub use error::{CollectionError, CollectionResult};
pub use media::{file_checksum, index_db_path, normalize_filename, MediaIndex};
