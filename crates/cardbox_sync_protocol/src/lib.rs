//! # Cardbox Sync Protocol
//!
//! Wire types for the cardbox collection and media sync protocols.
//!
//! This crate provides:
//! - The typed [`Operation`] dispatch enum covering every endpoint
//! - JSON request/response messages for each protocol step
//! - Positional row types for chunked table transfer
//! - Protocol version constants and client compatibility gates
//! - Payload size ceilings shared by both sides of the media protocol
//!
//! This is a pure protocol crate with no I/O operations. Field names on
//! the wire (`minUsn`, `lnewer`, `musn`, ...) follow the protocol the
//! established clients speak, so serde renames are part of the contract.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod limits;
mod messages;
mod operation;
mod rows;
mod version;

pub use limits::{
    MEDIA_META_SIZE_CEILING, MEDIA_UPLOAD_SIZE_CEILING, MEDIA_ZIP_FILE_CEILING,
    MEDIA_ZIP_SIZE_CEILING,
};
pub use messages::{
    ApplyChangesRequest, ApplyChunkRequest, ApplyGravesRequest, Changes, Chunk, Graves,
    HostKeyRequest, HostKeyResponse, JsonObject, MediaBeginResponse, MediaChange,
    MediaChangesRequest, MediaDownloadRequest, MediaEnvelope, MediaSanityRequest,
    MediaUploadResponse, MetaRequest, MetaResponse, SanityCheckRequest, SanityCheckResponse,
    SanitySummary, StartRequest,
};
pub use operation::{MediaOp, Operation, SyncOp};
pub use rows::{CardRow, NoteRow, RevlogRow};
pub use version::{client_too_old, MIN_SYNC_VERSION, SYNC_VERSION};
