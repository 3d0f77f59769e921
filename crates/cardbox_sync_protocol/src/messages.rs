//! Request and response messages for every protocol step.
//!
//! Structured calls carry JSON; the field names below are the wire
//! contract and must not change. Metadata objects (models, decks, deck
//! configs) are schema-opaque maps — the server reads only their `id`,
//! `mod` and `usn` members and passes the rest through.

use crate::rows::{CardRow, NoteRow, RevlogRow};
use serde::{Deserialize, Serialize};

/// A schema-opaque JSON object.
pub type JsonObject = serde_json::Map<String, serde_json::Value>;

/// `meta` request: protocol version and client version string.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaRequest {
    /// Client's sync protocol version.
    #[serde(default)]
    pub v: u8,
    /// Client version string, `"<client>,<version>,<platform>"`.
    #[serde(default)]
    pub cv: Option<String>,
}

/// `meta` response: collection summary, or an upgrade notice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaResponse {
    /// Collection modification timestamp.
    #[serde(rename = "mod")]
    pub modified: i64,
    /// Schema modification timestamp.
    pub scm: i64,
    /// Collection update sequence number.
    pub usn: i64,
    /// Server timestamp (seconds).
    pub ts: i64,
    /// Current media usn.
    pub musn: i64,
    /// Owning username.
    pub uname: String,
    /// Human-readable notice; set when `cont` is false.
    pub msg: String,
    /// False when the client must upgrade before syncing.
    pub cont: bool,
    /// Shard hint; always zero for a self-hosted server.
    #[serde(rename = "hostNum")]
    pub host_num: i64,
}

impl MetaResponse {
    /// An upgrade notice: the client cannot continue with this server.
    pub fn incompatible(msg: impl Into<String>) -> Self {
        Self {
            modified: 0,
            scm: 0,
            usn: 0,
            ts: 0,
            musn: 0,
            uname: String::new(),
            msg: msg.into(),
            cont: false,
            host_num: 0,
        }
    }
}

/// Tombstone ids, partitioned by object type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graves {
    /// Deleted card ids.
    pub cards: Vec<i64>,
    /// Deleted note ids.
    pub notes: Vec<i64>,
    /// Deleted deck ids.
    pub decks: Vec<i64>,
}

impl Graves {
    /// Returns true if no ids are carried.
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty() && self.notes.is_empty() && self.decks.is_empty()
    }
}

/// `start` request: opens a sync cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    /// The client's sync baseline; the server returns everything at or
    /// above this usn.
    #[serde(rename = "minUsn")]
    pub min_usn: i64,
    /// True when the client's collection is the newer side.
    #[serde(default)]
    pub lnewer: bool,
    /// Client tombstones sent inline by older protocol variants; newer
    /// clients send them through `applyGraves` and pass null here.
    #[serde(default)]
    pub graves: Option<Graves>,
}

/// `applyGraves` request: one chunk of client tombstones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyGravesRequest {
    /// The tombstones to apply.
    pub chunk: Graves,
}

/// The fully-bundled small objects exchanged by `applyChanges`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Changes {
    /// Changed note-type schemas.
    pub models: Vec<JsonObject>,
    /// Changed decks and deck configs, as the pair `[decks, dconf]`.
    pub decks: (Vec<JsonObject>, Vec<JsonObject>),
    /// Changed tag names.
    pub tags: Vec<String>,
    /// Collection configuration; only sent by the newer side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conf: Option<JsonObject>,
    /// Collection creation timestamp; only sent by the newer side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crt: Option<i64>,
}

/// `applyChanges` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyChangesRequest {
    /// The client's pending changes.
    pub changes: Changes,
}

/// A batch of unsynchronized rows from at most one table per call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Chunk {
    /// True once every chunked table has been drained.
    pub done: bool,
    /// Review log rows, if this call drained `revlog`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revlog: Option<Vec<RevlogRow>>,
    /// Card rows, if this call drained `cards`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cards: Option<Vec<CardRow>>,
    /// Note rows, if this call drained `notes`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<Vec<NoteRow>>,
}

/// `applyChunk` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyChunkRequest {
    /// The client rows to merge.
    pub chunk: Chunk,
}

/// Structural summary compared by `sanityCheck2`:
/// `[[new, learning, review], cards, notes, revlog, graves, models,
/// decks, dconf]`, with the scheduler counts canonicalized to zeros.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitySummary(
    pub [i64; 3],
    pub i64,
    pub i64,
    pub i64,
    pub i64,
    pub i64,
    pub i64,
    pub i64,
);

/// `sanityCheck2` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanityCheckRequest {
    /// The client's structural summary.
    pub client: SanitySummary,
    /// Reserved flag; carried for compatibility.
    #[serde(default)]
    pub full: Option<bool>,
}

/// `sanityCheck2` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanityCheckResponse {
    /// `"ok"` or `"bad"`.
    pub status: String,
    /// The client summary, echoed on mismatch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub c: Option<SanitySummary>,
    /// The server summary, included on mismatch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<SanitySummary>,
}

impl SanityCheckResponse {
    /// The summaries matched.
    pub fn ok() -> Self {
        Self {
            status: "ok".into(),
            c: None,
            s: None,
        }
    }

    /// The summaries diverged; the client should fall back to full sync.
    pub fn bad(client: SanitySummary, server: SanitySummary) -> Self {
        Self {
            status: "bad".into(),
            c: Some(client),
            s: Some(server),
        }
    }

    /// Returns true if the check passed.
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// `hostKey` request: username and password.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostKeyRequest {
    /// Username.
    pub u: String,
    /// Password.
    pub p: String,
}

/// `hostKey` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostKeyResponse {
    /// The allocated host key.
    pub key: String,
}

/// Envelope wrapping every structured media response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaEnvelope<T> {
    /// The payload.
    pub data: T,
    /// Error text; empty on success. Protocol-level failures surface as
    /// transport errors instead, so this server always sends it empty.
    pub err: String,
}

impl<T> MediaEnvelope<T> {
    /// Wraps a successful payload.
    pub fn ok(data: T) -> Self {
        Self {
            data,
            err: String::new(),
        }
    }
}

/// `begin` response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaBeginResponse {
    /// The per-cycle session key the client quotes back in `sk`.
    pub sk: String,
    /// Current media usn.
    pub usn: i64,
}

/// `mediaChanges` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaChangesRequest {
    /// The client's media baseline.
    #[serde(rename = "lastUsn")]
    pub last_usn: i64,
}

/// One media index entry on the wire: `[filename, usn, checksum]`,
/// checksum null for a deleted file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaChange(pub String, pub i64, pub Option<String>);

impl MediaChange {
    /// Filename.
    pub fn fname(&self) -> &str {
        &self.0
    }

    /// Update sequence number.
    pub fn usn(&self) -> i64 {
        self.1
    }

    /// Content checksum; `None` means deleted.
    pub fn checksum(&self) -> Option<&str> {
        self.2.as_deref()
    }
}

/// `downloadFiles` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaDownloadRequest {
    /// Filenames to bundle.
    pub files: Vec<String>,
}

/// `mediaSanity` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaSanityRequest {
    /// The client's count of non-deleted media files.
    pub local: i64,
}

/// `uploadChanges` response payload: `[processed_count, current_usn]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaUploadResponse(pub usize, pub i64);
