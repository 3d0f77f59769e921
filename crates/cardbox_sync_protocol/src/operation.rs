//! Typed operation dispatch.
//!
//! The transport layer maps the final path segment of a request to one
//! of these variants; the server dispatches on the enum, so an endpoint
//! that exists but is not handled is a compile error rather than a
//! runtime lookup failure.

/// A step of the incremental collection sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncOp {
    /// Version handshake and collection summary.
    Meta,
    /// Open a sync cycle; exchange tombstones.
    Start,
    /// Apply a chunk of client-side deletions.
    ApplyGraves,
    /// Two-way merge of models, decks, tags and config.
    ApplyChanges,
    /// Pop the next table of unsynchronized rows.
    Chunk,
    /// Merge a chunk of client rows.
    ApplyChunk,
    /// Compare structural summaries before closing the cycle.
    SanityCheck2,
    /// Close the cycle and bump the collection usn.
    Finish,
}

/// A step of the media sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaOp {
    /// Bind the media cycle to a session key.
    Begin,
    /// List media rows changed since a usn.
    MediaChanges,
    /// Coarse count comparison.
    MediaSanity,
    /// Upload a zip bundle of added/deleted files.
    UploadChanges,
    /// Download a zip bundle of requested files.
    DownloadFiles,
}

/// Any operation the sync server dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Authenticate and allocate a host key.
    HostKey,
    /// A collection sync step.
    Collection(SyncOp),
    /// A media sync step (served under the media base path).
    Media(MediaOp),
    /// Full-sync upload of a whole collection file.
    Upload,
    /// Full-sync download of the whole collection file.
    Download,
}

impl Operation {
    /// Resolves the final path segment of a request URL.
    ///
    /// Returns `None` for unknown segments; the transport should answer
    /// those with a not-found response before reaching the server.
    pub fn from_path(segment: &str) -> Option<Self> {
        let op = match segment {
            "hostKey" => Operation::HostKey,
            "upload" => Operation::Upload,
            "download" => Operation::Download,
            "meta" => Operation::Collection(SyncOp::Meta),
            "start" => Operation::Collection(SyncOp::Start),
            "applyGraves" => Operation::Collection(SyncOp::ApplyGraves),
            "applyChanges" => Operation::Collection(SyncOp::ApplyChanges),
            "chunk" => Operation::Collection(SyncOp::Chunk),
            "applyChunk" => Operation::Collection(SyncOp::ApplyChunk),
            "sanityCheck2" => Operation::Collection(SyncOp::SanityCheck2),
            "finish" => Operation::Collection(SyncOp::Finish),
            "begin" => Operation::Media(MediaOp::Begin),
            "mediaChanges" => Operation::Media(MediaOp::MediaChanges),
            "mediaSanity" => Operation::Media(MediaOp::MediaSanity),
            "uploadChanges" => Operation::Media(MediaOp::UploadChanges),
            "downloadFiles" => Operation::Media(MediaOp::DownloadFiles),
            _ => return None,
        };
        Some(op)
    }

    /// The wire name of this operation.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::HostKey => "hostKey",
            Operation::Upload => "upload",
            Operation::Download => "download",
            Operation::Collection(SyncOp::Meta) => "meta",
            Operation::Collection(SyncOp::Start) => "start",
            Operation::Collection(SyncOp::ApplyGraves) => "applyGraves",
            Operation::Collection(SyncOp::ApplyChanges) => "applyChanges",
            Operation::Collection(SyncOp::Chunk) => "chunk",
            Operation::Collection(SyncOp::ApplyChunk) => "applyChunk",
            Operation::Collection(SyncOp::SanityCheck2) => "sanityCheck2",
            Operation::Collection(SyncOp::Finish) => "finish",
            Operation::Media(MediaOp::Begin) => "begin",
            Operation::Media(MediaOp::MediaChanges) => "mediaChanges",
            Operation::Media(MediaOp::MediaSanity) => "mediaSanity",
            Operation::Media(MediaOp::UploadChanges) => "uploadChanges",
            Operation::Media(MediaOp::DownloadFiles) => "downloadFiles",
        }
    }

    /// Returns true if the operation needs an established session.
    ///
    /// Everything except the handshake does.
    pub fn requires_session(&self) -> bool {
        !matches!(self, Operation::HostKey)
    }

    /// Returns true if the request payload is raw bytes rather than JSON.
    pub fn raw_payload(&self) -> bool {
        matches!(self, Operation::Upload | Operation::Media(MediaOp::UploadChanges))
    }
}
