//! Payload ceilings shared by both sides of the media protocol.

/// Total payload ceiling for one outgoing media zip bundle (bytes).
///
/// `downloadFiles` stops adding members once the running total passes
/// this; the client re-requests the remainder.
pub const MEDIA_ZIP_SIZE_CEILING: u64 = 2_621_440; // 2.5 MiB

/// File-count ceiling for one outgoing media zip bundle.
pub const MEDIA_ZIP_FILE_CEILING: usize = 25;

/// Size ceiling for the `_meta` index member of an uploaded zip (bytes).
///
/// Checked against the declared uncompressed size before extraction.
pub const MEDIA_META_SIZE_CEILING: u64 = 100_000;

/// Ceiling for the sum of all member sizes of an uploaded zip (bytes).
///
/// Checked against declared uncompressed sizes before extraction.
pub const MEDIA_UPLOAD_SIZE_CEILING: u64 = 100 * 1024 * 1024;
