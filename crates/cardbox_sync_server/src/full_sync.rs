//! Whole-file fallback transfer.
//!
//! Used when incremental sync is unsafe — after structural divergence,
//! or when the client's collection was rebuilt. Uploads are staged to a
//! temporary file and integrity-checked before the live collection file
//! is replaced; a corrupt upload leaves the prior file untouched.

use crate::error::{ServerError, ServerResult};
use cardbox_core::{Collection, CollectionError};
use tracing::{info, warn};

/// Response body a successful upload answers with.
pub const UPLOAD_OK: &[u8] = b"OK";

/// Replaces the collection with an uploaded database file.
///
/// The bytes are written next to the live file, validated there, and
/// only then swapped in; the collection and its media index are
/// reopened afterwards. Validation failure is reported as
/// [`ServerError::CorruptUpload`] and destroys nothing.
pub fn upload(col: &mut Collection, data: &[u8]) -> ServerResult<Vec<u8>> {
    let staging = col.path().with_extension("tmp");
    std::fs::write(&staging, data)?;
    info!(bytes = data.len(), "staged full-sync upload");

    col.replace_from(&staging).map_err(|err| match err {
        CollectionError::Corrupt(_) | CollectionError::Sqlite(_) => {
            warn!(%err, "rejecting corrupt full-sync upload");
            ServerError::CorruptUpload(err.to_string())
        }
        other => other.into(),
    })?;
    Ok(UPLOAD_OK.to_vec())
}

/// Streams the raw collection file for the client to adopt wholesale.
/// The database handle is closed for the read so the file is complete
/// and self-contained, then reopened.
pub fn download(col: &mut Collection) -> ServerResult<Vec<u8>> {
    let bytes = col.raw_bytes()?;
    info!(bytes = bytes.len(), "serving full-sync download");
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_collection(dir: &TempDir, name: &str) -> Collection {
        Collection::open(dir.path().join(name).join("collection.db")).unwrap()
    }

    #[test]
    fn upload_replaces_collection() {
        let dir = TempDir::new().unwrap();
        let mut col = open_collection(&dir, "alice");

        // donor database with usn 3
        let donor = open_collection(&dir, "donor");
        donor.increment_usn().unwrap();
        donor.increment_usn().unwrap();
        donor.increment_usn().unwrap();
        let donor_path = donor.path().to_path_buf();
        drop(donor);
        let data = std::fs::read(donor_path).unwrap();

        let resp = upload(&mut col, &data).unwrap();
        assert_eq!(resp, UPLOAD_OK);
        assert_eq!(col.usn().unwrap(), 3);
    }

    #[test]
    fn corrupt_upload_leaves_prior_file_untouched() {
        let dir = TempDir::new().unwrap();
        let mut col = open_collection(&dir, "alice");
        col.increment_usn().unwrap();

        let err = upload(&mut col, b"definitely not sqlite").unwrap_err();
        assert!(matches!(err, ServerError::CorruptUpload(_)));
        assert_eq!(col.usn().unwrap(), 1);
        assert!(!col.path().with_extension("tmp").exists());
    }

    #[test]
    fn download_round_trips_through_upload() {
        let dir = TempDir::new().unwrap();
        let mut source = open_collection(&dir, "alice");
        source.increment_usn().unwrap();

        let bytes = download(&mut source).unwrap();
        assert!(bytes.starts_with(b"SQLite format 3"));
        // the source survives the read
        assert_eq!(source.usn().unwrap(), 1);

        let mut target = open_collection(&dir, "bob");
        upload(&mut target, &bytes).unwrap();
        assert_eq!(target.usn().unwrap(), 1);
    }
}
