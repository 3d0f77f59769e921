//! The server-local media index.
//!
//! Media files live in a per-collection directory; their sync state
//! lives in a separate SQLite file next to it
//! (`collection.media.server.db`). Each row carries the filename, the
//! usn at which it last changed, and a SHA-1 checksum — or a null
//! checksum meaning "deleted". The index opens and closes with its
//! collection; it never outlives it.

use crate::error::{CollectionError, CollectionResult};
use cardbox_sync_protocol::MediaChange;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use unicode_normalization::UnicodeNormalization;

const MEDIA_SCHEMA: &str = "
CREATE TABLE media (
    fname TEXT NOT NULL PRIMARY KEY,
    usn   INT NOT NULL,
    csum  TEXT
);
CREATE INDEX idx_media_usn ON media (usn);
";

/// The media directory and its sync-state database.
pub struct MediaIndex {
    dir: PathBuf,
    db: Connection,
}

impl MediaIndex {
    /// Opens the index for the given media directory, creating the
    /// directory and database on first use.
    pub fn open(dir: PathBuf) -> CollectionResult<Self> {
        std::fs::create_dir_all(&dir)?;
        let db_path = index_db_path(&dir);
        let fresh = !db_path.exists();
        let db = Connection::open(&db_path)?;
        if fresh {
            db.execute_batch(MEDIA_SCHEMA)?;
            debug!(dir = %dir.display(), "created media index");
        }
        Ok(Self { dir, db })
    }

    /// The media directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The highest usn in the index, 0 when empty.
    pub fn last_usn(&self) -> CollectionResult<i64> {
        let max: Option<i64> = self
            .db
            .query_row("SELECT max(usn) FROM media", [], |r| r.get(0))?;
        Ok(max.unwrap_or(0))
    }

    /// The number of non-deleted files.
    pub fn count(&self) -> CollectionResult<i64> {
        Ok(self.db.query_row(
            "SELECT count(*) FROM media WHERE csum IS NOT NULL",
            [],
            |r| r.get(0),
        )?)
    }

    /// The sync info of one file, if known.
    pub fn entry(&self, fname: &str) -> CollectionResult<Option<MediaChange>> {
        Ok(self
            .db
            .query_row(
                "SELECT fname, usn, csum FROM media WHERE fname = ?1",
                params![fname],
                |r| Ok(MediaChange(r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?)
    }

    /// Entries with `usn > last_usn`, ascending, so the final element
    /// carries the server's current media usn — a client invariant.
    pub fn changes_since(&self, last_usn: i64) -> CollectionResult<Vec<MediaChange>> {
        let mut stmt = self
            .db
            .prepare("SELECT fname, usn, csum FROM media WHERE usn > ?1 ORDER BY usn")?;
        let rows = stmt
            .query_map(params![last_usn], |r| {
                Ok(MediaChange(r.get(0)?, r.get(1)?, r.get(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Writes file contents into the media directory and records the
    /// entry at the given usn. Returns the content checksum.
    pub fn add_file(&mut self, fname: &str, data: &[u8], usn: i64) -> CollectionResult<String> {
        let path = self.file_path(fname)?;
        std::fs::write(path, data)?;
        let csum = file_checksum(data);
        self.db.execute(
            "INSERT OR REPLACE INTO media (fname, usn, csum) VALUES (?1, ?2, ?3)",
            params![fname, usn, csum],
        )?;
        Ok(csum)
    }

    /// Removes a file from the media directory and records the deletion
    /// at the given usn. A file already missing from disk is tolerated;
    /// the deletion still propagates.
    pub fn sync_delete(&mut self, fname: &str, usn: i64) -> CollectionResult<()> {
        let path = self.file_path(fname)?;
        if path.exists() {
            if let Err(err) = std::fs::remove_file(&path) {
                warn!(fname, %err, "could not remove media file");
            }
        }
        self.db.execute(
            "INSERT OR REPLACE INTO media (fname, usn, csum) VALUES (?1, ?2, NULL)",
            params![fname, usn],
        )?;
        Ok(())
    }

    /// Reads a file's contents from the media directory.
    pub fn read_file(&self, fname: &str) -> CollectionResult<Vec<u8>> {
        Ok(std::fs::read(self.file_path(fname)?)?)
    }

    /// Resolves a filename inside the media directory, rejecting names
    /// that would escape it.
    pub fn file_path(&self, fname: &str) -> CollectionResult<PathBuf> {
        if fname.is_empty()
            || fname.contains('/')
            || fname.contains('\\')
            || fname.contains("..")
        {
            return Err(CollectionError::InvalidFilename(fname.into()));
        }
        Ok(self.dir.join(fname))
    }
}

/// The index database path for a media directory.
pub fn index_db_path(dir: &Path) -> PathBuf {
    let mut name = dir.as_os_str().to_os_string();
    name.push(".server.db");
    PathBuf::from(name)
}

/// SHA-1 hex checksum of media file contents.
pub fn file_checksum(data: &[u8]) -> String {
    use sha1::{Digest, Sha1};
    hex::encode(Sha1::digest(data))
}

/// Normalizes a media filename the way this platform stores it: NFD on
/// macOS, NFC everywhere else.
pub fn normalize_filename(fname: &str) -> String {
    #[cfg(target_os = "macos")]
    {
        fname.nfd().collect()
    }
    #[cfg(not(target_os = "macos"))]
    {
        fname.nfc().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_index() -> (TempDir, MediaIndex) {
        let dir = TempDir::new().unwrap();
        let index = MediaIndex::open(dir.path().join("collection.media")).unwrap();
        (dir, index)
    }

    #[test]
    fn empty_index() {
        let (_dir, index) = open_index();
        assert_eq!(index.last_usn().unwrap(), 0);
        assert_eq!(index.count().unwrap(), 0);
        assert!(index.changes_since(0).unwrap().is_empty());
    }

    #[test]
    fn add_and_delete_advance_usn() {
        let (_dir, mut index) = open_index();
        let csum = index.add_file("cat.jpg", b"meow", 1).unwrap();
        assert_eq!(csum, file_checksum(b"meow"));
        assert_eq!(index.last_usn().unwrap(), 1);
        assert_eq!(index.count().unwrap(), 1);
        assert!(index.dir().join("cat.jpg").exists());

        index.sync_delete("cat.jpg", 2).unwrap();
        assert_eq!(index.last_usn().unwrap(), 2);
        assert_eq!(index.count().unwrap(), 0);
        assert!(!index.dir().join("cat.jpg").exists());

        let changes = index.changes_since(0).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].fname(), "cat.jpg");
        assert!(changes[0].checksum().is_none());
    }

    #[test]
    fn deleting_an_unknown_file_still_propagates() {
        let (_dir, mut index) = open_index();
        index.sync_delete("ghost.png", 1).unwrap();
        assert_eq!(index.last_usn().unwrap(), 1);
        let changes = index.changes_since(0).unwrap();
        assert_eq!(changes[0].fname(), "ghost.png");
    }

    #[test]
    fn changes_are_ascending_and_end_at_current_usn() {
        let (_dir, mut index) = open_index();
        index.add_file("a.jpg", b"a", 1).unwrap();
        index.add_file("b.jpg", b"b", 2).unwrap();
        index.add_file("c.jpg", b"c", 3).unwrap();

        let changes = index.changes_since(1).unwrap();
        let usns: Vec<i64> = changes.iter().map(MediaChange::usn).collect();
        assert_eq!(usns, vec![2, 3]);
        assert_eq!(changes.last().unwrap().usn(), index.last_usn().unwrap());
    }

    #[test]
    fn escaping_filenames_rejected() {
        let (_dir, index) = open_index();
        assert!(index.file_path("../../etc/passwd").is_err());
        assert!(index.file_path("a/b.jpg").is_err());
        assert!(index.file_path("a\\b.jpg").is_err());
        assert!(index.file_path("").is_err());
        assert!(index.file_path("plain.jpg").is_ok());
    }

    #[test]
    fn filename_normalization() {
        // "é" composed vs decomposed
        let decomposed = "e\u{301}.jpg";
        let normalized = normalize_filename(decomposed);
        #[cfg(not(target_os = "macos"))]
        assert_eq!(normalized, "\u{e9}.jpg");
        #[cfg(target_os = "macos")]
        assert_eq!(normalized, decomposed);
    }

    #[test]
    fn index_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let media_dir = dir.path().join("collection.media");
        {
            let mut index = MediaIndex::open(media_dir.clone()).unwrap();
            index.add_file("keep.jpg", b"data", 5).unwrap();
        }
        let index = MediaIndex::open(media_dir).unwrap();
        assert_eq!(index.last_usn().unwrap(), 5);
        assert_eq!(index.entry("keep.jpg").unwrap().unwrap().usn(), 5);
    }
}
