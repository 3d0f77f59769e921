//! The media sync protocol.
//!
//! Media reconciliation runs on its own usn stream, independent of the
//! collection cycle. Files travel in zip bundles: numbered members
//! `"0"`, `"1"`, ... hold contents, and a `_meta` member carries the
//! index. Uploads are untrusted — both ceilings are checked against the
//! declared sizes before a single byte is extracted, and the entry
//! count must reconcile with the index before anything is written.

use crate::error::{ServerError, ServerResult};
use crate::session::SyncSession;
use cardbox_core::{normalize_filename, Collection};
use cardbox_sync_protocol::{
    MediaBeginResponse, MediaChange, MediaChangesRequest, MediaDownloadRequest, MediaEnvelope,
    MediaSanityRequest, MediaUploadResponse, MEDIA_META_SIZE_CEILING, MEDIA_UPLOAD_SIZE_CEILING,
    MEDIA_ZIP_FILE_CEILING, MEDIA_ZIP_SIZE_CEILING,
};
use serde_json::Value;
use std::io::{Cursor, Read, Write};
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Handles the media-sync steps for one session.
pub struct MediaSyncHandler<'a> {
    col: &'a mut Collection,
    session: &'a SyncSession,
}

impl<'a> MediaSyncHandler<'a> {
    /// Binds a handler to the live collection and session.
    pub fn new(col: &'a mut Collection, session: &'a SyncSession) -> Self {
        Self { col, session }
    }

    /// Binds the media cycle to the session key and reports the current
    /// media usn.
    pub fn begin(&mut self) -> ServerResult<MediaEnvelope<MediaBeginResponse>> {
        Ok(MediaEnvelope::ok(MediaBeginResponse {
            sk: self.session.session_key(),
            usn: self.col.media().last_usn()?,
        }))
    }

    /// Entries changed since the client's baseline, ascending by usn.
    /// Clients rely on the final entry's usn equalling the server's
    /// current media usn.
    pub fn media_changes(
        &mut self,
        req: MediaChangesRequest,
    ) -> ServerResult<MediaEnvelope<Vec<MediaChange>>> {
        Ok(MediaEnvelope::ok(
            self.col.media().changes_since(req.last_usn)?,
        ))
    }

    /// Adopts a client zip bundle: adds the files it carries, deletes
    /// the files its index marks absent, each advancing the media usn by
    /// one. Rejected wholesale — nothing written, usn untouched — when
    /// a ceiling or the index reconciliation fails.
    pub fn upload_changes(
        &mut self,
        zip_bytes: &[u8],
    ) -> ServerResult<MediaEnvelope<MediaUploadResponse>> {
        let mut archive = ZipArchive::new(Cursor::new(zip_bytes))?;
        check_upload_ceilings(&mut archive)?;
        let meta = read_meta(&mut archive)?;

        let removals: Vec<String> = meta
            .iter()
            .filter(|(_, ordinal)| ordinal.is_empty())
            .map(|(fname, _)| normalize_filename(fname))
            .collect();
        let addition_count = archive.file_names().filter(|name| *name != "_meta").count();
        if removals.len() + addition_count != meta.len() {
            return Err(ServerError::MalformedUpload(format!(
                "index lists {} entries but the bundle holds {} additions and {} deletions",
                meta.len(),
                addition_count,
                removals.len()
            )));
        }

        let start_usn = self.col.media().last_usn()?;
        let mut usn = start_usn;
        for fname in &removals {
            usn += 1;
            self.col.media_mut().sync_delete(fname, usn)?;
        }
        for i in 0..archive.len() {
            let mut member = archive.by_index(i)?;
            if member.name() == "_meta" {
                continue;
            }
            let ordinal: usize = member.name().parse().map_err(|_| {
                ServerError::MalformedUpload(format!("unexpected member name {:?}", member.name()))
            })?;
            let (fname, marker) = meta.get(ordinal).ok_or_else(|| {
                ServerError::MalformedUpload(format!("member {ordinal} missing from index"))
            })?;
            if marker.is_empty() {
                return Err(ServerError::MalformedUpload(format!(
                    "member {ordinal} is indexed as a deletion"
                )));
            }
            let mut data = Vec::with_capacity(member.size() as usize);
            member.read_to_end(&mut data)?;
            let fname = normalize_filename(fname);
            usn += 1;
            self.col.media_mut().add_file(&fname, &data, usn)?;
        }

        let processed = (usn - start_usn) as usize;
        info!(
            processed,
            additions = addition_count,
            deletions = removals.len(),
            "adopted media changes"
        );
        Ok(MediaEnvelope::ok(MediaUploadResponse(
            processed,
            self.col.media().last_usn()?,
        )))
    }

    /// Bundles the requested files, stopping past the size or count
    /// ceiling; the client re-requests whatever was left out.
    pub fn download_files(&mut self, req: MediaDownloadRequest) -> ServerResult<Vec<u8>> {
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let mut names = serde_json::Map::new();
        let mut total = 0u64;
        let mut count = 0usize;

        for fname in &req.files {
            let data = self.col.media().read_file(fname)?;
            writer.start_file(count.to_string(), options)?;
            writer.write_all(&data)?;
            names.insert(count.to_string(), Value::String(fname.clone()));
            total += data.len() as u64;
            count += 1;
            if total > MEDIA_ZIP_SIZE_CEILING || count >= MEDIA_ZIP_FILE_CEILING {
                break;
            }
        }
        debug!(count, requested = req.files.len(), "bundled media files");

        writer.start_file("_meta", options)?;
        writer.write_all(serde_json::to_string(&names)?.as_bytes())?;
        let cursor = writer.finish()?;
        Ok(cursor.into_inner())
    }

    /// Coarse consistency check: compares non-deleted file counts.
    pub fn media_sanity(
        &mut self,
        req: MediaSanityRequest,
    ) -> ServerResult<MediaEnvelope<String>> {
        let server = self.col.media().count()?;
        let verdict = if server == req.local { "OK" } else { "FAILED" };
        if verdict == "FAILED" {
            info!(server, client = req.local, "media count mismatch");
        }
        Ok(MediaEnvelope::ok(verdict.to_string()))
    }
}

/// Validates both declared-size ceilings before extraction.
fn check_upload_ceilings(archive: &mut ZipArchive<Cursor<&[u8]>>) -> ServerResult<()> {
    let meta_size = archive
        .by_name("_meta")
        .map_err(|_| ServerError::MalformedUpload("bundle is missing its _meta index".into()))?
        .size();
    if meta_size > MEDIA_META_SIZE_CEILING {
        return Err(ServerError::MalformedUpload(format!(
            "index declares {meta_size} bytes, ceiling is {MEDIA_META_SIZE_CEILING}"
        )));
    }
    let mut total = 0u64;
    for i in 0..archive.len() {
        total = total.saturating_add(archive.by_index(i)?.size());
    }
    if total > MEDIA_UPLOAD_SIZE_CEILING {
        return Err(ServerError::MalformedUpload(format!(
            "bundle declares {total} bytes, ceiling is {MEDIA_UPLOAD_SIZE_CEILING}"
        )));
    }
    Ok(())
}

/// Parses the `_meta` index: `[filename, ordinal_or_empty]` pairs.
fn read_meta(archive: &mut ZipArchive<Cursor<&[u8]>>) -> ServerResult<Vec<(String, String)>> {
    let mut buf = String::new();
    archive.by_name("_meta")?.read_to_string(&mut buf)?;
    serde_json::from_str(&buf)
        .map_err(|err| ServerError::MalformedUpload(format!("unreadable _meta index: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardbox_sync_protocol::Graves;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        col: Collection,
        session: SyncSession,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let col = Collection::open(dir.path().join("alice").join("collection.db")).unwrap();
        let session = SyncSession::new("alice", dir.path().join("alice"));
        Fixture {
            _dir: dir,
            col,
            session,
        }
    }

    impl Fixture {
        fn handler(&mut self) -> MediaSyncHandler<'_> {
            MediaSyncHandler::new(&mut self.col, &self.session)
        }
    }

    /// Builds a client-style upload bundle: `files` become numbered
    /// members, `deletions` are indexed with an empty ordinal.
    fn client_zip(files: &[(&str, &[u8])], deletions: &[&str]) -> Vec<u8> {
        let options = SimpleFileOptions::default();
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let mut meta: Vec<(String, String)> = Vec::new();
        for (i, (fname, data)) in files.iter().enumerate() {
            writer.start_file(i.to_string(), options).unwrap();
            writer.write_all(data).unwrap();
            meta.push((fname.to_string(), i.to_string()));
        }
        for fname in deletions {
            meta.push((fname.to_string(), String::new()));
        }
        writer.start_file("_meta", options).unwrap();
        writer
            .write_all(serde_json::to_string(&meta).unwrap().as_bytes())
            .unwrap();
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn begin_reports_session_key_and_usn() {
        let mut fx = fixture();
        let resp = fx.handler().begin().unwrap();
        assert_eq!(resp.data.sk, fx.session.session_key());
        assert_eq!(resp.data.usn, 0);
        assert_eq!(resp.err, "");
    }

    #[test]
    fn upload_then_changes_round_trip() {
        let mut fx = fixture();
        let bundle = client_zip(&[("cat.jpg", b"meow"), ("dog.jpg", b"woof")], &[]);

        let resp = fx.handler().upload_changes(&bundle).unwrap();
        assert_eq!(resp.data, MediaUploadResponse(2, 2));

        let changes = fx
            .handler()
            .media_changes(MediaChangesRequest { last_usn: 0 })
            .unwrap()
            .data;
        assert_eq!(changes.len(), 2);
        let cat = changes.iter().find(|c| c.fname() == "cat.jpg").unwrap();
        assert_eq!(cat.checksum(), Some(cardbox_core::file_checksum(b"meow").as_str()));
        // invariant: the list ends at the server's current media usn
        assert_eq!(
            changes.last().unwrap().usn(),
            fx.col.media().last_usn().unwrap()
        );

        let sanity = fx
            .handler()
            .media_sanity(MediaSanityRequest { local: 2 })
            .unwrap();
        assert_eq!(sanity.data, "OK");
    }

    #[test]
    fn upload_applies_deletions() {
        let mut fx = fixture();
        fx.handler()
            .upload_changes(&client_zip(&[("cat.jpg", b"meow")], &[]))
            .unwrap();

        let resp = fx
            .handler()
            .upload_changes(&client_zip(&[], &["cat.jpg"]))
            .unwrap();
        assert_eq!(resp.data, MediaUploadResponse(1, 2));
        assert!(!fx.col.media().dir().join("cat.jpg").exists());

        let changes = fx
            .handler()
            .media_changes(MediaChangesRequest { last_usn: 1 })
            .unwrap()
            .data;
        assert_eq!(changes.len(), 1);
        assert!(changes[0].checksum().is_none());
    }

    #[test]
    fn mixed_upload_counts_every_entry() {
        let mut fx = fixture();
        fx.handler()
            .upload_changes(&client_zip(&[("old.jpg", b"old")], &[]))
            .unwrap();

        let resp = fx
            .handler()
            .upload_changes(&client_zip(&[("new.jpg", b"new")], &["old.jpg"]))
            .unwrap();
        assert_eq!(resp.data, MediaUploadResponse(2, 3));
        assert_eq!(fx.col.media().count().unwrap(), 1);
    }

    #[test]
    fn oversized_meta_is_rejected_before_extraction() {
        let mut fx = fixture();
        let options = SimpleFileOptions::default();
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer.start_file("0", options).unwrap();
        writer.write_all(b"payload").unwrap();
        writer.start_file("_meta", options).unwrap();
        writer
            .write_all(&vec![b' '; MEDIA_META_SIZE_CEILING as usize + 1])
            .unwrap();
        let bundle = writer.finish().unwrap().into_inner();

        let err = fx.handler().upload_changes(&bundle).unwrap_err();
        assert!(matches!(err, ServerError::MalformedUpload(_)));

        // nothing written, usn untouched
        assert_eq!(fx.col.media().last_usn().unwrap(), 0);
        assert!(!fx.col.media().dir().join("0").exists());
    }

    #[test]
    fn missing_meta_is_rejected() {
        let mut fx = fixture();
        let options = SimpleFileOptions::default();
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer.start_file("0", options).unwrap();
        writer.write_all(b"stray").unwrap();
        let bundle = writer.finish().unwrap().into_inner();

        assert!(matches!(
            fx.handler().upload_changes(&bundle),
            Err(ServerError::MalformedUpload(_))
        ));
    }

    #[test]
    fn unreconciled_index_is_rejected_before_writes() {
        let mut fx = fixture();
        // index claims two entries, bundle carries one member and no
        // deletions
        let options = SimpleFileOptions::default();
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer.start_file("0", options).unwrap();
        writer.write_all(b"data").unwrap();
        writer.start_file("_meta", options).unwrap();
        writer
            .write_all(br#"[["a.jpg","0"],["b.jpg","1"]]"#)
            .unwrap();
        let bundle = writer.finish().unwrap().into_inner();

        assert!(matches!(
            fx.handler().upload_changes(&bundle),
            Err(ServerError::MalformedUpload(_))
        ));
        assert_eq!(fx.col.media().last_usn().unwrap(), 0);
    }

    #[test]
    fn download_bundles_requested_files() {
        let mut fx = fixture();
        fx.handler()
            .upload_changes(&client_zip(&[("cat.jpg", b"meow"), ("dog.jpg", b"woof")], &[]))
            .unwrap();

        let bytes = fx
            .handler()
            .download_files(MediaDownloadRequest {
                files: vec!["cat.jpg".into(), "dog.jpg".into()],
            })
            .unwrap();

        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut meta = String::new();
        archive.by_name("_meta").unwrap().read_to_string(&mut meta).unwrap();
        let meta: serde_json::Map<String, Value> = serde_json::from_str(&meta).unwrap();
        assert_eq!(meta["0"], "cat.jpg");
        assert_eq!(meta["1"], "dog.jpg");

        let mut contents = Vec::new();
        archive.by_name("0").unwrap().read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"meow");
    }

    #[test]
    fn download_honors_file_count_ceiling() {
        let mut fx = fixture();
        let files: Vec<(String, Vec<u8>)> = (0..30)
            .map(|i| (format!("f{i}.jpg"), vec![b'x'; 10]))
            .collect();
        let borrowed: Vec<(&str, &[u8])> = files
            .iter()
            .map(|(n, d)| (n.as_str(), d.as_slice()))
            .collect();
        fx.handler().upload_changes(&client_zip(&borrowed, &[])).unwrap();

        let bytes = fx
            .handler()
            .download_files(MediaDownloadRequest {
                files: files.iter().map(|(n, _)| n.clone()).collect(),
            })
            .unwrap();
        let archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        // ceiling members plus _meta
        assert_eq!(archive.len(), MEDIA_ZIP_FILE_CEILING + 1);
    }

    #[test]
    fn media_usn_stream_is_independent_of_collection_usn() {
        let mut fx = fixture();
        fx.handler()
            .upload_changes(&client_zip(&[("cat.jpg", b"meow")], &[]))
            .unwrap();
        assert_eq!(fx.col.media().last_usn().unwrap(), 1);
        assert_eq!(fx.col.usn().unwrap(), 0);
        // unrelated to collection graves either
        assert_eq!(fx.col.graves_since(0).unwrap(), Graves::default());
    }
}
