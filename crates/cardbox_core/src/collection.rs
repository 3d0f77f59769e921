//! The collection database.
//!
//! A [`Collection`] wraps one user's SQLite file together with its media
//! index. Collections are owned exclusively by their worker while open;
//! nothing here is `Sync` and nothing needs to be. Opening is idempotent:
//! a missing file is initialized with the fresh-collection defaults, an
//! existing one is picked up as-is.

use crate::error::{CollectionError, CollectionResult};
use crate::media::MediaIndex;
use crate::{schema, time};
use cardbox_sync_protocol::{CardRow, Graves, JsonObject, NoteRow, RevlogRow, SanitySummary};
use rusqlite::{params, Connection};
use serde_json::Value;
use std::collections::HashMap;
use std::mem;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Separator between note fields in the `flds` column.
pub const FIELD_SEPARATOR: char = '\u{1f}';

/// The object type recorded in a tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraveKind {
    /// A deleted card.
    Card,
    /// A deleted note.
    Note,
    /// A deleted deck.
    Deck,
}

impl GraveKind {
    fn code(self) -> i64 {
        match self {
            GraveKind::Card => 0,
            GraveKind::Note => 1,
            GraveKind::Deck => 2,
        }
    }
}

/// One user's collection database plus its media index.
pub struct Collection {
    path: PathBuf,
    db: Connection,
    media: MediaIndex,
}

impl Collection {
    /// Opens the collection at `path`, creating directory, database and
    /// media index on first contact.
    pub fn open(path: impl Into<PathBuf>) -> CollectionResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let fresh = !path.exists();
        let db = open_configured(&path)?;
        if fresh {
            schema::init(&db, time::now_secs(), time::now_millis())?;
            info!(path = %path.display(), "created new collection");
        }
        let media = MediaIndex::open(media_dir_for(&path))?;
        Ok(Self { path, db, media })
    }

    /// The collection file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The media index backing this collection.
    pub fn media(&self) -> &MediaIndex {
        &self.media
    }

    /// Mutable access to the media index.
    pub fn media_mut(&mut self) -> &mut MediaIndex {
        &mut self.media
    }

    // Col row bookkeeping
    // ----------------------------------------------------------------

    /// Collection modification timestamp (millis).
    pub fn modified(&self) -> CollectionResult<i64> {
        self.col_scalar("mod")
    }

    /// Schema modification timestamp.
    pub fn schema_modified(&self) -> CollectionResult<i64> {
        self.col_scalar("scm")
    }

    /// Collection update sequence number.
    pub fn usn(&self) -> CollectionResult<i64> {
        self.col_scalar("usn")
    }

    /// Collection creation timestamp (seconds).
    pub fn created(&self) -> CollectionResult<i64> {
        self.col_scalar("crt")
    }

    /// Timestamp of the last completed sync (millis).
    pub fn last_sync(&self) -> CollectionResult<i64> {
        self.col_scalar("ls")
    }

    /// Stamps the modification time.
    pub fn set_modified(&self, now_millis: i64) -> CollectionResult<()> {
        self.db
            .execute("UPDATE col SET mod = ?1", params![now_millis])?;
        Ok(())
    }

    /// Stamps the last-sync time.
    pub fn set_last_sync(&self, now_millis: i64) -> CollectionResult<()> {
        self.db
            .execute("UPDATE col SET ls = ?1", params![now_millis])?;
        Ok(())
    }

    /// Overwrites the creation timestamp (adopted from the newer side
    /// during `applyChanges`).
    pub fn set_created(&self, crt: i64) -> CollectionResult<()> {
        self.db.execute("UPDATE col SET crt = ?1", params![crt])?;
        Ok(())
    }

    /// Bumps the collection usn by one, closing a sync cycle.
    pub fn increment_usn(&self) -> CollectionResult<()> {
        self.db.execute("UPDATE col SET usn = usn + 1", [])?;
        Ok(())
    }

    fn col_scalar(&self, column: &str) -> CollectionResult<i64> {
        let sql = format!("SELECT {column} FROM col");
        Ok(self.db.query_row(&sql, [], |r| r.get(0))?)
    }

    // Metadata maps (models, decks, deck configs, tags, conf)
    // ----------------------------------------------------------------

    /// The note-type map, keyed by id.
    pub fn models_map(&self) -> CollectionResult<JsonObject> {
        self.json_column("models")
    }

    /// The deck map, keyed by id.
    pub fn decks_map(&self) -> CollectionResult<JsonObject> {
        self.json_column("decks")
    }

    /// The deck-config map, keyed by id.
    pub fn deck_config_map(&self) -> CollectionResult<JsonObject> {
        self.json_column("dconf")
    }

    /// The tag map, tag name to usn.
    pub fn tags_map(&self) -> CollectionResult<JsonObject> {
        self.json_column("tags")
    }

    /// The client configuration object.
    pub fn conf_map(&self) -> CollectionResult<JsonObject> {
        self.json_column("conf")
    }

    /// Tag names with `usn >= min_usn`.
    pub fn pending_tags(&self, min_usn: i64) -> CollectionResult<Vec<String>> {
        let tags = self.tags_map()?;
        Ok(tags
            .iter()
            .filter(|(_, usn)| usn.as_i64().unwrap_or(0) >= min_usn)
            .map(|(name, _)| name.clone())
            .collect())
    }

    /// Merges incoming metadata objects into the named map. An incoming
    /// object wins only when the local copy is absent or strictly older
    /// by `mod`; ties keep the local copy.
    pub fn merge_objects(
        &self,
        column: &str,
        incoming: Vec<JsonObject>,
    ) -> CollectionResult<usize> {
        if incoming.is_empty() {
            return Ok(0);
        }
        let mut local = self.json_column(column)?;
        let mut adopted = 0;
        for obj in incoming {
            let Some(key) = object_key(&obj) else {
                continue;
            };
            let newer = match local.get(&key).and_then(Value::as_object) {
                None => true,
                Some(existing) => mod_of(existing) < mod_of(&obj),
            };
            if newer {
                local.insert(key, Value::Object(obj));
                adopted += 1;
            }
        }
        if adopted > 0 {
            self.set_json_column(column, &local)?;
        }
        debug!(column, adopted, "merged metadata objects");
        Ok(adopted)
    }

    /// Registers tag names missing from the tag map, stamped with `usn`.
    pub fn register_tags(&self, names: &[String], usn: i64) -> CollectionResult<()> {
        if names.is_empty() {
            return Ok(());
        }
        let mut tags = self.tags_map()?;
        let mut changed = false;
        for name in names {
            if !tags.contains_key(name) {
                tags.insert(name.clone(), usn.into());
                changed = true;
            }
        }
        if changed {
            self.set_json_column("tags", &tags)?;
        }
        Ok(())
    }

    /// Adopts configuration entries from the newer side, key by key.
    pub fn merge_conf(&self, incoming: JsonObject) -> CollectionResult<()> {
        if incoming.is_empty() {
            return Ok(());
        }
        let mut conf = self.conf_map()?;
        for (key, value) in incoming {
            conf.insert(key, value);
        }
        self.set_json_column("conf", &conf)
    }

    fn json_column(&self, column: &str) -> CollectionResult<JsonObject> {
        let sql = format!("SELECT {column} FROM col");
        let text: String = self.db.query_row(&sql, [], |r| r.get(0))?;
        Ok(serde_json::from_str(&text)?)
    }

    fn set_json_column(&self, column: &str, map: &JsonObject) -> CollectionResult<()> {
        let sql = format!("UPDATE col SET {column} = ?1");
        self.db.execute(&sql, params![serde_json::to_string(map)?])?;
        Ok(())
    }

    // Graves
    // ----------------------------------------------------------------

    /// Tombstones with `usn >= min_usn`, partitioned by object type.
    pub fn graves_since(&self, min_usn: i64) -> CollectionResult<Graves> {
        let mut stmt = self
            .db
            .prepare("SELECT oid, type FROM graves WHERE usn >= ?1")?;
        let mut graves = Graves::default();
        let rows = stmt.query_map(params![min_usn], |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (oid, kind) = row?;
            match kind {
                0 => graves.cards.push(oid),
                1 => graves.notes.push(oid),
                _ => graves.decks.push(oid),
            }
        }
        Ok(graves)
    }

    /// Records tombstones for the given ids.
    pub fn add_graves(&self, ids: &[i64], kind: GraveKind, usn: i64) -> CollectionResult<()> {
        let mut stmt = self
            .db
            .prepare("INSERT OR IGNORE INTO graves (usn, oid, type) VALUES (?1, ?2, ?3)")?;
        for id in ids {
            stmt.execute(params![usn, id, kind.code()])?;
        }
        Ok(())
    }

    /// Deletes cards and any notes left without cards by the deletion.
    pub fn remove_cards(&self, ids: &[i64]) -> CollectionResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let id_list = sql_id_list(ids);
        let mut stmt = self
            .db
            .prepare(&format!("SELECT DISTINCT nid FROM cards WHERE id IN {id_list}"))?;
        let nids: Vec<i64> = stmt
            .query_map([], |r| r.get(0))?
            .collect::<Result<_, _>>()?;

        self.db
            .execute(&format!("DELETE FROM cards WHERE id IN {id_list}"), [])?;
        if !nids.is_empty() {
            self.db.execute(
                &format!(
                    "DELETE FROM notes WHERE id IN {} AND id NOT IN (SELECT nid FROM cards)",
                    sql_id_list(&nids)
                ),
                [],
            )?;
        }
        Ok(())
    }

    /// Deletes notes by id.
    pub fn remove_notes(&self, ids: &[i64]) -> CollectionResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.db.execute(
            &format!("DELETE FROM notes WHERE id IN {}", sql_id_list(ids)),
            [],
        )?;
        Ok(())
    }

    /// Removes decks from the deck map. Cards living in those decks are
    /// deleted through their own tombstones, which the client sends
    /// alongside.
    pub fn remove_decks(&self, ids: &[i64]) -> CollectionResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut decks = self.decks_map()?;
        let mut changed = false;
        for id in ids {
            changed |= decks.remove(&id.to_string()).is_some();
        }
        if changed {
            self.set_json_column("decks", &decks)?;
        }
        Ok(())
    }

    // Chunked tables
    // ----------------------------------------------------------------

    /// Reads the revlog rows a client starting at `min_usn` is missing,
    /// stamped with `max_usn` in the outgoing copy, then stamps any
    /// lingering `usn = -1` rows (left behind by a full-sync upload)
    /// without sending them.
    pub fn take_pending_revlog(
        &self,
        min_usn: i64,
        max_usn: i64,
    ) -> CollectionResult<Vec<RevlogRow>> {
        let mut stmt = self.db.prepare(
            "SELECT id, cid, ease, ivl, lastIvl, factor, time, type
             FROM revlog WHERE usn >= ?1",
        )?;
        let rows = stmt
            .query_map(params![min_usn], |r| {
                Ok(RevlogRow(
                    r.get(0)?,
                    r.get(1)?,
                    max_usn,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                    r.get(7)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        self.db
            .execute("UPDATE revlog SET usn = ?1 WHERE usn = -1", params![max_usn])?;
        Ok(rows)
    }

    /// Card counterpart of [`Collection::take_pending_revlog`].
    pub fn take_pending_cards(
        &self,
        min_usn: i64,
        max_usn: i64,
    ) -> CollectionResult<Vec<CardRow>> {
        let mut stmt = self.db.prepare(
            "SELECT id, nid, did, ord, mod, type, queue, due, ivl, factor, reps,
                    lapses, left, odue, odid, flags, data
             FROM cards WHERE usn >= ?1",
        )?;
        let rows = stmt
            .query_map(params![min_usn], |r| {
                Ok(CardRow(
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    max_usn,
                    r.get(5)?,
                    r.get(6)?,
                    r.get(7)?,
                    r.get(8)?,
                    r.get(9)?,
                    r.get(10)?,
                    r.get(11)?,
                    r.get(12)?,
                    r.get(13)?,
                    r.get(14)?,
                    r.get(15)?,
                    r.get(16)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        self.db
            .execute("UPDATE cards SET usn = ?1 WHERE usn = -1", params![max_usn])?;
        Ok(rows)
    }

    /// Note counterpart of [`Collection::take_pending_revlog`]. The sort
    /// field and checksum columns are sent as empty placeholders; the
    /// receiving side recomputes them.
    pub fn take_pending_notes(
        &self,
        min_usn: i64,
        max_usn: i64,
    ) -> CollectionResult<Vec<NoteRow>> {
        let mut stmt = self.db.prepare(
            "SELECT id, guid, mid, mod, tags, flds, flags, data
             FROM notes WHERE usn >= ?1",
        )?;
        let rows = stmt
            .query_map(params![min_usn], |r| {
                Ok(NoteRow(
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    max_usn,
                    r.get(4)?,
                    r.get(5)?,
                    Value::String(String::new()),
                    Value::String(String::new()),
                    r.get(6)?,
                    r.get(7)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        self.db
            .execute("UPDATE notes SET usn = ?1 WHERE usn = -1", params![max_usn])?;
        Ok(rows)
    }

    /// Appends revlog rows; the log is append-only, so an id already
    /// present is ignored.
    pub fn merge_revlog(&self, rows: &[RevlogRow]) -> CollectionResult<usize> {
        let mut stmt = self.db.prepare(
            "INSERT OR IGNORE INTO revlog VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        let mut inserted = 0;
        for row in rows {
            inserted += stmt.execute(params![
                row.0, row.1, row.2, row.3, row.4, row.5, row.6, row.7, row.8
            ])?;
        }
        Ok(inserted)
    }

    /// Merges card rows under the newer-row-wins rule: an incoming row is
    /// adopted only when no local row inside the sync window carries a
    /// `mod` at least as recent.
    pub fn merge_cards(&self, rows: &[CardRow], min_usn: i64) -> CollectionResult<usize> {
        let local_mods = self.local_mods("cards", rows.iter().map(CardRow::id), min_usn)?;
        let mut stmt = self.db.prepare(
            "INSERT OR REPLACE INTO cards VALUES
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        )?;
        let mut adopted = 0;
        for row in rows {
            if !newer_than_local(&local_mods, row.id(), row.modified()) {
                continue;
            }
            stmt.execute(params![
                row.0, row.1, row.2, row.3, row.4, row.5, row.6, row.7, row.8, row.9, row.10,
                row.11, row.12, row.13, row.14, row.15, row.16, row.17
            ])?;
            adopted += 1;
        }
        Ok(adopted)
    }

    /// Merges note rows under the newer-row-wins rule, rebuilding each
    /// adopted note's sort field and field checksum without touching its
    /// `mod` stamp.
    pub fn merge_notes(&self, rows: &[NoteRow], min_usn: i64) -> CollectionResult<usize> {
        let local_mods = self.local_mods("notes", rows.iter().map(NoteRow::id), min_usn)?;
        let mut stmt = self.db.prepare(
            "INSERT OR REPLACE INTO notes VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )?;
        let mut adopted = 0;
        for row in rows {
            if !newer_than_local(&local_mods, row.id(), row.modified()) {
                continue;
            }
            let first_field = row
                .fields()
                .split(FIELD_SEPARATOR)
                .next()
                .unwrap_or_default();
            stmt.execute(params![
                row.0,
                row.1,
                row.2,
                row.3,
                row.4,
                row.5,
                row.6,
                first_field,
                field_checksum(first_field),
                row.9,
                row.10
            ])?;
            adopted += 1;
        }
        Ok(adopted)
    }

    fn local_mods(
        &self,
        table: &str,
        ids: impl Iterator<Item = i64>,
        min_usn: i64,
    ) -> CollectionResult<HashMap<i64, i64>> {
        let ids: Vec<i64> = ids.collect();
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = format!(
            "SELECT id, mod FROM {table} WHERE id IN {} AND usn >= ?1",
            sql_id_list(&ids)
        );
        let mut stmt = self.db.prepare(&sql)?;
        let rows = stmt.query_map(params![min_usn], |r| Ok((r.get(0)?, r.get(1)?)))?;
        rows.collect::<Result<HashMap<_, _>, _>>()
            .map_err(CollectionError::from)
    }

    // Structural summary
    // ----------------------------------------------------------------

    /// The structural summary compared by `sanityCheck2`. Scheduler
    /// counts are canonicalized to zeros on both sides, so only the
    /// table and map cardinalities matter.
    pub fn sanity_summary(&self) -> CollectionResult<SanitySummary> {
        Ok(SanitySummary(
            [0, 0, 0],
            self.table_count("cards")?,
            self.table_count("notes")?,
            self.table_count("revlog")?,
            self.table_count("graves")?,
            self.models_map()?.len() as i64,
            self.decks_map()?.len() as i64,
            self.deck_config_map()?.len() as i64,
        ))
    }

    /// Returns the first table or metadata map still holding `usn = -1`
    /// entries, if any. A finished sync cycle must leave none.
    pub fn unstamped_table(&self) -> CollectionResult<Option<&'static str>> {
        for table in ["cards", "notes", "revlog", "graves"] {
            let sql = format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE usn = -1)");
            let dirty: bool = self.db.query_row(&sql, [], |r| r.get(0))?;
            if dirty {
                return Ok(Some(table));
            }
        }
        for (name, map) in [
            ("models", self.models_map()?),
            ("decks", self.decks_map()?),
            ("dconf", self.deck_config_map()?),
        ] {
            if map
                .values()
                .filter_map(Value::as_object)
                .any(|obj| usn_of(obj) == -1)
            {
                return Ok(Some(name));
            }
        }
        if self
            .tags_map()?
            .values()
            .any(|usn| usn.as_i64() == Some(-1))
        {
            return Ok(Some("tags"));
        }
        Ok(None)
    }

    fn table_count(&self, table: &str) -> CollectionResult<i64> {
        let sql = format!("SELECT count(*) FROM {table}");
        Ok(self.db.query_row(&sql, [], |r| r.get(0))?)
    }

    // Full-sync support
    // ----------------------------------------------------------------

    /// Validates the database file at `incoming` and, on success,
    /// atomically replaces this collection's file with it, reopening
    /// both the database and the media index. On failure the incoming
    /// file is deleted and the live collection is untouched.
    pub fn replace_from(&mut self, incoming: &Path) -> CollectionResult<()> {
        if let Err(err) = integrity_check(incoming) {
            let _ = std::fs::remove_file(incoming);
            return Err(err);
        }

        self.close_db()?;
        std::fs::rename(incoming, &self.path)?;
        self.db = open_configured(&self.path)?;
        self.media = MediaIndex::open(media_dir_for(&self.path))?;
        info!(path = %self.path.display(), "collection replaced by full-sync upload");
        Ok(())
    }

    /// Reads the raw bytes of the collection file with the database
    /// handle closed (checkpointing the WAL), then reopens.
    pub fn raw_bytes(&mut self) -> CollectionResult<Vec<u8>> {
        self.close_db()?;
        let bytes = std::fs::read(&self.path);
        self.db = open_configured(&self.path)?;
        self.media = MediaIndex::open(media_dir_for(&self.path))?;
        Ok(bytes?)
    }

    fn close_db(&mut self) -> CollectionResult<()> {
        let old = mem::replace(&mut self.db, Connection::open_in_memory()?);
        old.close().map_err(|(_, err)| CollectionError::from(err))
    }
}

/// The media directory belonging to a collection file
/// (`collection.db` -> `collection.media`).
pub fn media_dir_for(collection_path: &Path) -> PathBuf {
    collection_path.with_extension("media")
}

/// Metadata objects of a map with `usn >= min_usn`.
pub fn pending_objects(map: &JsonObject, min_usn: i64) -> Vec<JsonObject> {
    map.values()
        .filter_map(Value::as_object)
        .filter(|obj| usn_of(obj) >= min_usn)
        .cloned()
        .collect()
}

/// The checksum stored in a note's `csum` column: the first 32 bits of
/// the SHA-1 of its first field.
pub fn field_checksum(text: &str) -> i64 {
    use sha1::{Digest, Sha1};
    let digest = hex::encode(Sha1::digest(text.as_bytes()));
    i64::from_str_radix(&digest[..8], 16).unwrap_or(0)
}

fn open_configured(path: &Path) -> CollectionResult<Connection> {
    let db = Connection::open(path)?;
    let _mode: String = db.query_row("PRAGMA journal_mode = WAL", [], |r| r.get(0))?;
    db.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(db)
}

fn integrity_check(path: &Path) -> CollectionResult<()> {
    let db = Connection::open(path)?;
    let verdict: String = db.query_row("PRAGMA integrity_check", [], |r| r.get(0))?;
    db.close().map_err(|(_, err)| CollectionError::from(err))?;
    if verdict == "ok" {
        Ok(())
    } else {
        Err(CollectionError::Corrupt(verdict))
    }
}

fn newer_than_local(local_mods: &HashMap<i64, i64>, id: i64, incoming_mod: i64) -> bool {
    match local_mods.get(&id) {
        None => true,
        Some(local_mod) => *local_mod < incoming_mod,
    }
}

fn sql_id_list(ids: &[i64]) -> String {
    let mut out = String::with_capacity(ids.len() * 8 + 2);
    out.push('(');
    for (i, id) in ids.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&id.to_string());
    }
    out.push(')');
    out
}

fn object_key(obj: &JsonObject) -> Option<String> {
    match obj.get("id")? {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

/// Reads an object's `mod`, tolerating clients that store it as a
/// string.
fn mod_of(obj: &JsonObject) -> i64 {
    match obj.get("mod") {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

fn usn_of(obj: &JsonObject) -> i64 {
    obj.get("usn").and_then(Value::as_i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn open_collection() -> (TempDir, Collection) {
        let dir = TempDir::new().unwrap();
        let col = Collection::open(dir.path().join("user").join("collection.db")).unwrap();
        (dir, col)
    }

    fn object(id: i64, modified: i64, usn: i64) -> JsonObject {
        json!({ "id": id, "mod": modified, "usn": usn, "name": format!("obj{id}") })
            .as_object()
            .unwrap()
            .clone()
    }

    fn card(id: i64, modified: i64, usn: i64) -> CardRow {
        CardRow(
            id,
            id,
            1,
            0,
            modified,
            usn,
            0,
            0,
            0,
            0,
            2500,
            0,
            0,
            0,
            0,
            0,
            0,
            String::new(),
        )
    }

    fn note(id: i64, modified: i64, usn: i64) -> NoteRow {
        NoteRow(
            id,
            format!("guid{id}"),
            1,
            modified,
            usn,
            String::new(),
            format!("front{id}\u{1f}back{id}"),
            Value::String(String::new()),
            Value::String(String::new()),
            0,
            String::new(),
        )
    }

    #[test]
    fn fresh_collection_defaults() {
        let (_dir, col) = open_collection();
        assert_eq!(col.usn().unwrap(), 0);
        assert_eq!(col.decks_map().unwrap().len(), 1);
        assert_eq!(col.deck_config_map().unwrap().len(), 1);
        assert!(col.models_map().unwrap().is_empty());
        assert!(col.path().exists());
    }

    #[test]
    fn open_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("collection.db");
        {
            let col = Collection::open(&path).unwrap();
            col.increment_usn().unwrap();
        }
        let col = Collection::open(&path).unwrap();
        assert_eq!(col.usn().unwrap(), 1);
    }

    #[test]
    fn graves_partition_by_kind() {
        let (_dir, col) = open_collection();
        col.add_graves(&[42], GraveKind::Card, 7).unwrap();
        col.add_graves(&[10], GraveKind::Note, 3).unwrap();
        col.add_graves(&[2], GraveKind::Deck, 9).unwrap();

        let graves = col.graves_since(5).unwrap();
        assert_eq!(graves.cards, vec![42]);
        assert!(graves.notes.is_empty());
        assert_eq!(graves.decks, vec![2]);

        let graves = col.graves_since(0).unwrap();
        assert_eq!(graves.notes, vec![10]);
    }

    #[test]
    fn remove_cards_reaps_orphaned_notes() {
        let (_dir, col) = open_collection();
        col.merge_notes(&[note(1, 10, 0)], 0).unwrap();
        // two cards on note 1, one card on its own note
        col.merge_cards(&[card(100, 10, 0)], 0).unwrap();
        let mut second = card(101, 10, 0);
        second.1 = 1;
        let mut third = card(102, 10, 0);
        third.1 = 2;
        col.merge_cards(&[second, third], 0).unwrap();
        col.merge_notes(&[note(2, 10, 0)], 0).unwrap();

        // removing one of note 1's cards keeps the note
        col.remove_cards(&[100]).unwrap();
        assert_eq!(col.table_count("notes").unwrap(), 2);

        // removing the last one reaps it
        col.remove_cards(&[101]).unwrap();
        assert_eq!(col.table_count("notes").unwrap(), 1);
        assert_eq!(col.table_count("cards").unwrap(), 1);
    }

    #[test]
    fn metadata_merge_prefers_strictly_newer() {
        let (_dir, col) = open_collection();
        col.merge_objects("models", vec![object(5, 100, 2)]).unwrap();

        // same mod: local wins
        let adopted = col
            .merge_objects("models", vec![object(5, 100, 3)])
            .unwrap();
        assert_eq!(adopted, 0);

        // strictly newer: incoming wins
        let adopted = col
            .merge_objects("models", vec![object(5, 101, 3)])
            .unwrap();
        assert_eq!(adopted, 1);
        let models = col.models_map().unwrap();
        assert_eq!(models["5"]["usn"], 3);
    }

    #[test]
    fn take_pending_stamps_outgoing_rows() {
        let (_dir, col) = open_collection();
        col.merge_cards(&[card(1, 10, 3), card(2, 10, 7)], 0).unwrap();

        let rows = col.take_pending_cards(5, 9).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id(), 2);
        assert_eq!(rows[0].usn(), 9);

        // the stored copy keeps its original stamp
        let stored: i64 = col
            .db
            .query_row("SELECT usn FROM cards WHERE id = 2", [], |r| r.get(0))
            .unwrap();
        assert_eq!(stored, 7);
    }

    #[test]
    fn take_pending_stamps_stragglers_without_sending() {
        let (_dir, col) = open_collection();
        col.merge_cards(&[card(1, 10, -1)], 0).unwrap();

        let rows = col.take_pending_cards(5, 9).unwrap();
        assert!(rows.is_empty());
        let stored: i64 = col
            .db
            .query_row("SELECT usn FROM cards WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(stored, 9);
    }

    #[test]
    fn merge_cards_newer_wins() {
        let (_dir, col) = open_collection();
        col.merge_cards(&[card(1, 100, 5)], 0).unwrap();

        // older incoming inside the window: kept out
        assert_eq!(col.merge_cards(&[card(1, 99, 6)], 5).unwrap(), 0);
        // equal mod: local wins
        assert_eq!(col.merge_cards(&[card(1, 100, 6)], 5).unwrap(), 0);
        // newer incoming: adopted
        assert_eq!(col.merge_cards(&[card(1, 101, 6)], 5).unwrap(), 1);

        // local row outside the window is replaced unconditionally
        assert_eq!(col.merge_cards(&[card(1, 50, 8)], 7).unwrap(), 1);
    }

    #[test]
    fn merge_is_idempotent() {
        let (_dir, col) = open_collection();
        let rows = [card(1, 100, 9)];
        assert_eq!(col.merge_cards(&rows, 5).unwrap(), 1);
        // second application is a no-op: mod is no longer strictly greater
        assert_eq!(col.merge_cards(&rows, 5).unwrap(), 0);
    }

    #[test]
    fn merge_notes_rebuilds_sort_field() {
        let (_dir, col) = open_collection();
        col.merge_notes(&[note(1, 10, 4)], 0).unwrap();

        let (sfld, csum): (String, i64) = col
            .db
            .query_row("SELECT sfld, csum FROM notes WHERE id = 1", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(sfld, "front1");
        assert_eq!(csum, field_checksum("front1"));
    }

    #[test]
    fn merge_revlog_ignores_duplicates() {
        let (_dir, col) = open_collection();
        let row = RevlogRow(1000, 1, 2, 3, 1, 0, 2500, 4000, 0);
        assert_eq!(col.merge_revlog(&[row.clone()]).unwrap(), 1);
        assert_eq!(col.merge_revlog(&[row]).unwrap(), 0);
    }

    #[test]
    fn sanity_summary_counts() {
        let (_dir, col) = open_collection();
        col.merge_cards(&[card(1, 10, 0)], 0).unwrap();
        col.merge_notes(&[note(1, 10, 0), note(2, 10, 0)], 0).unwrap();
        col.add_graves(&[9], GraveKind::Card, 1).unwrap();

        let summary = col.sanity_summary().unwrap();
        assert_eq!(summary, SanitySummary([0, 0, 0], 1, 2, 0, 1, 0, 1, 1));
    }

    #[test]
    fn unstamped_detection() {
        let (_dir, col) = open_collection();
        assert!(col.unstamped_table().unwrap().is_none());
        col.merge_cards(&[card(1, 10, -1)], 0).unwrap();
        assert_eq!(col.unstamped_table().unwrap(), Some("cards"));
    }

    #[test]
    fn replace_from_rejects_garbage() {
        let (dir, mut col) = open_collection();
        col.increment_usn().unwrap();

        let bogus = dir.path().join("upload.tmp");
        std::fs::write(&bogus, b"not a database at all").unwrap();
        assert!(col.replace_from(&bogus).is_err());

        // prior collection untouched, temp file cleaned up
        assert_eq!(col.usn().unwrap(), 1);
        assert!(!bogus.exists());
    }

    #[test]
    fn replace_from_swaps_valid_database() {
        let (dir, mut col) = open_collection();

        // build a donor collection with a different usn
        let donor_path = dir.path().join("donor").join("collection.db");
        {
            let donor = Collection::open(&donor_path).unwrap();
            donor.increment_usn().unwrap();
            donor.increment_usn().unwrap();
        }
        let upload = dir.path().join("upload.tmp");
        std::fs::copy(&donor_path, &upload).unwrap();

        col.replace_from(&upload).unwrap();
        assert_eq!(col.usn().unwrap(), 2);
    }

    #[test]
    fn raw_bytes_round_trip() {
        let (_dir, mut col) = open_collection();
        col.increment_usn().unwrap();
        let bytes = col.raw_bytes().unwrap();
        assert!(bytes.starts_with(b"SQLite format 3"));
        // still usable afterwards
        assert_eq!(col.usn().unwrap(), 1);
    }

    #[test]
    fn field_checksum_is_stable() {
        assert_eq!(field_checksum("front"), field_checksum("front"));
        assert_ne!(field_checksum("front"), field_checksum("back"));
    }
}
