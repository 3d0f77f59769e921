//! Sync sessions and the session registry.
//!
//! A session binds a host key to a user and their collection path, and
//! carries the state of the sync cycle currently in flight. The registry
//! keeps sessions in memory and, when configured with a database path,
//! also persists them so clients survive a server restart without
//! reauthenticating.

use crate::error::ServerResult;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Filename of a user's collection inside their directory.
pub const COLLECTION_FILENAME: &str = "collection.db";

/// Which chunked table the next `chunk` call drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkTable {
    /// The review log, drained first.
    Revlog,
    /// Cards, drained second.
    Cards,
    /// Notes, drained last.
    Notes,
}

impl ChunkTable {
    /// The fixed drain order.
    pub const ALL: [ChunkTable; 3] = [ChunkTable::Revlog, ChunkTable::Cards, ChunkTable::Notes];
}

/// Per-cycle bookkeeping captured once by `start` and reused by every
/// later step, so `usnLim` arithmetic stays consistent for the whole
/// cycle.
#[derive(Debug, Clone)]
pub struct SyncCycleState {
    /// The client's declared baseline.
    pub min_usn: i64,
    /// The collection usn at cycle start; stamps everything sent or
    /// tombstoned during the cycle.
    pub max_usn: i64,
    /// True when the server's collection is the newer side.
    pub server_newer: bool,
    /// Tables not yet drained by `chunk`, front first.
    pub tables_left: Vec<ChunkTable>,
}

impl SyncCycleState {
    /// Opens a cycle at the given window.
    pub fn new(min_usn: i64, max_usn: i64, server_newer: bool) -> Self {
        Self {
            min_usn,
            max_usn,
            server_newer,
            tables_left: ChunkTable::ALL.to_vec(),
        }
    }
}

/// One client's sync session.
///
/// Protocol handlers are bound to whatever collection instance the
/// session's worker currently holds at each job; only the cycle state
/// lives here, so a collection closed for inactivity and reopened later
/// is picked up transparently.
pub struct SyncSession {
    host_key: String,
    username: String,
    user_dir: PathBuf,
    session_key: Mutex<String>,
    cycle: Mutex<Option<SyncCycleState>>,
}

impl SyncSession {
    /// Creates a session with freshly generated keys.
    pub fn new(username: impl Into<String>, user_dir: impl Into<PathBuf>) -> Self {
        Self::restore(
            generate_host_key(),
            generate_session_key(),
            username,
            user_dir,
        )
    }

    /// Rebuilds a session from persisted fields.
    pub fn restore(
        host_key: impl Into<String>,
        session_key: impl Into<String>,
        username: impl Into<String>,
        user_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host_key: host_key.into(),
            username: username.into(),
            user_dir: user_dir.into(),
            session_key: Mutex::new(session_key.into()),
            cycle: Mutex::new(None),
        }
    }

    /// The long-lived host key identifying this session.
    pub fn host_key(&self) -> &str {
        &self.host_key
    }

    /// The owning username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The user's directory under the data root.
    pub fn user_dir(&self) -> &Path {
        &self.user_dir
    }

    /// The user's collection file path.
    pub fn collection_path(&self) -> PathBuf {
        self.user_dir.join(COLLECTION_FILENAME)
    }

    /// The short-lived per-cycle media key.
    pub fn session_key(&self) -> String {
        self.session_key.lock().clone()
    }

    /// Adopts the session key a client announced at `meta`.
    pub fn set_session_key(&self, key: impl Into<String>) {
        *self.session_key.lock() = key.into();
    }

    /// The sync cycle in flight, if any.
    pub fn cycle(&self) -> MutexGuard<'_, Option<SyncCycleState>> {
        self.cycle.lock()
    }
}

fn generate_host_key() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

fn generate_session_key() -> String {
    hex::encode(rand::random::<[u8; 4]>())
}

/// The session registry: host key to session, optionally durable.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<SyncSession>>>,
    db_path: Option<PathBuf>,
}

impl SessionStore {
    /// A registry that forgets everything on restart.
    pub fn in_memory() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            db_path: None,
        }
    }

    /// A registry persisted to a SQLite file.
    pub fn persistent(db_path: impl Into<PathBuf>) -> ServerResult<Self> {
        let db_path = db_path.into();
        let db = Connection::open(&db_path)?;
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS session (
                hkey     TEXT PRIMARY KEY,
                skey     TEXT NOT NULL,
                username TEXT NOT NULL,
                path     TEXT NOT NULL
            )",
        )?;
        Ok(Self {
            sessions: Mutex::new(HashMap::new()),
            db_path: Some(db_path),
        })
    }

    /// Stores a session, both in memory and (when durable) on disk.
    pub fn save(&self, session: &Arc<SyncSession>) -> ServerResult<()> {
        self.sessions
            .lock()
            .insert(session.host_key().to_string(), Arc::clone(session));
        if let Some(db) = self.connect()? {
            db.execute(
                "INSERT OR REPLACE INTO session (hkey, skey, username, path)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    session.host_key(),
                    session.session_key(),
                    session.username(),
                    session.user_dir().to_string_lossy(),
                ],
            )?;
        }
        Ok(())
    }

    /// Looks a session up by host key.
    pub fn load(&self, host_key: &str) -> ServerResult<Option<Arc<SyncSession>>> {
        if let Some(session) = self.sessions.lock().get(host_key) {
            return Ok(Some(Arc::clone(session)));
        }
        let Some(db) = self.connect()? else {
            return Ok(None);
        };
        let row = db
            .query_row(
                "SELECT skey, username, path FROM session WHERE hkey = ?1",
                params![host_key],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(skey, username, path)| {
            debug!(username, "restored session from disk");
            self.cache(SyncSession::restore(host_key, skey, username, path))
        }))
    }

    /// Looks a session up by its short-lived session key.
    pub fn load_from_session_key(&self, session_key: &str) -> ServerResult<Option<Arc<SyncSession>>> {
        {
            let sessions = self.sessions.lock();
            if let Some(session) = sessions
                .values()
                .find(|s| s.session_key() == session_key)
            {
                return Ok(Some(Arc::clone(session)));
            }
        }
        let Some(db) = self.connect()? else {
            return Ok(None);
        };
        let row = db
            .query_row(
                "SELECT hkey, username, path FROM session WHERE skey = ?1",
                params![session_key],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(hkey, username, path)| {
            self.cache(SyncSession::restore(hkey, session_key, username, path))
        }))
    }

    /// Drops a session everywhere.
    pub fn delete(&self, host_key: &str) -> ServerResult<()> {
        self.sessions.lock().remove(host_key);
        if let Some(db) = self.connect()? {
            db.execute("DELETE FROM session WHERE hkey = ?1", params![host_key])?;
        }
        Ok(())
    }

    fn cache(&self, session: SyncSession) -> Arc<SyncSession> {
        let session = Arc::new(session);
        self.sessions
            .lock()
            .insert(session.host_key().to_string(), Arc::clone(&session));
        session
    }

    fn connect(&self) -> ServerResult<Option<Connection>> {
        match &self.db_path {
            Some(path) => Ok(Some(Connection::open(path)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn keys_are_generated() {
        let session = SyncSession::new("alice", "/data/alice");
        assert_eq!(session.host_key().len(), 32);
        assert_eq!(session.session_key().len(), 8);
        assert_eq!(
            session.collection_path(),
            PathBuf::from("/data/alice/collection.db")
        );

        let other = SyncSession::new("alice", "/data/alice");
        assert_ne!(session.host_key(), other.host_key());
    }

    #[test]
    fn cycle_state_lives_on_the_session() {
        let session = SyncSession::new("alice", "/data/alice");
        assert!(session.cycle().is_none());

        *session.cycle() = Some(SyncCycleState::new(5, 10, true));
        let guard = session.cycle();
        let state = guard.as_ref().unwrap();
        assert_eq!(state.min_usn, 5);
        assert_eq!(state.max_usn, 10);
        assert_eq!(state.tables_left, ChunkTable::ALL.to_vec());
    }

    #[test]
    fn memory_store_round_trip() {
        let store = SessionStore::in_memory();
        let session = Arc::new(SyncSession::new("alice", "/data/alice"));
        store.save(&session).unwrap();

        let loaded = store.load(session.host_key()).unwrap().unwrap();
        assert!(Arc::ptr_eq(&session, &loaded));

        let by_skey = store
            .load_from_session_key(&session.session_key())
            .unwrap()
            .unwrap();
        assert_eq!(by_skey.username(), "alice");

        store.delete(session.host_key()).unwrap();
        assert!(store.load(session.host_key()).unwrap().is_none());
    }

    #[test]
    fn persistent_store_survives_restart() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("session.db");

        let session = Arc::new(SyncSession::new("bob", dir.path().join("bob")));
        {
            let store = SessionStore::persistent(&db_path).unwrap();
            store.save(&session).unwrap();
        }

        // a fresh store (fresh process) still finds it
        let store = SessionStore::persistent(&db_path).unwrap();
        let loaded = store.load(session.host_key()).unwrap().unwrap();
        assert_eq!(loaded.username(), "bob");
        assert_eq!(loaded.session_key(), session.session_key());
        assert_eq!(loaded.collection_path(), session.collection_path());

        let by_skey = store
            .load_from_session_key(&session.session_key())
            .unwrap()
            .unwrap();
        assert_eq!(by_skey.host_key(), session.host_key());
    }

    #[test]
    fn unknown_keys_miss() {
        let store = SessionStore::in_memory();
        assert!(store.load("missing").unwrap().is_none());
        assert!(store.load_from_session_key("missing").unwrap().is_none());
    }
}
