//! The SQLite-backed user store.
//!
//! Credentials live in a single `auth` table. Password hashes are
//! salted SHA-256: `hex(sha256(username + password + salt)) + salt`,
//! with the 16-hex-character salt carried as the hash suffix.
//!
//! This is a collaborator surface — the sync engine only calls
//! [`UserStore::authenticate`] and [`UserStore::user_dir`]; the
//! management methods exist for admin tooling and tests.

use crate::error::{ServerError, ServerResult};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tracing::info;

const SALT_LEN: usize = 16; // hex characters

/// SQLite-backed user credentials plus the user-directory mapping.
pub struct UserStore {
    db_path: PathBuf,
    data_root: PathBuf,
}

impl UserStore {
    /// Opens (creating if needed) the auth database.
    pub fn open(
        db_path: impl Into<PathBuf>,
        data_root: impl Into<PathBuf>,
    ) -> ServerResult<Self> {
        let store = Self {
            db_path: db_path.into(),
            data_root: data_root.into(),
        };
        store.connect()?.execute_batch(
            "CREATE TABLE IF NOT EXISTS auth (
                username TEXT PRIMARY KEY,
                hash     TEXT NOT NULL
            )",
        )?;
        Ok(store)
    }

    /// Returns true if the username/password pair is valid.
    pub fn authenticate(&self, username: &str, password: &str) -> ServerResult<bool> {
        if !valid_username(username) {
            return Ok(false);
        }
        let db = self.connect()?;
        let stored: Option<String> = db
            .query_row(
                "SELECT hash FROM auth WHERE username = ?1",
                params![username],
                |r| r.get(0),
            )
            .optional()?;
        let Some(stored) = stored else {
            info!(username, "authentication failed: unknown user");
            return Ok(false);
        };
        if stored.len() <= SALT_LEN {
            return Err(ServerError::Internal(format!(
                "malformed password hash for {username}"
            )));
        }
        let salt = &stored[stored.len() - SALT_LEN..];
        Ok(hash_password(username, password, salt) == stored)
    }

    /// The directory holding this user's collection and media.
    pub fn user_dir(&self, username: &str) -> PathBuf {
        self.data_root.join(username)
    }

    /// Adds a user and creates their directory.
    pub fn add_user(&self, username: &str, password: &str) -> ServerResult<()> {
        if !valid_username(username) {
            return Err(ServerError::InvalidRequest(format!(
                "invalid username: {username:?}"
            )));
        }
        let salt = hex::encode(rand::random::<[u8; 8]>());
        self.connect()?.execute(
            "INSERT INTO auth (username, hash) VALUES (?1, ?2)",
            params![username, hash_password(username, password, &salt)],
        )?;
        std::fs::create_dir_all(self.user_dir(username))?;
        info!(username, "added user");
        Ok(())
    }

    /// Removes a user's credentials. Their collection directory is left
    /// in place.
    pub fn del_user(&self, username: &str) -> ServerResult<()> {
        self.connect()?
            .execute("DELETE FROM auth WHERE username = ?1", params![username])?;
        info!(username, "removed user");
        Ok(())
    }

    /// All registered usernames.
    pub fn user_list(&self) -> ServerResult<Vec<String>> {
        let db = self.connect()?;
        let mut stmt = db.prepare("SELECT username FROM auth ORDER BY username")?;
        let users = stmt
            .query_map([], |r| r.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(users)
    }

    /// Replaces a user's password.
    pub fn set_password(&self, username: &str, new_password: &str) -> ServerResult<()> {
        let salt = hex::encode(rand::random::<[u8; 8]>());
        let changed = self.connect()?.execute(
            "UPDATE auth SET hash = ?1 WHERE username = ?2",
            params![hash_password(username, new_password, &salt), username],
        )?;
        if changed == 0 {
            return Err(ServerError::InvalidRequest(format!(
                "no such user: {username}"
            )));
        }
        info!(username, "changed password");
        Ok(())
    }

    fn connect(&self) -> ServerResult<Connection> {
        Ok(Connection::open(&self.db_path)?)
    }
}

/// Usernames double as directory names under the data root, so anything
/// that could traverse the filesystem is rejected.
pub fn valid_username(username: &str) -> bool {
    !username.is_empty()
        && !username.contains('/')
        && !username.contains('\\')
        && !username.contains("..")
        && username != "."
}

fn hash_password(username: &str, password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(username.as_bytes());
    hasher.update(password.as_bytes());
    hasher.update(salt.as_bytes());
    format!("{}{salt}", hex::encode(hasher.finalize()))
}
