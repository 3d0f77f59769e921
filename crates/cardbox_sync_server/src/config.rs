//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

/// How often the idle monitor scans the worker registry.
pub const DEFAULT_MONITOR_FREQUENCY: Duration = Duration::from_secs(15);

/// How long a worker may sit idle before its collection is closed.
pub const DEFAULT_MONITOR_INACTIVITY: Duration = Duration::from_secs(90);

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory holding one subdirectory per user.
    pub data_root: PathBuf,
    /// SQLite file persisting sessions across restarts; sessions are
    /// memory-only when unset.
    pub session_db_path: Option<PathBuf>,
    /// SQLite file holding user credentials; any credentials are
    /// accepted when unset.
    pub auth_db_path: Option<PathBuf>,
    /// How often the idle monitor scans workers.
    pub monitor_frequency: Duration,
    /// Idle threshold past which a worker's collection is closed.
    pub monitor_inactivity: Duration,
}

impl ServerConfig {
    /// Creates a configuration rooted at the given data directory.
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            session_db_path: None,
            auth_db_path: None,
            monitor_frequency: DEFAULT_MONITOR_FREQUENCY,
            monitor_inactivity: DEFAULT_MONITOR_INACTIVITY,
        }
    }

    /// Persists sessions to the given SQLite file.
    pub fn with_session_db(mut self, path: impl Into<PathBuf>) -> Self {
        self.session_db_path = Some(path.into());
        self
    }

    /// Authenticates users against the given SQLite file.
    pub fn with_auth_db(mut self, path: impl Into<PathBuf>) -> Self {
        self.auth_db_path = Some(path.into());
        self
    }

    /// Overrides the idle monitor timing.
    pub fn with_monitor_timing(mut self, frequency: Duration, inactivity: Duration) -> Self {
        self.monitor_frequency = frequency;
        self.monitor_inactivity = inactivity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::new("/srv/cardbox");
        assert_eq!(config.data_root, PathBuf::from("/srv/cardbox"));
        assert!(config.session_db_path.is_none());
        assert!(config.auth_db_path.is_none());
        assert_eq!(config.monitor_frequency, DEFAULT_MONITOR_FREQUENCY);
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new("/srv/cardbox")
            .with_session_db("/srv/cardbox/session.db")
            .with_auth_db("/srv/cardbox/auth.db")
            .with_monitor_timing(Duration::from_secs(5), Duration::from_secs(30));

        assert!(config.session_db_path.is_some());
        assert!(config.auth_db_path.is_some());
        assert_eq!(config.monitor_inactivity, Duration::from_secs(30));
    }
}
