use std::path::PathBuf;

use anyhow::{anyhow, Result};

/// Storage configuration, read from the environment at initialization.
#[derive(Clone, Debug)]
pub struct Config {
    /// Filesystem path to the database file. Required outside tests unless
    /// `allow_in_memory` is set.
    pub db_path: Option<PathBuf>,

    /// Journaling mode applied at open.
    pub journal_mode: String,

    /// Durability level applied at open.
    pub synchronous: String,

    /// Permit an ephemeral in-memory store when no DB_PATH is configured.
    pub allow_in_memory: bool,

    /// Refuse in-memory storage outright.
    pub strict: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            journal_mode: "WAL".to_string(),
            synchronous: "NORMAL".to_string(),
            allow_in_memory: false,
            strict: false,
        }
    }
}

/// Where the store lives once the startup rules have been applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageLocation {
    File(PathBuf),
    InMemory,
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| {
            let v = v.trim().to_ascii_lowercase();
            v == "1" || v == "true" || v == "yes"
        })
        .unwrap_or(false)
}

impl Config {
    pub fn from_env() -> Self {
        let db_path = std::env::var("DB_PATH")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let journal_mode =
            std::env::var("PRAGMA_JOURNAL_MODE").unwrap_or_else(|_| "WAL".to_string());
        let synchronous =
            std::env::var("PRAGMA_SYNCHRONOUS").unwrap_or_else(|_| "NORMAL".to_string());

        Self {
            db_path,
            journal_mode,
            synchronous,
            allow_in_memory: env_flag("ALLOW_IN_MEMORY"),
            strict: env_flag("STRICT"),
        }
    }

    /// Apply the startup rules and decide where the store lives.
    ///
    /// Outside tests, a missing DB_PATH is an error unless ALLOW_IN_MEMORY is
    /// set; STRICT refuses in-memory storage even then.
    pub fn resolve_location(&self) -> Result<StorageLocation> {
        // An explicit DB_PATH of ":memory:" goes through the same
        // ALLOW_IN_MEMORY gate as a missing DB_PATH.
        let explicit_memory = match &self.db_path {
            Some(path) if path.as_os_str() != ":memory:" => {
                return Ok(StorageLocation::File(path.clone()));
            }
            Some(_) => true,
            None => false,
        };

        if self.strict {
            return Err(anyhow!(
                "STRICT is set: refusing to run against in-memory storage"
            ));
        }
        if !self.allow_in_memory {
            if explicit_memory {
                return Err(anyhow!(
                    "DB_PATH is ':memory:' but ALLOW_IN_MEMORY is not set; \
                     set DB_PATH to a database file path (or ALLOW_IN_MEMORY=true \
                     for an ephemeral store)"
                ));
            }
            return Err(anyhow!(
                "DB_PATH is not configured; set DB_PATH to a database file path \
                 (or ALLOW_IN_MEMORY=true for an ephemeral store)"
            ));
        }
        tracing::warn!("no file-backed DB_PATH configured; using an ephemeral in-memory store");
        Ok(StorageLocation::InMemory)
    }
}
