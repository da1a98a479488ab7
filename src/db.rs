use std::fs;
use std::time::Duration;

use anyhow::Result;
use rusqlite::Connection;

use crate::config::{Config, StorageLocation};
use crate::sync;

pub(crate) fn now_secs() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        .try_into()
        .unwrap_or(i64::MAX)
}

/// Run `f` inside a `BEGIN IMMEDIATE` transaction.
///
/// IMMEDIATE acquires the writer slot up front, so two concurrent callers
/// serialize before either reads state it is about to overwrite (the counter
/// allocation in `sync::push` depends on this).
pub(crate) fn immediate_tx<T>(conn: &Connection, f: impl FnOnce() -> Result<T>) -> Result<T> {
    conn.execute_batch("BEGIN IMMEDIATE;")?;

    match f() {
        Ok(value) => {
            conn.execute_batch("COMMIT;")?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK;");
            Err(e)
        }
    }
}

/// Open the store at the location the configuration resolves to, applying
/// pragmas and migrations.
pub fn open(config: &Config) -> Result<Connection> {
    let conn = match config.resolve_location()? {
        StorageLocation::File(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            Connection::open(path)?
        }
        StorageLocation::InMemory => Connection::open_in_memory()?,
    };

    conn.busy_timeout(Duration::from_millis(5_000))?;
    conn.pragma_update(None, "journal_mode", &config.journal_mode)?;
    conn.pragma_update(None, "synchronous", &config.synchronous)?;
    migrate(&conn)?;
    Ok(conn)
}

/// Ephemeral store for tests.
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.busy_timeout(Duration::from_millis(5_000))?;
    migrate(&conn)?;
    Ok(conn)
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    let mut user_version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if user_version < 1 {
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS users (
  id TEXT PRIMARY KEY,
  email TEXT,
  display_name TEXT,
  active_workspace_id TEXT,
  created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS auth_accounts (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  provider TEXT NOT NULL,
  provider_user_id TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  FOREIGN KEY(user_id) REFERENCES users(id)
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_auth_accounts_provider
  ON auth_accounts(provider, provider_user_id);

CREATE TABLE IF NOT EXISTS workspaces (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  description TEXT,
  owner_user_id TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  deleted INTEGER NOT NULL DEFAULT 0,
  deleted_at INTEGER,
  FOREIGN KEY(owner_user_id) REFERENCES users(id)
);

CREATE TABLE IF NOT EXISTS workspace_members (
  id TEXT PRIMARY KEY,
  workspace_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  role TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  FOREIGN KEY(workspace_id) REFERENCES workspaces(id),
  FOREIGN KEY(user_id) REFERENCES users(id)
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_workspace_members_workspace_user
  ON workspace_members(workspace_id, user_id);

CREATE TABLE IF NOT EXISTS invites (
  id TEXT PRIMARY KEY,
  workspace_id TEXT NOT NULL,
  email TEXT NOT NULL,
  role TEXT NOT NULL,
  status TEXT NOT NULL,
  invited_by TEXT NOT NULL,
  token_hash TEXT NOT NULL,
  expires_at INTEGER NOT NULL,
  accepted_at INTEGER,
  accepted_user_id TEXT,
  revoked_at INTEGER,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL,
  FOREIGN KEY(workspace_id) REFERENCES workspaces(id)
);
CREATE INDEX IF NOT EXISTS idx_invites_workspace_email
  ON invites(workspace_id, email, status);

PRAGMA user_version = 1;
"#,
        )?;
        user_version = 1;
    }

    if user_version < 2 {
        // v2: sync infrastructure. op_id is the global idempotency key;
        // (workspace_id, server_version) is the per-workspace total order.
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS server_version_counters (
  workspace_id TEXT PRIMARY KEY,
  value INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS change_log (
  id TEXT PRIMARY KEY,
  workspace_id TEXT NOT NULL,
  server_version INTEGER NOT NULL,
  table_name TEXT NOT NULL,
  pk TEXT NOT NULL,
  op TEXT NOT NULL,
  payload_json TEXT,
  clock INTEGER NOT NULL,
  hlc TEXT NOT NULL,
  device_id TEXT NOT NULL,
  op_id TEXT NOT NULL,
  created_at INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_change_log_op_id ON change_log(op_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_change_log_workspace_version
  ON change_log(workspace_id, server_version);
CREATE INDEX IF NOT EXISTS idx_change_log_workspace_table
  ON change_log(workspace_id, table_name, server_version);

CREATE TABLE IF NOT EXISTS device_cursors (
  id TEXT PRIMARY KEY,
  workspace_id TEXT NOT NULL,
  device_id TEXT NOT NULL,
  last_seen_version INTEGER NOT NULL,
  updated_at INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_device_cursors_workspace_device
  ON device_cursors(workspace_id, device_id);

CREATE TABLE IF NOT EXISTS tombstones (
  id TEXT PRIMARY KEY,
  workspace_id TEXT NOT NULL,
  table_name TEXT NOT NULL,
  pk TEXT NOT NULL,
  deleted_at INTEGER NOT NULL,
  clock INTEGER NOT NULL,
  server_version INTEGER NOT NULL,
  created_at INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_tombstones_workspace_table_pk
  ON tombstones(workspace_id, table_name, pk);
CREATE INDEX IF NOT EXISTS idx_tombstones_workspace_version
  ON tombstones(workspace_id, server_version);

PRAGMA user_version = 2;
"#,
        )?;
        user_version = 2;
    }

    if user_version < 3 {
        // v3: one materialized row store per sync table. Identical shape, so
        // the DDL is generated from the allowlist.
        for entity in sync::SYNC_TABLES.iter().filter_map(|t| sync::entity_table(t)) {
            conn.execute_batch(&format!(
                r#"
CREATE TABLE IF NOT EXISTS {entity} (
  workspace_id TEXT NOT NULL,
  id TEXT NOT NULL,
  data_json TEXT NOT NULL,
  clock INTEGER NOT NULL,
  hlc TEXT NOT NULL,
  device_id TEXT NOT NULL,
  deleted INTEGER NOT NULL DEFAULT 0,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL,
  PRIMARY KEY (workspace_id, id)
);
"#
            ))?;
        }
        conn.execute_batch("PRAGMA user_version = 3;")?;
        user_version = 3;
    }

    if user_version < 4 {
        // v4: deployment operators + per-workspace settings bag.
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS admin_users (
  user_id TEXT PRIMARY KEY,
  created_at INTEGER NOT NULL,
  created_by TEXT,
  FOREIGN KEY(user_id) REFERENCES users(id)
);

CREATE TABLE IF NOT EXISTS workspace_settings (
  workspace_id TEXT NOT NULL,
  key TEXT NOT NULL,
  value TEXT NOT NULL,
  updated_at INTEGER NOT NULL,
  PRIMARY KEY (workspace_id, key),
  FOREIGN KEY(workspace_id) REFERENCES workspaces(id)
);

PRAGMA user_version = 4;
"#,
        )?;
    }

    Ok(())
}
