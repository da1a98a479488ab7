use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::db::{immediate_tx, now_secs};

/// Static allowlist of tables devices may sync.
pub const SYNC_TABLES: &[&str] = &[
    "threads",
    "messages",
    "projects",
    "posts",
    "kv",
    "file_meta",
    "notifications",
];

pub const MAX_PULL_LIMIT: i64 = 1000;
pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";

// SQLite caps bound parameters per statement; probe op_ids in chunks well
// under that limit.
const IDEMPOTENCY_PROBE_CHUNK: usize = 200;
const GC_BATCH_SIZE: usize = 1000;

/// Materialized row store backing a sync table, or None for a table outside
/// the allowlist. The returned name is embedded in SQL, so it must come from
/// this fixed mapping and never from request input.
pub(crate) fn entity_table(table_name: &str) -> Option<&'static str> {
    Some(match table_name {
        "threads" => "entity_threads",
        "messages" => "entity_messages",
        "projects" => "entity_projects",
        "posts" => "entity_posts",
        "kv" => "entity_kv",
        "file_meta" => "entity_file_meta",
        "notifications" => "entity_notifications",
        _ => return None,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOp {
    Put,
    Delete,
}

impl SyncOp {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncOp::Put => "put",
            SyncOp::Delete => "delete",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "put" => Ok(SyncOp::Put),
            "delete" => Ok(SyncOp::Delete),
            other => Err(anyhow!("unknown change-log op: {other}")),
        }
    }
}

/// Client-generated stamp carried by every op.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OpStamp {
    pub device_id: String,
    pub op_id: String,
    pub hlc: String,
    pub clock: i64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PendingOp {
    pub table_name: String,
    pub operation: SyncOp,
    pub pk: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub stamp: OpStamp,
}

#[derive(Clone, Debug, Serialize)]
pub struct PushOpResult {
    pub op_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl PushOpResult {
    fn ok(op_id: &str, server_version: i64) -> Self {
        Self {
            op_id: op_id.to_string(),
            success: true,
            server_version: Some(server_version),
            error: None,
            error_code: None,
        }
    }

    fn validation(op_id: &str, message: String) -> Self {
        Self {
            op_id: op_id.to_string(),
            success: false,
            server_version: None,
            error: Some(message),
            error_code: Some(VALIDATION_ERROR.to_string()),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct PushResponse {
    pub results: Vec<PushOpResult>,
    /// Workspace counter after the call.
    pub server_version: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct Change {
    pub server_version: i64,
    pub table_name: String,
    pub pk: String,
    pub op: SyncOp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub stamp: OpStamp,
}

#[derive(Clone, Debug, Serialize)]
pub struct PullResponse {
    pub changes: Vec<Change>,
    pub next_cursor: i64,
    pub has_more: bool,
}

fn counter_value(conn: &Connection, workspace_id: &str) -> Result<i64> {
    let value: Option<i64> = conn
        .query_row(
            r#"SELECT value FROM server_version_counters WHERE workspace_id = ?1"#,
            params![workspace_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.unwrap_or(0))
}

/// Apply a batch of device ops.
///
/// The whole batch commits in one IMMEDIATE transaction: the counter read and
/// the counter write cannot interleave with another push, so server_versions
/// stay dense and contiguous per workspace. Replayed op_ids report the
/// server_version they were originally assigned.
pub fn push(conn: &Connection, workspace_id: &str, ops: &[PendingOp]) -> Result<PushResponse> {
    if ops.is_empty() {
        return Ok(PushResponse {
            results: Vec::new(),
            server_version: counter_value(conn, workspace_id)?,
        });
    }

    // An unknown table rejects the entire batch without touching state.
    if ops.iter().any(|op| entity_table(&op.table_name).is_none()) {
        let results = ops
            .iter()
            .map(|op| {
                let message = if entity_table(&op.table_name).is_none() {
                    format!("unknown sync table: {}", op.table_name)
                } else {
                    "batch rejected: sibling op failed validation".to_string()
                };
                PushOpResult::validation(&op.stamp.op_id, message)
            })
            .collect();
        return Ok(PushResponse {
            results,
            server_version: counter_value(conn, workspace_id)?,
        });
    }

    immediate_tx(conn, || {
        let now = now_secs();

        // Idempotency probe: which op_ids already committed?
        let mut probe_ids: Vec<&str> = ops.iter().map(|op| op.stamp.op_id.as_str()).collect();
        probe_ids.sort_unstable();
        probe_ids.dedup();

        let mut existing: BTreeMap<String, i64> = BTreeMap::new();
        for chunk in probe_ids.chunks(IDEMPOTENCY_PROBE_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT op_id, server_version FROM change_log WHERE op_id IN ({placeholders})"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(chunk.iter()))?;
            while let Some(row) = rows.next()? {
                existing.insert(row.get(0)?, row.get(1)?);
            }
        }

        // Distinct new op_ids, in first-occurrence order. Duplicates within
        // the batch share one allocated version.
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut new_ops: Vec<&PendingOp> = Vec::new();
        for op in ops {
            let op_id = op.stamp.op_id.as_str();
            if existing.contains_key(op_id) || !seen.insert(op_id) {
                continue;
            }
            new_ops.push(op);
        }

        let base = counter_value(conn, workspace_id)?;
        let next = base + new_ops.len() as i64;
        if !new_ops.is_empty() {
            conn.execute(
                r#"INSERT INTO server_version_counters (workspace_id, value)
                   VALUES (?1, ?2)
                   ON CONFLICT(workspace_id) DO UPDATE SET value = excluded.value"#,
                params![workspace_id, next],
            )?;
        }

        let mut allocated: BTreeMap<&str, i64> = BTreeMap::new();
        for (i, op) in new_ops.iter().enumerate() {
            allocated.insert(op.stamp.op_id.as_str(), base + 1 + i as i64);
        }

        let mut applied: BTreeSet<&str> = BTreeSet::new();
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let op_id = op.stamp.op_id.as_str();

            if let Some(&version) = existing.get(op_id) {
                results.push(PushOpResult::ok(op_id, version));
                continue;
            }

            let version = *allocated
                .get(op_id)
                .ok_or_else(|| anyhow!("push: op_id missing from allocation map"))?;
            if !applied.insert(op_id) {
                // Duplicate within the batch: mirror the first result.
                results.push(PushOpResult::ok(op_id, version));
                continue;
            }

            insert_change_log(conn, workspace_id, version, op, now)?;
            match op.operation {
                SyncOp::Put => apply_put(conn, workspace_id, op, now)?,
                SyncOp::Delete => {
                    apply_delete(conn, workspace_id, op, now)?;
                    upsert_tombstone(conn, workspace_id, op, version, now)?;
                }
            }
            results.push(PushOpResult::ok(op_id, version));
        }

        tracing::debug!(
            workspace_id,
            ops = ops.len(),
            new_ops = new_ops.len(),
            server_version = next,
            "push committed"
        );

        Ok(PushResponse {
            results,
            server_version: next,
        })
    })
}

fn insert_change_log(
    conn: &Connection,
    workspace_id: &str,
    server_version: i64,
    op: &PendingOp,
    now: i64,
) -> Result<()> {
    let payload_json = op
        .payload
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        r#"INSERT INTO change_log
           (id, workspace_id, server_version, table_name, pk, op, payload_json,
            clock, hlc, device_id, op_id, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"#,
        params![
            uuid::Uuid::new_v4().to_string(),
            workspace_id,
            server_version,
            op.table_name,
            op.pk,
            op.operation.as_str(),
            payload_json,
            op.stamp.clock,
            op.stamp.hlc,
            op.stamp.device_id,
            op.stamp.op_id,
            now
        ],
    )?;
    Ok(())
}

fn require_entity_table(table_name: &str) -> Result<&'static str> {
    entity_table(table_name).ok_or_else(|| anyhow!("unknown sync table: {table_name}"))
}

fn apply_put(conn: &Connection, workspace_id: &str, op: &PendingOp, now: i64) -> Result<()> {
    let entity = require_entity_table(&op.table_name)?;
    let data_json = match &op.payload {
        Some(value) => serde_json::to_string(value)?,
        None => "{}".to_string(),
    };

    let changed = conn.execute(
        &format!(
            r#"INSERT INTO {entity}
               (workspace_id, id, data_json, clock, hlc, device_id, deleted, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)
               ON CONFLICT(workspace_id, id) DO UPDATE SET
                 data_json = excluded.data_json,
                 clock = excluded.clock,
                 hlc = excluded.hlc,
                 device_id = excluded.device_id,
                 deleted = 0,
                 updated_at = excluded.updated_at
               WHERE excluded.clock > {entity}.clock
                  OR (excluded.clock = {entity}.clock AND excluded.hlc > {entity}.hlc)"#
        ),
        params![
            workspace_id,
            op.pk,
            data_json,
            op.stamp.clock,
            op.stamp.hlc,
            op.stamp.device_id,
            now
        ],
    )?;

    if changed > 0 {
        // This put is now the winning change for the key, so the delete it
        // displaced must stop propagating.
        conn.execute(
            r#"DELETE FROM tombstones
               WHERE workspace_id = ?1 AND table_name = ?2 AND pk = ?3"#,
            params![workspace_id, op.table_name, op.pk],
        )?;
    }
    Ok(())
}

fn apply_delete(conn: &Connection, workspace_id: &str, op: &PendingOp, now: i64) -> Result<()> {
    let entity = require_entity_table(&op.table_name)?;
    // A losing delete leaves the row untouched; a delete of an unseen key
    // inserts a stub so later stale puts still lose the comparison.
    conn.execute(
        &format!(
            r#"INSERT INTO {entity}
               (workspace_id, id, data_json, clock, hlc, device_id, deleted, created_at, updated_at)
               VALUES (?1, ?2, '{{}}', ?3, ?4, ?5, 1, ?6, ?6)
               ON CONFLICT(workspace_id, id) DO UPDATE SET
                 clock = excluded.clock,
                 hlc = excluded.hlc,
                 device_id = excluded.device_id,
                 deleted = 1,
                 updated_at = excluded.updated_at
               WHERE excluded.clock > {entity}.clock
                  OR (excluded.clock = {entity}.clock AND excluded.hlc > {entity}.hlc)"#
        ),
        params![
            workspace_id,
            op.pk,
            op.stamp.clock,
            op.stamp.hlc,
            op.stamp.device_id,
            now
        ],
    )?;
    Ok(())
}

fn upsert_tombstone(
    conn: &Connection,
    workspace_id: &str,
    op: &PendingOp,
    server_version: i64,
    now: i64,
) -> Result<()> {
    conn.execute(
        r#"INSERT INTO tombstones
           (id, workspace_id, table_name, pk, deleted_at, clock, server_version, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?5)
           ON CONFLICT(workspace_id, table_name, pk) DO UPDATE SET
             clock = excluded.clock,
             server_version = excluded.server_version,
             deleted_at = excluded.deleted_at
           WHERE excluded.clock > tombstones.clock
              OR (excluded.clock = tombstones.clock
                  AND excluded.server_version > tombstones.server_version)"#,
        params![
            uuid::Uuid::new_v4().to_string(),
            workspace_id,
            op.table_name,
            op.pk,
            now,
            op.stamp.clock,
            server_version
        ],
    )?;
    Ok(())
}

/// Read committed changes past `cursor`, oldest first.
///
/// Read-only; a pull never observes a partially committed push.
pub fn pull(
    conn: &Connection,
    workspace_id: &str,
    cursor: i64,
    limit: i64,
    tables: Option<&[String]>,
) -> Result<PullResponse> {
    let limit = limit.clamp(0, MAX_PULL_LIMIT);

    if let Some(tables) = tables {
        if tables.is_empty() {
            return Ok(PullResponse {
                changes: Vec::new(),
                next_cursor: cursor,
                has_more: false,
            });
        }
    }

    let mut sql = String::from(
        r#"SELECT server_version, table_name, pk, op, payload_json, clock, hlc, device_id, op_id
           FROM change_log
           WHERE workspace_id = ? AND server_version > ?"#,
    );
    let mut values: Vec<rusqlite::types::Value> =
        vec![workspace_id.to_string().into(), cursor.into()];
    if let Some(tables) = tables {
        let placeholders = vec!["?"; tables.len()].join(", ");
        sql.push_str(&format!(" AND table_name IN ({placeholders})"));
        for table in tables {
            values.push(table.clone().into());
        }
    }
    // One extra row decides has_more without a second query.
    sql.push_str(" ORDER BY server_version ASC LIMIT ?");
    values.push((limit + 1).into());

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(rusqlite::params_from_iter(values))?;

    let mut changes: Vec<Change> = Vec::new();
    let mut has_more = false;
    while let Some(row) = rows.next()? {
        if changes.len() as i64 >= limit {
            has_more = true;
            break;
        }
        let op: String = row.get(3)?;
        let payload_json: Option<String> = row.get(4)?;
        let payload = payload_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        changes.push(Change {
            server_version: row.get(0)?,
            table_name: row.get(1)?,
            pk: row.get(2)?,
            op: SyncOp::parse(&op)?,
            payload,
            stamp: OpStamp {
                clock: row.get(5)?,
                hlc: row.get(6)?,
                device_id: row.get(7)?,
                op_id: row.get(8)?,
            },
        });
    }

    let next_cursor = changes.last().map_or(cursor, |c| c.server_version);
    Ok(PullResponse {
        changes,
        next_cursor,
        has_more,
    })
}

/// Record how far a device has read. Forward-only: a stale update can never
/// move the cursor backwards.
pub fn update_cursor(
    conn: &Connection,
    workspace_id: &str,
    device_id: &str,
    version: i64,
) -> Result<i64> {
    let now = now_secs();
    conn.execute(
        r#"INSERT INTO device_cursors (id, workspace_id, device_id, last_seen_version, updated_at)
           VALUES (?1, ?2, ?3, ?4, ?5)
           ON CONFLICT(workspace_id, device_id) DO UPDATE SET
             last_seen_version = max(device_cursors.last_seen_version, excluded.last_seen_version),
             updated_at = excluded.updated_at"#,
        params![
            uuid::Uuid::new_v4().to_string(),
            workspace_id,
            device_id,
            version,
            now
        ],
    )?;

    let persisted: i64 = conn.query_row(
        r#"SELECT last_seen_version FROM device_cursors
           WHERE workspace_id = ?1 AND device_id = ?2"#,
        params![workspace_id, device_id],
        |row| row.get(0),
    )?;
    Ok(persisted)
}

/// Delete change-log rows every device has already seen, once they age past
/// the retention window.
pub fn gc_change_log(conn: &Connection, workspace_id: &str, retention_seconds: i64) -> Result<u64> {
    gc_versioned_table(conn, workspace_id, retention_seconds, "change_log")
}

/// Same predicate applied to tombstones.
pub fn gc_tombstones(conn: &Connection, workspace_id: &str, retention_seconds: i64) -> Result<u64> {
    gc_versioned_table(conn, workspace_id, retention_seconds, "tombstones")
}

fn gc_versioned_table(
    conn: &Connection,
    workspace_id: &str,
    retention_seconds: i64,
    table: &'static str,
) -> Result<u64> {
    let min_cursor: i64 = conn.query_row(
        r#"SELECT COALESCE(MIN(last_seen_version), 0) FROM device_cursors
           WHERE workspace_id = ?1"#,
        params![workspace_id],
        |row| row.get(0),
    )?;
    let cutoff = now_secs() - retention_seconds;

    // Each batch is its own transaction to bound writer-lock hold time.
    let mut total: u64 = 0;
    loop {
        let deleted = conn.execute(
            &format!(
                r#"DELETE FROM {table} WHERE id IN (
                     SELECT id FROM {table}
                     WHERE workspace_id = ?1 AND server_version < ?2 AND created_at < ?3
                     LIMIT {GC_BATCH_SIZE})"#
            ),
            params![workspace_id, min_cursor, cutoff],
        )?;
        total += deleted as u64;
        if deleted < GC_BATCH_SIZE {
            break;
        }
        tracing::debug!(workspace_id, table, total, "gc batch deleted");
    }

    if total > 0 {
        tracing::info!(workspace_id, table, deleted = total, "garbage collected");
    }
    Ok(total)
}
