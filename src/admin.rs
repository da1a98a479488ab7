use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::db::{immediate_tx, now_secs};
use crate::workspace::{
    get_workspace_row, soft_delete_workspace_tx, user_from_row, workspace_from_row, Member, Role,
    User, Workspace, WORKSPACE_COLUMNS,
};

#[derive(Clone, Debug, Serialize)]
pub struct AdminUser {
    pub user_id: String,
    pub created_at: i64,
    pub created_by: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct DeviceCursor {
    pub workspace_id: String,
    pub device_id: String,
    pub last_seen_version: i64,
    pub updated_at: i64,
}

/// Row counts for the operational tables, for the ops status endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct StatusReport {
    pub users: i64,
    pub workspaces: i64,
    pub deleted_workspaces: i64,
    pub members: i64,
    pub pending_invites: i64,
    pub change_log_entries: i64,
    pub tombstones: i64,
    pub device_cursors: i64,
}

fn require_user(conn: &Connection, user_id: &str) -> Result<()> {
    let found: Option<i64> = conn
        .query_row(
            r#"SELECT 1 FROM users WHERE id = ?1"#,
            params![user_id],
            |row| row.get(0),
        )
        .optional()?;
    if found.is_none() {
        return Err(anyhow!("not_found: user {user_id}"));
    }
    Ok(())
}

fn require_workspace(conn: &Connection, workspace_id: &str) -> Result<Workspace> {
    get_workspace_row(conn, workspace_id)?
        .ok_or_else(|| anyhow!("not_found: workspace {workspace_id}"))
}

pub fn is_admin(conn: &Connection, user_id: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            r#"SELECT 1 FROM admin_users WHERE user_id = ?1"#,
            params![user_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn list_admins(conn: &Connection) -> Result<Vec<AdminUser>> {
    let mut stmt = conn.prepare(
        r#"SELECT user_id, created_at, created_by FROM admin_users
           ORDER BY created_at ASC, user_id ASC"#,
    )?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(AdminUser {
            user_id: row.get(0)?,
            created_at: row.get(1)?,
            created_by: row.get(2)?,
        });
    }
    Ok(out)
}

/// Grant operator rights. Idempotent.
pub fn grant_admin(conn: &Connection, user_id: &str, created_by: Option<&str>) -> Result<()> {
    require_user(conn, user_id)?;
    conn.execute(
        r#"INSERT INTO admin_users (user_id, created_at, created_by)
           VALUES (?1, ?2, ?3)
           ON CONFLICT(user_id) DO NOTHING"#,
        params![user_id, now_secs(), created_by],
    )?;
    Ok(())
}

/// Revoke operator rights. Idempotent.
pub fn revoke_admin(conn: &Connection, user_id: &str) -> Result<()> {
    conn.execute(
        r#"DELETE FROM admin_users WHERE user_id = ?1"#,
        params![user_id],
    )?;
    Ok(())
}

pub fn list_members(conn: &Connection, workspace_id: &str) -> Result<Vec<Member>> {
    let mut stmt = conn.prepare(
        r#"SELECT id, workspace_id, user_id, role, created_at
           FROM workspace_members
           WHERE workspace_id = ?1
           ORDER BY created_at ASC, user_id ASC"#,
    )?;
    let mut rows = stmt.query(params![workspace_id])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let role: String = row.get(3)?;
        out.push(Member {
            id: row.get(0)?,
            workspace_id: row.get(1)?,
            user_id: row.get(2)?,
            role: Role::parse(&role)?,
            created_at: row.get(4)?,
        });
    }
    Ok(out)
}

/// Add a member or overwrite an existing member's role.
pub fn upsert_member(
    conn: &Connection,
    workspace_id: &str,
    user_id: &str,
    role: Role,
) -> Result<()> {
    immediate_tx(conn, || {
        require_workspace(conn, workspace_id)?;
        require_user(conn, user_id)?;
        conn.execute(
            r#"INSERT INTO workspace_members (id, workspace_id, user_id, role, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5)
               ON CONFLICT(workspace_id, user_id) DO UPDATE SET role = excluded.role"#,
            params![
                uuid::Uuid::new_v4().to_string(),
                workspace_id,
                user_id,
                role.as_str(),
                now_secs()
            ],
        )?;
        Ok(())
    })
}

pub fn set_member_role(
    conn: &Connection,
    workspace_id: &str,
    user_id: &str,
    role: Role,
) -> Result<()> {
    let updated = conn.execute(
        r#"UPDATE workspace_members SET role = ?3
           WHERE workspace_id = ?1 AND user_id = ?2"#,
        params![workspace_id, user_id, role.as_str()],
    )?;
    if updated == 0 {
        return Err(anyhow!("not_found: member {user_id} in {workspace_id}"));
    }
    Ok(())
}

/// Remove a membership. The user's active-workspace pointer is repaired in
/// the same transaction so it never dangles on a workspace they left.
pub fn remove_member(conn: &Connection, workspace_id: &str, user_id: &str) -> Result<()> {
    immediate_tx(conn, || {
        let deleted = conn.execute(
            r#"DELETE FROM workspace_members WHERE workspace_id = ?1 AND user_id = ?2"#,
            params![workspace_id, user_id],
        )?;
        if deleted == 0 {
            return Err(anyhow!("not_found: member {user_id} in {workspace_id}"));
        }

        let active: Option<String> = conn
            .query_row(
                r#"SELECT active_workspace_id FROM users WHERE id = ?1"#,
                params![user_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten();
        if active.as_deref() == Some(workspace_id) {
            let replacement: Option<String> = conn
                .query_row(
                    r#"SELECT w.id
                       FROM workspace_members m
                       JOIN workspaces w ON w.id = m.workspace_id
                       WHERE m.user_id = ?1 AND w.deleted = 0
                       ORDER BY m.created_at ASC, w.id ASC
                       LIMIT 1"#,
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()?;
            conn.execute(
                r#"UPDATE users SET active_workspace_id = ?2 WHERE id = ?1"#,
                params![user_id, replacement],
            )?;
        }
        Ok(())
    })
}

/// Paginated workspace listing for operators.
pub fn list_workspaces(
    conn: &Connection,
    search: Option<&str>,
    include_deleted: bool,
    limit: i64,
    offset: i64,
) -> Result<Vec<Workspace>> {
    let limit = limit.clamp(1, 500);
    let offset = offset.max(0);

    let mut sql = format!(r#"SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE 1 = 1"#);
    let mut values: Vec<rusqlite::types::Value> = Vec::new();
    if !include_deleted {
        sql.push_str(" AND deleted = 0");
    }
    if let Some(search) = search.map(str::trim).filter(|s| !s.is_empty()) {
        sql.push_str(" AND (name LIKE ? OR description LIKE ?)");
        let pattern = format!("%{search}%");
        values.push(pattern.clone().into());
        values.push(pattern.into());
    }
    sql.push_str(" ORDER BY created_at ASC, id ASC LIMIT ? OFFSET ?");
    values.push(limit.into());
    values.push(offset.into());

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(rusqlite::params_from_iter(values))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(workspace_from_row(row)?);
    }
    Ok(out)
}

pub fn get_workspace(conn: &Connection, workspace_id: &str) -> Result<Option<Workspace>> {
    get_workspace_row(conn, workspace_id)
}

/// Operator soft-delete: same transactional re-homing as the member-facing
/// removal, without the owner check.
pub fn soft_delete_workspace(conn: &Connection, workspace_id: &str) -> Result<()> {
    immediate_tx(conn, || {
        let workspace = require_workspace(conn, workspace_id)?;
        if workspace.deleted {
            return Ok(());
        }
        soft_delete_workspace_tx(conn, workspace_id)
    })
}

pub fn restore_workspace(conn: &Connection, workspace_id: &str) -> Result<()> {
    let updated = conn.execute(
        r#"UPDATE workspaces SET deleted = 0, deleted_at = NULL WHERE id = ?1"#,
        params![workspace_id],
    )?;
    if updated == 0 {
        return Err(anyhow!("not_found: workspace {workspace_id}"));
    }
    Ok(())
}

pub fn search_users(conn: &Connection, query: &str, limit: i64) -> Result<Vec<User>> {
    let limit = limit.clamp(1, 500);
    let pattern = format!("%{}%", query.trim());
    let mut stmt = conn.prepare(
        r#"SELECT id, email, display_name, active_workspace_id, created_at
           FROM users
           WHERE email LIKE ?1 OR display_name LIKE ?1
           ORDER BY created_at ASC, id ASC
           LIMIT ?2"#,
    )?;
    let mut rows = stmt.query(params![pattern, limit])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(user_from_row(row)?);
    }
    Ok(out)
}

pub fn get_workspace_setting(
    conn: &Connection,
    workspace_id: &str,
    key: &str,
) -> Result<Option<String>> {
    conn.query_row(
        r#"SELECT value FROM workspace_settings WHERE workspace_id = ?1 AND key = ?2"#,
        params![workspace_id, key],
        |row| row.get(0),
    )
    .optional()
    .map_err(Into::into)
}

pub fn set_workspace_setting(
    conn: &Connection,
    workspace_id: &str,
    key: &str,
    value: &str,
) -> Result<()> {
    if key.trim().is_empty() {
        return Err(anyhow!("validation: setting key is required"));
    }
    require_workspace(conn, workspace_id)?;
    conn.execute(
        r#"INSERT INTO workspace_settings (workspace_id, key, value, updated_at)
           VALUES (?1, ?2, ?3, ?4)
           ON CONFLICT(workspace_id, key) DO UPDATE SET
             value = excluded.value,
             updated_at = excluded.updated_at"#,
        params![workspace_id, key, value, now_secs()],
    )?;
    Ok(())
}

pub fn list_device_cursors(conn: &Connection, workspace_id: &str) -> Result<Vec<DeviceCursor>> {
    let mut stmt = conn.prepare(
        r#"SELECT workspace_id, device_id, last_seen_version, updated_at
           FROM device_cursors
           WHERE workspace_id = ?1
           ORDER BY device_id ASC"#,
    )?;
    let mut rows = stmt.query(params![workspace_id])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(DeviceCursor {
            workspace_id: row.get(0)?,
            device_id: row.get(1)?,
            last_seen_version: row.get(2)?,
            updated_at: row.get(3)?,
        });
    }
    Ok(out)
}

/// Drop an abandoned device's cursor so it stops holding back change-log GC.
/// Returns whether a cursor row was removed.
pub fn clear_device_cursor(
    conn: &Connection,
    workspace_id: &str,
    device_id: &str,
) -> Result<bool> {
    let deleted = conn.execute(
        r#"DELETE FROM device_cursors WHERE workspace_id = ?1 AND device_id = ?2"#,
        params![workspace_id, device_id],
    )?;
    if deleted > 0 {
        tracing::info!(workspace_id, device_id, "device cursor cleared");
    }
    Ok(deleted > 0)
}

fn count(conn: &Connection, sql: &str) -> Result<i64> {
    conn.query_row(sql, [], |row| row.get(0)).map_err(Into::into)
}

pub fn status(conn: &Connection) -> Result<StatusReport> {
    Ok(StatusReport {
        users: count(conn, "SELECT COUNT(*) FROM users")?,
        workspaces: count(conn, "SELECT COUNT(*) FROM workspaces WHERE deleted = 0")?,
        deleted_workspaces: count(conn, "SELECT COUNT(*) FROM workspaces WHERE deleted = 1")?,
        members: count(conn, "SELECT COUNT(*) FROM workspace_members")?,
        pending_invites: count(
            conn,
            "SELECT COUNT(*) FROM invites WHERE status = 'pending'",
        )?,
        change_log_entries: count(conn, "SELECT COUNT(*) FROM change_log")?,
        tombstones: count(conn, "SELECT COUNT(*) FROM tombstones")?,
        device_cursors: count(conn, "SELECT COUNT(*) FROM device_cursors")?,
    })
}
