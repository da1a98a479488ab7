use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::db::{immediate_tx, now_secs};

pub const DEFAULT_WORKSPACE_NAME: &str = "My Workspace";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Editor,
    Viewer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Editor => "editor",
            Role::Viewer => "viewer",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "owner" => Ok(Role::Owner),
            "editor" => Ok(Role::Editor),
            "viewer" => Ok(Role::Viewer),
            other => Err(anyhow!("unknown role: {other}")),
        }
    }

    /// Owner and editor may change workspace metadata.
    pub fn can_edit(self) -> bool {
        matches!(self, Role::Owner | Role::Editor)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub active_workspace_id: Option<String>,
    pub created_at: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub owner_user_id: String,
    pub created_at: i64,
    pub deleted: bool,
    pub deleted_at: Option<i64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct WorkspaceSummary {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub role: Role,
    pub created_at: i64,
    pub is_active: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct Member {
    pub id: String,
    pub workspace_id: String,
    pub user_id: String,
    pub role: Role,
    pub created_at: i64,
}

pub(crate) fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        display_name: row.get(2)?,
        active_workspace_id: row.get(3)?,
        created_at: row.get(4)?,
    })
}

pub(crate) fn workspace_from_row(row: &Row<'_>) -> rusqlite::Result<Workspace> {
    Ok(Workspace {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        owner_user_id: row.get(3)?,
        created_at: row.get(4)?,
        deleted: row.get::<_, i64>(5)? != 0,
        deleted_at: row.get(6)?,
    })
}

pub(crate) const WORKSPACE_COLUMNS: &str =
    "id, name, description, owner_user_id, created_at, deleted, deleted_at";

fn user_exists(conn: &Connection, user_id: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            r#"SELECT 1 FROM users WHERE id = ?1"#,
            params![user_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub(crate) fn get_workspace_row(
    conn: &Connection,
    workspace_id: &str,
) -> Result<Option<Workspace>> {
    conn.query_row(
        &format!(r#"SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE id = ?1"#),
        params![workspace_id],
        workspace_from_row,
    )
    .optional()
    .map_err(Into::into)
}

/// Map an external auth identity to an internal user, creating the user on
/// first sight.
///
/// Concurrency-safe by construction: the unique index on
/// (provider, provider_user_id) is the coordination point. We insert a
/// provisional user, attempt the account insert with ON CONFLICT DO NOTHING,
/// and if the account already existed we drop the provisional row and re-read
/// the winner. Two racing callers always observe the same user_id.
pub fn resolve_or_create_user(
    conn: &Connection,
    provider: &str,
    provider_user_id: &str,
    email: Option<&str>,
    display_name: Option<&str>,
) -> Result<String> {
    if provider.trim().is_empty() || provider_user_id.trim().is_empty() {
        return Err(anyhow!("validation: provider and provider_user_id are required"));
    }

    immediate_tx(conn, || {
        let now = now_secs();
        let candidate_user_id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            r#"INSERT INTO users (id, email, display_name, active_workspace_id, created_at)
               VALUES (?1, ?2, ?3, NULL, ?4)"#,
            params![candidate_user_id, email, display_name, now],
        )?;

        let inserted = conn.execute(
            r#"INSERT INTO auth_accounts (id, user_id, provider, provider_user_id, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5)
               ON CONFLICT(provider, provider_user_id) DO NOTHING"#,
            params![
                uuid::Uuid::new_v4().to_string(),
                candidate_user_id,
                provider,
                provider_user_id,
                now
            ],
        )?;
        if inserted > 0 {
            return Ok(candidate_user_id);
        }

        conn.execute(
            r#"DELETE FROM users WHERE id = ?1"#,
            params![candidate_user_id],
        )?;
        let user_id: String = conn.query_row(
            r#"SELECT user_id FROM auth_accounts
               WHERE provider = ?1 AND provider_user_id = ?2"#,
            params![provider, provider_user_id],
            |row| row.get(0),
        )?;
        Ok(user_id)
    })
}

pub fn get_user(
    conn: &Connection,
    provider: &str,
    provider_user_id: &str,
) -> Result<Option<User>> {
    conn.query_row(
        r#"SELECT u.id, u.email, u.display_name, u.active_workspace_id, u.created_at
           FROM auth_accounts a
           JOIN users u ON u.id = a.user_id
           WHERE a.provider = ?1 AND a.provider_user_id = ?2"#,
        params![provider, provider_user_id],
        |row| user_from_row(row),
    )
    .optional()
    .map_err(Into::into)
}

/// The workspace a freshly signed-in user should land in.
///
/// Preference order: the current active pointer when it still names a live
/// membership, else the oldest surviving membership (repairing the pointer),
/// else a new sole-owner workspace.
pub fn get_or_create_default_workspace(
    conn: &Connection,
    user_id: &str,
) -> Result<(String, String)> {
    immediate_tx(conn, || {
        if !user_exists(conn, user_id)? {
            return Err(anyhow!("not_found: user {user_id}"));
        }

        let active: Option<(String, String)> = conn
            .query_row(
                r#"SELECT w.id, w.name
                   FROM users u
                   JOIN workspaces w ON w.id = u.active_workspace_id
                   JOIN workspace_members m ON m.workspace_id = w.id AND m.user_id = u.id
                   WHERE u.id = ?1 AND w.deleted = 0"#,
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some(found) = active {
            return Ok(found);
        }

        let oldest: Option<(String, String)> = conn
            .query_row(
                r#"SELECT w.id, w.name
                   FROM workspace_members m
                   JOIN workspaces w ON w.id = m.workspace_id
                   WHERE m.user_id = ?1 AND w.deleted = 0
                   ORDER BY m.created_at ASC, w.id ASC
                   LIMIT 1"#,
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((workspace_id, name)) = oldest {
            conn.execute(
                r#"UPDATE users SET active_workspace_id = ?2 WHERE id = ?1"#,
                params![user_id, workspace_id],
            )?;
            return Ok((workspace_id, name));
        }

        let now = now_secs();
        let workspace_id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            r#"INSERT INTO workspaces (id, name, description, owner_user_id, created_at)
               VALUES (?1, ?2, NULL, ?3, ?4)"#,
            params![workspace_id, DEFAULT_WORKSPACE_NAME, user_id, now],
        )?;
        conn.execute(
            r#"INSERT INTO workspace_members (id, workspace_id, user_id, role, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
            params![
                uuid::Uuid::new_v4().to_string(),
                workspace_id,
                user_id,
                Role::Owner.as_str(),
                now
            ],
        )?;
        conn.execute(
            r#"UPDATE users SET active_workspace_id = ?2 WHERE id = ?1"#,
            params![user_id, workspace_id],
        )?;
        Ok((workspace_id, DEFAULT_WORKSPACE_NAME.to_string()))
    })
}

/// Membership role, or None for non-members. Soft-delete state is ignored
/// here; callers that care filter themselves.
pub fn get_workspace_role(
    conn: &Connection,
    user_id: &str,
    workspace_id: &str,
) -> Result<Option<Role>> {
    let role: Option<String> = conn
        .query_row(
            r#"SELECT role FROM workspace_members
               WHERE user_id = ?1 AND workspace_id = ?2"#,
            params![user_id, workspace_id],
            |row| row.get(0),
        )
        .optional()?;
    role.as_deref().map(Role::parse).transpose()
}

pub fn list_user_workspaces(conn: &Connection, user_id: &str) -> Result<Vec<WorkspaceSummary>> {
    let mut stmt = conn.prepare(
        r#"SELECT w.id, w.name, w.description, m.role, w.created_at,
                  CASE WHEN u.active_workspace_id = w.id THEN 1 ELSE 0 END
           FROM workspace_members m
           JOIN workspaces w ON w.id = m.workspace_id
           JOIN users u ON u.id = m.user_id
           WHERE m.user_id = ?1 AND w.deleted = 0
           ORDER BY m.created_at ASC, w.id ASC"#,
    )?;

    let mut rows = stmt.query(params![user_id])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let role: String = row.get(3)?;
        out.push(WorkspaceSummary {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            role: Role::parse(&role)?,
            created_at: row.get(4)?,
            is_active: row.get::<_, i64>(5)? != 0,
        });
    }
    Ok(out)
}

pub fn create_workspace(
    conn: &Connection,
    user_id: &str,
    name: &str,
    description: Option<&str>,
) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow!("validation: workspace name is required"));
    }

    immediate_tx(conn, || {
        if !user_exists(conn, user_id)? {
            return Err(anyhow!("not_found: user {user_id}"));
        }

        let now = now_secs();
        let workspace_id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            r#"INSERT INTO workspaces (id, name, description, owner_user_id, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
            params![workspace_id, name, description, user_id, now],
        )?;
        conn.execute(
            r#"INSERT INTO workspace_members (id, workspace_id, user_id, role, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
            params![
                uuid::Uuid::new_v4().to_string(),
                workspace_id,
                user_id,
                Role::Owner.as_str(),
                now
            ],
        )?;
        Ok(workspace_id)
    })
}

pub fn update_workspace(
    conn: &Connection,
    user_id: &str,
    workspace_id: &str,
    name: &str,
    description: Option<&str>,
) -> Result<()> {
    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow!("validation: workspace name is required"));
    }

    immediate_tx(conn, || {
        let workspace = get_workspace_row(conn, workspace_id)?
            .ok_or_else(|| anyhow!("not_found: workspace {workspace_id}"))?;

        let role = get_workspace_role(conn, user_id, workspace_id)?;
        if !role.is_some_and(Role::can_edit) {
            return Err(anyhow!("forbidden_role"));
        }
        if workspace.deleted {
            return Ok(());
        }

        conn.execute(
            r#"UPDATE workspaces SET name = ?2, description = ?3 WHERE id = ?1"#,
            params![workspace_id, name, description],
        )?;
        Ok(())
    })
}

/// Point every user whose active workspace is `workspace_id` at some other
/// workspace they still belong to, or at nothing. Must run inside the same
/// transaction as the soft-delete that orphans them.
pub(crate) fn rehome_active_pointers(conn: &Connection, workspace_id: &str) -> Result<()> {
    let mut stmt = conn.prepare(r#"SELECT id FROM users WHERE active_workspace_id = ?1"#)?;
    let mut rows = stmt.query(params![workspace_id])?;
    let mut affected: Vec<String> = Vec::new();
    while let Some(row) = rows.next()? {
        affected.push(row.get(0)?);
    }

    for user_id in affected {
        let replacement: Option<String> = conn
            .query_row(
                r#"SELECT w.id
                   FROM workspace_members m
                   JOIN workspaces w ON w.id = m.workspace_id
                   WHERE m.user_id = ?1 AND w.deleted = 0 AND w.id != ?2
                   ORDER BY m.created_at ASC, w.id ASC
                   LIMIT 1"#,
                params![user_id, workspace_id],
                |row| row.get(0),
            )
            .optional()?;
        conn.execute(
            r#"UPDATE users SET active_workspace_id = ?2 WHERE id = ?1"#,
            params![user_id, replacement],
        )?;
    }
    Ok(())
}

pub(crate) fn soft_delete_workspace_tx(conn: &Connection, workspace_id: &str) -> Result<()> {
    conn.execute(
        r#"UPDATE workspaces SET deleted = 1, deleted_at = ?2 WHERE id = ?1"#,
        params![workspace_id, now_secs()],
    )?;
    rehome_active_pointers(conn, workspace_id)
}

/// Soft-delete a workspace. Owner only. Memberships survive; active-workspace
/// pointers are re-homed in the same transaction.
pub fn remove_workspace(conn: &Connection, user_id: &str, workspace_id: &str) -> Result<()> {
    immediate_tx(conn, || {
        let workspace = get_workspace_row(conn, workspace_id)?
            .ok_or_else(|| anyhow!("not_found: workspace {workspace_id}"))?;

        let role = get_workspace_role(conn, user_id, workspace_id)?;
        if role != Some(Role::Owner) {
            return Err(anyhow!("forbidden_owner"));
        }
        if workspace.deleted {
            return Ok(());
        }

        soft_delete_workspace_tx(conn, workspace_id)
    })
}

pub fn set_active_workspace(conn: &Connection, user_id: &str, workspace_id: &str) -> Result<()> {
    // One transaction: a soft-delete committing between the membership check
    // and the pointer write would leave the pointer on a deleted workspace.
    immediate_tx(conn, || {
        let member: Option<i64> = conn
            .query_row(
                r#"SELECT 1
                   FROM workspace_members m
                   JOIN workspaces w ON w.id = m.workspace_id
                   WHERE m.user_id = ?1 AND m.workspace_id = ?2 AND w.deleted = 0"#,
                params![user_id, workspace_id],
                |row| row.get(0),
            )
            .optional()?;
        if member.is_none() {
            return Err(anyhow!("not_member"));
        }

        conn.execute(
            r#"UPDATE users SET active_workspace_id = ?2 WHERE id = ?1"#,
            params![user_id, workspace_id],
        )?;
        Ok(())
    })
}
