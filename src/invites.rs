use anyhow::{anyhow, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64_URL;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::db::{immediate_tx, now_secs};
use crate::workspace::{get_workspace_role, get_workspace_row, Role};

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_ACCEPTED: &str = "accepted";
pub const STATUS_REVOKED: &str = "revoked";
pub const STATUS_EXPIRED: &str = "expired";

#[derive(Clone, Debug, Serialize)]
pub struct Invite {
    pub id: String,
    pub workspace_id: String,
    pub email: String,
    pub role: Role,
    pub status: String,
    pub invited_by: String,
    pub expires_at: i64,
    pub accepted_at: Option<i64>,
    pub accepted_user_id: Option<String>,
    pub revoked_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

const INVITE_COLUMNS: &str = "id, workspace_id, email, role, status, invited_by, expires_at, \
                              accepted_at, accepted_user_id, revoked_at, created_at, updated_at";

fn invite_from_row(row: &Row<'_>) -> rusqlite::Result<Invite> {
    let role: String = row.get(3)?;
    let role = Role::parse(&role).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(Invite {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        email: row.get(2)?,
        role,
        status: row.get(4)?,
        invited_by: row.get(5)?,
        expires_at: row.get(6)?,
        accepted_at: row.get(7)?,
        accepted_user_id: row.get(8)?,
        revoked_at: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }

    let mut diff = 0_u8;
    for (&lhs, &rhs) in left.iter().zip(right) {
        diff |= lhs ^ rhs;
    }
    diff == 0
}

fn lazy_expire(conn: &Connection, workspace_id: &str, now: i64) -> Result<()> {
    conn.execute(
        r#"UPDATE invites SET status = ?3, updated_at = ?2
           WHERE workspace_id = ?1 AND status = ?4 AND expires_at <= ?2"#,
        params![workspace_id, now, STATUS_EXPIRED, STATUS_PENDING],
    )?;
    Ok(())
}

/// Invite an email address into a workspace.
///
/// Returns the invite and the plaintext token, exactly once; only the token's
/// SHA-256 hash is persisted.
pub fn create_invite(
    conn: &Connection,
    inviter_user_id: &str,
    workspace_id: &str,
    email: &str,
    role: Role,
    ttl_seconds: i64,
) -> Result<(Invite, String)> {
    let email = normalize_email(email);
    if email.is_empty() {
        return Err(anyhow!("validation: invite email is required"));
    }
    if ttl_seconds <= 0 {
        return Err(anyhow!("validation: invite ttl must be positive"));
    }

    immediate_tx(conn, || {
        let workspace = get_workspace_row(conn, workspace_id)?
            .ok_or_else(|| anyhow!("not_found: workspace {workspace_id}"))?;
        if workspace.deleted {
            return Err(anyhow!("not_found: workspace {workspace_id}"));
        }

        let inviter_role = get_workspace_role(conn, inviter_user_id, workspace_id)?;
        if !inviter_role.is_some_and(Role::can_edit) {
            return Err(anyhow!("forbidden_role"));
        }

        let mut token_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut token_bytes);
        let token = B64_URL.encode(token_bytes);
        let token_hash = sha256_hex(token.as_bytes());

        let now = now_secs();
        let invite = Invite {
            id: uuid::Uuid::new_v4().to_string(),
            workspace_id: workspace_id.to_string(),
            email,
            role,
            status: STATUS_PENDING.to_string(),
            invited_by: inviter_user_id.to_string(),
            expires_at: now + ttl_seconds,
            accepted_at: None,
            accepted_user_id: None,
            revoked_at: None,
            created_at: now,
            updated_at: now,
        };
        conn.execute(
            r#"INSERT INTO invites
               (id, workspace_id, email, role, status, invited_by, token_hash, expires_at,
                created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)"#,
            params![
                invite.id,
                invite.workspace_id,
                invite.email,
                invite.role.as_str(),
                invite.status,
                invite.invited_by,
                token_hash,
                invite.expires_at,
                now
            ],
        )?;
        Ok((invite, token))
    })
}

/// List a workspace's invites, transitioning stale pending invites to
/// expired first, in the same transaction.
pub fn list_invites(conn: &Connection, workspace_id: &str) -> Result<Vec<Invite>> {
    immediate_tx(conn, || {
        lazy_expire(conn, workspace_id, now_secs())?;

        let mut stmt = conn.prepare(&format!(
            r#"SELECT {INVITE_COLUMNS} FROM invites
               WHERE workspace_id = ?1
               ORDER BY created_at ASC, id ASC"#
        ))?;
        let mut rows = stmt.query(params![workspace_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(invite_from_row(row)?);
        }
        Ok(out)
    })
}

/// Revoke a pending invite. No-op when the invite already reached a terminal
/// state.
pub fn revoke_invite(conn: &Connection, invite_id: &str) -> Result<()> {
    immediate_tx(conn, || {
        let exists: Option<i64> = conn
            .query_row(
                r#"SELECT 1 FROM invites WHERE id = ?1"#,
                params![invite_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(anyhow!("not_found: invite {invite_id}"));
        }

        let now = now_secs();
        conn.execute(
            r#"UPDATE invites SET status = ?3, revoked_at = ?2, updated_at = ?2
               WHERE id = ?1 AND status = ?4"#,
            params![invite_id, now, STATUS_REVOKED, STATUS_PENDING],
        )?;
        Ok(())
    })
}

/// Accept the oldest pending invite for (workspace, email).
///
/// One transaction end to end: lazy expiry, status checks, the token-hash
/// comparison, the acceptance mark, the membership upsert (an existing
/// member's role is overwritten), and the active-workspace switch.
pub fn consume_invite(
    conn: &Connection,
    user_id: &str,
    workspace_id: &str,
    email: &str,
    token: &str,
) -> Result<Invite> {
    let email = normalize_email(email);

    immediate_tx(conn, || {
        let now = now_secs();
        lazy_expire(conn, workspace_id, now)?;

        let pending: Option<(Invite, String)> = conn
            .query_row(
                &format!(
                    r#"SELECT {INVITE_COLUMNS}, token_hash FROM invites
                       WHERE workspace_id = ?1 AND email = ?2 AND status = ?3
                       ORDER BY created_at ASC, id ASC
                       LIMIT 1"#
                ),
                params![workspace_id, email, STATUS_PENDING],
                |row| {
                    let invite = invite_from_row(row)?;
                    let token_hash: String = row.get(12)?;
                    Ok((invite, token_hash))
                },
            )
            .optional()?;

        let Some((invite, token_hash)) = pending else {
            // Name the terminal state the newest invite reached, if any.
            let last_status: Option<String> = conn
                .query_row(
                    r#"SELECT status FROM invites
                       WHERE workspace_id = ?1 AND email = ?2
                       ORDER BY created_at DESC, id DESC
                       LIMIT 1"#,
                    params![workspace_id, email],
                    |row| row.get(0),
                )
                .optional()?;
            return Err(match last_status.as_deref() {
                Some(STATUS_ACCEPTED) => anyhow!("already_used"),
                Some(STATUS_REVOKED) => anyhow!("revoked"),
                Some(STATUS_EXPIRED) => anyhow!("expired"),
                _ => anyhow!("not_found"),
            });
        };

        if !constant_time_eq(
            sha256_hex(token.as_bytes()).as_bytes(),
            token_hash.as_bytes(),
        ) {
            return Err(anyhow!("token_mismatch"));
        }

        if !conn
            .query_row(
                r#"SELECT 1 FROM users WHERE id = ?1"#,
                params![user_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .is_some()
        {
            return Err(anyhow!("not_found: user {user_id}"));
        }

        conn.execute(
            r#"UPDATE invites
               SET status = ?2, accepted_at = ?3, accepted_user_id = ?4, updated_at = ?3
               WHERE id = ?1"#,
            params![invite.id, STATUS_ACCEPTED, now, user_id],
        )?;

        conn.execute(
            r#"INSERT INTO workspace_members (id, workspace_id, user_id, role, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5)
               ON CONFLICT(workspace_id, user_id) DO UPDATE SET role = excluded.role"#,
            params![
                uuid::Uuid::new_v4().to_string(),
                workspace_id,
                user_id,
                invite.role.as_str(),
                now
            ],
        )?;

        conn.execute(
            r#"UPDATE users SET active_workspace_id = ?2 WHERE id = ?1"#,
            params![user_id, workspace_id],
        )?;

        Ok(Invite {
            status: STATUS_ACCEPTED.to_string(),
            accepted_at: Some(now),
            accepted_user_id: Some(user_id.to_string()),
            updated_at: now,
            ..invite
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emails_are_lowercased_and_trimmed() {
        assert_eq!(normalize_email("  Ada@Example.COM "), "ada@example.com");
    }

    #[test]
    fn constant_time_eq_requires_equal_lengths() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
