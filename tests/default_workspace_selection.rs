use rusqlite::params;
use worksync::db;
use worksync::workspace;

fn new_user(conn: &rusqlite::Connection, uid: &str) -> String {
    workspace::resolve_or_create_user(conn, "google", uid, None, None).expect("resolve user")
}

#[test]
fn first_login_creates_a_sole_owner_workspace() {
    let conn = db::open_in_memory().expect("open db");
    let user_id = new_user(&conn, "uid-1");

    let (workspace_id, name) =
        workspace::get_or_create_default_workspace(&conn, &user_id).expect("default workspace");
    assert_eq!(name, "My Workspace");

    let role = workspace::get_workspace_role(&conn, &user_id, &workspace_id)
        .expect("role")
        .expect("member");
    assert_eq!(role, workspace::Role::Owner);

    let user = workspace::get_user(&conn, "google", "uid-1")
        .expect("get_user")
        .expect("user");
    assert_eq!(user.active_workspace_id.as_deref(), Some(workspace_id.as_str()));

    // A second call lands in the same workspace instead of minting another.
    let (again, _) =
        workspace::get_or_create_default_workspace(&conn, &user_id).expect("default workspace");
    assert_eq!(again, workspace_id);
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM workspaces", [], |row| row.get(0))
        .expect("count");
    assert_eq!(count, 1);
}

#[test]
fn stale_active_pointer_is_repaired_to_the_oldest_membership() {
    let conn = db::open_in_memory().expect("open db");
    let user_id = new_user(&conn, "uid-1");

    let oldest = workspace::create_workspace(&conn, &user_id, "First", None).expect("first");
    workspace::create_workspace(&conn, &user_id, "Second", None).expect("second");

    // Simulate a pointer corrupted by an out-of-band deletion.
    conn.execute(
        r#"UPDATE users SET active_workspace_id = 'gone' WHERE id = ?1"#,
        params![user_id],
    )
    .expect("corrupt pointer");

    let (workspace_id, name) =
        workspace::get_or_create_default_workspace(&conn, &user_id).expect("default workspace");
    assert_eq!(workspace_id, oldest);
    assert_eq!(name, "First");

    let active: Option<String> = conn
        .query_row(
            r#"SELECT active_workspace_id FROM users WHERE id = ?1"#,
            params![user_id],
            |row| row.get(0),
        )
        .expect("active pointer");
    assert_eq!(active.as_deref(), Some(oldest.as_str()));
}

#[test]
fn valid_active_pointer_wins_over_older_memberships() {
    let conn = db::open_in_memory().expect("open db");
    let user_id = new_user(&conn, "uid-1");

    workspace::create_workspace(&conn, &user_id, "First", None).expect("first");
    let second = workspace::create_workspace(&conn, &user_id, "Second", None).expect("second");
    workspace::set_active_workspace(&conn, &user_id, &second).expect("set active");

    let (workspace_id, name) =
        workspace::get_or_create_default_workspace(&conn, &user_id).expect("default workspace");
    assert_eq!(workspace_id, second);
    assert_eq!(name, "Second");
}

#[test]
fn unknown_user_is_not_found() {
    let conn = db::open_in_memory().expect("open db");
    let err = workspace::get_or_create_default_workspace(&conn, "nobody").unwrap_err();
    assert!(err.to_string().starts_with("not_found"));
}
