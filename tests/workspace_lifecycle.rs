use worksync::db;
use worksync::workspace::{self, Role};
use worksync::admin;

fn new_user(conn: &rusqlite::Connection, uid: &str) -> String {
    workspace::resolve_or_create_user(conn, "google", uid, None, None).expect("resolve user")
}

#[test]
fn create_workspace_installs_the_owner_membership() {
    let conn = db::open_in_memory().expect("open db");
    let owner = new_user(&conn, "uid-owner");

    let workspace_id =
        workspace::create_workspace(&conn, &owner, "Team", Some("shared space")).expect("create");

    let role = workspace::get_workspace_role(&conn, &owner, &workspace_id)
        .expect("role")
        .expect("member");
    assert_eq!(role, Role::Owner);

    let listed = workspace::list_user_workspaces(&conn, &owner).expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "Team");
    assert_eq!(listed[0].description.as_deref(), Some("shared space"));

    let err = workspace::create_workspace(&conn, &owner, "   ", None).unwrap_err();
    assert!(err.to_string().starts_with("validation"));
}

#[test]
fn update_requires_editor_or_owner() {
    let conn = db::open_in_memory().expect("open db");
    let owner = new_user(&conn, "uid-owner");
    let editor = new_user(&conn, "uid-editor");
    let viewer = new_user(&conn, "uid-viewer");
    let outsider = new_user(&conn, "uid-outsider");

    let workspace_id = workspace::create_workspace(&conn, &owner, "Team", None).expect("create");
    admin::upsert_member(&conn, &workspace_id, &editor, Role::Editor).expect("add editor");
    admin::upsert_member(&conn, &workspace_id, &viewer, Role::Viewer).expect("add viewer");

    workspace::update_workspace(&conn, &owner, &workspace_id, "Renamed", None).expect("owner");
    workspace::update_workspace(&conn, &editor, &workspace_id, "Renamed again", None)
        .expect("editor");

    let err =
        workspace::update_workspace(&conn, &viewer, &workspace_id, "Nope", None).unwrap_err();
    assert_eq!(err.to_string(), "forbidden_role");
    let err =
        workspace::update_workspace(&conn, &outsider, &workspace_id, "Nope", None).unwrap_err();
    assert_eq!(err.to_string(), "forbidden_role");

    let stored = admin::get_workspace(&conn, &workspace_id)
        .expect("get")
        .expect("workspace");
    assert_eq!(stored.name, "Renamed again");
}

#[test]
fn only_the_owner_removes_a_workspace() {
    let conn = db::open_in_memory().expect("open db");
    let owner = new_user(&conn, "uid-owner");
    let editor = new_user(&conn, "uid-editor");

    let workspace_id = workspace::create_workspace(&conn, &owner, "Team", None).expect("create");
    admin::upsert_member(&conn, &workspace_id, &editor, Role::Editor).expect("add editor");

    let err = workspace::remove_workspace(&conn, &editor, &workspace_id).unwrap_err();
    assert_eq!(err.to_string(), "forbidden_owner");

    workspace::remove_workspace(&conn, &owner, &workspace_id).expect("remove");
    let stored = admin::get_workspace(&conn, &workspace_id)
        .expect("get")
        .expect("workspace");
    assert!(stored.deleted);
    assert!(stored.deleted_at.is_some());

    // Membership survives the soft-delete, but member-facing listings drop it.
    let role = workspace::get_workspace_role(&conn, &editor, &workspace_id).expect("role");
    assert_eq!(role, Some(Role::Editor));
    assert!(workspace::list_user_workspaces(&conn, &editor)
        .expect("list")
        .is_empty());

    // Updating a soft-deleted workspace is a no-op.
    workspace::update_workspace(&conn, &owner, &workspace_id, "Too late", None).expect("no-op");
    let stored = admin::get_workspace(&conn, &workspace_id)
        .expect("get")
        .expect("workspace");
    assert_eq!(stored.name, "Team");
}

#[test]
fn removal_rehomes_every_affected_active_pointer() {
    let conn = db::open_in_memory().expect("open db");
    let owner = new_user(&conn, "uid-owner");
    let drifter = new_user(&conn, "uid-drifter");
    let stranded = new_user(&conn, "uid-stranded");

    let doomed = workspace::create_workspace(&conn, &owner, "Doomed", None).expect("doomed");
    let haven = workspace::create_workspace(&conn, &drifter, "Haven", None).expect("haven");

    admin::upsert_member(&conn, &doomed, &drifter, Role::Viewer).expect("add drifter");
    admin::upsert_member(&conn, &doomed, &stranded, Role::Viewer).expect("add stranded");
    workspace::set_active_workspace(&conn, &drifter, &doomed).expect("drifter active");
    workspace::set_active_workspace(&conn, &stranded, &doomed).expect("stranded active");
    workspace::set_active_workspace(&conn, &owner, &doomed).expect("owner active");

    workspace::remove_workspace(&conn, &owner, &doomed).expect("remove");

    // drifter still belongs to another live workspace and lands there;
    // stranded has nowhere left and goes to null.
    let active = |uid: &str| -> Option<String> {
        conn.query_row(
            r#"SELECT active_workspace_id FROM users WHERE id = ?1"#,
            [uid],
            |row| row.get(0),
        )
        .expect("pointer")
    };
    assert_eq!(active(&drifter).as_deref(), Some(haven.as_str()));
    assert_eq!(active(&stranded), None);
    assert_eq!(active(&owner), None);
}

#[test]
fn set_active_workspace_requires_a_live_membership() {
    let conn = db::open_in_memory().expect("open db");
    let owner = new_user(&conn, "uid-owner");
    let outsider = new_user(&conn, "uid-outsider");

    let workspace_id = workspace::create_workspace(&conn, &owner, "Team", None).expect("create");

    let err = workspace::set_active_workspace(&conn, &outsider, &workspace_id).unwrap_err();
    assert_eq!(err.to_string(), "not_member");

    workspace::set_active_workspace(&conn, &owner, &workspace_id).expect("set active");

    workspace::remove_workspace(&conn, &owner, &workspace_id).expect("remove");
    let err = workspace::set_active_workspace(&conn, &owner, &workspace_id).unwrap_err();
    assert_eq!(err.to_string(), "not_member", "soft-deleted reads as not_member");
}
