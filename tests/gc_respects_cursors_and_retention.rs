use worksync::db;
use worksync::sync::{self, OpStamp, PendingOp, SyncOp};

fn op(operation: SyncOp, pk: &str, clock: i64, op_id: &str) -> PendingOp {
    PendingOp {
        table_name: "notifications".to_string(),
        operation,
        pk: pk.to_string(),
        payload: match operation {
            SyncOp::Put => Some(serde_json::json!({ "pk": pk })),
            SyncOp::Delete => None,
        },
        stamp: OpStamp {
            device_id: "device-a".to_string(),
            op_id: op_id.to_string(),
            hlc: format!("2026-01-01T00:00:00.000Z-{clock:04}"),
            clock,
        },
    }
}

fn backdate(conn: &rusqlite::Connection, table: &str, seconds: i64) {
    conn.execute(
        &format!("UPDATE {table} SET created_at = created_at - ?1"),
        [seconds],
    )
    .expect("backdate");
}

fn surviving_versions(conn: &rusqlite::Connection) -> Vec<i64> {
    let mut stmt = conn
        .prepare("SELECT server_version FROM change_log WHERE workspace_id = 'ws-1' ORDER BY server_version")
        .expect("prepare");
    stmt.query_map([], |row| row.get(0))
        .expect("query")
        .collect::<Result<_, _>>()
        .expect("rows")
}

#[test]
fn gc_change_log_keeps_everything_a_device_still_needs() {
    let conn = db::open_in_memory().expect("open db");

    let ops: Vec<PendingOp> = (1..=5)
        .map(|i| op(SyncOp::Put, &format!("n{i}"), i, &format!("op-{i}")))
        .collect();
    sync::push(&conn, "ws-1", &ops).expect("seed");

    sync::update_cursor(&conn, "ws-1", "device-a", 3).expect("cursor a");
    sync::update_cursor(&conn, "ws-1", "device-b", 5).expect("cursor b");
    backdate(&conn, "change_log", 3_600);

    let deleted = sync::gc_change_log(&conn, "ws-1", 1).expect("gc");
    assert_eq!(deleted, 2);

    // min_cursor is 3: versions 1 and 2 are gone, 3..=5 survive for the
    // slower device.
    assert_eq!(surviving_versions(&conn), vec![3, 4, 5]);
}

#[test]
fn gc_change_log_without_cursors_deletes_nothing() {
    let conn = db::open_in_memory().expect("open db");

    sync::push(&conn, "ws-1", &[op(SyncOp::Put, "n1", 1, "op-1")]).expect("seed");
    backdate(&conn, "change_log", 3_600);

    let deleted = sync::gc_change_log(&conn, "ws-1", 1).expect("gc");
    assert_eq!(deleted, 0);
    assert_eq!(surviving_versions(&conn), vec![1]);
}

#[test]
fn gc_change_log_honors_the_retention_window() {
    let conn = db::open_in_memory().expect("open db");

    sync::push(&conn, "ws-1", &[op(SyncOp::Put, "n1", 1, "op-1")]).expect("seed");
    sync::update_cursor(&conn, "ws-1", "device-a", 10).expect("cursor");

    // Fresh rows stay even though every cursor is past them.
    let deleted = sync::gc_change_log(&conn, "ws-1", 86_400).expect("gc");
    assert_eq!(deleted, 0);
    assert_eq!(surviving_versions(&conn), vec![1]);
}

#[test]
fn gc_tombstones_applies_the_same_predicate() {
    let conn = db::open_in_memory().expect("open db");

    sync::push(
        &conn,
        "ws-1",
        &[
            op(SyncOp::Delete, "n1", 1, "op-1"),
            op(SyncOp::Delete, "n2", 2, "op-2"),
            op(SyncOp::Delete, "n3", 3, "op-3"),
        ],
    )
    .expect("seed deletes");

    sync::update_cursor(&conn, "ws-1", "device-a", 2).expect("cursor");
    backdate(&conn, "tombstones", 3_600);

    let deleted = sync::gc_tombstones(&conn, "ws-1", 1).expect("gc");
    assert_eq!(deleted, 1, "only the tombstone below every cursor goes");

    let remaining: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM tombstones WHERE workspace_id = 'ws-1'",
            [],
            |row| row.get(0),
        )
        .expect("count");
    assert_eq!(remaining, 2);
}

#[test]
fn gc_is_scoped_to_the_workspace() {
    let conn = db::open_in_memory().expect("open db");

    sync::push(&conn, "ws-1", &[op(SyncOp::Put, "n1", 1, "op-1")]).expect("seed ws-1");
    sync::push(&conn, "ws-2", &[op(SyncOp::Put, "n1", 1, "op-2")]).expect("seed ws-2");
    sync::update_cursor(&conn, "ws-1", "device-a", 5).expect("cursor");
    backdate(&conn, "change_log", 3_600);

    sync::gc_change_log(&conn, "ws-1", 1).expect("gc");

    let other: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM change_log WHERE workspace_id = 'ws-2'",
            [],
            |row| row.get(0),
        )
        .expect("count");
    assert_eq!(other, 1);
}
