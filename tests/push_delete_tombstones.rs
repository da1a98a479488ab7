use worksync::db;
use worksync::sync::{self, OpStamp, PendingOp, SyncOp};

fn op(
    operation: SyncOp,
    pk: &str,
    clock: i64,
    device: &str,
    op_id: &str,
) -> PendingOp {
    PendingOp {
        table_name: "posts".to_string(),
        operation,
        pk: pk.to_string(),
        payload: match operation {
            SyncOp::Put => Some(serde_json::json!({ "body": "content" })),
            SyncOp::Delete => None,
        },
        stamp: OpStamp {
            device_id: device.to_string(),
            op_id: op_id.to_string(),
            hlc: format!("2026-01-01T00:00:00.000Z-{clock:04}"),
            clock,
        },
    }
}

fn tombstones(conn: &rusqlite::Connection, pk: &str) -> Vec<(i64, i64)> {
    let mut stmt = conn
        .prepare(
            "SELECT clock, server_version FROM tombstones
             WHERE workspace_id = 'ws-1' AND table_name = 'posts' AND pk = ?1",
        )
        .expect("prepare");
    stmt.query_map([pk], |row| Ok((row.get(0)?, row.get(1)?)))
        .expect("query")
        .collect::<Result<_, _>>()
        .expect("rows")
}

#[test]
fn redelete_keeps_a_single_tombstone_with_the_winning_stamp() {
    let conn = db::open_in_memory().expect("open db");

    sync::push(&conn, "ws-1", &[op(SyncOp::Put, "p1", 1, "device-a", "op-1")]).expect("put");
    sync::push(&conn, "ws-1", &[op(SyncOp::Delete, "p1", 2, "device-a", "op-2")]).expect("delete");
    sync::push(&conn, "ws-1", &[op(SyncOp::Delete, "p1", 3, "device-b", "op-3")])
        .expect("re-delete");

    let rows = tombstones(&conn, "p1");
    assert_eq!(rows.len(), 1, "exactly one tombstone per logical key");
    let (clock, server_version) = rows[0];
    assert_eq!(clock, 3);
    assert_eq!(server_version, 3);

    let (deleted, row_clock): (bool, i64) = conn
        .query_row(
            "SELECT deleted, clock FROM entity_posts WHERE workspace_id = 'ws-1' AND id = 'p1'",
            [],
            |row| Ok((row.get::<_, i64>(0)? != 0, row.get(1)?)),
        )
        .expect("materialized row");
    assert!(deleted);
    assert_eq!(row_clock, 3);
}

#[test]
fn stale_delete_does_not_regress_the_tombstone() {
    let conn = db::open_in_memory().expect("open db");

    sync::push(&conn, "ws-1", &[op(SyncOp::Delete, "p1", 5, "device-a", "op-1")]).expect("delete");
    sync::push(&conn, "ws-1", &[op(SyncOp::Delete, "p1", 2, "device-b", "op-2")])
        .expect("stale delete");

    let rows = tombstones(&conn, "p1");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, 5);
    assert_eq!(rows[0].1, 1);
}

#[test]
fn delete_of_unseen_key_inserts_a_deleted_stub() {
    let conn = db::open_in_memory().expect("open db");

    sync::push(&conn, "ws-1", &[op(SyncOp::Delete, "ghost", 4, "device-a", "op-1")])
        .expect("delete");

    let (data_json, deleted): (String, bool) = conn
        .query_row(
            "SELECT data_json, deleted FROM entity_posts
             WHERE workspace_id = 'ws-1' AND id = 'ghost'",
            [],
            |row| Ok((row.get(0)?, row.get::<_, i64>(1)? != 0)),
        )
        .expect("stub row");
    assert_eq!(data_json, "{}");
    assert!(deleted);
    assert_eq!(tombstones(&conn, "ghost").len(), 1);

    // A stale put after the delete still loses.
    sync::push(&conn, "ws-1", &[op(SyncOp::Put, "ghost", 2, "device-b", "op-2")])
        .expect("stale put");
    let deleted: bool = conn
        .query_row(
            "SELECT deleted FROM entity_posts WHERE workspace_id = 'ws-1' AND id = 'ghost'",
            [],
            |row| Ok(row.get::<_, i64>(0)? != 0),
        )
        .expect("row");
    assert!(deleted, "losing put must not clear the deleted flag");
    assert_eq!(tombstones(&conn, "ghost").len(), 1);
}

#[test]
fn winning_put_after_delete_clears_the_tombstone() {
    let conn = db::open_in_memory().expect("open db");

    sync::push(&conn, "ws-1", &[op(SyncOp::Delete, "p1", 2, "device-a", "op-1")]).expect("delete");
    sync::push(&conn, "ws-1", &[op(SyncOp::Put, "p1", 3, "device-b", "op-2")]).expect("put");

    let deleted: bool = conn
        .query_row(
            "SELECT deleted FROM entity_posts WHERE workspace_id = 'ws-1' AND id = 'p1'",
            [],
            |row| Ok(row.get::<_, i64>(0)? != 0),
        )
        .expect("row");
    assert!(!deleted);
    assert!(
        tombstones(&conn, "p1").is_empty(),
        "a tombstone exists only while the winning change is a delete"
    );
}
