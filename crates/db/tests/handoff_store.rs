mod support;

use budget_core::{HandoffStore, StoreError};
use budget_db::{Db, DbError};
use chrono::Duration;
use rusqlite::Connection;
use support::{block_window, make_snapshot, setup_db, ts, usage};

#[test]
fn empty_store_has_no_snapshot() {
    let test_db = setup_db();
    assert_eq!(test_db.db.latest_snapshot().expect("load"), None);
    assert_eq!(test_db.db.snapshot_count().expect("count"), 0);
}

#[test]
fn latest_snapshot_round_trips() {
    let mut test_db = setup_db();
    let first = make_snapshot(1, ts(9, 0));
    let second = make_snapshot(2, ts(10, 0));
    assert_eq!(test_db.db.save(&first).expect("save first"), 1);
    assert_eq!(test_db.db.save(&second).expect("save second"), 2);

    let loaded = test_db.db.load_latest().expect("load").expect("snapshot");
    assert_eq!(loaded, second);
    assert_eq!(loaded.cursors["/logs/a.jsonl"].offset, 4_096);
}

#[test]
fn stale_sequence_is_rejected() {
    let mut test_db = setup_db();
    test_db
        .db
        .save(&make_snapshot(5, ts(9, 0)))
        .expect("save");
    let err = test_db
        .db
        .save(&make_snapshot(5, ts(9, 30)))
        .expect_err("replay");
    assert!(matches!(
        err,
        StoreError::Replay {
            sequence: 5,
            latest: 5
        }
    ));
    assert!(matches!(
        test_db.db.save_snapshot(&make_snapshot(3, ts(9, 45))),
        Err(DbError::Replay { .. })
    ));
    assert_eq!(test_db.db.snapshot_count().expect("count"), 1);
}

#[test]
fn tampered_payload_is_reported_corrupt() {
    let mut test_db = setup_db();
    test_db
        .db
        .save(&make_snapshot(1, ts(9, 0)))
        .expect("save");
    {
        let conn = Connection::open(&test_db.path).expect("open conn");
        conn.execute(
            "UPDATE handoff_snapshot SET payload_json = replace(payload_json, '4096', '9999')",
            [],
        )
        .expect("tamper");
    }
    let err = test_db.db.load_latest().expect_err("corrupt");
    assert!(matches!(err, StoreError::Corrupt(_)));
}

#[test]
fn prune_keeps_newest_snapshots() {
    let mut test_db = setup_db();
    for sequence in 1..=6 {
        test_db
            .db
            .save(&make_snapshot(sequence, ts(8, 0) + Duration::minutes(sequence as i64)))
            .expect("save");
    }
    assert_eq!(test_db.db.prune_snapshots(2).expect("prune"), 4);
    assert_eq!(test_db.db.snapshot_count().expect("count"), 2);
    let latest = test_db.db.latest_snapshot().expect("load").expect("snapshot");
    assert_eq!(latest.sequence_number, 6);
}

#[test]
fn reopened_database_keeps_snapshots() {
    let mut test_db = setup_db();
    test_db
        .db
        .save(&make_snapshot(7, ts(9, 0)))
        .expect("save");
    let reopened = Db::open_and_migrate(&test_db.path).expect("reopen");
    let latest = reopened.latest_snapshot().expect("load").expect("snapshot");
    assert_eq!(latest.sequence_number, 7);
}

#[test]
fn closed_blocks_are_listed_newest_first() {
    let mut test_db = setup_db();
    let early = block_window(ts(1, 0), usage(100, 10), 2);
    let late = block_window(ts(6, 0), usage(300, 30), 4);
    test_db.db.record_closed_window(&early).expect("early");
    test_db.db.record_closed_window(&late).expect("late");
    // Re-recording the same block replaces it.
    let late_again = block_window(ts(6, 0), usage(310, 30), 5);
    assert!(test_db.db.record_closed_block(&late_again).expect("again"));

    let blocks = test_db.db.list_closed_blocks(0).expect("list");
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].anchor, ts(6, 0));
    assert_eq!(blocks[0].window_end, ts(11, 0));
    assert_eq!(blocks[0].totals.input_tokens, 310);
    assert_eq!(blocks[0].event_count, 5);
    assert_eq!(blocks[0].window, late_again);
    assert_eq!(blocks[1].anchor, ts(1, 0));

    let newest = test_db.db.list_closed_blocks(1).expect("list one");
    assert_eq!(newest.len(), 1);
}

#[test]
fn windows_without_a_block_are_not_recorded() {
    let mut test_db = setup_db();
    let mut open = block_window(ts(1, 0), usage(1, 1), 1);
    open.anchor = None;
    assert!(!test_db.db.record_closed_block(&open).expect("record"));
    let mut long = block_window(ts(1, 0), usage(1, 1), 1);
    long.kind = budget_core::WindowKind::LongQuota;
    assert!(!test_db.db.record_closed_block(&long).expect("record"));
    assert!(test_db.db.list_closed_blocks(0).expect("list").is_empty());
}

#[test]
fn migrate_is_idempotent() {
    let mut test_db = setup_db();
    test_db.db.migrate().expect("second migrate");
    test_db
        .db
        .save(&make_snapshot(1, ts(9, 0)))
        .expect("save");
    test_db.db.migrate().expect("third migrate");
    assert_eq!(test_db.db.snapshot_count().expect("count"), 1);
}

#[test]
fn latest_sequence_survives_a_corrupt_payload() {
    let mut test_db = setup_db();
    test_db
        .db
        .save(&make_snapshot(4, ts(9, 0)))
        .expect("save");
    {
        let conn = Connection::open(&test_db.path).expect("open conn");
        conn.execute("UPDATE handoff_snapshot SET checksum = 'bad'", [])
            .expect("tamper");
    }
    assert!(test_db.db.load_latest().is_err());
    assert_eq!(
        HandoffStore::latest_sequence(&test_db.db).expect("sequence"),
        Some(4)
    );
}
