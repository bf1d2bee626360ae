use std::fmt::Write;

use budget_core::{HandoffSnapshot, HandoffStore, RollingWindow, StoreError};
use chrono::SecondsFormat;
use rusqlite::{OptionalExtension, params};
use sha2::{Digest, Sha256};

use crate::Db;
use crate::error::{DbError, Result};

impl Db {
    /// Appends `snapshot`. Rows are never updated once written.
    pub fn save_snapshot(&mut self, snapshot: &HandoffSnapshot) -> Result<u64> {
        let payload = serde_json::to_string(snapshot)?;
        let checksum = checksum(&payload);
        let tx = self.conn.transaction()?;
        let latest: Option<i64> = tx.query_row(
            "SELECT MAX(sequence_number) FROM handoff_snapshot",
            [],
            |row| row.get(0),
        )?;
        if let Some(latest) = latest
            && snapshot.sequence_number as i64 <= latest
        {
            return Err(DbError::Replay {
                sequence: snapshot.sequence_number,
                latest: latest as u64,
            });
        }
        tx.execute(
            r#"
            INSERT INTO handoff_snapshot (
              sequence_number, created_at, reason, payload_json, checksum
            ) VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                snapshot.sequence_number as i64,
                snapshot
                    .created_at
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
                snapshot.reason.as_str(),
                payload,
                checksum,
            ],
        )?;
        tx.commit()?;
        Ok(snapshot.sequence_number)
    }

    /// The newest snapshot, verified against its checksum.
    pub fn latest_snapshot(&self) -> Result<Option<HandoffSnapshot>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT sequence_number, payload_json, checksum
                FROM handoff_snapshot
                ORDER BY sequence_number DESC
                LIMIT 1
                "#,
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((sequence, payload, stored_checksum)) = row else {
            return Ok(None);
        };
        if checksum(&payload) != stored_checksum {
            return Err(DbError::Corrupt(format!(
                "checksum mismatch for snapshot {sequence}"
            )));
        }
        let snapshot: HandoffSnapshot = serde_json::from_str(&payload)
            .map_err(|err| DbError::Corrupt(format!("snapshot {sequence}: {err}")))?;
        if snapshot.sequence_number as i64 != sequence {
            return Err(DbError::Corrupt(format!(
                "snapshot {sequence} carries sequence {}",
                snapshot.sequence_number
            )));
        }
        Ok(Some(snapshot))
    }

    pub fn latest_sequence(&self) -> Result<Option<u64>> {
        let latest: Option<i64> = self.conn.query_row(
            "SELECT MAX(sequence_number) FROM handoff_snapshot",
            [],
            |row| row.get(0),
        )?;
        Ok(latest.map(|value| value as u64))
    }

    pub fn snapshot_count(&self) -> Result<u64> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM handoff_snapshot", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Deletes all but the newest `keep` snapshots. Returns the number removed.
    pub fn prune_snapshots(&mut self, keep: usize) -> Result<usize> {
        let keep = keep.max(1) as i64;
        let removed = self.conn.execute(
            r#"
            DELETE FROM handoff_snapshot
            WHERE sequence_number NOT IN (
              SELECT sequence_number FROM handoff_snapshot
              ORDER BY sequence_number DESC
              LIMIT ?1
            )
            "#,
            params![keep],
        )?;
        Ok(removed)
    }
}

impl HandoffStore for Db {
    fn save(&mut self, snapshot: &HandoffSnapshot) -> std::result::Result<u64, StoreError> {
        self.save_snapshot(snapshot).map_err(StoreError::from)
    }

    fn load_latest(&self) -> std::result::Result<Option<HandoffSnapshot>, StoreError> {
        self.latest_snapshot().map_err(StoreError::from)
    }

    fn latest_sequence(&self) -> std::result::Result<Option<u64>, StoreError> {
        Db::latest_sequence(self).map_err(StoreError::from)
    }

    fn prune(&mut self, keep: usize) -> std::result::Result<usize, StoreError> {
        self.prune_snapshots(keep).map_err(StoreError::from)
    }

    fn record_closed_window(
        &mut self,
        window: &RollingWindow,
    ) -> std::result::Result<(), StoreError> {
        self.record_closed_block(window)
            .map(|_| ())
            .map_err(StoreError::from)
    }
}

fn checksum(payload: &str) -> String {
    let digest = Sha256::digest(payload.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest.iter() {
        let _ = write!(&mut out, "{:02x}", byte);
    }
    out
}
