use budget_core::{RollingWindow, TokenUsage, WindowKind};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Row, params};

use crate::Db;
use crate::error::{DbError, Result};

/// A ShortBlock that has closed, as kept in history.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedBlock {
    pub anchor: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub totals: TokenUsage,
    pub event_count: u64,
    pub window: RollingWindow,
}

impl Db {
    /// Stores a closed ShortBlock. Returns false for windows that are not closed blocks.
    ///
    /// Re-recording the same anchor replaces the row, which happens when sources are
    /// re-read after a discarded snapshot.
    pub fn record_closed_block(&mut self, window: &RollingWindow) -> Result<bool> {
        if window.kind != WindowKind::ShortBlock {
            return Ok(false);
        }
        let Some(anchor) = window.anchor else {
            return Ok(false);
        };
        let window_end = anchor + window.length();
        let payload = serde_json::to_string(window)?;
        self.conn.execute(
            r#"
            INSERT INTO closed_block (
              anchor, window_end, input_tokens, output_tokens, cache_read_tokens,
              cache_creation_tokens, event_count, payload_json, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(anchor) DO UPDATE SET
              window_end = excluded.window_end,
              input_tokens = excluded.input_tokens,
              output_tokens = excluded.output_tokens,
              cache_read_tokens = excluded.cache_read_tokens,
              cache_creation_tokens = excluded.cache_creation_tokens,
              event_count = excluded.event_count,
              payload_json = excluded.payload_json,
              recorded_at = excluded.recorded_at
            "#,
            params![
                format_ts(anchor),
                format_ts(window_end),
                window.totals.input_tokens as i64,
                window.totals.output_tokens as i64,
                window.totals.cache_read_tokens as i64,
                window.totals.cache_creation_tokens as i64,
                window.event_count as i64,
                payload,
                format_ts(Utc::now()),
            ],
        )?;
        Ok(true)
    }

    /// Closed blocks, newest first. A `limit` of 0 returns all of them.
    pub fn list_closed_blocks(&self, limit: usize) -> Result<Vec<ClosedBlock>> {
        let limit = if limit == 0 { -1 } else { limit as i64 };
        let mut stmt = self.conn.prepare(
            r#"
            SELECT anchor, window_end, input_tokens, output_tokens, cache_read_tokens,
                   cache_creation_tokens, event_count, payload_json
            FROM closed_block
            ORDER BY anchor DESC
            LIMIT ?1
            "#,
        )?;
        let mut rows = stmt.query(params![limit])?;
        let mut blocks = Vec::new();
        while let Some(row) = rows.next()? {
            blocks.push(row_to_closed_block(row)?);
        }
        Ok(blocks)
    }
}

fn row_to_closed_block(row: &Row<'_>) -> Result<ClosedBlock> {
    let anchor = parse_ts(&row.get::<_, String>(0)?)?;
    let window_end = parse_ts(&row.get::<_, String>(1)?)?;
    let payload = row.get::<_, String>(7)?;
    let window: RollingWindow = serde_json::from_str(&payload)
        .map_err(|err| DbError::Corrupt(format!("closed block {anchor}: {err}")))?;
    Ok(ClosedBlock {
        anchor,
        window_end,
        totals: TokenUsage {
            input_tokens: row.get::<_, i64>(2)? as u64,
            output_tokens: row.get::<_, i64>(3)? as u64,
            cache_read_tokens: row.get::<_, i64>(4)? as u64,
            cache_creation_tokens: row.get::<_, i64>(5)? as u64,
        },
        event_count: row.get::<_, i64>(6)? as u64,
        window,
    })
}

fn format_ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}
