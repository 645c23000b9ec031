use crate::bus::{Event, EventBus, EventKind};
use crate::claims::is_constraint_violation;
use crate::db::Db;
use crate::error::{KilnError, Result};
use crate::identifiers::{force_identifier, increment_identifier};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};

/// Maximum slug length, shared by canonicalization and collision handling.
const SLUG_MAX_LEN: usize = 50;

/// A log row as exposed through the data layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogData {
    pub logid: i64,
    pub name: String,
    pub slug: String,
    pub stepid: i64,
    pub complete: bool,
    pub num_lines: i64,
    #[serde(rename = "type")]
    pub log_type: String,
}

impl LogData {
    /// Every topic alias this log is addressable under for event dispatch.
    pub fn event_topics(&self) -> Vec<String> {
        vec![
            format!("/logs/{}", self.logid),
            format!("/steps/{}/logs/{}", self.stepid, self.slug),
        ]
    }
}

/// Append-only, slug-unique, completion-gated log persistence.
///
/// Slug uniqueness within the parent step is enforced by the store's
/// unique index, so collisions between racing masters resolve the same
/// way as collisions within one process.
#[derive(Debug, Clone)]
pub struct LogStore {
    db: Db,
    bus: EventBus,
}

impl LogStore {
    pub fn new(db: Db, bus: EventBus) -> Self {
        Self { db, bus }
    }

    /// Create a new log under `step_id`, deriving a slug from `name` and
    /// resolving collisions by incrementing a trailing suffix.
    pub fn add_log(&self, step_id: i64, name: &str, log_type: &str) -> Result<i64> {
        let conn = self.db.conn()?;
        let mut slug = force_identifier(SLUG_MAX_LEN, name);
        // Intentionally unbounded: under sustained collisions this keeps
        // retrying until an insert lands, matching the upstream contract.
        loop {
            let inserted = conn.execute(
                "INSERT INTO logs (name, slug, step_id, complete, num_lines, type)
                 VALUES (?1, ?2, ?3, 0, 0, ?4)",
                params![name, slug, step_id, log_type],
            );
            match inserted {
                Ok(_) => {
                    let log_id = conn.last_insert_rowid();
                    drop(conn);
                    self.publish_log_event(log_id, EventKind::New)?;
                    return Ok(log_id);
                }
                Err(e) if is_constraint_violation(&e) => {
                    slug = increment_identifier(SLUG_MAX_LEN, &slug);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Append `content` (one or more newline-separated lines) to the log.
    ///
    /// Returns the `(first_line, last_line)` range of the new chunk, or
    /// `None` when the log does not exist or the content carries no lines.
    /// Appending to a finished log fails with `AlreadyComplete`.
    pub fn append_log(&self, log_id: i64, content: &str) -> Result<Option<(i64, i64)>> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;

        let row: Option<(bool, i64)> = tx
            .query_row(
                "SELECT complete, num_lines FROM logs WHERE id = ?1",
                params![log_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((complete, num_lines)) = row else {
            return Ok(None);
        };
        if complete {
            return Err(KilnError::AlreadyComplete(log_id));
        }

        let lines = split_lines(content);
        if lines.is_empty() {
            return Ok(None);
        }

        let first_line = num_lines;
        let last_line = num_lines + lines.len() as i64 - 1;
        tx.execute(
            "INSERT INTO logchunks (log_id, first_line, last_line, content, compressed)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![log_id, first_line, last_line, lines.join("\n").into_bytes()],
        )?;
        tx.execute(
            "UPDATE logs SET num_lines = ?1 WHERE id = ?2",
            params![last_line + 1, log_id],
        )?;
        tx.commit()?;

        self.publish_log_event(log_id, EventKind::Append)?;
        Ok(Some((first_line, last_line)))
    }

    /// Mark the log complete. Re-finishing an already-complete log is a
    /// no-op, not an error; `num_lines` is frozen from here on.
    pub fn finish_log(&self, log_id: i64) -> Result<()> {
        let conn = self.db.conn()?;
        let affected = conn.execute(
            "UPDATE logs SET complete = 1 WHERE id = ?1",
            params![log_id],
        )?;
        drop(conn);
        if affected > 0 {
            self.publish_log_event(log_id, EventKind::Finished)?;
        }
        Ok(())
    }

    /// Rewrite the log's stored chunks as gzip in the background.
    ///
    /// Best-effort: failures are logged and never surfaced to the write
    /// path. Logical line content and `num_lines` are preserved exactly.
    pub fn compress_log(&self, log_id: i64) -> tokio::task::JoinHandle<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = compress_chunks(&db, log_id) {
                tracing::warn!("compressing log {} failed: {}", log_id, e);
            }
        })
    }

    pub fn get_log(&self, log_id: i64) -> Result<Option<LogData>> {
        let conn = self.db.conn()?;
        let data = conn
            .query_row(
                "SELECT id, name, slug, step_id, complete, num_lines, type
                 FROM logs WHERE id = ?1",
                params![log_id],
                row_to_log,
            )
            .optional()?;
        Ok(data)
    }

    pub fn get_log_by_slug(&self, step_id: i64, slug: &str) -> Result<Option<LogData>> {
        let conn = self.db.conn()?;
        let data = conn
            .query_row(
                "SELECT id, name, slug, step_id, complete, num_lines, type
                 FROM logs WHERE step_id = ?1 AND slug = ?2",
                params![step_id, slug],
                row_to_log,
            )
            .optional()?;
        Ok(data)
    }

    pub fn get_logs(&self, step_id: i64) -> Result<Vec<LogData>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, slug, step_id, complete, num_lines, type
             FROM logs WHERE step_id = ?1",
        )?;
        let rows = stmt.query_map(params![step_id], row_to_log)?;

        let mut logs = Vec::new();
        for row in rows {
            logs.push(row?);
        }
        Ok(logs)
    }

    /// Read lines `[first_line, last_line]` of a log, decompressing chunks
    /// transparently. Lines outside the stored range are simply absent.
    pub fn get_log_lines(&self, log_id: i64, first_line: i64, last_line: i64) -> Result<Vec<String>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(
            "SELECT first_line, content, compressed FROM logchunks
             WHERE log_id = ?1 AND last_line >= ?2 AND first_line <= ?3
             ORDER BY first_line",
        )?;
        let rows = stmt.query_map(params![log_id, first_line, last_line], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, bool>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (chunk_first, content, compressed) = row?;
            let content = if compressed {
                gunzip(&content)?
            } else {
                content
            };
            let text = String::from_utf8(content)
                .map_err(|e| KilnError::Internal(format!("log {} chunk is not utf-8: {}", log_id, e)))?;
            for (offset, line) in text.split('\n').enumerate() {
                let line_no = chunk_first + offset as i64;
                if line_no >= first_line && line_no <= last_line {
                    out.push(line.to_string());
                }
            }
        }
        Ok(out)
    }

    /// Fetch the committed snapshot and publish it under every topic alias.
    fn publish_log_event(&self, log_id: i64, kind: EventKind) -> Result<()> {
        let Some(data) = self.get_log(log_id)? else {
            return Ok(());
        };
        self.bus.publish(Event {
            topics: data.event_topics(),
            kind,
            snapshot: serde_json::to_value(&data)?,
        });
        Ok(())
    }
}

fn row_to_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogData> {
    Ok(LogData {
        logid: row.get(0)?,
        name: row.get(1)?,
        slug: row.get(2)?,
        stepid: row.get(3)?,
        complete: row.get(4)?,
        num_lines: row.get(5)?,
        log_type: row.get(6)?,
    })
}

/// Split chunk content into lines, dropping the trailing empty segment a
/// final newline produces.
fn split_lines(content: &str) -> Vec<&str> {
    let trimmed = content.strip_suffix('\n').unwrap_or(content);
    if trimmed.is_empty() {
        return Vec::new();
    }
    trimmed.split('\n').collect()
}

fn compress_chunks(db: &Db, log_id: i64) -> Result<()> {
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    let conn = db.conn()?;
    let mut stmt = conn.prepare(
        "SELECT rowid, content FROM logchunks WHERE log_id = ?1 AND compressed = 0",
    )?;
    let rows = stmt.query_map(params![log_id], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
    })?;

    let mut pending = Vec::new();
    for row in rows {
        pending.push(row?);
    }
    drop(stmt);

    let total = pending.len();
    for (rowid, content) in pending {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&content)?;
        let compressed = encoder.finish()?;
        conn.execute(
            "UPDATE logchunks SET content = ?1, compressed = 1 WHERE rowid = ?2",
            params![compressed, rowid],
        )?;
    }
    if total > 0 {
        tracing::debug!("compressed {} chunk(s) for log {}", total, log_id);
    }
    Ok(())
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::read::GzDecoder;
    use std::io::Read;

    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
