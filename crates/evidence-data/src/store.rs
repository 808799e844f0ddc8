//! SQLite record sink.
//!
//! Uses WAL mode and one transaction per run: records become visible
//! atomically when the run finishes, and an aborted run leaves nothing behind.

use eyre::{bail, eyre, Context, Result};
use rusqlite::Connection;

use crate::sink::{RecordSink, SinkSummary, StreamSpec, StreamSummary};

pub struct SqliteSink {
    conn: Connection,
    run_id: String,
    /// Opened streams in open order, with the next sequence number.
    counts: Vec<(&'static str, u64)>,
    finished: bool,
}

impl SqliteSink {
    /// Creates or opens a SQLite database with WAL mode enabled and starts
    /// the run transaction.
    ///
    /// # Errors
    /// Returns error if the database cannot be opened or migrations fail.
    pub fn new(path: &str, run_id: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .wrap_err_with(|| format!("failed to open SQLite database {path}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        run_migrations(&conn)?;

        let existing: i64 = conn.query_row(
            "SELECT COUNT(*) FROM streams WHERE run_id = ?",
            rusqlite::params![run_id],
            |row| row.get(0),
        )?;
        if existing > 0 {
            bail!("run {run_id} already exists in {path}");
        }

        conn.execute_batch("BEGIN")?;
        tracing::info!(path, run_id, "writing records to SQLite");
        Ok(Self {
            conn,
            run_id: run_id.to_string(),
            counts: Vec::new(),
            finished: false,
        })
    }
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS streams (
            run_id TEXT NOT NULL,
            name TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            description TEXT,
            when_empty TEXT,
            PRIMARY KEY (run_id, name)
        );

        CREATE TABLE IF NOT EXISTS records (
            run_id TEXT NOT NULL,
            stream TEXT NOT NULL,
            seq INTEGER NOT NULL,
            body TEXT NOT NULL,
            PRIMARY KEY (run_id, stream, seq)
        );
        ",
    )?;
    Ok(())
}

impl RecordSink for SqliteSink {
    fn open_stream(&mut self, spec: &StreamSpec) -> Result<()> {
        if self.counts.iter().any(|(name, _)| *name == spec.name) {
            return Ok(());
        }
        self.conn.execute(
            "INSERT INTO streams (run_id, name, ordinal, description, when_empty)
             VALUES (?, ?, ?, ?, ?)",
            rusqlite::params![
                self.run_id,
                spec.name,
                self.counts.len() as i64,
                spec.description,
                spec.when_empty.render()
            ],
        )?;
        self.counts.push((spec.name, 0));
        Ok(())
    }

    fn append(&mut self, stream: &str, json: &str) -> Result<()> {
        let (_, seq) = self
            .counts
            .iter_mut()
            .find(|(name, _)| *name == stream)
            .ok_or_else(|| eyre!("stream {stream} was not opened"))?;
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO records (run_id, stream, seq, body) VALUES (?, ?, ?, ?)",
        )?;
        stmt.execute(rusqlite::params![self.run_id, stream, *seq, json])?;
        *seq += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<SinkSummary> {
        if self.finished {
            bail!("sink already finished");
        }
        self.conn
            .execute_batch("COMMIT")
            .wrap_err("failed to commit run transaction")?;
        self.finished = true;

        Ok(SinkSummary {
            backend: self.backend_type(),
            streams: self
                .counts
                .iter()
                .map(|(name, records)| StreamSummary {
                    name: name.to_string(),
                    records: *records,
                    shards: Vec::new(),
                })
                .collect(),
        })
    }

    fn backend_type(&self) -> &'static str {
        "SQLite"
    }
}

/// Per-stream record counts of a finished run, in the order the streams
/// were opened.
///
/// # Errors
/// Returns error if the database cannot be opened or queried.
pub fn stream_counts(path: &str, run_id: &str) -> Result<Vec<(String, u64)>> {
    let conn = Connection::open(path)
        .wrap_err_with(|| format!("failed to open SQLite database {path}"))?;
    let mut stmt = conn.prepare(
        "
        SELECT s.name, COUNT(r.seq)
        FROM streams s
        LEFT JOIN records r ON r.run_id = s.run_id AND r.stream = s.name
        WHERE s.run_id = ?
        GROUP BY s.name, s.ordinal
        ORDER BY s.ordinal
        ",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![run_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
