// =============================================================================
// Signal Store — batched, hash-chained, immutable persistence
// =============================================================================
//
// `append()` only enqueues into the in-memory pending batch and never touches
// I/O. A background flusher wakes every `flush_interval` or as soon as the
// batch reaches `batch_size`, and writes the whole batch in one transaction,
// assigning `prev_sha256` in stable arrival order (created_at, then signal_id
// lexically). On shutdown the generator calls `flush()` synchronously before
// the store closes.
//
// Immutability is enforced in the database itself: UPDATE triggers abort any
// change to the immutable columns, the outcome fields transition exactly once
// from NULL, and `order_id` is write-once. `verify_integrity` recomputes
// every digest and checks each chain link.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::signal::{Signal, SourceVerdict};
use crate::types::{Outcome, Symbol};

// =============================================================================
// Reports and query types
// =============================================================================

/// Output of `verify_integrity`. Any mismatch is a critical event.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub checked: usize,
    pub ok: usize,
    pub mismatches: Vec<IntegrityMismatch>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityMismatch {
    pub signal_id: String,
    pub expected_sha256: String,
    pub actual_sha256: String,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Bounded query filter for `query_recent`.
#[derive(Debug, Clone, Default)]
pub struct SignalFilter {
    pub symbol: Option<Symbol>,
    pub min_confidence: Option<f64>,
    /// Epoch milliseconds lower bound on created_at.
    pub since: Option<i64>,
}

/// One historical outcome row consumed by the quality scorer.
#[derive(Debug, Clone)]
pub struct OutcomeRow {
    pub confidence: f64,
    pub outcome: Outcome,
}

// =============================================================================
// SignalStore
// =============================================================================

pub struct SignalStore {
    conn: Mutex<Connection>,
    pending: Mutex<Vec<Signal>>,
    /// sha256 of the newest persisted signal; empty when the table is empty.
    tip: Mutex<String>,
    batch_size: usize,
    /// Signals that failed a retried flush land here as JSONL.
    sidecar_dir: PathBuf,
    /// Woken by `append` when the pending batch reaches `batch_size`.
    pub batch_full: Notify,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS signals (
    insertion_seq       INTEGER PRIMARY KEY AUTOINCREMENT,
    signal_id           TEXT NOT NULL UNIQUE,
    created_at          INTEGER NOT NULL,
    symbol              TEXT NOT NULL,
    action              TEXT NOT NULL,
    entry_price         REAL NOT NULL,
    stop_price          REAL NOT NULL,
    target_price        REAL NOT NULL,
    confidence          REAL NOT NULL,
    regime              TEXT NOT NULL,
    sources_used        TEXT NOT NULL,
    per_source_verdicts TEXT NOT NULL,
    rationale           TEXT NOT NULL,
    service_type        TEXT NOT NULL,
    sha256              TEXT NOT NULL,
    prev_sha256         TEXT NOT NULL,
    outcome             TEXT,
    exit_price          REAL,
    pnl_pct             REAL,
    exit_at             INTEGER,
    order_id            TEXT
);
CREATE INDEX IF NOT EXISTS idx_signals_created ON signals (created_at DESC);
CREATE INDEX IF NOT EXISTS idx_signals_symbol_created ON signals (symbol, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_signals_confidence ON signals (confidence DESC);
CREATE INDEX IF NOT EXISTS idx_signals_outcome ON signals (outcome, created_at);
CREATE INDEX IF NOT EXISTS idx_signals_symbol_conf ON signals (symbol, confidence DESC);

CREATE TRIGGER IF NOT EXISTS trg_signals_immutable
BEFORE UPDATE ON signals
WHEN NEW.signal_id IS NOT OLD.signal_id
  OR NEW.created_at IS NOT OLD.created_at
  OR NEW.symbol IS NOT OLD.symbol
  OR NEW.action IS NOT OLD.action
  OR NEW.entry_price IS NOT OLD.entry_price
  OR NEW.stop_price IS NOT OLD.stop_price
  OR NEW.target_price IS NOT OLD.target_price
  OR NEW.confidence IS NOT OLD.confidence
  OR NEW.regime IS NOT OLD.regime
  OR NEW.sources_used IS NOT OLD.sources_used
  OR NEW.per_source_verdicts IS NOT OLD.per_source_verdicts
  OR NEW.rationale IS NOT OLD.rationale
  OR NEW.service_type IS NOT OLD.service_type
  OR NEW.sha256 IS NOT OLD.sha256
  OR NEW.prev_sha256 IS NOT OLD.prev_sha256
BEGIN
    SELECT RAISE(ABORT, 'immutable signal fields cannot change');
END;

CREATE TRIGGER IF NOT EXISTS trg_signals_outcome_once
BEFORE UPDATE ON signals
WHEN OLD.outcome IS NOT NULL
 AND (NEW.outcome IS NOT OLD.outcome
   OR NEW.exit_price IS NOT OLD.exit_price
   OR NEW.pnl_pct IS NOT OLD.pnl_pct
   OR NEW.exit_at IS NOT OLD.exit_at)
BEGIN
    SELECT RAISE(ABORT, 'signal outcome is terminal');
END;

CREATE TRIGGER IF NOT EXISTS trg_signals_order_once
BEFORE UPDATE ON signals
WHEN OLD.order_id IS NOT NULL AND NEW.order_id IS NOT OLD.order_id
BEGIN
    SELECT RAISE(ABORT, 'order id is write-once');
END;
"#;

impl SignalStore {
    /// Open (or create) the store at `path` with WAL journaling.
    pub fn open(path: impl AsRef<Path>, batch_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open signal store at {}", path.display()))?;
        let sidecar_dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from("."));
        Self::init(conn, batch_size, sidecar_dir)
    }

    /// In-memory store for tests.
    pub fn open_in_memory(batch_size: usize) -> Result<Self> {
        Self::init(
            Connection::open_in_memory().context("in-memory signal store")?,
            batch_size,
            std::env::temp_dir(),
        )
    }

    fn init(conn: Connection, batch_size: usize, sidecar_dir: PathBuf) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.execute_batch(SCHEMA)
            .context("failed to initialise signal store schema")?;

        let tip: String = conn
            .query_row(
                "SELECT sha256 FROM signals ORDER BY insertion_seq DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read chain tip")?
            .unwrap_or_default();

        info!(batch_size, "signal store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            pending: Mutex::new(Vec::new()),
            tip: Mutex::new(tip),
            batch_size,
            sidecar_dir,
            batch_full: Notify::new(),
        })
    }

    // -------------------------------------------------------------------------
    // Pending batch
    // -------------------------------------------------------------------------

    /// Enqueue a signal. Never blocks on I/O; wakes the flusher when the
    /// batch is full.
    pub fn append(&self, signal: Signal) {
        let len = {
            let mut pending = self.pending.lock();
            pending.push(signal);
            pending.len()
        };
        if len >= self.batch_size {
            self.batch_full.notify_one();
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    // -------------------------------------------------------------------------
    // Flush
    // -------------------------------------------------------------------------

    /// Synchronously flush the pending batch in one transaction. Retries the
    /// transaction once; on a second failure the batch is written to a
    /// sidecar JSONL file and the error is surfaced as a critical event.
    ///
    /// Returns the number of signals committed.
    pub fn flush(&self) -> Result<usize, EngineError> {
        let mut batch: Vec<Signal> = {
            let mut pending = self.pending.lock();
            std::mem::take(&mut *pending)
        };
        if batch.is_empty() {
            return Ok(0);
        }

        // Stable insertion order: created_at, then signal_id lexically.
        batch.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.signal_id.cmp(&b.signal_id))
        });

        match self.try_commit(&batch) {
            Ok(count) => Ok(count),
            Err(first) => {
                warn!(error = %first, "batch flush failed, retrying once");
                match self.try_commit(&batch) {
                    Ok(count) => Ok(count),
                    Err(second) => {
                        error!(error = %second, count = batch.len(), "batch flush failed twice, writing sidecar");
                        self.write_sidecar(&batch)?;
                        Err(EngineError::StoreTransient(format!(
                            "flush failed twice, {} signals diverted to sidecar: {second}",
                            batch.len()
                        )))
                    }
                }
            }
        }
    }

    fn try_commit(&self, batch: &[Signal]) -> Result<usize, EngineError> {
        let mut conn = self.conn.lock();
        let mut tip = self.tip.lock();

        let tx = conn
            .transaction()
            .map_err(|e| EngineError::StoreTransient(e.to_string()))?;

        let mut chain = tip.clone();
        for signal in batch {
            tx.execute(
                "INSERT INTO signals
                 (signal_id, created_at, symbol, action, entry_price, stop_price, target_price,
                  confidence, regime, sources_used, per_source_verdicts, rationale, service_type,
                  sha256, prev_sha256)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    signal.signal_id,
                    signal.created_at,
                    signal.symbol.as_str(),
                    signal.action.to_string(),
                    signal.entry_price,
                    signal.stop_price,
                    signal.target_price,
                    signal.confidence,
                    signal.regime.to_string(),
                    serde_json::to_string(&signal.sources_used)
                        .map_err(|e| EngineError::StoreTransient(e.to_string()))?,
                    serde_json::to_string(&signal.per_source_verdicts)
                        .map_err(|e| EngineError::StoreTransient(e.to_string()))?,
                    signal.rationale,
                    signal.service_type,
                    signal.sha256,
                    chain,
                ],
            )
            .map_err(|e| EngineError::StoreTransient(e.to_string()))?;
            chain = signal.sha256.clone();
        }

        tx.commit()
            .map_err(|e| EngineError::StoreTransient(e.to_string()))?;

        *tip = chain;
        debug!(count = batch.len(), "batch committed");
        Ok(batch.len())
    }

    fn write_sidecar(&self, batch: &[Signal]) -> Result<(), EngineError> {
        let filename = format!(
            "signals_failed_{}.jsonl",
            chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f")
        );
        let path = self.sidecar_dir.join(filename);
        let mut lines = String::new();
        for signal in batch {
            let line = serde_json::to_string(signal)
                .map_err(|e| EngineError::StoreTransient(e.to_string()))?;
            lines.push_str(&line);
            lines.push('\n');
        }
        std::fs::write(&path, lines)
            .map_err(|e| EngineError::StoreTransient(format!("sidecar write failed: {e}")))?;
        error!(path = %path.display(), count = batch.len(), "signals diverted to sidecar file");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Bounded query over persisted signals, newest first.
    pub fn query_recent(
        &self,
        filter: &SignalFilter,
        limit: usize,
    ) -> Result<Vec<Signal>, EngineError> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT signal_id, created_at, symbol, action, entry_price, stop_price, target_price,
                    confidence, regime, sources_used, per_source_verdicts, rationale, service_type,
                    sha256, prev_sha256
             FROM signals WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(symbol) = &filter.symbol {
            sql.push_str(" AND symbol = ?");
            args.push(Box::new(symbol.as_str().to_string()));
        }
        if let Some(min_confidence) = filter.min_confidence {
            sql.push_str(" AND confidence >= ?");
            args.push(Box::new(min_confidence));
        }
        if let Some(since) = filter.since {
            sql.push_str(" AND created_at >= ?");
            args.push(Box::new(since));
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ?");
        args.push(Box::new(limit as i64));

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| EngineError::StoreTransient(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), row_to_signal)
            .map_err(|e| EngineError::StoreTransient(e.to_string()))?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| EngineError::StoreTransient(e.to_string()))
    }

    /// Labelled outcomes for a symbol over the trailing `days`, for the
    /// quality scorer.
    pub fn query_outcomes(&self, symbol: &Symbol, days: i64) -> Result<Vec<OutcomeRow>, EngineError> {
        let cutoff = chrono::Utc::now().timestamp_millis() - days * 24 * 60 * 60 * 1000;
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT confidence, outcome FROM signals
                 WHERE symbol = ?1 AND outcome IS NOT NULL AND created_at >= ?2",
            )
            .map_err(|e| EngineError::StoreTransient(e.to_string()))?;
        let rows = stmt
            .query_map(params![symbol.as_str(), cutoff], |row| {
                let confidence: f64 = row.get(0)?;
                let outcome: String = row.get(1)?;
                Ok((confidence, outcome))
            })
            .map_err(|e| EngineError::StoreTransient(e.to_string()))?;

        let mut outcomes = Vec::new();
        for row in rows {
            let (confidence, outcome) =
                row.map_err(|e| EngineError::StoreTransient(e.to_string()))?;
            let outcome = outcome
                .parse::<Outcome>()
                .map_err(EngineError::StoreIntegrity)?;
            outcomes.push(OutcomeRow {
                confidence,
                outcome,
            });
        }
        Ok(outcomes)
    }

    pub fn count(&self) -> Result<usize, EngineError> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM signals", [], |row| row.get::<_, i64>(0))
            .map(|n| n as usize)
            .map_err(|e| EngineError::StoreTransient(e.to_string()))
    }

    // -------------------------------------------------------------------------
    // Outcome / order updates (the only sanctioned mutations)
    // -------------------------------------------------------------------------

    /// Label a signal's outcome. The immutability triggers guarantee this
    /// transitions exactly once from NULL to a terminal value.
    pub fn record_outcome(
        &self,
        signal_id: &str,
        outcome: Outcome,
        exit_price: f64,
        pnl_pct: f64,
        exit_at: i64,
    ) -> Result<(), EngineError> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE signals SET outcome = ?2, exit_price = ?3, pnl_pct = ?4, exit_at = ?5
                 WHERE signal_id = ?1",
                params![signal_id, outcome.to_string(), exit_price, pnl_pct, exit_at],
            )
            .map_err(|e| EngineError::StoreTransient(e.to_string()))?;
        if changed == 0 {
            return Err(EngineError::StoreTransient(format!(
                "unknown signal {signal_id}"
            )));
        }
        Ok(())
    }

    /// Stamp the broker order id after a successful execution.
    pub fn record_order(&self, signal_id: &str, order_id: &str) -> Result<(), EngineError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE signals SET order_id = ?2 WHERE signal_id = ?1",
            params![signal_id, order_id],
        )
        .map_err(|e| EngineError::StoreTransient(e.to_string()))?;
        Ok(())
    }

    pub fn order_id_of(&self, signal_id: &str) -> Result<Option<String>, EngineError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT order_id FROM signals WHERE signal_id = ?1",
            params![signal_id],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()
        .map(|row| row.flatten())
        .map_err(|e| EngineError::StoreTransient(e.to_string()))
    }

    // -------------------------------------------------------------------------
    // Integrity
    // -------------------------------------------------------------------------

    /// Recompute every row's digest and verify the chain links. `range`
    /// bounds `created_at` (inclusive start, exclusive end); `None` scans the
    /// whole table in insertion order.
    pub fn verify_integrity(
        &self,
        range: Option<(i64, i64)>,
    ) -> Result<IntegrityReport, EngineError> {
        let conn = self.conn.lock();

        let (sql, args): (&str, Vec<i64>) = match range {
            Some((start, end)) => (
                "SELECT signal_id, created_at, symbol, action, entry_price, stop_price,
                        target_price, confidence, regime, sources_used, per_source_verdicts,
                        rationale, service_type, sha256, prev_sha256
                 FROM signals WHERE created_at >= ?1 AND created_at < ?2
                 ORDER BY insertion_seq ASC",
                vec![start, end],
            ),
            None => (
                "SELECT signal_id, created_at, symbol, action, entry_price, stop_price,
                        target_price, confidence, regime, sources_used, per_source_verdicts,
                        rationale, service_type, sha256, prev_sha256
                 FROM signals ORDER BY insertion_seq ASC",
                vec![],
            ),
        };

        let mut stmt = stmt_or_transient(&conn, sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args), row_to_signal)
            .map_err(|e| EngineError::StoreTransient(e.to_string()))?;

        let mut report = IntegrityReport {
            checked: 0,
            ok: 0,
            mismatches: Vec::new(),
        };
        let mut prev_sha: Option<String> = None;

        for row in rows {
            let signal = row.map_err(|e| EngineError::StoreTransient(e.to_string()))?;
            report.checked += 1;

            let recomputed = signal.compute_sha256();
            let digest_ok = recomputed == signal.sha256;
            // The first row in a bounded range legitimately links to a row
            // outside the range, so the link check only applies beyond it.
            let link_ok = match &prev_sha {
                Some(prev) => signal.prev_sha256 == *prev,
                None => range.is_some() || signal.prev_sha256.is_empty(),
            };

            if digest_ok && link_ok {
                report.ok += 1;
            } else {
                report.mismatches.push(IntegrityMismatch {
                    signal_id: signal.signal_id.clone(),
                    expected_sha256: signal.sha256.clone(),
                    actual_sha256: recomputed,
                });
            }
            prev_sha = Some(signal.sha256);
        }

        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Archive
    // -------------------------------------------------------------------------

    /// Move rows older than `cutoff_ms` into the sibling archive store,
    /// preserving the chain: the oldest surviving row keeps its
    /// `prev_sha256` pointing into the archive. Returns rows moved.
    pub fn archive_older_than(
        &self,
        cutoff_ms: i64,
        archive_path: impl AsRef<Path>,
    ) -> Result<usize, EngineError> {
        let archive_path = archive_path.as_ref().to_string_lossy().to_string();
        let conn = self.conn.lock();

        conn.execute("ATTACH DATABASE ?1 AS archive", params![archive_path])
            .map_err(|e| EngineError::StoreTransient(format!("attach archive: {e}")))?;

        let result = (|| -> Result<usize, EngineError> {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS archive.signals AS
                 SELECT * FROM main.signals WHERE 0",
            )
            .map_err(|e| EngineError::StoreTransient(format!("archive schema: {e}")))?;

            let moved = conn
                .execute(
                    "INSERT INTO archive.signals
                     SELECT * FROM main.signals WHERE created_at < ?1",
                    params![cutoff_ms],
                )
                .map_err(|e| EngineError::StoreTransient(format!("archive copy: {e}")))?;

            conn.execute(
                "DELETE FROM main.signals WHERE created_at < ?1",
                params![cutoff_ms],
            )
            .map_err(|e| EngineError::StoreTransient(format!("archive delete: {e}")))?;

            Ok(moved)
        })();

        conn.execute("DETACH DATABASE archive", [])
            .map_err(|e| EngineError::StoreTransient(format!("detach archive: {e}")))?;

        let moved = result?;
        if moved > 0 {
            info!(moved, "signals archived");
        }
        Ok(moved)
    }
}

fn stmt_or_transient<'a>(
    conn: &'a Connection,
    sql: &str,
) -> Result<rusqlite::Statement<'a>, EngineError> {
    conn.prepare(sql)
        .map_err(|e| EngineError::StoreTransient(e.to_string()))
}

fn row_to_signal(row: &rusqlite::Row<'_>) -> rusqlite::Result<Signal> {
    let action: String = row.get(3)?;
    let regime: String = row.get(8)?;
    let sources_used: String = row.get(9)?;
    let per_source_verdicts: String = row.get(10)?;

    Ok(Signal {
        signal_id: row.get(0)?,
        created_at: row.get(1)?,
        symbol: Symbol::new(row.get::<_, String>(2)?),
        action: action.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
        })?,
        entry_price: row.get(4)?,
        stop_price: row.get(5)?,
        target_price: row.get(6)?,
        confidence: row.get(7)?,
        regime: regime.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, e.into())
        })?,
        sources_used: serde_json::from_str(&sources_used).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, e.into())
        })?,
        per_source_verdicts: serde_json::from_str::<Vec<SourceVerdict>>(&per_source_verdicts)
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    10,
                    rusqlite::types::Type::Text,
                    e.into(),
                )
            })?,
        rationale: row.get(11)?,
        service_type: row.get(12)?,
        sha256: row.get(13)?,
        prev_sha256: row.get(14)?,
    })
}

// =============================================================================
// Background flusher
// =============================================================================

/// Run the flush loop until shutdown. Wakes on the interval or when `append`
/// reports a full batch; flushes run on the blocking pool.
pub async fn run_flusher(
    store: Arc<SignalStore>,
    flush_interval: Duration,
    metrics: Arc<crate::metrics::Metrics>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(flush_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = store.batch_full.notified() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }

        let started = std::time::Instant::now();
        let task_store = store.clone();
        let flushed = tokio::task::spawn_blocking(move || task_store.flush()).await;
        match flushed {
            Ok(Ok(0)) => {}
            Ok(Ok(count)) => {
                metrics.flush_duration.observe(started.elapsed().as_secs_f64());
                debug!(count, "flusher committed batch");
            }
            Ok(Err(e)) => {
                metrics.flush_failures.inc();
                error!(error = %e, "flusher error");
            }
            Err(e) => error!(error = %e, "flusher task panicked"),
        }
        metrics.pending_batch.set(store.pending_len() as i64);
    }
}
