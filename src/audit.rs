// =============================================================================
// Audit Log — append-only, hash-linked compliance records
// =============================================================================
//
// Every signal emission, configuration change, integrity check and executor
// decision lands here. Records chain exactly like signals: `record_hash`
// covers the record's own fields, `prev_record_hash` carries the previous
// record's hash, so any historical mutation is detectable. An UPDATE trigger
// enforces append-only at the store level; retention pruning is the single
// sanctioned deletion path.

use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::EngineError;

/// One compliance record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub record_id: String,
    /// Epoch milliseconds, UTC.
    pub occurred_at: i64,
    pub actor: String,
    pub action: String,
    pub resource: String,
    pub details_json: String,
    pub prev_record_hash: String,
    pub record_hash: String,
}

impl AuditRecord {
    fn canonical_json(&self) -> String {
        #[derive(Serialize)]
        struct Canonical<'a> {
            record_id: &'a str,
            occurred_at: i64,
            actor: &'a str,
            action: &'a str,
            resource: &'a str,
            details_json: &'a str,
        }
        serde_json::to_string(&Canonical {
            record_id: &self.record_id,
            occurred_at: self.occurred_at,
            actor: &self.actor,
            action: &self.action,
            resource: &self.resource,
            details_json: &self.details_json,
        })
        .expect("canonical audit record serialises")
    }

    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_json().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Chain verification summary.
#[derive(Debug, Clone, Serialize)]
pub struct AuditChainReport {
    pub checked: usize,
    pub ok: usize,
    pub mismatches: Vec<String>,
}

pub struct AuditLog {
    conn: Mutex<Connection>,
    /// Hash of the newest record; empty when the log is empty.
    tip: Mutex<String>,
}

impl AuditLog {
    /// Open (or create) the audit database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("failed to open audit db at {}", path.as_ref().display()))?;
        Self::init(conn)
    }

    /// In-memory log for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("in-memory audit db")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS audit_records (
                seq              INTEGER PRIMARY KEY AUTOINCREMENT,
                record_id        TEXT NOT NULL UNIQUE,
                occurred_at      INTEGER NOT NULL,
                actor            TEXT NOT NULL,
                action           TEXT NOT NULL,
                resource         TEXT NOT NULL,
                details_json     TEXT NOT NULL,
                prev_record_hash TEXT NOT NULL,
                record_hash      TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_occurred ON audit_records (occurred_at);
            CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_records (action, occurred_at);
            CREATE TRIGGER IF NOT EXISTS trg_audit_append_only
            BEFORE UPDATE ON audit_records
            BEGIN
                SELECT RAISE(ABORT, 'audit records are append-only');
            END;
            "#,
        )
        .context("failed to initialise audit schema")?;

        let tip: String = conn
            .query_row(
                "SELECT record_hash FROM audit_records ORDER BY seq DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .unwrap_or_default();

        Ok(Self {
            conn: Mutex::new(conn),
            tip: Mutex::new(tip),
        })
    }

    /// Append one record, chaining it to the current tip.
    pub fn append(
        &self,
        actor: &str,
        action: &str,
        resource: &str,
        details: serde_json::Value,
    ) -> Result<AuditRecord, EngineError> {
        let conn = self.conn.lock();
        let mut tip = self.tip.lock();

        let mut record = AuditRecord {
            record_id: uuid::Uuid::new_v4().to_string(),
            occurred_at: chrono::Utc::now().timestamp_millis(),
            actor: actor.to_string(),
            action: action.to_string(),
            resource: resource.to_string(),
            details_json: details.to_string(),
            prev_record_hash: tip.clone(),
            record_hash: String::new(),
        };
        record.record_hash = record.compute_hash();

        conn.execute(
            "INSERT INTO audit_records
             (record_id, occurred_at, actor, action, resource, details_json, prev_record_hash, record_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.record_id,
                record.occurred_at,
                record.actor,
                record.action,
                record.resource,
                record.details_json,
                record.prev_record_hash,
                record.record_hash,
            ],
        )
        .map_err(|e| EngineError::StoreTransient(format!("audit append failed: {e}")))?;

        *tip = record.record_hash.clone();
        debug!(action = %record.action, resource = %record.resource, "audit record appended");
        Ok(record)
    }

    /// Recompute every hash and verify the chain links.
    pub fn verify_chain(&self) -> Result<AuditChainReport, EngineError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT record_id, occurred_at, actor, action, resource, details_json,
                        prev_record_hash, record_hash
                 FROM audit_records ORDER BY seq ASC",
            )
            .map_err(|e| EngineError::StoreTransient(e.to_string()))?;

        let rows = stmt
            .query_map([], |row| {
                Ok(AuditRecord {
                    record_id: row.get(0)?,
                    occurred_at: row.get(1)?,
                    actor: row.get(2)?,
                    action: row.get(3)?,
                    resource: row.get(4)?,
                    details_json: row.get(5)?,
                    prev_record_hash: row.get(6)?,
                    record_hash: row.get(7)?,
                })
            })
            .map_err(|e| EngineError::StoreTransient(e.to_string()))?;

        let mut report = AuditChainReport {
            checked: 0,
            ok: 0,
            mismatches: Vec::new(),
        };
        let mut prev_hash = String::new();

        for row in rows {
            let record = row.map_err(|e| EngineError::StoreTransient(e.to_string()))?;
            report.checked += 1;

            let recomputed = record.compute_hash();
            if recomputed != record.record_hash || record.prev_record_hash != prev_hash {
                report.mismatches.push(record.record_id.clone());
            } else {
                report.ok += 1;
            }
            prev_hash = record.record_hash;
        }

        Ok(report)
    }

    /// Delete records older than the retention window. Returns the number of
    /// rows removed. The oldest surviving record keeps its link into the
    /// pruned region, so the remaining chain still verifies from that point.
    pub fn prune_expired(&self, retention_days: i64) -> Result<usize, EngineError> {
        let cutoff =
            chrono::Utc::now().timestamp_millis() - retention_days * 24 * 60 * 60 * 1000;
        let conn = self.conn.lock();
        let removed = conn
            .execute(
                "DELETE FROM audit_records WHERE occurred_at < ?1",
                params![cutoff],
            )
            .map_err(|e| EngineError::StoreTransient(e.to_string()))?;
        if removed > 0 {
            info!(removed, retention_days, "audit retention pruning complete");
        }
        Ok(removed)
    }

    pub fn count(&self) -> Result<usize, EngineError> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM audit_records", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|n| n as usize)
        .map_err(|e| EngineError::StoreTransient(e.to_string()))
    }

    /// Newest records first, bounded by `limit`.
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditRecord>, EngineError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT record_id, occurred_at, actor, action, resource, details_json,
                        prev_record_hash, record_hash
                 FROM audit_records ORDER BY seq DESC LIMIT ?1",
            )
            .map_err(|e| EngineError::StoreTransient(e.to_string()))?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(AuditRecord {
                    record_id: row.get(0)?,
                    occurred_at: row.get(1)?,
                    actor: row.get(2)?,
                    action: row.get(3)?,
                    resource: row.get(4)?,
                    details_json: row.get(5)?,
                    prev_record_hash: row.get(6)?,
                    record_hash: row.get(7)?,
                })
            })
            .map_err(|e| EngineError::StoreTransient(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| EngineError::StoreTransient(e.to_string()))
    }
}
