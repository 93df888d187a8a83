//! SQLite tables the built-in tasks act on: properties, their leases, and the
//! operator audit log.

use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use propdesk_scheduler::handlers::{AuditLog, HandlerError, PropertyLedger, StatusRecompute};
use rusqlite::Connection;
use tracing::debug;

pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS properties (
            id          TEXT NOT NULL PRIMARY KEY,
            name        TEXT NOT NULL,
            status      TEXT NOT NULL DEFAULT 'vacant',   -- vacant | occupied
            updated_at  TEXT
        ) STRICT;

        CREATE TABLE IF NOT EXISTS leases (
            id          TEXT NOT NULL PRIMARY KEY,
            property_id TEXT NOT NULL REFERENCES properties (id) ON DELETE CASCADE,
            starts_on   TEXT NOT NULL,   -- YYYY-MM-DD
            ends_on     TEXT             -- YYYY-MM-DD, NULL = open-ended
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_leases_property ON leases (property_id);

        CREATE TABLE IF NOT EXISTS audit_log (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            action      TEXT NOT NULL,
            created_at  TEXT NOT NULL    -- RFC 3339 UTC
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_audit_log_created ON audit_log (created_at);
        ",
    )
}

/// Property ledger and audit log over one connection.
pub struct BackOffice {
    db: Mutex<Connection>,
}

impl BackOffice {
    pub fn new(conn: Connection) -> rusqlite::Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, HandlerError> {
        self.db
            .lock()
            .map_err(|_| HandlerError::failed("back-office database lock poisoned"))
    }

    /// Append an operator action to the audit log.
    pub fn record(&self, action: &str, at: DateTime<Utc>) -> Result<(), HandlerError> {
        self.lock()?
            .execute(
                "INSERT INTO audit_log (action, created_at) VALUES (?1, ?2)",
                rusqlite::params![action, fmt_ts(at)],
            )
            .map_err(db_failure("audit log write"))?;
        Ok(())
    }
}

const OCCUPIED_AS_OF: &str = "CASE WHEN EXISTS (
        SELECT 1 FROM leases l
        WHERE l.property_id = properties.id
          AND l.starts_on <= ?1
          AND (l.ends_on IS NULL OR l.ends_on >= ?1)
    ) THEN 'occupied' ELSE 'vacant' END";

impl PropertyLedger for BackOffice {
    fn recompute_statuses(&self, as_of: DateTime<Utc>) -> Result<StatusRecompute, HandlerError> {
        let day = as_of.date_naive().format("%Y-%m-%d").to_string();
        let mut db = self.lock()?;
        let tx = db.transaction().map_err(db_failure("begin"))?;

        let examined: i64 = tx
            .query_row("SELECT COUNT(*) FROM properties", [], |r| r.get(0))
            .map_err(db_failure("count properties"))?;
        let changed = tx
            .execute(
                &format!(
                    "UPDATE properties SET status = {OCCUPIED_AS_OF}, updated_at = ?2
                     WHERE status IS NOT {OCCUPIED_AS_OF}"
                ),
                rusqlite::params![day, fmt_ts(as_of)],
            )
            .map_err(db_failure("update statuses"))?;
        tx.commit().map_err(db_failure("commit"))?;

        debug!(%day, examined, changed, "property statuses recomputed");
        Ok(StatusRecompute {
            examined: examined.max(0) as u64,
            changed: changed as u64,
        })
    }
}

impl AuditLog for BackOffice {
    fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, HandlerError> {
        let removed = self
            .lock()?
            .execute(
                "DELETE FROM audit_log WHERE created_at < ?1",
                [fmt_ts(cutoff)],
            )
            .map_err(db_failure("audit log prune"))?;
        Ok(removed as u64)
    }
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn db_failure(what: &'static str) -> impl Fn(rusqlite::Error) -> HandlerError {
    move |e| HandlerError::failed(format!("{what}: {e}"))
}
