use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `tasks` table (idempotent) and an index on `next_run_at` so the
/// due-task query stays cheap.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            id            TEXT    NOT NULL PRIMARY KEY,
            name          TEXT    NOT NULL,
            task_type     TEXT    NOT NULL UNIQUE,
            description   TEXT    NOT NULL DEFAULT '',
            frequency     TEXT    NOT NULL,   -- MANUAL | HOURLY | DAILY | ...
            parameters    TEXT    NOT NULL DEFAULT '{}',  -- JSON object
            status        TEXT    NOT NULL DEFAULT 'ACTIVE',
            last_run_at   TEXT,               -- RFC 3339 or NULL
            next_run_at   TEXT,               -- RFC 3339, NULL only for MANUAL
            run_count     INTEGER NOT NULL DEFAULT 0,
            success_count INTEGER NOT NULL DEFAULT 0,
            failure_count INTEGER NOT NULL DEFAULT 0,
            result        TEXT,
            last_error    TEXT,
            created_at    TEXT    NOT NULL,
            updated_at    TEXT    NOT NULL,
            lease_token   TEXT,               -- set while an execution is in flight
            leased_at     TEXT,
            CHECK (task_type <> ''),
            CHECK (run_count = success_count + failure_count)
        ) STRICT;

        -- Due query: WHERE status = 'ACTIVE' AND next_run_at <= ? ORDER BY next_run_at, id
        CREATE INDEX IF NOT EXISTS idx_tasks_next_run ON tasks (next_run_at, id);
        ",
    )?;
    Ok(())
}

/// Fixed-width UTC encoding so lexical order in SQLite equals time order.
///
/// Only holds for years 0000 through 9999; `Task::validate` keeps stored
/// timestamps inside that range.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}
