//! Task persistence.
//!
//! The dispatcher only sees the [`TaskStore`] trait. [`SqliteTaskStore`] is the
//! production backend; [`MemoryTaskStore`] backs tests and embedded use.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use rusqlite::{ffi, types::Type, Connection, ErrorCode, OptionalExtension, Row};
use tracing::{debug, instrument};

use crate::db::{fmt_ts, init_db, parse_ts};
use crate::error::{Result, SchedulerError, StoreError};
use crate::types::{Frequency, Task, TaskParams, TaskStatus};

/// Persistence collaborator consumed by the dispatcher.
///
/// `save` must write the whole record in one atomic operation: a concurrent
/// reader sees either the old bookkeeping or the new, never a mix.
///
/// Leases are the cross-process in-flight marker. Whoever holds a task's
/// lease is the only writer of that task until it releases it or the lease
/// goes stale.
pub trait TaskStore: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<Task>>;
    fn find_by_type(&self, task_type: &str) -> Result<Option<Task>>;
    /// Active, non-manual tasks with `next_run_at <= now`, oldest first, ties by id.
    fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<Task>>;
    /// All tasks, ordered by creation.
    fn list(&self) -> Result<Vec<Task>>;
    fn insert(&self, task: &Task) -> Result<String>;
    fn save(&self, task: &Task) -> Result<()>;
    fn delete(&self, id: &str) -> Result<()>;
    /// Take the lease on `id` for `token`. `Ok(false)` while another holder's
    /// lease was taken at or after `stale_before`. `TaskNotFound` if no such task.
    fn acquire_lease(
        &self,
        id: &str,
        token: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool>;
    /// Drop the lease if `token` still holds it.
    fn release_lease(&self, id: &str, token: &str) -> Result<()>;
}

const TASK_COLUMNS: &str = "id, name, task_type, description, frequency, parameters, status,
     last_run_at, next_run_at, run_count, success_count, failure_count,
     result, last_error, created_at, updated_at";

/// SQLite-backed store. Wraps a single connection in a `Mutex`.
pub struct SqliteTaskStore {
    db: Mutex<Connection>,
}

impl SqliteTaskStore {
    /// Wrap `conn`, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| SchedulerError::Store(StoreError::LockPoisoned))
    }

    fn query_many(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Task>> {
        let db = self.conn()?;
        let mut stmt = db.prepare_cached(sql)?;
        let tasks = stmt
            .query_map(params, row_to_task)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    fn query_one(&self, sql: &str, params: impl rusqlite::Params) -> Result<Option<Task>> {
        let db = self.conn()?;
        let task = db.query_row(sql, params, row_to_task).optional()?;
        Ok(task)
    }
}

impl TaskStore for SqliteTaskStore {
    #[instrument(skip(self))]
    fn get(&self, id: &str) -> Result<Option<Task>> {
        self.query_one(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            [id],
        )
    }

    #[instrument(skip(self))]
    fn find_by_type(&self, task_type: &str) -> Result<Option<Task>> {
        self.query_one(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_type = ?1"),
            [task_type],
        )
    }

    #[instrument(skip_all, fields(now = %now))]
    fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let due = self.query_many(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE status = 'ACTIVE' AND frequency <> 'MANUAL'
                   AND next_run_at IS NOT NULL AND next_run_at <= ?1
                 ORDER BY next_run_at ASC, id ASC"
            ),
            [fmt_ts(now)],
        )?;
        debug!(count = due.len(), "due tasks fetched");
        Ok(due)
    }

    fn list(&self) -> Result<Vec<Task>> {
        self.query_many(
            &format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at, id"),
            [],
        )
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, task_type = %task.task_type))]
    fn insert(&self, task: &Task) -> Result<String> {
        task.validate()?;
        let params_json = encode_params(task)?;
        let db = self.conn()?;
        db.execute(
            &format!(
                "INSERT INTO tasks ({TASK_COLUMNS})
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)"
            ),
            rusqlite::params![
                task.id,
                task.name,
                task.task_type,
                task.description,
                task.frequency.as_str(),
                params_json,
                task.status.to_string(),
                task.last_run_at.map(fmt_ts),
                task.next_run_at.map(fmt_ts),
                task.run_count as i64,
                task.success_count as i64,
                task.failure_count as i64,
                task.result,
                task.last_error,
                fmt_ts(task.created_at),
                fmt_ts(task.updated_at),
            ],
        )
        .map_err(|e| map_constraint(e, task))?;
        debug!("task inserted");
        Ok(task.id.clone())
    }

    #[instrument(skip(self, task), fields(task_id = %task.id))]
    fn save(&self, task: &Task) -> Result<()> {
        task.validate()?;
        let params_json = encode_params(task)?;
        let db = self.conn()?;
        let n = db
            .execute(
                "UPDATE tasks SET
                    name = ?2, task_type = ?3, description = ?4, frequency = ?5,
                    parameters = ?6, status = ?7, last_run_at = ?8, next_run_at = ?9,
                    run_count = ?10, success_count = ?11, failure_count = ?12,
                    result = ?13, last_error = ?14, updated_at = ?15
                 WHERE id = ?1",
                rusqlite::params![
                    task.id,
                    task.name,
                    task.task_type,
                    task.description,
                    task.frequency.as_str(),
                    params_json,
                    task.status.to_string(),
                    task.last_run_at.map(fmt_ts),
                    task.next_run_at.map(fmt_ts),
                    task.run_count as i64,
                    task.success_count as i64,
                    task.failure_count as i64,
                    task.result,
                    task.last_error,
                    fmt_ts(task.updated_at),
                ],
            )
            .map_err(|e| map_constraint(e, task))?;
        if n == 0 {
            return Err(SchedulerError::TaskNotFound {
                id: task.id.clone(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    fn delete(&self, id: &str) -> Result<()> {
        let n = self.conn()?.execute("DELETE FROM tasks WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::TaskNotFound { id: id.to_string() });
        }
        debug!("task deleted");
        Ok(())
    }

    #[instrument(skip(self, token, now, stale_before))]
    fn acquire_lease(
        &self,
        id: &str,
        token: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let db = self.conn()?;
        let n = db.execute(
            "UPDATE tasks SET lease_token = ?2, leased_at = ?3
             WHERE id = ?1 AND (lease_token IS NULL OR leased_at < ?4)",
            rusqlite::params![id, token, fmt_ts(now), fmt_ts(stale_before)],
        )?;
        if n == 1 {
            return Ok(true);
        }
        let exists = db
            .query_row("SELECT 1 FROM tasks WHERE id = ?1", [id], |_| Ok(()))
            .optional()?
            .is_some();
        if exists {
            debug!("lease held elsewhere");
            Ok(false)
        } else {
            Err(SchedulerError::TaskNotFound { id: id.to_string() })
        }
    }

    fn release_lease(&self, id: &str, token: &str) -> Result<()> {
        self.conn()?.execute(
            "UPDATE tasks SET lease_token = NULL, leased_at = NULL
             WHERE id = ?1 AND lease_token = ?2",
            [id, token],
        )?;
        Ok(())
    }
}

fn encode_params(task: &Task) -> Result<String> {
    serde_json::to_string(&task.parameters).map_err(|e| {
        SchedulerError::Store(StoreError::CorruptRow {
            id: task.id.clone(),
            reason: format!("parameters: {e}"),
        })
    })
}

fn map_constraint(e: rusqlite::Error, task: &Task) -> SchedulerError {
    let duplicate = matches!(
        &e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == ErrorCode::ConstraintViolation
                && (err.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                    || err.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
    );
    if duplicate {
        SchedulerError::Store(StoreError::DuplicateKey(format!(
            "task type {} (id {})",
            task.task_type, task.id
        )))
    } else {
        e.into()
    }
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|s| parse_ts(&s).map_err(|e| conversion_error(idx, format!("{s}: {e}"))))
        .transpose()
}

fn required_ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_ts(&s).map_err(|e| conversion_error(idx, format!("{s}: {e}")))
}

fn count_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let n: i64 = row.get(idx)?;
    u64::try_from(n).map_err(|_| conversion_error(idx, format!("negative counter {n}")))
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let frequency: String = row.get(4)?;
    let frequency: Frequency = frequency
        .parse()
        .map_err(|e: SchedulerError| conversion_error(4, e.to_string()))?;
    let params: String = row.get(5)?;
    let parameters: TaskParams =
        serde_json::from_str(&params).map_err(|e| conversion_error(5, e.to_string()))?;
    let status: String = row.get(6)?;
    let status: TaskStatus = status
        .parse()
        .map_err(|e: SchedulerError| conversion_error(6, e.to_string()))?;

    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        task_type: row.get(2)?,
        description: row.get(3)?,
        frequency,
        parameters,
        status,
        last_run_at: ts_column(row, 7)?,
        next_run_at: ts_column(row, 8)?,
        run_count: count_column(row, 9)?,
        success_count: count_column(row, 10)?,
        failure_count: count_column(row, 11)?,
        result: row.get(12)?,
        last_error: row.get(13)?,
        created_at: required_ts_column(row, 14)?,
        updated_at: required_ts_column(row, 15)?,
    })
}

/// In-memory store. Each `save` swaps the whole record under the write lock.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<String, Task>>,
    /// task id -> (token, taken at). Always locked after `tasks`.
    leases: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Task>>> {
        self.tasks
            .read()
            .map_err(|_| SchedulerError::Store(StoreError::LockPoisoned))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Task>>> {
        self.tasks
            .write()
            .map_err(|_| SchedulerError::Store(StoreError::LockPoisoned))
    }

    fn leases(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, (String, DateTime<Utc>)>>> {
        self.leases
            .lock()
            .map_err(|_| SchedulerError::Store(StoreError::LockPoisoned))
    }
}

impl TaskStore for MemoryTaskStore {
    fn get(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.read()?.get(id).cloned())
    }

    fn find_by_type(&self, task_type: &str) -> Result<Option<Task>> {
        Ok(self
            .read()?
            .values()
            .find(|t| t.task_type == task_type)
            .cloned())
    }

    fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let mut due: Vec<Task> = self
            .read()?
            .values()
            .filter(|t| t.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at).then_with(|| a.id.cmp(&b.id)));
        Ok(due)
    }

    fn list(&self) -> Result<Vec<Task>> {
        let mut all: Vec<Task> = self.read()?.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }

    fn insert(&self, task: &Task) -> Result<String> {
        task.validate()?;
        let mut tasks = self.write()?;
        if tasks.contains_key(&task.id) || tasks.values().any(|t| t.task_type == task.task_type) {
            return Err(SchedulerError::Store(StoreError::DuplicateKey(format!(
                "task type {} (id {})",
                task.task_type, task.id
            ))));
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(task.id.clone())
    }

    fn save(&self, task: &Task) -> Result<()> {
        task.validate()?;
        let mut tasks = self.write()?;
        match tasks.get_mut(&task.id) {
            Some(slot) => {
                *slot = task.clone();
                Ok(())
            }
            None => Err(SchedulerError::TaskNotFound {
                id: task.id.clone(),
            }),
        }
    }

    fn delete(&self, id: &str) -> Result<()> {
        let mut tasks = self.write()?;
        tasks
            .remove(id)
            .ok_or_else(|| SchedulerError::TaskNotFound { id: id.to_string() })?;
        self.leases()?.remove(id);
        Ok(())
    }

    fn acquire_lease(
        &self,
        id: &str,
        token: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let tasks = self.read()?;
        if !tasks.contains_key(id) {
            return Err(SchedulerError::TaskNotFound { id: id.to_string() });
        }
        let mut leases = self.leases()?;
        match leases.get(id) {
            Some((_, taken_at)) if *taken_at >= stale_before => Ok(false),
            _ => {
                leases.insert(id.to_string(), (token.to_string(), now));
                Ok(true)
            }
        }
    }

    fn release_lease(&self, id: &str, token: &str) -> Result<()> {
        let mut leases = self.leases()?;
        if leases.get(id).is_some_and(|(held, _)| held == token) {
            leases.remove(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewTask;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn task(task_type: &str, frequency: Frequency, next: Option<DateTime<Utc>>) -> Task {
        let spec = NewTask::new(task_type, task_type, frequency)
            .parameters(TaskParams::new().with("retention_days", 30i64));
        Task::new(spec, next, now())
    }

    fn stores() -> Vec<(&'static str, Box<dyn TaskStore>)> {
        vec![
            ("sqlite", Box::new(SqliteTaskStore::open_in_memory().unwrap())),
            ("memory", Box::new(MemoryTaskStore::new())),
        ]
    }

    #[test]
    fn insert_get_round_trip() {
        for (name, store) in stores() {
            let t = task("A", Frequency::Daily, Some(now()));
            store.insert(&t).unwrap();
            let back = store.get(&t.id).unwrap().expect(name);
            assert_eq!(back, t, "{name}");
            assert_eq!(store.find_by_type("A").unwrap().map(|t| t.id), Some(t.id.clone()));
            assert!(store.find_by_type("B").unwrap().is_none(), "{name}");
        }
    }

    #[test]
    fn duplicate_type_rejected() {
        for (name, store) in stores() {
            store.insert(&task("A", Frequency::Daily, Some(now()))).unwrap();
            let err = store
                .insert(&task("A", Frequency::Weekly, Some(now())))
                .unwrap_err();
            assert!(
                matches!(err, SchedulerError::Store(StoreError::DuplicateKey(_))),
                "{name}: {err}"
            );
        }
    }

    #[test]
    fn find_due_filters_and_orders() {
        for (name, store) in stores() {
            let t0 = now();
            let late = task("LATE", Frequency::Daily, Some(t0 - Duration::hours(1)));
            let early = task("EARLY", Frequency::Daily, Some(t0 - Duration::hours(5)));
            let exact = task("EXACT", Frequency::Weekly, Some(t0));
            let future = task("FUTURE", Frequency::Daily, Some(t0 + Duration::seconds(1)));
            let manual = task("MANUAL_ONE", Frequency::Manual, None);
            let mut inactive = task("OFF", Frequency::Daily, Some(t0 - Duration::days(3)));
            inactive.status = TaskStatus::Inactive;

            for t in [&late, &early, &exact, &future, &manual, &inactive] {
                store.insert(t).unwrap();
            }

            let due: Vec<String> = store
                .find_due(t0)
                .unwrap()
                .into_iter()
                .map(|t| t.task_type)
                .collect();
            assert_eq!(due, vec!["EARLY", "LATE", "EXACT"], "{name}");
        }
    }

    #[test]
    fn find_due_breaks_ties_by_id() {
        for (name, store) in stores() {
            let at = now() - Duration::minutes(10);
            let mut a = task("A", Frequency::Daily, Some(at));
            let mut b = task("B", Frequency::Daily, Some(at));
            a.id = "0002".into();
            b.id = "0001".into();
            store.insert(&a).unwrap();
            store.insert(&b).unwrap();
            let ids: Vec<String> = store.find_due(now()).unwrap().into_iter().map(|t| t.id).collect();
            assert_eq!(ids, vec!["0001", "0002"], "{name}");
        }
    }

    #[test]
    fn save_replaces_bookkeeping() {
        for (name, store) in stores() {
            let mut t = task("A", Frequency::Daily, Some(now()));
            store.insert(&t).unwrap();
            t.run_count = 1;
            t.failure_count = 1;
            t.last_error = Some("boom".into());
            t.last_run_at = Some(now());
            t.next_run_at = Some(now() + Duration::days(1));
            store.save(&t).unwrap();
            assert_eq!(store.get(&t.id).unwrap().unwrap(), t, "{name}");
        }
    }

    #[test]
    fn save_rejects_unbalanced_counters() {
        for (name, store) in stores() {
            let mut t = task("A", Frequency::Daily, Some(now()));
            store.insert(&t).unwrap();
            t.run_count = 1;
            assert!(store.save(&t).is_err(), "{name}");
            assert_eq!(store.get(&t.id).unwrap().unwrap().run_count, 0, "{name}");
        }
    }

    #[test]
    fn save_and_delete_unknown_id() {
        for (name, store) in stores() {
            let t = task("A", Frequency::Daily, Some(now()));
            assert!(
                matches!(store.save(&t), Err(SchedulerError::TaskNotFound { .. })),
                "{name}"
            );
            assert!(
                matches!(store.delete("nope"), Err(SchedulerError::TaskNotFound { .. })),
                "{name}"
            );
        }
    }

    #[test]
    fn lease_is_exclusive_until_released_or_stale() {
        for (name, store) in stores() {
            let t = task("A", Frequency::Daily, Some(now()));
            store.insert(&t).unwrap();
            let hour_ago = now() - Duration::hours(1);

            assert!(store.acquire_lease(&t.id, "first", now(), hour_ago).unwrap(), "{name}");
            assert!(!store.acquire_lease(&t.id, "second", now(), hour_ago).unwrap(), "{name}");

            // Releasing with the wrong token leaves the holder in place.
            store.release_lease(&t.id, "second").unwrap();
            assert!(!store.acquire_lease(&t.id, "second", now(), hour_ago).unwrap(), "{name}");

            store.release_lease(&t.id, "first").unwrap();
            assert!(store.acquire_lease(&t.id, "second", now(), hour_ago).unwrap(), "{name}");

            // Two hours on, the lease taken at now() is stale and can be taken over.
            let later = now() + Duration::hours(2);
            assert!(
                store.acquire_lease(&t.id, "third", later, later - Duration::hours(1)).unwrap(),
                "{name}"
            );
            store.release_lease(&t.id, "second").unwrap();
            assert!(!store.acquire_lease(&t.id, "fourth", later, later - Duration::hours(1)).unwrap(), "{name}");
        }
    }

    #[test]
    fn lease_on_unknown_task() {
        for (name, store) in stores() {
            let err = store.acquire_lease("nope", "t", now(), now()).unwrap_err();
            assert!(matches!(err, SchedulerError::TaskNotFound { .. }), "{name}");
        }
    }

    #[test]
    fn sqlite_lease_is_visible_across_connections() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tasks.db");
        let a = SqliteTaskStore::new(Connection::open(&path).unwrap()).unwrap();
        let b = SqliteTaskStore::new(Connection::open(&path).unwrap()).unwrap();
        let t = task("A", Frequency::Daily, Some(now()));
        a.insert(&t).unwrap();

        let hour_ago = now() - Duration::hours(1);
        assert!(a.acquire_lease(&t.id, "a", now(), hour_ago).unwrap());
        assert!(!b.acquire_lease(&t.id, "b", now(), hour_ago).unwrap());
        a.release_lease(&t.id, "a").unwrap();
        assert!(b.acquire_lease(&t.id, "b", now(), hour_ago).unwrap());
    }

    #[test]
    fn sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tasks.db");
        let t = task("A", Frequency::Monthly, Some(now()));
        {
            let store = SqliteTaskStore::new(Connection::open(&path).unwrap()).unwrap();
            store.insert(&t).unwrap();
        }
        let store = SqliteTaskStore::new(Connection::open(&path).unwrap()).unwrap();
        assert_eq!(store.list().unwrap(), vec![t]);
    }

    #[test]
    fn corrupt_frequency_is_reported() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let t = task("A", Frequency::Daily, Some(now()));
        store.insert(&t).unwrap();
        store
            .conn()
            .unwrap()
            .execute("UPDATE tasks SET frequency = 'SOMETIMES'", [])
            .unwrap();
        assert!(store.get(&t.id).is_err());
    }
}
