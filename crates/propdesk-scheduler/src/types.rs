use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SchedulerError;

/// Last year whose RFC 3339 text is still four digits wide. Stored timestamps
/// past it would break the lexical ordering the SQLite due query relies on.
pub const MAX_YEAR: i32 = 9999;

pub(crate) fn in_storable_range(ts: DateTime<Utc>) -> bool {
    (0..=MAX_YEAR).contains(&ts.year())
}

/// Cadence at which a task is automatically re-scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frequency {
    /// Never selected by a sweep; runs only on explicit invocation.
    Manual,
    Hourly,
    Daily,
    Weekly,
    /// One calendar month, clamped to the last valid day.
    Monthly,
    /// Twelve calendar months, clamped like `Monthly`.
    Yearly,
}

impl Frequency {
    pub const ALL: [Frequency; 6] = [
        Frequency::Manual,
        Frequency::Hourly,
        Frequency::Daily,
        Frequency::Weekly,
        Frequency::Monthly,
        Frequency::Yearly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Manual => "MANUAL",
            Frequency::Hourly => "HOURLY",
            Frequency::Daily => "DAILY",
            Frequency::Weekly => "WEEKLY",
            Frequency::Monthly => "MONTHLY",
            Frequency::Yearly => "YEARLY",
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, Frequency::Manual)
    }
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Frequency {
    type Err = SchedulerError;

    /// Labels are matched case-insensitively; anything outside the closed
    /// set is a configuration error.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Frequency::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SchedulerError::Configuration(format!("unknown frequency: {s}")))
    }
}

/// Whether a task takes part in automatic sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Active,
    /// Skipped by sweeps but still runnable by hand.
    Inactive,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Active => "ACTIVE",
            TaskStatus::Inactive => "INACTIVE",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(TaskStatus::Active),
            "INACTIVE" => Ok(TaskStatus::Inactive),
            other => Err(SchedulerError::Configuration(format!(
                "unknown task status: {other}"
            ))),
        }
    }
}

/// A single loosely-typed task parameter.
///
/// Untagged so the stored JSON stays a plain object: `{"retention_days": 90}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn kind(&self) -> &'static str {
        match self {
            ParamValue::Null => "null",
            ParamValue::Bool(_) => "boolean",
            ParamValue::Int(_) => "integer",
            ParamValue::Float(_) => "number",
            ParamValue::Text(_) => "string",
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Text(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::Text(s)
    }
}

impl From<i64> for ParamValue {
    fn from(n: i64) -> Self {
        ParamValue::Int(n)
    }
}

impl From<f64> for ParamValue {
    fn from(n: f64) -> Self {
        ParamValue::Float(n)
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        ParamValue::Bool(b)
    }
}

/// Key-ordered parameter map handed verbatim to a task handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskParams(BTreeMap<String, ParamValue>);

impl TaskParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, handy for catalog literals.
    pub fn with(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<ParamValue>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }
}

/// A persisted, schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// UUIDv7 string, time-sortable primary key.
    pub id: String,
    pub name: String,
    /// Handler discriminator, e.g. `UPDATE_PROPERTY_STATUS`.
    #[serde(rename = "type")]
    pub task_type: String,
    pub description: String,
    pub frequency: Frequency,
    pub parameters: TaskParams,
    pub status: TaskStatus,
    /// Start of the most recent execution.
    pub last_run_at: Option<DateTime<Utc>>,
    /// `None` exactly when `frequency` is `Manual`.
    pub next_run_at: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Summary of the last successful run.
    pub result: Option<String>,
    /// Message of the last failed run.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build a fresh, never-run task. `next_run_at` must already be computed
    /// by the caller from the frequency policy.
    pub fn new(spec: NewTask, next_run_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            name: spec.name,
            task_type: spec.task_type,
            description: spec.description,
            frequency: spec.frequency,
            parameters: spec.parameters,
            status: spec.status,
            last_run_at: None,
            next_run_at,
            run_count: 0,
            success_count: 0,
            failure_count: 0,
            result: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when a sweep at `now` should pick this task up.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Active
            && !self.frequency.is_manual()
            && self.next_run_at.is_some_and(|next| next <= now)
    }

    /// Check the record-level invariants before it is written.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.task_type.trim().is_empty() {
            return Err(SchedulerError::Configuration(format!(
                "task {} has an empty type",
                self.id
            )));
        }
        if !self.frequency.is_manual() && self.next_run_at.is_none() {
            return Err(SchedulerError::Configuration(format!(
                "task {} ({}) has no next run",
                self.id, self.frequency
            )));
        }
        let stamps = [Some(self.created_at), Some(self.updated_at), self.last_run_at, self.next_run_at];
        if let Some(bad) = stamps.into_iter().flatten().find(|ts| !in_storable_range(*ts)) {
            return Err(SchedulerError::Configuration(format!(
                "task {} has timestamp {bad} outside years 0000-{MAX_YEAR}",
                self.id
            )));
        }
        if self.run_count != self.success_count + self.failure_count {
            return Err(SchedulerError::Configuration(format!(
                "task {} counters out of balance: {} != {} + {}",
                self.id, self.run_count, self.success_count, self.failure_count
            )));
        }
        Ok(())
    }
}

/// Operator-supplied fields of a task that does not exist yet.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub task_type: String,
    pub description: String,
    pub frequency: Frequency,
    pub parameters: TaskParams,
    pub status: TaskStatus,
}

impl NewTask {
    pub fn new(name: &str, task_type: &str, frequency: Frequency) -> Self {
        Self {
            name: name.to_string(),
            task_type: task_type.to_string(),
            description: String::new(),
            frequency,
            parameters: TaskParams::new(),
            status: TaskStatus::Active,
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn parameters(mut self, parameters: TaskParams) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }
}
