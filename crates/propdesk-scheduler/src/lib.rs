//! `propdesk-scheduler`: persisted back-office task scheduler.
//!
//! # Overview
//!
//! Tasks live in a SQLite `tasks` table (or in memory for tests). An external
//! trigger calls [`engine::TaskManager::run_due`] once per tick. Every due
//! task is routed by its type to a [`handlers::TaskHandler`]. Its run
//! counters and its result or error are recorded, and its next run is
//! computed from the observed start time.
//!
//! # Frequencies
//!
//! | Label     | Next run after a start at `t`                  |
//! |-----------|------------------------------------------------|
//! | `MANUAL`  | never (explicit invocation only)               |
//! | `HOURLY`  | `t + 1h`                                       |
//! | `DAILY`   | `t + 24h`                                      |
//! | `WEEKLY`  | `t + 7d`                                       |
//! | `MONTHLY` | `t + 1 month`, clamped to the month's last day |
//! | `YEARLY`  | `t + 12 months`, same clamp                    |

pub mod catalog;
pub mod clock;
pub mod db;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod schedule;
pub mod store;
pub mod types;

pub use catalog::{default_catalog, CatalogEntry};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{BootstrapReport, Execution, Outcome, SweepReport, TaskManager};
pub use error::{Result, SchedulerError, StoreError};
pub use handlers::{HandlerError, HandlerRegistry, TaskHandler};
pub use store::{MemoryTaskStore, SqliteTaskStore, TaskStore};
pub use types::{Frequency, NewTask, ParamValue, Task, TaskParams, TaskStatus};
