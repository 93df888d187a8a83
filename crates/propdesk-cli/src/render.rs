//! Plain-text rendering of tasks and reports for the terminal.

use std::fmt::Write;

use chrono::{DateTime, SecondsFormat, Utc};
use propdesk_scheduler::{BootstrapReport, SweepReport, Task};

fn ts(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| "-".to_string())
}

pub fn task_table(tasks: &[Task]) -> String {
    if tasks.is_empty() {
        return "no tasks (run `propdesk bootstrap` to seed the defaults)\n".to_string();
    }
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<36}  {:<24}  {:<8}  {:<8}  {:>11}  {:<20}",
        "ID", "TYPE", "FREQ", "STATUS", "RUNS ok/err", "NEXT RUN"
    );
    for t in tasks {
        let _ = writeln!(
            out,
            "{:<36}  {:<24}  {:<8}  {:<8}  {:>11}  {:<20}",
            t.id,
            t.task_type,
            t.frequency.as_str(),
            t.status.to_string(),
            format!("{}/{}", t.success_count, t.failure_count),
            ts(t.next_run_at),
        );
    }
    out
}

pub fn task_detail(t: &Task) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} ({})", t.name, t.id);
    let _ = writeln!(out, "  type:        {}", t.task_type);
    if !t.description.is_empty() {
        let _ = writeln!(out, "  description: {}", t.description);
    }
    let _ = writeln!(out, "  frequency:   {}", t.frequency);
    let _ = writeln!(out, "  status:      {}", t.status);
    let _ = writeln!(out, "  last run:    {}", ts(t.last_run_at));
    let _ = writeln!(out, "  next run:    {}", ts(t.next_run_at));
    let _ = writeln!(
        out,
        "  runs:        {} ({} ok, {} failed)",
        t.run_count, t.success_count, t.failure_count
    );
    let _ = writeln!(out, "  result:      {}", t.result.as_deref().unwrap_or("-"));
    let _ = writeln!(out, "  last error:  {}", t.last_error.as_deref().unwrap_or("-"));
    if t.parameters.is_empty() {
        let _ = writeln!(out, "  parameters:  -");
    } else {
        let _ = writeln!(out, "  parameters:");
        for (key, value) in t.parameters.iter() {
            let value = serde_json::to_string(value).unwrap_or_default();
            let _ = writeln!(out, "    {key} = {value}");
        }
    }
    out
}

pub fn sweep_summary(r: &SweepReport) -> String {
    let mut out = format!(
        "{} attempted, {} succeeded, {} failed",
        r.attempted, r.succeeded, r.failed
    );
    if r.skipped > 0 {
        let _ = write!(out, ", {} skipped (in flight)", r.skipped);
    }
    out.push('\n');
    for e in &r.errors {
        let _ = writeln!(out, "  error: {e}");
    }
    out
}

pub fn bootstrap_summary(r: &BootstrapReport) -> String {
    let mut out = format!(
        "{} created, {} already present\n",
        r.created, r.updated
    );
    for e in &r.errors {
        let _ = writeln!(out, "  error: {e}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use propdesk_scheduler::{Frequency, NewTask, TaskParams};

    fn sample() -> Task {
        let now = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let spec = NewTask::new("Prune audit log", "PRUNE_AUDIT_LOG", Frequency::Weekly)
            .parameters(TaskParams::new().with("retention_days", 90i64));
        Task::new(spec, Some(now), now)
    }

    #[test]
    fn table_lists_each_task() {
        let out = task_table(&[sample()]);
        assert!(out.starts_with("ID"));
        assert!(out.contains("PRUNE_AUDIT_LOG"));
        assert!(out.contains("WEEKLY"));
        assert!(out.contains("2025-01-02T03:04:05Z"));
        assert_eq!(out.lines().count(), 2);
    }

    #[test]
    fn detail_shows_parameters_and_missing_fields() {
        let out = task_detail(&sample());
        assert!(out.contains("retention_days = 90"));
        assert!(out.contains("last run:    -"));
        assert!(out.contains("last error:  -"));
    }

    #[test]
    fn sweep_summary_lists_errors() {
        let r = SweepReport {
            attempted: 2,
            succeeded: 1,
            failed: 1,
            skipped: 0,
            errors: vec!["Prune audit log [PRUNE_AUDIT_LOG]: disk full".into()],
        };
        let out = sweep_summary(&r);
        assert!(out.starts_with("2 attempted, 1 succeeded, 1 failed\n"));
        assert!(out.contains("error: Prune audit log"));
    }

    #[test]
    fn bootstrap_summary_counts_existing_tasks() {
        let r = BootstrapReport {
            created: 1,
            updated: 2,
            errors: vec!["Broken [BROKEN]: invalid frequency".into()],
        };
        let out = bootstrap_summary(&r);
        assert!(out.starts_with("1 created, 2 already present\n"));
        assert!(out.contains("error: Broken"));
    }
}
