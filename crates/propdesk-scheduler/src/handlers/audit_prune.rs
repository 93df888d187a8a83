use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::info;

use super::{HandlerContext, HandlerError, TaskHandler};
use crate::types::TaskParams;

pub const PRUNE_AUDIT_LOG: &str = "PRUNE_AUDIT_LOG";
pub const DEFAULT_RETENTION_DAYS: i64 = 90;

/// Audit-log storage that can drop entries older than a cutoff.
pub trait AuditLog: Send + Sync {
    /// Delete entries created strictly before `cutoff`; returns how many went.
    fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, HandlerError>;
}

/// Deletes audit entries older than `retention_days` (default 90).
pub struct PruneAuditLog {
    audit: Arc<dyn AuditLog>,
}

impl PruneAuditLog {
    pub fn new(audit: Arc<dyn AuditLog>) -> Self {
        Self { audit }
    }
}

#[async_trait]
impl TaskHandler for PruneAuditLog {
    async fn run(&self, ctx: &HandlerContext, params: &TaskParams) -> Result<String, HandlerError> {
        let days = params.i64_or("retention_days", DEFAULT_RETENTION_DAYS)?;
        if !(1..=36_500).contains(&days) {
            return Err(HandlerError::InvalidParameter {
                key: "retention_days".to_string(),
                reason: format!("must be between 1 and 36500, got {days}"),
            });
        }
        let cutoff = ctx.started_at - Duration::days(days);
        let removed = self.audit.prune_before(cutoff)?;
        info!(task_id = %ctx.task_id, removed, %cutoff, "audit log pruned");
        Ok(format!("{removed} audit entries older than {days} days removed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeAudit {
        cutoffs: Mutex<Vec<DateTime<Utc>>>,
    }

    impl AuditLog for FakeAudit {
        fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, HandlerError> {
            self.cutoffs.lock().unwrap().push(cutoff);
            Ok(4)
        }
    }

    fn ctx(started_at: DateTime<Utc>) -> HandlerContext {
        HandlerContext {
            task_id: "t".into(),
            task_type: PRUNE_AUDIT_LOG.into(),
            started_at,
        }
    }

    #[tokio::test]
    async fn uses_retention_window() {
        let audit = Arc::new(FakeAudit::default());
        let handler = PruneAuditLog::new(audit.clone());
        let start = Utc.with_ymd_and_hms(2025, 5, 31, 3, 0, 0).unwrap();
        let params = TaskParams::new().with("retention_days", 30i64);

        let summary = handler.run(&ctx(start), &params).await.unwrap();
        assert_eq!(summary, "4 audit entries older than 30 days removed");
        assert_eq!(
            *audit.cutoffs.lock().unwrap(),
            vec![Utc.with_ymd_and_hms(2025, 5, 1, 3, 0, 0).unwrap()]
        );
    }

    #[tokio::test]
    async fn defaults_to_ninety_days() {
        let audit = Arc::new(FakeAudit::default());
        let handler = PruneAuditLog::new(audit.clone());
        let start = Utc::now();
        handler.run(&ctx(start), &TaskParams::new()).await.unwrap();
        assert_eq!(audit.cutoffs.lock().unwrap()[0], start - Duration::days(90));
    }

    #[tokio::test]
    async fn rejects_non_positive_retention() {
        let handler = PruneAuditLog::new(Arc::new(FakeAudit::default()));
        let params = TaskParams::new().with("retention_days", 0i64);
        let err = handler.run(&ctx(Utc::now()), &params).await.unwrap_err();
        assert!(matches!(err, HandlerError::InvalidParameter { .. }));
    }
}
