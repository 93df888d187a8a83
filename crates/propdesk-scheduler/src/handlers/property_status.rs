use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use super::{HandlerContext, HandlerError, TaskHandler};
use crate::types::TaskParams;

pub const UPDATE_PROPERTY_STATUS: &str = "UPDATE_PROPERTY_STATUS";

/// Counts returned by a status recomputation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusRecompute {
    pub examined: u64,
    pub changed: u64,
}

/// Property records whose occupancy status is derived from their leases.
pub trait PropertyLedger: Send + Sync {
    fn recompute_statuses(&self, as_of: DateTime<Utc>) -> Result<StatusRecompute, HandlerError>;
}

/// Recomputes every property's status as of the run start.
pub struct UpdatePropertyStatus {
    ledger: Arc<dyn PropertyLedger>,
}

impl UpdatePropertyStatus {
    pub fn new(ledger: Arc<dyn PropertyLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl TaskHandler for UpdatePropertyStatus {
    async fn run(&self, ctx: &HandlerContext, _params: &TaskParams) -> Result<String, HandlerError> {
        let counts = self.ledger.recompute_statuses(ctx.started_at)?;
        info!(
            task_id = %ctx.task_id,
            examined = counts.examined,
            changed = counts.changed,
            "property statuses recomputed"
        );
        Ok(format!(
            "{} properties examined, {} status changes",
            counts.examined, counts.changed
        ))
    }
}
