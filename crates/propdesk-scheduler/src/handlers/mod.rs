//! Task handlers and the registry that routes a task type to its handler.
//!
//! Defines the `TaskHandler` trait that every task type implements, the
//! typed parameter accessors handlers use, and the built-in back-office
//! handlers with the collaborator traits they call into.

pub mod audit_prune;
pub mod email_test;
pub mod property_status;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::error::{Result, SchedulerError};
use crate::types::{ParamValue, TaskParams};

pub use audit_prune::{AuditLog, PruneAuditLog, PRUNE_AUDIT_LOG};
pub use email_test::{MailProbe, TestEmailConfig, TEST_EMAIL_CONFIG};
pub use property_status::{PropertyLedger, StatusRecompute, UpdatePropertyStatus, UPDATE_PROPERTY_STATUS};

/// The task's own logic failed. Recorded in `last_error`, never fatal.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("missing parameter: {key}")]
    MissingParameter { key: String },

    #[error("invalid parameter {key}: {reason}")]
    InvalidParameter { key: String, reason: String },

    /// An external collaborator (mail relay, ledger, audit store) failed.
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }
}

/// What a handler knows about the run it is part of.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub task_id: String,
    pub task_type: String,
    /// Observed execution start; also the reference "now" for the handler.
    pub started_at: DateTime<Utc>,
}

/// Trait that all task types must implement.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Perform the task's effect and return a one-line summary.
    async fn run(&self, ctx: &HandlerContext, params: &TaskParams) -> std::result::Result<String, HandlerError>;
}

// Typed extraction. A wrong type is reported, never coerced.
impl TaskParams {
    pub fn require_str(&self, key: &str) -> std::result::Result<&str, HandlerError> {
        match self.get(key) {
            Some(ParamValue::Text(s)) => Ok(s),
            Some(ParamValue::Null) | None => Err(HandlerError::MissingParameter {
                key: key.to_string(),
            }),
            Some(other) => Err(wrong_type(key, "string", other)),
        }
    }

    /// Integers, or floats with no fractional part.
    pub fn i64_or(&self, key: &str, default: i64) -> std::result::Result<i64, HandlerError> {
        match self.get(key) {
            Some(ParamValue::Int(n)) => Ok(*n),
            Some(ParamValue::Float(f)) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(*f as i64),
            Some(ParamValue::Null) | None => Ok(default),
            Some(other) => Err(wrong_type(key, "integer", other)),
        }
    }
}

fn wrong_type(key: &str, expected: &str, got: &ParamValue) -> HandlerError {
    HandlerError::InvalidParameter {
        key: key.to_string(),
        reason: format!("expected {expected}, got {}", got.kind()),
    }
}

/// Fixed map from task type to handler, built once at start-up.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `task_type`. Types are unique.
    pub fn register(&mut self, task_type: &str, handler: Arc<dyn TaskHandler>) -> Result<()> {
        if task_type.trim().is_empty() {
            return Err(SchedulerError::Configuration(
                "cannot register a handler for an empty task type".to_string(),
            ));
        }
        if self.handlers.contains_key(task_type) {
            return Err(SchedulerError::Configuration(format!(
                "duplicate handler for task type: {task_type}"
            )));
        }
        self.handlers.insert(task_type.to_string(), handler);
        Ok(())
    }

    pub fn resolve(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Fail if any of `task_types` has no handler.
    pub fn validate<'a>(&self, task_types: impl IntoIterator<Item = &'a str>) -> Result<()> {
        let missing: Vec<&str> = task_types.into_iter().filter(|t| !self.contains(t)).collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(SchedulerError::Configuration(format!(
                "no handler registered for: {}",
                missing.join(", ")
            )))
        }
    }
}

/// External systems the built-in handlers act on.
#[derive(Clone)]
pub struct Collaborators {
    pub ledger: Arc<dyn PropertyLedger>,
    pub mail: Arc<dyn MailProbe>,
    pub audit: Arc<dyn AuditLog>,
}

/// Registry holding every built-in task type.
pub fn builtin_registry(c: Collaborators) -> Result<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register(UPDATE_PROPERTY_STATUS, Arc::new(UpdatePropertyStatus::new(c.ledger)))?;
    registry.register(TEST_EMAIL_CONFIG, Arc::new(TestEmailConfig::new(c.mail)))?;
    registry.register(PRUNE_AUDIT_LOG, Arc::new(PruneAuditLog::new(c.audit)))?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        async fn run(&self, _ctx: &HandlerContext, params: &TaskParams) -> std::result::Result<String, HandlerError> {
            Ok(params.require_str("say")?.to_string())
        }
    }

    #[test]
    fn duplicate_registration_is_configuration_error() {
        let mut reg = HandlerRegistry::new();
        reg.register("ECHO", Arc::new(Echo)).unwrap();
        let err = reg.register("ECHO", Arc::new(Echo)).unwrap_err();
        assert!(matches!(err, SchedulerError::Configuration(_)));
    }

    #[test]
    fn empty_type_rejected() {
        let mut reg = HandlerRegistry::new();
        assert!(reg.register("  ", Arc::new(Echo)).is_err());
    }

    #[test]
    fn resolve_and_validate() {
        let mut reg = HandlerRegistry::new();
        reg.register("B", Arc::new(Echo)).unwrap();
        reg.register("A", Arc::new(Echo)).unwrap();
        assert!(reg.resolve("A").is_some());
        assert!(reg.resolve("C").is_none());
        assert!(reg.validate(["A", "B"]).is_ok());
        let err = reg.validate(["A", "C"]).unwrap_err();
        assert!(err.to_string().contains("C"));
    }

    #[tokio::test]
    async fn handler_receives_params() {
        let mut reg = HandlerRegistry::new();
        reg.register("ECHO", Arc::new(Echo)).unwrap();
        let ctx = HandlerContext {
            task_id: "t".into(),
            task_type: "ECHO".into(),
            started_at: Utc::now(),
        };
        let params = TaskParams::new().with("say", "hello");
        let out = reg.resolve("ECHO").unwrap().run(&ctx, &params).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn typed_accessors() {
        let p = TaskParams::new()
            .with("name", "x")
            .with("days", 7i64)
            .with("whole", 3.0)
            .with("half", 2.5)
            .with("nothing", ParamValue::Null);

        assert_eq!(p.require_str("name").unwrap(), "x");
        assert!(matches!(
            p.require_str("missing"),
            Err(HandlerError::MissingParameter { .. })
        ));
        assert!(matches!(
            p.require_str("nothing"),
            Err(HandlerError::MissingParameter { .. })
        ));
        assert!(matches!(
            p.require_str("days"),
            Err(HandlerError::InvalidParameter { .. })
        ));
        assert_eq!(p.i64_or("days", 1).unwrap(), 7);
        assert_eq!(p.i64_or("whole", 1).unwrap(), 3);
        assert!(p.i64_or("half", 1).is_err());
        assert_eq!(p.i64_or("missing", 90).unwrap(), 90);
    }
}
